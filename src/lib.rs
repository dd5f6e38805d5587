mod time;
mod instrument;
mod waveform;
mod config;
mod notify;
mod trigger;
mod sync;
mod download;
mod handoff;
mod history;
mod rate;
mod persist;
mod session;
mod poller;
pub mod sim;

use thiserror::Error;

/// An instrument could not be reached or refused a command.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("instrument unreachable: {0}")]
    Unreachable(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer of one channel's capture failed.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("cannot allocate buffer for {0} samples")]
    OutOfMemory(usize),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("instrument {name:?} ({instrument:?}): {source}")]
    InstrumentComm {
        instrument: InstrumentId,
        name: String,
        #[source]
        source: CommError,
    },
    #[error("out of memory downloading {channel:?}: {source}")]
    ResourceExhausted {
        channel: ChannelId,
        #[source]
        source: DownloadError,
    },
    #[error("no history entry at {0}")]
    HistoryNotFound(TimePoint),
    #[error("unknown instrument {0:?}")]
    UnknownInstrument(String),
    #[error("malformed session document: {0}")]
    Document(#[from] serde_json::Error),
    #[error("acquisition thread has exited")]
    SessionClosed,
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use time::{
    TimePoint,
    FS_PER_SECOND,
};

pub use instrument::{
    InstrumentId,
    ChannelId,
    StreamKind,
    StreamDescriptor,
    TriggerStatus,
    Instrument,
    Instruments,
};

pub use waveform::{
    Waveform,
    EventFlags,
    InstrumentCapture,
    AcquisitionEvent,
};

pub use config::{
    RetentionPolicy,
    SessionConfig,
};

pub use notify::{
    Notification,
    Notifier,
    QUEUE_DEPTH,
};

pub use trigger::{
    TriggerState,
    TriggerArmController,
};

pub use sync::{
    SyncMember,
    ReleasedGroup,
    MultiScopeSynchronizer,
};

pub use download::WaveformDownloader;

pub use handoff::{
    Origin,
    Published,
    GateGuard,
    DataHandoffGate,
};

pub use history::HistoryStore;

pub use rate::PerformanceTracker;

pub use persist::{
    ArmIntent,
    InstrumentRecord,
    SessionDocument,
};

pub use session::{
    CancelToken,
    SessionStatus,
    AcquisitionSession,
};

pub use poller::{
    AcquisitionPoller,
    SessionHandle,
};
