//! Session configuration supplied by the surrounding application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How much acquisition history to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    Unbounded,
    /// Keep at most this many events.
    MaxEntries(usize),
    /// Keep events while their sample memory stays within this many bytes.
    MaxBytes(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long secondaries of a synchronized group may lag the primary's trigger.
    #[serde(with = "humantime_serde")]
    pub sync_window: Duration,
    pub retention: RetentionPolicy,
    /// Upper bound on a single trigger poll.
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    /// Pause between poll iterations that found nothing ready.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Number of recent events the waveform rate is averaged over.
    #[serde(default = "default_rate_window")]
    pub rate_window: usize,
    /// Treat multiple instruments as one synchronized group.
    #[serde(default = "default_synchronize")]
    pub synchronize: bool,
    /// Name of the group's primary instrument; the first one added if unset.
    #[serde(default)]
    pub primary: Option<String>,
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_rate_window() -> usize {
    10
}

fn default_synchronize() -> bool {
    true
}

impl SessionConfig {
    pub fn new(sync_window: Duration, retention: RetentionPolicy) -> SessionConfig {
        SessionConfig {
            sync_window,
            retention,
            poll_timeout: default_poll_timeout(),
            poll_interval: default_poll_interval(),
            rate_window: default_rate_window(),
            synchronize: default_synchronize(),
            primary: None,
        }
    }
}
