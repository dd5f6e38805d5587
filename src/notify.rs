//! Fire-and-forget notifications from the acquisition thread to consumers.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use crate::instrument::InstrumentId;
use crate::handoff::Origin;
use crate::time::TimePoint;
use crate::trigger::TriggerState;
use crate::waveform::EventFlags;

/// Notifications a subscriber may leave unread before newer ones are dropped.
pub const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub enum Notification {
    /// The handoff gate has released a new event; it is now what readers observe. The waveforms
    /// themselves are read through the gate or looked up in history by `trigger_time`.
    AcquisitionPublished {
        trigger_time: TimePoint,
        flags: EventFlags,
        origin: Origin,
        sequence: u64,
    },
    /// History gained or lost entries.
    HistoryChanged,
    TriggerStateChanged { instrument: InstrumentId, state: TriggerState },
    /// A synchronized group timed out waiting for its members and fell back to free-run.
    FreeRunEngaged { missing: Vec<InstrumentId> },
}

/// Broadcasts notifications to any number of subscribers. Each subscriber has a queue of
/// `QUEUE_DEPTH`; a full queue loses the notification, and subscribers that hang up are dropped
/// on the next send. Nobody is ever waited on.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<SyncSender<Notification>>>>,
}

impl Notifier {
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (send, recv) = sync_channel(QUEUE_DEPTH);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(send);
        recv
    }

    pub fn send(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| match subscriber.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::trace!("notify: subscriber is lagging, dropped {:?}", notification);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}
