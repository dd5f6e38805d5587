//! The exclusive region between the acquisition thread and consumers.
//!
//! Publishing an event swaps the waveform reference of each of its channels one at a time; the
//! region is held for the whole swap, and readers enter the same region before looking at any
//! channel, so a reader sees either all of the old event or all of the new one.
//!
//! The region records which thread holds it and how deeply. Re-entering from the owning thread
//! only bumps the depth, so the acquisition thread can read back what it is in the middle of
//! publishing; any other thread waits until the depth returns to zero.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::instrument::{ChannelId, InstrumentId};
use crate::waveform::{AcquisitionEvent, Waveform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Freshly downloaded from the instruments.
    Live,
    /// Republished from history.
    History,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub event: Arc<AcquisitionEvent>,
    pub origin: Origin,
    /// Increments on every publish.
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct Region {
    owner: Option<ThreadId>,
    depth: usize,
}

#[derive(Debug, Default)]
struct Current {
    published: Option<Published>,
    channels: BTreeMap<ChannelId, Arc<Waveform>>,
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct DataHandoffGate {
    region: Mutex<Region>,
    released: Condvar,
    current: Mutex<Current>,
}

impl DataHandoffGate {
    pub fn new() -> DataHandoffGate {
        DataHandoffGate::default()
    }

    /// Enter the exclusive region, waiting for any other thread to leave it first.
    pub fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut region = self.region.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match region.owner {
                None => {
                    region.owner = Some(me);
                    region.depth = 1;
                    break
                }
                Some(owner) if owner == me => {
                    region.depth += 1;
                    break
                }
                Some(_) => {
                    region = self.released.wait(region).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        GateGuard { gate: self, _not_send: PhantomData }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let region = self.region.lock().unwrap_or_else(PoisonError::into_inner);
        region.owner == Some(thread::current().id())
    }

    /// The currently published event, read inside the region.
    pub fn latest(&self) -> Option<Published> {
        self.enter().published()
    }

    fn leave(&self) {
        let mut region = self.region.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(region.owner, Some(thread::current().id()));
        region.depth -= 1;
        if region.depth == 0 {
            region.owner = None;
            self.released.notify_all();
        }
    }

    fn current(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of being inside the region. Leaves it on drop; cannot cross threads.
pub struct GateGuard<'a> {
    gate: &'a DataHandoffGate,
    _not_send: PhantomData<*const ()>,
}

impl GateGuard<'_> {
    pub fn published(&self) -> Option<Published> {
        self.gate.current().published.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.gate.current().sequence
    }

    pub fn waveform(&self, channel: ChannelId) -> Option<Arc<Waveform>> {
        self.gate.current().channels.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<(ChannelId, Arc<Waveform>)> {
        self.gate.current().channels.iter()
            .map(|(&channel, waveform)| (channel, waveform.clone()))
            .collect()
    }

    /// Replace the current references with those of `event`. Channels the event lacks keep their
    /// previous waveform for live data; history replaces the whole view.
    pub(crate) fn publish(&self, event: Arc<AcquisitionEvent>, origin: Origin) -> Published {
        if origin == Origin::History {
            self.gate.current().channels.clear();
        }
        for (channel, waveform) in event.channels() {
            self.gate.current().channels.insert(channel, waveform.clone());
        }
        let mut current = self.gate.current();
        current.sequence += 1;
        let published = Published { event, origin, sequence: current.sequence };
        current.published = Some(published.clone());
        published
    }

    /// Drop the references of every channel belonging to `instrument`. Returns how many went.
    pub(crate) fn forget_instrument(&self, instrument: InstrumentId) -> usize {
        let mut current = self.gate.current();
        let before = current.channels.len();
        current.channels.retain(|channel, _| channel.instrument != instrument);
        before - current.channels.len()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::time::TimePoint;
    use crate::waveform::InstrumentCapture;

    const CHANNELS: usize = 4;

    fn event(value: u32) -> Arc<AcquisitionEvent> {
        let id = InstrumentId::from_index(0);
        let mut capture = InstrumentCapture::new(id, TimePoint::new(value as i64, 0), 0);
        for stream in 0..CHANNELS {
            capture.insert(stream, Waveform::new(TimePoint::default(), 1, vec![value as f32; 16]));
        }
        Arc::new(AcquisitionEvent::new(TimePoint::new(value as i64, 0), vec![capture], false))
    }

    #[test]
    fn test_reentrant_on_owner() {
        let gate = DataHandoffGate::new();
        let outer = gate.enter();
        outer.publish(event(1), Origin::Live);
        {
            let inner = gate.enter();
            assert_eq!(inner.sequence(), 1);
            assert!(gate.is_held_by_current_thread());
        }
        assert!(gate.is_held_by_current_thread());
        drop(outer);
        assert!(!gate.is_held_by_current_thread());
    }

    #[test]
    fn test_excludes_other_threads() {
        let gate = Arc::new(DataHandoffGate::new());
        let entered = Arc::new(AtomicBool::new(false));
        let guard = gate.enter();
        let waiter = {
            let (gate, entered) = (gate.clone(), entered.clone());
            thread::spawn(move || {
                let _guard = gate.enter();
                entered.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_tearing_under_contention() {
        const PUBLISHES: u32 = 2000;
        let gate = Arc::new(DataHandoffGate::new());
        gate.enter().publish(event(0), Origin::Live);
        let barrier = Arc::new(Barrier::new(3));
        let writer = {
            let (gate, barrier) = (gate.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                for value in 1..=PUBLISHES {
                    let guard = gate.enter();
                    guard.publish(event(value), Origin::Live);
                }
            })
        };
        let readers = (0..2).map(|_| {
            let (gate, barrier) = (gate.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                loop {
                    let guard = gate.enter();
                    let values = guard.channels().iter()
                        .map(|(_, waveform)| waveform.samples()[0])
                        .collect::<Vec<_>>();
                    assert_eq!(values.len(), CHANNELS);
                    assert!(values.iter().all(|&value| value == values[0]),
                        "torn read: {:?}", values);
                    if values[0] as u32 == PUBLISHES {
                        break
                    }
                }
            })
        }).collect::<Vec<_>>();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_history_replaces_whole_view() {
        let gate = DataHandoffGate::new();
        let guard = gate.enter();
        guard.publish(event(1), Origin::Live);
        let empty = Arc::new(AcquisitionEvent::new(TimePoint::default(), vec![], false));
        let published = guard.publish(empty, Origin::History);
        assert_eq!(published.origin, Origin::History);
        assert!(guard.channels().is_empty());
    }

    #[test]
    fn test_forget_instrument() {
        let gate = DataHandoffGate::new();
        let guard = gate.enter();
        guard.publish(event(1), Origin::Live);
        assert_eq!(guard.forget_instrument(InstrumentId::from_index(1)), 0);
        assert_eq!(guard.forget_instrument(InstrumentId::from_index(0)), CHANNELS);
        assert!(guard.channels().is_empty());
        assert_eq!(guard.sequence(), 1);
    }
}
