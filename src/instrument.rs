use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CommError, DownloadError};
use crate::time::TimePoint;
use crate::waveform::Waveform;

/// Stable handle for a connected instrument. Ids are never reused within a session, so a handle
/// held by history or the synchronizer can go stale but never alias another instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentId(usize);

impl InstrumentId {
    pub(crate) fn from_index(index: usize) -> InstrumentId {
        InstrumentId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub instrument: InstrumentId,
    pub stream: usize,
}

impl ChannelId {
    pub fn new(instrument: InstrumentId, stream: usize) -> ChannelId {
        ChannelId { instrument, stream }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Analog,
    Digital,
    Spectrum,
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub index: usize,
    pub name: String,
    pub kind: StreamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    /// A capture is waiting to be downloaded; carries the trigger time on the instrument clock.
    Ready(TimePoint),
    NotReady,
}

/// The operations the acquisition engine needs from an oscilloscope driver.
///
/// All calls are made from the acquisition thread. `poll_trigger` must return within roughly
/// `timeout`; none of the calls may block indefinitely.
pub trait Instrument: Send {
    fn name(&self) -> &str;

    fn streams(&self) -> Vec<StreamDescriptor>;

    fn arm(&mut self, oneshot: bool) -> Result<(), CommError>;

    fn stop(&mut self);

    fn poll_trigger(&mut self, timeout: Duration) -> Result<TriggerStatus, CommError>;

    fn download_waveform(&mut self, stream: usize) -> Result<Waveform, DownloadError>;
}

pub(crate) struct Slot {
    pub name: String,
    pub streams: Vec<StreamDescriptor>,
    pub handle: Box<dyn Instrument>,
}

/// Arena of connected instruments, addressed by `InstrumentId`.
#[derive(Default)]
pub struct Instruments {
    slots: Vec<Option<Slot>>,
}

impl Instruments {
    pub fn add(&mut self, handle: Box<dyn Instrument>) -> InstrumentId {
        let id = InstrumentId(self.slots.len());
        let name = handle.name().to_owned();
        let streams = handle.streams();
        log::info!("instruments: connected {:?} as {:?} with {} streams", name, id, streams.len());
        self.slots.push(Some(Slot { name, streams, handle }));
        id
    }

    pub fn remove(&mut self, id: InstrumentId) -> Option<Box<dyn Instrument>> {
        let slot = self.slots.get_mut(id.0)?.take()?;
        log::info!("instruments: disconnected {:?} ({:?})", slot.name, id);
        Some(slot.handle)
    }

    pub fn contains(&self, id: InstrumentId) -> bool {
        self.slot(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = InstrumentId> + '_ {
        self.slots.iter().enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| InstrumentId(index))
    }

    pub fn len(&self) -> usize {
        self.ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, name: &str) -> Option<InstrumentId> {
        self.ids().find(|&id| self.name(id) == Some(name))
    }

    pub fn name(&self, id: InstrumentId) -> Option<&str> {
        self.slot(id).map(|slot| slot.name.as_str())
    }

    pub fn streams(&self, id: InstrumentId) -> &[StreamDescriptor] {
        self.slot(id).map(|slot| slot.streams.as_slice()).unwrap_or(&[])
    }

    pub(crate) fn slot(&self, id: InstrumentId) -> Option<&Slot> {
        self.slots.get(id.0)?.as_ref()
    }

    pub(crate) fn handle_mut(&mut self, id: InstrumentId) -> Option<&mut dyn Instrument> {
        let slot = self.slots.get_mut(id.0)?.as_mut()?;
        Some(slot.handle.as_mut())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimulatedScope;

    #[test]
    fn test_ids_are_stable() {
        let mut instruments = Instruments::default();
        let a = instruments.add(Box::new(SimulatedScope::new("a", 1)));
        let b = instruments.add(Box::new(SimulatedScope::new("b", 2)));
        assert!(instruments.remove(a).is_some());
        assert!(instruments.remove(a).is_none());
        let c = instruments.add(Box::new(SimulatedScope::new("c", 1)));
        assert_ne!(a, c);
        assert_eq!(instruments.ids().collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(instruments.find("b"), Some(b));
        assert_eq!(instruments.streams(b).len(), 2);
        assert!(instruments.streams(a).is_empty());
    }
}
