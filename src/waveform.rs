//! Captured sample data and the events that group it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::instrument::{ChannelId, InstrumentId};
use crate::time::TimePoint;

/// Samples of one channel from one acquisition. Never mutated once built; a newer capture of the
/// same channel is a new `Waveform`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    start: TimePoint,
    interval_fs: i64,
    samples: Vec<f32>,
}

impl Waveform {
    pub fn new(start: TimePoint, interval_fs: i64, samples: Vec<f32>) -> Waveform {
        Waveform { start, interval_fs, samples }
    }

    pub fn start(&self) -> TimePoint {
        self.start
    }

    /// Time between adjacent samples, in femtoseconds.
    pub fn interval_fs(&self) -> i64 {
        self.interval_fs
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Raw native-endian sample bytes, for the session layer to write out verbatim.
    pub fn sample_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }

    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Waveform>() + std::mem::size_of_val(self.samples.as_slice())
    }

    pub fn time_of(&self, index: usize) -> TimePoint {
        self.start.offset_by(self.interval_fs.saturating_mul(index as i64))
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u8 {
        /// Captures in this event were not confirmed to share a trigger instant.
        const FREE_RUN   = 1 << 0;
        /// At least one channel failed to download; see `InstrumentCapture::failed`.
        const INCOMPLETE = 1 << 1;
    }
}

/// Everything one instrument contributed to an event.
#[derive(Debug, Clone)]
pub struct InstrumentCapture {
    instrument: InstrumentId,
    trigger_time: TimePoint,
    skew_fs: i64,
    waveforms: BTreeMap<usize, Arc<Waveform>>,
    failed: Vec<usize>,
}

impl InstrumentCapture {
    pub(crate) fn new(instrument: InstrumentId, trigger_time: TimePoint, skew_fs: i64)
            -> InstrumentCapture {
        InstrumentCapture {
            instrument,
            trigger_time,
            skew_fs,
            waveforms: BTreeMap::new(),
            failed: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, stream: usize, waveform: Waveform) {
        self.waveforms.insert(stream, Arc::new(waveform));
    }

    pub(crate) fn mark_failed(&mut self, stream: usize) {
        self.failed.push(stream);
    }

    pub fn instrument(&self) -> InstrumentId {
        self.instrument
    }

    /// Trigger time as reported by the instrument's own clock.
    pub fn trigger_time(&self) -> TimePoint {
        self.trigger_time
    }

    /// Offset of this instrument's trigger from the event's canonical trigger time.
    pub fn skew_fs(&self) -> i64 {
        self.skew_fs
    }

    pub fn waveform(&self, stream: usize) -> Option<&Arc<Waveform>> {
        self.waveforms.get(&stream)
    }

    pub fn waveforms(&self) -> impl Iterator<Item = (usize, &Arc<Waveform>)> {
        self.waveforms.iter().map(|(&stream, waveform)| (stream, waveform))
    }

    /// Streams whose download failed for this acquisition.
    pub fn failed(&self) -> &[usize] {
        &self.failed
    }
}

/// One logical acquisition across one or more instruments.
#[derive(Debug, Clone)]
pub struct AcquisitionEvent {
    trigger_time: TimePoint,
    flags: EventFlags,
    captures: Vec<InstrumentCapture>,
}

impl AcquisitionEvent {
    pub(crate) fn new(trigger_time: TimePoint, captures: Vec<InstrumentCapture>, free_run: bool)
            -> AcquisitionEvent {
        let mut flags = EventFlags::empty();
        flags.set(EventFlags::FREE_RUN, free_run);
        flags.set(EventFlags::INCOMPLETE,
            captures.iter().any(|capture| !capture.failed.is_empty()));
        AcquisitionEvent { trigger_time, flags, captures }
    }

    pub fn trigger_time(&self) -> TimePoint {
        self.trigger_time
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn is_free_run(&self) -> bool {
        self.flags.contains(EventFlags::FREE_RUN)
    }

    pub fn captures(&self) -> &[InstrumentCapture] {
        &self.captures
    }

    pub fn capture(&self, instrument: InstrumentId) -> Option<&InstrumentCapture> {
        self.captures.iter().find(|capture| capture.instrument == instrument)
    }

    pub fn waveform(&self, channel: ChannelId) -> Option<&Arc<Waveform>> {
        self.capture(channel.instrument)?.waveform(channel.stream)
    }

    pub fn channels(&self) -> impl Iterator<Item = (ChannelId, &Arc<Waveform>)> {
        self.captures.iter().flat_map(|capture| {
            capture.waveforms().map(move |(stream, waveform)|
                (ChannelId::new(capture.instrument, stream), waveform))
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.channels().map(|(_, waveform)| waveform.size_bytes()).sum()
    }

    /// This event with `other`'s captures folded in. A capture from an instrument present in both
    /// is taken from `other`; `FREE_RUN` sticks if either side had it.
    pub(crate) fn merged_with(&self, other: &AcquisitionEvent) -> AcquisitionEvent {
        let mut captures = self.captures.iter()
            .filter(|capture| other.capture(capture.instrument).is_none())
            .chain(&other.captures)
            .cloned()
            .collect::<Vec<_>>();
        captures.sort_by_key(|capture| capture.instrument);
        let free_run = self.is_free_run() || other.is_free_run();
        AcquisitionEvent::new(self.trigger_time, captures, free_run)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_waveform_bytes() {
        let waveform = Waveform::new(TimePoint::default(), 1_000, vec![1.0, -1.0]);
        assert_eq!(waveform.sample_bytes().len(), 8);
        assert_eq!(&waveform.sample_bytes()[..4], &1.0f32.to_ne_bytes());
        assert_eq!(waveform.time_of(2), TimePoint::new(0, 2_000));
    }

    #[test]
    fn test_event_flags() {
        let id = InstrumentId::from_index(0);
        let mut capture = InstrumentCapture::new(id, TimePoint::default(), 0);
        capture.insert(0, Waveform::new(TimePoint::default(), 1, vec![0.0; 4]));
        let event = AcquisitionEvent::new(TimePoint::default(), vec![capture.clone()], false);
        assert_eq!(event.flags(), EventFlags::empty());
        assert!(event.waveform(ChannelId::new(id, 0)).is_some());
        assert!(event.waveform(ChannelId::new(id, 1)).is_none());

        capture.mark_failed(1);
        let event = AcquisitionEvent::new(TimePoint::default(), vec![capture], true);
        assert_eq!(event.flags(), EventFlags::FREE_RUN | EventFlags::INCOMPLETE);
        assert_eq!(event.channels().count(), 1);
    }

    #[test]
    fn test_merge_keeps_every_instrument() {
        let (a, b) = (InstrumentId::from_index(0), InstrumentId::from_index(1));
        let capture = |id, failed: bool| {
            let mut capture = InstrumentCapture::new(id, TimePoint::new(1, 0), 0);
            capture.insert(0, Waveform::new(TimePoint::new(1, 0), 1, vec![0.0; 4]));
            if failed {
                capture.mark_failed(1);
            }
            capture
        };
        let first = AcquisitionEvent::new(TimePoint::new(1, 0), vec![capture(b, true)], true);
        let second = AcquisitionEvent::new(TimePoint::new(1, 0), vec![capture(a, false)], false);
        let merged = first.merged_with(&second);
        assert_eq!(merged.captures().iter().map(|capture| capture.instrument()).collect::<Vec<_>>(),
            vec![a, b]);
        assert_eq!(merged.flags(), EventFlags::FREE_RUN | EventFlags::INCOMPLETE);
        assert_eq!(merged.size_bytes(), first.size_bytes() + second.size_bytes());

        // the newer capture of the same instrument wins
        let replacement = AcquisitionEvent::new(TimePoint::new(1, 0), vec![capture(b, false)], false);
        let merged = merged.merged_with(&replacement);
        assert_eq!(merged.captures().len(), 2);
        assert!(merged.capture(b).unwrap().failed().is_empty());
        assert_eq!(merged.flags(), EventFlags::FREE_RUN);
    }
}
