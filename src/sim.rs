//! A software oscilloscope producing sine waves on a virtual clock.

use std::collections::BTreeSet;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{CommError, DownloadError};
use crate::instrument::{Instrument, StreamDescriptor, StreamKind, TriggerStatus};
use crate::time::TimePoint;
use crate::waveform::Waveform;

const DEFAULT_SAMPLE_COUNT: usize = 1000;
const DEFAULT_INTERVAL_FS: i64 = 1_000_000; // 1 GS/s
const DEFAULT_TRIGGER_PERIOD_FS: i64 = 1_000_000_000_000; // 1 ms

/// Counters shared with whoever created the scope, readable after it has been handed to a session.
#[derive(Debug, Default)]
pub struct SimStats {
    pub arms: AtomicUsize,
    pub stops: AtomicUsize,
    pub polls: AtomicUsize,
    pub polls_while_disarmed: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl SimStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

#[derive(Debug)]
pub struct SimulatedScope {
    name: String,
    channels: usize,
    frequency: f32,
    sample_count: usize,
    clock_offset_fs: i64,
    trigger_period_fs: i64,
    trigger_after_polls: usize,
    never_triggers: bool,
    rejects_arm: bool,
    rearm_faults: usize,
    poll_faults: usize,
    failing_streams: BTreeSet<usize>,
    stats: Arc<SimStats>,

    armed: bool,
    polls_since_arm: usize,
    captures: i64,
    pending: Option<TimePoint>,
}

impl SimulatedScope {
    pub fn new(name: &str, channels: usize) -> SimulatedScope {
        SimulatedScope {
            name: name.to_owned(),
            channels,
            frequency: 10e6,
            sample_count: DEFAULT_SAMPLE_COUNT,
            clock_offset_fs: 0,
            trigger_period_fs: DEFAULT_TRIGGER_PERIOD_FS,
            trigger_after_polls: 1,
            never_triggers: false,
            rejects_arm: false,
            rearm_faults: 0,
            poll_faults: 0,
            failing_streams: BTreeSet::new(),
            stats: Arc::new(SimStats::default()),
            armed: false,
            polls_since_arm: 0,
            captures: 0,
            pending: None,
        }
    }

    /// Shift every trigger timestamp by `offset_fs`, as if this scope's clock ran ahead.
    pub fn with_clock_offset(mut self, offset_fs: i64) -> Self {
        self.clock_offset_fs = offset_fs;
        self
    }

    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_sample_count(mut self, sample_count: usize) -> Self {
        self.sample_count = sample_count;
        self
    }

    /// Report a trigger only on the `polls`-th poll after arming.
    pub fn with_trigger_after(mut self, polls: usize) -> Self {
        self.trigger_after_polls = polls.max(1);
        self
    }

    pub fn never_triggering(mut self) -> Self {
        self.never_triggers = true;
        self
    }

    pub fn rejecting_arm(mut self) -> Self {
        self.rejects_arm = true;
        self
    }

    /// Accept the first arm, then refuse the next `count` arms with a communication error.
    pub fn rejecting_rearms(mut self, count: usize) -> Self {
        self.rearm_faults = count;
        self
    }

    /// Fail the next `count` trigger polls with a communication error.
    pub fn with_poll_faults(mut self, count: usize) -> Self {
        self.poll_faults = count;
        self
    }

    pub fn with_failing_stream(mut self, stream: usize) -> Self {
        self.failing_streams.insert(stream);
        self
    }

    pub fn stats(&self) -> Arc<SimStats> {
        self.stats.clone()
    }

    fn generate(&self, stream: usize, start: TimePoint) -> Result<Waveform, DownloadError> {
        let mut samples = Vec::new();
        samples.try_reserve_exact(self.sample_count)
            .map_err(|_| DownloadError::OutOfMemory(self.sample_count))?;
        let step = 2.0 * PI * self.frequency * (DEFAULT_INTERVAL_FS as f32 * 1e-15);
        let mut phase = stream as f32 * PI / 4.0;
        for _ in 0..self.sample_count {
            samples.push(phase.sin());
            phase = (phase + step) % (2.0 * PI);
        }
        Ok(Waveform::new(start, DEFAULT_INTERVAL_FS, samples))
    }
}

impl Instrument for SimulatedScope {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> Vec<StreamDescriptor> {
        (0..self.channels)
            .map(|index| StreamDescriptor {
                index,
                name: format!("CH{}", index + 1),
                kind: StreamKind::Analog,
            })
            .collect()
    }

    fn arm(&mut self, oneshot: bool) -> Result<(), CommError> {
        bump(&self.stats.arms);
        if self.rejects_arm {
            return Err(CommError::Rejected(format!("{}: arm refused", self.name)))
        }
        if self.rearm_faults > 0 && SimStats::get(&self.stats.arms) > 1 {
            self.rearm_faults -= 1;
            return Err(CommError::Unreachable(format!("{}: re-arm timed out", self.name)))
        }
        log::trace!("sim {}: armed (oneshot: {})", self.name, oneshot);
        self.armed = true;
        self.polls_since_arm = 0;
        self.pending = None;
        Ok(())
    }

    fn stop(&mut self) {
        bump(&self.stats.stops);
        self.armed = false;
        self.pending = None;
    }

    fn poll_trigger(&mut self, _timeout: Duration) -> Result<TriggerStatus, CommError> {
        bump(&self.stats.polls);
        if self.poll_faults > 0 {
            self.poll_faults -= 1;
            return Err(CommError::Unreachable(format!("{}: poll timed out", self.name)))
        }
        if let Some(timestamp) = self.pending {
            return Ok(TriggerStatus::Ready(timestamp))
        }
        if !self.armed {
            bump(&self.stats.polls_while_disarmed);
            return Ok(TriggerStatus::NotReady)
        }
        self.polls_since_arm += 1;
        if self.never_triggers || self.polls_since_arm < self.trigger_after_polls {
            return Ok(TriggerStatus::NotReady)
        }
        self.captures += 1;
        let timestamp = TimePoint::from_femtos(
            self.captures as i128 * self.trigger_period_fs as i128
                + self.clock_offset_fs as i128);
        self.armed = false;
        self.pending = Some(timestamp);
        Ok(TriggerStatus::Ready(timestamp))
    }

    fn download_waveform(&mut self, stream: usize) -> Result<Waveform, DownloadError> {
        bump(&self.stats.downloads);
        let Some(start) = self.pending else {
            return Err(DownloadError::Transfer(format!("{}: no capture pending", self.name)))
        };
        if stream >= self.channels || self.failing_streams.contains(&stream) {
            return Err(DownloadError::Transfer(format!("{}: CH{} read failed",
                self.name, stream + 1)))
        }
        self.generate(stream, start)
    }
}
