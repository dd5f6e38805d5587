use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Error, Result};
use crate::config::RetentionPolicy;
use crate::time::TimePoint;
use crate::waveform::AcquisitionEvent;

/// Past acquisitions in trigger-time order, at most one per `TimePoint`.
///
/// Entries are shared `Arc`s: evicting one frees its waveforms unless a consumer (for example the
/// handoff gate, after a jump into history) still holds it.
#[derive(Debug)]
pub struct HistoryStore {
    entries: BTreeMap<TimePoint, Arc<AcquisitionEvent>>,
    bytes: usize,
    policy: RetentionPolicy,
}

impl HistoryStore {
    pub fn new(policy: RetentionPolicy) -> HistoryStore {
        HistoryStore { entries: BTreeMap::new(), bytes: 0, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: RetentionPolicy) {
        self.policy = policy;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sample memory held by all entries.
    pub fn memory_usage(&self) -> usize {
        self.bytes
    }

    pub fn timepoints(&self) -> impl Iterator<Item = TimePoint> + '_ {
        self.entries.keys().copied()
    }

    pub fn latest(&self) -> Option<&Arc<AcquisitionEvent>> {
        self.entries.values().next_back()
    }

    /// Insert `event` under its trigger time. An entry already at that time is merged with it
    /// rather than replaced, so no published capture goes missing. Returns the stored entry.
    pub fn record(&mut self, event: Arc<AcquisitionEvent>) -> Arc<AcquisitionEvent> {
        let timepoint = event.trigger_time();
        let stored = match self.entries.remove(&timepoint) {
            Some(existing) => {
                log::debug!("history: merging captures at {}", timepoint);
                self.bytes -= existing.size_bytes();
                Arc::new(existing.merged_with(&event))
            }
            None => event,
        };
        self.bytes += stored.size_bytes();
        self.entries.insert(timepoint, stored.clone());
        stored
    }

    pub fn lookup(&self, timepoint: TimePoint) -> Result<Arc<AcquisitionEvent>> {
        self.entries.get(&timepoint).cloned().ok_or(Error::HistoryNotFound(timepoint))
    }

    pub fn remove(&mut self, timepoint: TimePoint) -> Result<Arc<AcquisitionEvent>> {
        let event = self.entries.remove(&timepoint).ok_or(Error::HistoryNotFound(timepoint))?;
        self.bytes -= event.size_bytes();
        Ok(event)
    }

    /// Apply the configured retention policy. Returns the number of evicted entries.
    pub fn enforce(&mut self) -> usize {
        self.prune(self.policy)
    }

    /// Evict oldest entries until `policy` is satisfied.
    pub fn prune(&mut self, policy: RetentionPolicy) -> usize {
        let mut evicted = 0;
        loop {
            let over = match policy {
                RetentionPolicy::Unbounded => false,
                RetentionPolicy::MaxEntries(limit) => self.entries.len() > limit,
                RetentionPolicy::MaxBytes(limit) => self.bytes > limit,
            };
            if !over {
                break
            }
            let Some((_, event)) = self.entries.pop_first() else { break };
            self.bytes -= event.size_bytes();
            evicted += 1;
        }
        if evicted > 0 {
            log::debug!("history: evicted {} entries ({} left, {} bytes)",
                evicted, self.entries.len(), self.bytes);
        }
        evicted
    }

    /// Evict every entry for which `predicate` returns true.
    pub fn prune_where<F>(&mut self, mut predicate: F) -> usize
            where F: FnMut(TimePoint, &AcquisitionEvent) -> bool {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|&timepoint, event| {
            let evict = predicate(timepoint, event);
            if evict {
                freed += event.size_bytes();
            }
            !evict
        });
        self.bytes -= freed;
        before - self.entries.len()
    }

}
