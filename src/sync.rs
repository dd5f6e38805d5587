//! Reconciles trigger readiness across instruments with independent clocks.
//!
//! A lone instrument is released as soon as it triggers. A synchronized group waits for its primary;
//! once the primary is ready, the other members have `window` to report ready too. If they all do,
//! the group is released as one aligned acquisition with per-member skew. If the window runs out,
//! the group drops to free-run: every ready member is released on its own, flagged as not aligned,
//! until the next arm rebuilds the group.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::instrument::InstrumentId;
use crate::notify::{Notification, Notifier};
use crate::time::TimePoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMember {
    pub instrument: InstrumentId,
    pub trigger_time: TimePoint,
    /// `trigger_time` minus the primary's trigger time; zero for the primary and for lone captures.
    pub skew_fs: i64,
}

/// Instruments whose captures should be downloaded together as one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedGroup {
    pub trigger_time: TimePoint,
    pub members: Vec<SyncMember>,
    pub free_run: bool,
}

impl ReleasedGroup {
    fn single(instrument: InstrumentId, trigger_time: TimePoint, free_run: bool) -> ReleasedGroup {
        ReleasedGroup {
            trigger_time,
            members: vec![SyncMember { instrument, trigger_time, skew_fs: 0 }],
            free_run,
        }
    }

    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.members.iter().map(|member| member.instrument).collect()
    }
}

#[derive(Debug)]
pub struct MultiScopeSynchronizer {
    window: Duration,
    members: Vec<InstrumentId>,
    primary: Option<InstrumentId>,
    free_run: bool,
    // trigger time, and when the poller saw it
    ready: BTreeMap<InstrumentId, (TimePoint, Instant)>,
    deadline: Option<Instant>,
    notifier: Notifier,
}

impl MultiScopeSynchronizer {
    pub fn new(window: Duration, notifier: Notifier) -> MultiScopeSynchronizer {
        MultiScopeSynchronizer {
            window,
            members: Vec::new(),
            primary: None,
            free_run: false,
            ready: BTreeMap::new(),
            deadline: None,
            notifier,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn primary(&self) -> Option<InstrumentId> {
        self.primary
    }

    pub fn is_grouped(&self) -> bool {
        self.members.len() > 1
    }

    pub fn is_free_run(&self) -> bool {
        self.free_run
    }

    /// True while a window is open waiting for secondaries.
    pub fn is_waiting(&self) -> bool {
        self.deadline.is_some()
    }

    /// Start a new arm cycle. An empty or single-member group never waits.
    pub fn begin(&mut self, members: &[InstrumentId], primary: Option<InstrumentId>) {
        self.members = members.to_vec();
        self.primary = primary.filter(|id| members.contains(id));
        if self.is_grouped() && self.primary.is_none() {
            self.primary = members.first().copied();
        }
        self.free_run = false;
        self.abort();
        if self.is_grouped() {
            log::debug!("sync: group of {} with primary {:?}, window {:?}",
                self.members.len(), self.primary, self.window);
        }
    }

    /// Forget anything pending without releasing it.
    pub fn abort(&mut self) {
        if self.deadline.is_some() {
            log::debug!("sync: wait window aborted");
        }
        self.ready.clear();
        self.deadline = None;
    }

    pub fn remove(&mut self, id: InstrumentId) {
        self.members.retain(|&member| member != id);
        self.ready.remove(&id);
        if self.primary == Some(id) {
            self.primary = None;
            self.deadline = None;
            if self.is_grouped() && !self.free_run {
                log::warn!("sync: primary {:?} disconnected, falling back to free-run", id);
                self.engage_free_run();
            }
        }
    }

    pub fn on_ready(&mut self, id: InstrumentId, trigger_time: TimePoint, now: Instant) {
        self.ready.insert(id, (trigger_time, now));
        if self.is_grouped() && !self.free_run && self.primary == Some(id)
                && self.deadline.is_none() {
            log::debug!("sync: primary triggered at {}, waiting up to {:?}",
                trigger_time, self.window);
            self.deadline = Some(now + self.window);
        }
    }

    /// Hand out every group that is ready to be downloaded as of `now`.
    pub fn release(&mut self, now: Instant) -> Vec<ReleasedGroup> {
        if self.ready.is_empty() {
            return Vec::new()
        }
        if !self.is_grouped() || self.free_run {
            return self.release_singles()
        }
        if self.members.iter().all(|&member| self.ready_in_window(member)) {
            return self.release_aligned().into_iter().collect()
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.engage_free_run();
                self.release_singles()
            }
            _ => Vec::new()
        }
    }

    /// Seen ready no later than the deadline of the open window.
    fn ready_in_window(&self, id: InstrumentId) -> bool {
        self.ready.get(&id).is_some_and(|&(_, seen)|
            self.deadline.map_or(true, |deadline| seen <= deadline))
    }

    fn engage_free_run(&mut self) {
        let missing = self.members.iter().copied()
            .filter(|&member| !self.ready_in_window(member))
            .collect::<Vec<_>>();
        log::warn!("sync: timed out after {:?} waiting for {:?}, switching to free-run",
            self.window, missing);
        self.free_run = true;
        self.deadline = None;
        self.notifier.send(Notification::FreeRunEngaged { missing });
    }

    fn release_singles(&mut self) -> Vec<ReleasedGroup> {
        let free_run = self.free_run;
        std::mem::take(&mut self.ready).into_iter()
            .map(|(id, (trigger_time, _))| ReleasedGroup::single(id, trigger_time, free_run))
            .collect()
    }

    fn release_aligned(&mut self) -> Option<ReleasedGroup> {
        let (primary_time, _) = *self.ready.get(&self.primary?)?;
        let members = self.members.iter()
            .filter_map(|id| {
                let (trigger_time, _) = *self.ready.get(id)?;
                Some(SyncMember {
                    instrument: *id,
                    trigger_time,
                    skew_fs: trigger_time.femtos_since(primary_time),
                })
            })
            .collect::<Vec<_>>();
        log::debug!("sync: aligned {} instruments at {}", members.len(), primary_time);
        self.ready.clear();
        self.deadline = None;
        Some(ReleasedGroup { trigger_time: primary_time, members, free_run: false })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    fn ids(count: usize) -> Vec<InstrumentId> {
        (0..count).map(InstrumentId::from_index).collect()
    }

    #[test]
    fn test_single_instrument_passes_through() {
        let mut sync = MultiScopeSynchronizer::new(WINDOW, Notifier::default());
        let ids = ids(1);
        sync.begin(&ids, None);
        assert!(!sync.is_grouped());
        let now = Instant::now();
        sync.on_ready(ids[0], TimePoint::new(1, 0), now);
        let groups = sync.release(now);
        assert_eq!(groups, vec![ReleasedGroup::single(ids[0], TimePoint::new(1, 0), false)]);
        assert!(sync.release(now).is_empty());
    }

    #[test]
    fn test_aligned_group_with_skew() {
        let mut sync = MultiScopeSynchronizer::new(WINDOW, Notifier::default());
        let ids = ids(2);
        sync.begin(&ids, Some(ids[1]));
        let now = Instant::now();
        // secondary first: held until the primary shows up
        sync.on_ready(ids[0], TimePoint::new(5, 1_500), now);
        assert!(sync.release(now).is_empty());
        assert!(!sync.is_waiting());

        sync.on_ready(ids[1], TimePoint::new(5, 1_000), now);
        let groups = sync.release(now + WINDOW / 2);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert!(!group.free_run);
        assert_eq!(group.trigger_time, TimePoint::new(5, 1_000));
        assert_eq!(group.members.iter().map(|member| member.skew_fs).collect::<Vec<_>>(),
            vec![500, 0]);
        assert!(!sync.is_free_run());
    }

    #[test]
    fn test_window_expiry_engages_free_run() {
        let notifier = Notifier::default();
        let notifications = notifier.subscribe();
        let mut sync = MultiScopeSynchronizer::new(WINDOW, notifier);
        let ids = ids(2);
        sync.begin(&ids, None);
        let now = Instant::now();
        sync.on_ready(ids[0], TimePoint::new(1, 0), now);
        assert!(sync.is_waiting());
        assert!(sync.release(now + WINDOW / 2).is_empty());

        let groups = sync.release(now + WINDOW);
        assert_eq!(groups, vec![ReleasedGroup::single(ids[0], TimePoint::new(1, 0), true)]);
        assert!(sync.is_free_run());
        assert!(matches!(notifications.try_recv(),
            Ok(Notification::FreeRunEngaged { missing }) if missing == vec![ids[1]]));

        // stays free-running; late member released on its own
        sync.on_ready(ids[1], TimePoint::new(2, 0), now + WINDOW * 2);
        let groups = sync.release(now + WINDOW * 2);
        assert_eq!(groups, vec![ReleasedGroup::single(ids[1], TimePoint::new(2, 0), true)]);

        sync.begin(&ids, None);
        assert!(!sync.is_free_run());
    }

    #[test]
    fn test_member_seen_after_window_is_not_aligned() {
        let mut sync = MultiScopeSynchronizer::new(WINDOW, Notifier::default());
        let ids = ids(2);
        sync.begin(&ids, Some(ids[0]));
        let now = Instant::now();
        sync.on_ready(ids[0], TimePoint::new(1, 0), now);
        // both are ready by the time of the next release, but the secondary came in late
        let late = now + WINDOW * 2;
        sync.on_ready(ids[1], TimePoint::new(1, 10), late);
        let groups = sync.release(late);
        assert_eq!(groups, vec![
            ReleasedGroup::single(ids[0], TimePoint::new(1, 0), true),
            ReleasedGroup::single(ids[1], TimePoint::new(1, 10), true),
        ]);
        assert!(sync.is_free_run());
    }

    #[test]
    fn test_member_seen_at_deadline_is_aligned() {
        let mut sync = MultiScopeSynchronizer::new(WINDOW, Notifier::default());
        let ids = ids(2);
        sync.begin(&ids, Some(ids[0]));
        let now = Instant::now();
        sync.on_ready(ids[0], TimePoint::new(1, 0), now);
        sync.on_ready(ids[1], TimePoint::new(1, 10), now + WINDOW);
        let groups = sync.release(now + WINDOW);
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].free_run);
        assert_eq!(groups[0].members[1].skew_fs, 10);
    }

    #[test]
    fn test_abort_discards_pending() {
        let mut sync = MultiScopeSynchronizer::new(WINDOW, Notifier::default());
        let ids = ids(2);
        sync.begin(&ids, None);
        let now = Instant::now();
        sync.on_ready(ids[0], TimePoint::new(1, 0), now);
        sync.abort();
        assert!(!sync.is_waiting());
        assert!(sync.release(now + WINDOW * 2).is_empty());
        assert!(!sync.is_free_run());
    }
}
