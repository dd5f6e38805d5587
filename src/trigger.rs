//! Arm/disarm state machine for the set of instruments in a session.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use crate::instrument::{InstrumentId, Instruments};
use crate::notify::{Notification, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerState {
    #[default]
    Disarmed,
    ArmedContinuous,
    ArmedOneShot,
    TriggeredPendingDownload,
}

impl TriggerState {
    pub fn is_armed(self) -> bool {
        matches!(self, Self::ArmedContinuous | Self::ArmedOneShot)
    }
}

#[derive(Debug)]
pub struct TriggerArmController {
    states: BTreeMap<InstrumentId, TriggerState>,
    // secondaries first, primary last; stopping walks it backwards
    order: Vec<InstrumentId>,
    oneshot: bool,
    rearm_pending: BTreeSet<InstrumentId>,
    armed_at: Option<Instant>,
    notifier: Notifier,
}

impl TriggerArmController {
    pub fn new(notifier: Notifier) -> TriggerArmController {
        TriggerArmController {
            states: BTreeMap::new(),
            order: Vec::new(),
            oneshot: false,
            rearm_pending: BTreeSet::new(),
            armed_at: None,
            notifier,
        }
    }

    pub fn state(&self, id: InstrumentId) -> TriggerState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    pub fn states(&self) -> impl Iterator<Item = (InstrumentId, TriggerState)> + '_ {
        self.states.iter().map(|(&id, &state)| (id, state))
    }

    /// Session-wide state: pending downloads dominate, then armed, then disarmed.
    pub fn aggregate(&self) -> TriggerState {
        let states = || self.states.values();
        if states().any(|&state| state == TriggerState::TriggeredPendingDownload) {
            TriggerState::TriggeredPendingDownload
        } else if states().any(|state| state.is_armed()) {
            if self.oneshot { TriggerState::ArmedOneShot } else { TriggerState::ArmedContinuous }
        } else {
            TriggerState::Disarmed
        }
    }

    pub fn is_active(&self) -> bool {
        self.states.values().any(|&state| state != TriggerState::Disarmed)
    }

    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    pub fn armed_at(&self) -> Option<Instant> {
        self.armed_at
    }

    /// Armed, but the instrument refused its last re-arm; retried before the next poll.
    pub fn is_rearm_pending(&self, id: InstrumentId) -> bool {
        self.rearm_pending.contains(&id)
    }

    /// Instruments that should be polled this iteration, in arm order.
    pub fn pollable(&self) -> Vec<InstrumentId> {
        self.order.iter().copied()
            .filter(|id| self.state(*id).is_armed() && !self.rearm_pending.contains(id))
            .collect()
    }

    fn set(&mut self, id: InstrumentId, state: TriggerState) {
        let previous = self.states.insert(id, state).unwrap_or_default();
        if previous != state {
            log::trace!("trigger: {:?} {:?} -> {:?}", id, previous, state);
            self.notifier.send(Notification::TriggerStateChanged { instrument: id, state });
        }
    }

    /// Arm every instrument in `order`, all or nothing.
    pub fn arm(&mut self, instruments: &mut Instruments, order: &[InstrumentId], oneshot: bool)
            -> Result<()> {
        if self.is_active() {
            log::debug!("trigger: re-arming, stopping first");
            self.stop(instruments);
        }
        let armed_state = if oneshot {
            TriggerState::ArmedOneShot
        } else {
            TriggerState::ArmedContinuous
        };
        let mut armed = Vec::new();
        for &id in order {
            let Some(handle) = instruments.handle_mut(id) else {
                self.unwind(instruments, &armed);
                return Err(Error::UnknownInstrument(format!("{:?}", id)))
            };
            match handle.arm(oneshot) {
                Ok(()) => {
                    armed.push(id);
                    self.set(id, armed_state);
                }
                Err(source) => {
                    let name = handle.name().to_owned();
                    log::warn!("trigger: {} rejected arm ({}), disarming {} already armed",
                        name, source, armed.len());
                    self.unwind(instruments, &armed);
                    return Err(Error::InstrumentComm { instrument: id, name, source })
                }
            }
        }
        log::info!("trigger: armed {} instruments ({})", armed.len(),
            if oneshot { "single" } else { "continuous" });
        self.order = armed;
        self.oneshot = oneshot;
        self.armed_at = Some(Instant::now());
        Ok(())
    }

    fn unwind(&mut self, instruments: &mut Instruments, armed: &[InstrumentId]) {
        for &id in armed.iter().rev() {
            if let Some(handle) = instruments.handle_mut(id) {
                handle.stop();
            }
            self.set(id, TriggerState::Disarmed);
        }
    }

    /// Disarm everything, primary first. Safe to call repeatedly.
    pub fn stop(&mut self, instruments: &mut Instruments) {
        let active = self.states.iter()
            .filter(|&(_, &state)| state != TriggerState::Disarmed)
            .map(|(&id, _)| id)
            .collect::<BTreeSet<_>>();
        let mut ordered = self.order.iter().rev().copied()
            .filter(|id| active.contains(id))
            .collect::<Vec<_>>();
        ordered.extend(active.iter().filter(|id| !self.order.contains(id)));
        for id in ordered {
            if let Some(handle) = instruments.handle_mut(id) {
                handle.stop();
            }
            self.set(id, TriggerState::Disarmed);
        }
        if !active.is_empty() {
            log::info!("trigger: stopped {} instruments", active.len());
        }
        self.rearm_pending.clear();
    }

    pub fn mark_triggered(&mut self, id: InstrumentId) {
        debug_assert!(self.state(id).is_armed(), "{:?} triggered while {:?}", id, self.state(id));
        self.set(id, TriggerState::TriggeredPendingDownload);
    }

    /// Called once every channel of `ids` has been downloaded (or failed). Continuous mode re-arms
    /// in arm order; single mode leaves the instruments disarmed.
    pub fn release(&mut self, instruments: &mut Instruments, ids: &[InstrumentId]) {
        let ordered = self.order.iter().copied()
            .filter(|id| ids.contains(id))
            .collect::<Vec<_>>();
        for id in ordered {
            if self.state(id) != TriggerState::TriggeredPendingDownload {
                continue
            }
            if self.oneshot {
                self.set(id, TriggerState::Disarmed);
                continue
            }
            self.set(id, TriggerState::ArmedContinuous);
            self.rearm(instruments, id);
        }
    }

    fn rearm(&mut self, instruments: &mut Instruments, id: InstrumentId) {
        let Some(handle) = instruments.handle_mut(id) else {
            self.forget(id);
            return
        };
        match handle.arm(false) {
            Ok(()) => {
                self.rearm_pending.remove(&id);
            }
            Err(error) => {
                log::warn!("trigger: re-arming {} failed, will retry: {}", handle.name(), error);
                self.rearm_pending.insert(id);
            }
        }
    }

    /// Retry re-arms that failed on a previous iteration.
    pub fn retry_rearm(&mut self, instruments: &mut Instruments) {
        for id in self.rearm_pending.clone() {
            self.rearm(instruments, id);
        }
    }

    pub fn forget(&mut self, id: InstrumentId) {
        self.states.remove(&id);
        self.order.retain(|&other| other != id);
        self.rearm_pending.remove(&id);
    }
}
