//! All acquisition-side state of one session, driven one poll iteration at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use crate::{Error, Result};
use crate::config::{RetentionPolicy, SessionConfig};
use crate::download::WaveformDownloader;
use crate::handoff::{DataHandoffGate, Origin, Published};
use crate::history::HistoryStore;
use crate::instrument::{Instrument, InstrumentId, Instruments, TriggerStatus};
use crate::notify::{Notification, Notifier};
use crate::persist::{ArmIntent, InstrumentRecord, SessionDocument};
use crate::rate::PerformanceTracker;
use crate::sync::MultiScopeSynchronizer;
use crate::time::TimePoint;
use crate::trigger::{TriggerArmController, TriggerState};
use crate::waveform::AcquisitionEvent;

/// Set from any thread to make the acquisition thread abandon the iteration in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub trigger: TriggerState,
    pub free_run: bool,
    pub waveform_rate: Option<f64>,
    pub total_waveforms: u64,
    pub history_entries: usize,
    pub history_bytes: usize,
    pub armed_for: Option<Duration>,
}

pub struct AcquisitionSession {
    config: SessionConfig,
    instruments: Instruments,
    primary: Option<InstrumentId>,
    trigger: TriggerArmController,
    sync: MultiScopeSynchronizer,
    downloader: WaveformDownloader,
    history: HistoryStore,
    rate: PerformanceTracker,
    gate: Arc<DataHandoffGate>,
    notifier: Notifier,
    cancel: CancelToken,
    halt_when: Option<Box<dyn Fn(&AcquisitionEvent) -> bool + Send>>,
}

impl AcquisitionSession {
    pub fn new(config: SessionConfig) -> AcquisitionSession {
        let notifier = Notifier::default();
        AcquisitionSession {
            instruments: Instruments::default(),
            primary: None,
            trigger: TriggerArmController::new(notifier.clone()),
            sync: MultiScopeSynchronizer::new(config.sync_window, notifier.clone()),
            downloader: WaveformDownloader::default(),
            history: HistoryStore::new(config.retention),
            rate: PerformanceTracker::new(config.rate_window),
            gate: Arc::new(DataHandoffGate::new()),
            notifier,
            cancel: CancelToken::default(),
            halt_when: None,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    pub fn trigger(&self) -> &TriggerArmController {
        &self.trigger
    }

    pub fn synchronizer(&self) -> &MultiScopeSynchronizer {
        &self.sync
    }

    pub fn downloader(&self) -> &WaveformDownloader {
        &self.downloader
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.rate
    }

    pub fn gate(&self) -> Arc<DataHandoffGate> {
        self.gate.clone()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_active(&self) -> bool {
        self.trigger.is_active()
    }

    pub fn add_instrument(&mut self, handle: Box<dyn Instrument>) -> InstrumentId {
        let id = self.instruments.add(handle);
        if self.primary.is_none() && self.config.primary.as_deref() == self.instruments.name(id) {
            self.primary = Some(id);
        }
        id
    }

    /// Disconnect an instrument. Its id stays retired; history entries that mention it are kept.
    pub fn remove_instrument(&mut self, id: InstrumentId) -> Option<Box<dyn Instrument>> {
        let mut handle = self.instruments.remove(id)?;
        if self.trigger.state(id) != TriggerState::Disarmed {
            handle.stop();
        }
        self.trigger.forget(id);
        self.sync.remove(id);
        let dropped = self.gate.enter().forget_instrument(id);
        log::debug!("session: dropped {} published channels of {:?}", dropped, id);
        if self.primary == Some(id) {
            self.primary = None;
        }
        Some(handle)
    }

    pub fn set_primary(&mut self, id: InstrumentId) -> Result<()> {
        if !self.instruments.contains(id) {
            return Err(Error::UnknownInstrument(format!("{:?}", id)))
        }
        self.primary = Some(id);
        Ok(())
    }

    /// The explicitly chosen primary, or else the first connected instrument.
    pub fn primary(&self) -> Option<InstrumentId> {
        self.primary.or_else(|| self.instruments.ids().next())
    }

    pub fn set_sync_window(&mut self, window: Duration) {
        self.config.sync_window = window;
        self.sync.set_window(window);
    }

    pub fn set_retention(&mut self, policy: RetentionPolicy) {
        self.config.retention = policy;
        self.history.set_policy(policy);
        if self.history.enforce() > 0 {
            self.notifier.send(Notification::HistoryChanged);
        }
    }

    /// Stop acquisition right after publishing an event for which `condition` holds.
    pub fn set_halt_condition<F>(&mut self, condition: F)
            where F: Fn(&AcquisitionEvent) -> bool + Send + 'static {
        self.halt_when = Some(Box::new(condition));
    }

    pub fn clear_halt_condition(&mut self) {
        self.halt_when = None;
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            trigger: self.trigger.aggregate(),
            free_run: self.sync.is_free_run(),
            waveform_rate: self.rate.rate(),
            total_waveforms: self.rate.total(),
            history_entries: self.history.len(),
            history_bytes: self.history.memory_usage(),
            armed_for: self.trigger.armed_at()
                .filter(|_| self.trigger.is_active())
                .map(|armed_at| armed_at.elapsed()),
        }
    }

    /// Secondaries first, primary last.
    fn arm_order(&self) -> Vec<InstrumentId> {
        let primary = self.primary();
        let mut order = self.instruments.ids()
            .filter(|&id| Some(id) != primary)
            .collect::<Vec<_>>();
        order.extend(primary);
        order
    }

    pub fn arm(&mut self, oneshot: bool) -> Result<()> {
        self.cancel.reset();
        self.rate.reset();
        let order = self.arm_order();
        if self.config.synchronize {
            self.sync.begin(&order, self.primary());
        } else {
            self.sync.begin(&[], None);
        }
        let result = self.trigger.arm(&mut self.instruments, &order, oneshot);
        if result.is_err() {
            self.sync.abort();
        }
        result
    }

    /// Disarm every instrument and drop any half-assembled group. Idempotent.
    pub fn stop(&mut self) {
        self.sync.abort();
        self.trigger.stop(&mut self.instruments);
    }

    pub fn poll(&mut self) -> Result<usize> {
        self.poll_at(Instant::now())
    }

    /// Run one iteration: poll armed instruments, then download and publish whatever the
    /// synchronizer releases. Returns the number of events published.
    pub fn poll_at(&mut self, now: Instant) -> Result<usize> {
        self.trigger.retry_rearm(&mut self.instruments);
        for id in self.trigger.pollable() {
            if self.cancel.is_cancelled() {
                log::debug!("poller: iteration cancelled");
                return Ok(0)
            }
            let Some(handle) = self.instruments.handle_mut(id) else { continue };
            match handle.poll_trigger(self.config.poll_timeout) {
                Ok(TriggerStatus::Ready(trigger_time)) => {
                    log::debug!("poller: {} triggered at {}", handle.name(), trigger_time);
                    self.trigger.mark_triggered(id);
                    self.sync.on_ready(id, trigger_time, now);
                }
                Ok(TriggerStatus::NotReady) => (),
                Err(error) => {
                    log::warn!("poller: polling {} failed, retrying next iteration: {}",
                        handle.name(), error);
                }
            }
        }

        let mut published = 0;
        for group in self.sync.release(now) {
            if self.cancel.is_cancelled() {
                log::debug!("poller: iteration cancelled before download");
                return Ok(published)
            }
            let event = match self.downloader.download(&mut self.instruments, &group) {
                Ok(event) => event,
                Err(error) => {
                    self.stop();
                    return Err(error)
                }
            };
            self.trigger.release(&mut self.instruments, &group.instruments());
            published += 1;
            if self.publish(Arc::new(event), now) {
                break
            }
        }
        Ok(published)
    }

    /// Returns true if the halt condition matched and everything was stopped.
    fn publish(&mut self, event: Arc<AcquisitionEvent>, now: Instant) -> bool {
        let published = self.gate.enter().publish(event.clone(), Origin::Live);
        log::debug!("poller: published #{} at {} ({:?})",
            published.sequence, event.trigger_time(), event.flags());
        self.rate.record(now);
        self.history.record(event.clone());
        self.history.enforce();
        self.notifier.send(Notification::AcquisitionPublished {
            trigger_time: event.trigger_time(),
            flags: event.flags(),
            origin: Origin::Live,
            sequence: published.sequence,
        });
        self.notifier.send(Notification::HistoryChanged);
        if self.halt_when.as_ref().is_some_and(|condition| condition(&event)) {
            log::info!("session: halt condition met at {}, stopping", event.trigger_time());
            self.stop();
            return true
        }
        false
    }

    /// Republish a past event through the handoff gate without touching the instruments.
    pub fn jump_to(&mut self, timepoint: TimePoint) -> Result<Published> {
        let event = self.history.lookup(timepoint)?;
        let published = self.gate.enter().publish(event.clone(), Origin::History);
        log::debug!("history: jumped to {}", timepoint);
        self.notifier.send(Notification::AcquisitionPublished {
            trigger_time: event.trigger_time(),
            flags: event.flags(),
            origin: Origin::History,
            sequence: published.sequence,
        });
        Ok(published)
    }

    pub fn lookup(&self, timepoint: TimePoint) -> Result<Arc<AcquisitionEvent>> {
        self.history.lookup(timepoint)
    }

    pub fn remove_history(&mut self, timepoint: TimePoint) -> Result<()> {
        self.history.remove(timepoint)?;
        self.notifier.send(Notification::HistoryChanged);
        Ok(())
    }

    pub fn prune_history(&mut self, policy: RetentionPolicy) -> usize {
        let evicted = self.history.prune(policy);
        if evicted > 0 {
            self.notifier.send(Notification::HistoryChanged);
        }
        evicted
    }

    pub fn document(&self) -> SessionDocument {
        let primary = self.primary();
        SessionDocument {
            trigger: ArmIntent::from_state(self.trigger.aggregate(), self.trigger.is_oneshot()),
            sync_window: self.config.sync_window,
            synchronize: self.config.synchronize,
            instruments: self.instruments.ids()
                .filter_map(|id| Some(InstrumentRecord {
                    id,
                    name: self.instruments.name(id)?.to_owned(),
                    streams: self.instruments.streams(id).to_vec(),
                    primary: Some(id) == primary,
                }))
                .collect(),
        }
    }

    pub fn serialize(&self) -> Result<serde_json::Value> {
        self.document().to_value()
    }

    /// Restore synchronization settings, the primary and the armed/disarmed intent. Instruments
    /// are matched by name; ones that are not connected are skipped.
    pub fn deserialize(&mut self, value: &serde_json::Value) -> Result<()> {
        let document = SessionDocument::from_value(value)?;
        self.set_sync_window(document.sync_window);
        self.config.synchronize = document.synchronize;
        for record in &document.instruments {
            match self.instruments.find(&record.name) {
                Some(id) if record.primary => self.primary = Some(id),
                Some(_) => (),
                None => log::warn!("session: saved instrument {:?} is not connected", record.name),
            }
        }
        match document.trigger {
            ArmIntent::Stopped => {
                self.stop();
                Ok(())
            }
            ArmIntent::Continuous => self.arm(false),
            ArmIntent::Single => self.arm(true),
        }
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        self.stop();
    }
}
