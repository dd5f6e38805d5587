//! The acquisition thread and the handle other threads use to talk to it.

use std::sync::Arc;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread;

use crate::{Error, Result};
use crate::config::RetentionPolicy;
use crate::handoff::{DataHandoffGate, Published};
use crate::notify::{Notification, Notifier};
use crate::session::{AcquisitionSession, CancelToken, SessionStatus};
use crate::time::TimePoint;
use crate::waveform::AcquisitionEvent;

type Job = Box<dyn FnOnce(&mut AcquisitionSession) + Send>;

enum Command {
    Run(Job),
    Stop,
    Shutdown,
}

/// Owns the session on a dedicated thread. Every acquisition-side mutation happens there, one
/// command or poll iteration at a time.
pub struct AcquisitionPoller {
    session: AcquisitionSession,
    commands: Receiver<Command>,
}

impl AcquisitionPoller {
    pub fn new(session: AcquisitionSession) -> (AcquisitionPoller, SessionHandle) {
        let (send, recv) = channel();
        let handle = SessionHandle {
            commands: send,
            cancel: session.cancel_token(),
            gate: session.gate(),
            notifier: session.notifier().clone(),
        };
        (AcquisitionPoller { session, commands: recv }, handle)
    }

    /// Start polling. The thread exits once every `SessionHandle` is dropped or `shutdown` is
    /// called, or with an error if acquisition hits a fatal condition; either way all
    /// instruments are disarmed on the way out.
    pub fn run(self) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || self.poll_loop())
    }

    fn poll_loop(mut self) -> Result<()> {
        'session: loop {
            // nothing armed: sleep until somebody asks for something
            if !self.session.is_active() {
                match self.commands.recv() {
                    Ok(command) => {
                        if !self.execute(command) { break 'session }
                    }
                    Err(_) => break 'session,
                }
            }
            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if !self.execute(command) { break 'session }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'session,
                }
            }
            if !self.session.is_active() {
                continue
            }
            match self.session.poll() {
                Ok(0) => thread::sleep(self.session.config().poll_interval),
                Ok(published) => log::trace!("poller: published {} events", published),
                Err(error) => {
                    log::error!("poller: acquisition failed: {}", error);
                    self.session.stop();
                    return Err(error)
                }
            }
        }
        log::debug!("poller: done");
        self.session.stop();
        Ok(())
    }

    fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Run(job) => {
                job(&mut self.session);
                true
            }
            Command::Stop => {
                self.session.stop();
                true
            }
            Command::Shutdown => false,
        }
    }
}

/// Cloneable, thread-safe access to a session running on an `AcquisitionPoller`.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<Command>,
    cancel: CancelToken,
    gate: Arc<DataHandoffGate>,
    notifier: Notifier,
}

impl SessionHandle {
    /// The gate consumers read published waveforms through.
    pub fn gate(&self) -> &Arc<DataHandoffGate> {
        &self.gate
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Run `f` on the acquisition thread between poll iterations and wait for its result.
    pub fn call<F, R>(&self, f: F) -> Result<R>
            where F: FnOnce(&mut AcquisitionSession) -> R + Send + 'static, R: Send + 'static {
        let (reply_send, reply_recv) = channel();
        let job: Job = Box::new(move |session| {
            let _ = reply_send.send(f(session));
        });
        self.commands.send(Command::Run(job)).map_err(|_| Error::SessionClosed)?;
        reply_recv.recv().map_err(|_| Error::SessionClosed)
    }

    pub fn arm(&self, oneshot: bool) -> Result<()> {
        self.call(move |session| session.arm(oneshot))?
    }

    /// Disarm everything. The iteration in progress is abandoned as soon as the acquisition
    /// thread notices; does not wait for the instruments to acknowledge.
    pub fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.commands.send(Command::Stop).map_err(|_| Error::SessionClosed)
    }

    /// Stop acquisition once a published event satisfies `condition`.
    pub fn set_halt_condition<F>(&self, condition: F) -> Result<()>
            where F: Fn(&AcquisitionEvent) -> bool + Send + 'static {
        self.call(move |session| session.set_halt_condition(condition))
    }

    pub fn status(&self) -> Result<SessionStatus> {
        self.call(|session| session.status())
    }

    pub fn jump_to(&self, timepoint: TimePoint) -> Result<Published> {
        self.call(move |session| session.jump_to(timepoint))?
    }

    pub fn lookup(&self, timepoint: TimePoint) -> Result<Arc<AcquisitionEvent>> {
        self.call(move |session| session.lookup(timepoint))?
    }

    pub fn history(&self) -> Result<Vec<TimePoint>> {
        self.call(|session| session.history().timepoints().collect())
    }

    pub fn remove_history(&self, timepoint: TimePoint) -> Result<()> {
        self.call(move |session| session.remove_history(timepoint))?
    }

    pub fn prune_history(&self, policy: RetentionPolicy) -> Result<usize> {
        self.call(move |session| session.prune_history(policy))
    }

    pub fn serialize(&self) -> Result<serde_json::Value> {
        self.call(|session| session.serialize())?
    }

    pub fn deserialize(&self, document: serde_json::Value) -> Result<()> {
        self.call(move |session| session.deserialize(&document))?
    }

    /// Ask the acquisition thread to disarm everything and exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
