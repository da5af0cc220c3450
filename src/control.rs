//! Session control. A single actor thread owns the active session; every
//! start, stop and restart goes through it, so sessions never overlap.

use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveWriter, SavedCapture};
use crate::error::{CaptureError, ConfigError, Result};
use crate::events::CaptureEvent;
use crate::session::{CaptureSession, CaptureTarget, SessionEnv, SessionOptions, SessionStatus};

enum Command {
    Start { target: Option<CaptureTarget>, options: Option<SessionOptions>, reply: Sender<Result<String>> },
    Stop { reply: Sender<Option<SavedCapture>> },
    SaveAndRestart { reply: Sender<Result<String>> },
    QueryReadiness { reply: Sender<Option<String>> },
    Status { reply: Sender<Option<SessionStatus>> },
    Shutdown { reply: Sender<()> },
}

pub struct Controller {
    target: Option<CaptureTarget>,
    options: SessionOptions,
    archive: ArchiveWriter,
    env: SessionEnv,
    active: Option<CaptureSession>,
}

impl Controller {
    pub fn new(target: Option<CaptureTarget>, options: SessionOptions, archive: ArchiveWriter, env: SessionEnv) -> Self {
        Controller { target, options, archive, env, active: None }
    }

    /// Move the controller onto its own thread.
    pub fn spawn(self) -> Result<(ControllerHandle, thread::JoinHandle<()>)> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new().name("capture-control".into()).spawn(move || self.run(rx))?;
        Ok((ControllerHandle { tx }, handle))
    }

    fn run(mut self, commands: Receiver<Command>) {
        for command in commands.iter() {
            match command {
                Command::Start { target, options, reply } => {
                    let _ = reply.send(self.start(target, options));
                }
                Command::Stop { reply } => {
                    let _ = reply.send(self.stop());
                }
                Command::SaveAndRestart { reply } => {
                    let _ = reply.send(self.save_and_restart());
                }
                Command::QueryReadiness { reply } => {
                    let _ = reply.send(self.query_readiness());
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.active.as_ref().map(CaptureSession::status));
                }
                Command::Shutdown { reply } => {
                    self.stop();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        // every handle dropped, or shut down
        if self.active.is_some() {
            self.stop();
        }
        debug!("controller exited");
    }

    fn start(&mut self, target: Option<CaptureTarget>, options: Option<SessionOptions>) -> Result<String> {
        let Some(target) = target.or_else(|| self.target.clone()) else {
            self.emit(CaptureEvent::CaptureError { message: "No interface specified".into() });
            return Err(ConfigError::NoTarget.into());
        };
        if let Some(options) = options {
            self.options = options;
        }

        // the previous session is fully stopped and archived first
        if let Some(previous) = self.active.take() {
            info!(interface = %previous.target(), "replacing running capture");
            previous.stop(&self.archive);
        }

        let label = self.launch(target, self.options)?;
        self.emit(CaptureEvent::CaptureStarted { interface: label.clone() });
        Ok(label)
    }

    fn launch(&mut self, target: CaptureTarget, options: SessionOptions) -> Result<String> {
        match CaptureSession::start(target.clone(), options, &self.env) {
            Ok(session) => {
                let label = target.label();
                self.target = Some(target);
                self.active = Some(session);
                Ok(label)
            }
            Err(e) => {
                warn!(interface = %target, error = %e, "failed to start capture");
                self.emit(CaptureEvent::CaptureError { message: format!("Failed to start capture: {e}") });
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> Option<SavedCapture> {
        let session = self.active.take()?;
        let saved = session.stop(&self.archive);
        self.emit(CaptureEvent::CaptureStopped {});
        saved
    }

    fn save_and_restart(&mut self) -> Result<String> {
        let Some(session) = self.active.take() else {
            self.emit(CaptureEvent::CaptureError { message: "No active capture to save".into() });
            return Err(CaptureError::NoActiveSession);
        };
        let target = session.target().clone();
        let options = session.options();
        session.stop(&self.archive);

        let label = self.launch(target, options)?;
        self.emit(CaptureEvent::CaptureRestarted { interface: label.clone() });
        Ok(label)
    }

    fn query_readiness(&self) -> Option<String> {
        let target = self.target.as_ref()?;
        let label = target.label();
        if self.active.is_none() {
            self.emit(CaptureEvent::InterfaceReady { interface: label.clone() });
        }
        Some(label)
    }

    fn emit(&self, event: CaptureEvent) {
        self.env.sink.emit(event);
    }
}

/// Cheap, cloneable access to the controller thread.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: Sender<Command>,
}

impl ControllerHandle {
    /// Start capturing on `target`, or on the configured target when `None`.
    /// Replaces any running session.
    pub fn start(&self, target: Option<CaptureTarget>) -> Result<String> {
        self.request(|reply| Command::Start { target, options: None, reply })?
    }

    pub fn start_with(&self, target: Option<CaptureTarget>, options: SessionOptions) -> Result<String> {
        self.request(|reply| Command::Start { target, options: Some(options), reply })?
    }

    /// Stop and archive the running session. `Ok(None)` when nothing was
    /// running or nothing was captured.
    pub fn stop(&self) -> Result<Option<SavedCapture>> {
        self.request(|reply| Command::Stop { reply })
    }

    pub fn save_and_restart(&self) -> Result<String> {
        self.request(|reply| Command::SaveAndRestart { reply })?
    }

    /// The configured interface label, if any.
    pub fn query_readiness(&self) -> Result<Option<String>> {
        self.request(|reply| Command::QueryReadiness { reply })
    }

    pub fn status(&self) -> Result<Option<SessionStatus>> {
        self.request(|reply| Command::Status { reply })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply })
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = bounded(1);
        self.tx.send(build(reply)).map_err(|_| CaptureError::ControllerGone)?;
        response.recv().map_err(|_| CaptureError::ControllerGone)
    }
}
