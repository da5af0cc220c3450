use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveName, ArchiveTap, ArchiveWriter, SavedCapture};
use crate::buffer::PacketBuffer;
use crate::config::{BatchTuning, PipelineTuning};
use crate::dispatch::{self, BatchDispatcher};
use crate::dns::{self, DnsCache, ReverseResolver};
use crate::error::Result;
use crate::events::{CaptureEvent, EventSink};
use crate::filter::VisibilityPolicy;
use crate::models::domain::{Alert, RawFrame};
use crate::parser::LinkLayer;
use crate::pipeline::Pipeline;
use crate::remote::{self, RemoteProcess, RemoteTarget};
use crate::{replay, sniff};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Local { interface: String },
    Remote(RemoteTarget),
    /// A stored capture played through the live pipeline.
    Replay { path: PathBuf },
}

impl CaptureTarget {
    pub fn label(&self) -> String {
        match self {
            CaptureTarget::Local { interface } => interface.clone(),
            CaptureTarget::Remote(remote) => remote.label(),
            CaptureTarget::Replay { path } => format!("replay:{}", path.display()),
        }
    }

    pub fn archive_name(&self) -> ArchiveName {
        match self {
            CaptureTarget::Local { .. } | CaptureTarget::Replay { .. } => ArchiveName::Live,
            CaptureTarget::Remote(remote) => ArchiveName::Remote {
                host: remote.host_name().to_string(),
                interface: remote.interface.clone(),
            },
        }
    }

    fn batch_tuning(&self, tuning: &PipelineTuning) -> BatchTuning {
        match self {
            CaptureTarget::Remote(_) => tuning.remote,
            _ => tuning.live,
        }
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub resolve_dns: bool,
    pub policy: VisibilityPolicy,
    pub tuning: PipelineTuning,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions { resolve_dns: true, policy: VisibilityPolicy::default(), tuning: PipelineTuning::default() }
    }
}

/// Collaborators a session needs from whoever starts it.
#[derive(Clone)]
pub struct SessionEnv {
    pub runtime: Handle,
    pub sink: Arc<dyn EventSink>,
    pub resolver: Arc<dyn ReverseResolver>,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) pipeline: Pipeline,
    pub(crate) buffer: PacketBuffer,
    alerts_delivered: usize,
}

impl SessionState {
    pub(crate) fn new(pipeline: Pipeline, capacity: usize) -> Self {
        SessionState { pipeline, buffer: PacketBuffer::new(capacity), alerts_delivered: 0 }
    }

    pub(crate) fn ingest(&mut self, frame: &RawFrame, link: LinkLayer) {
        let Some(record) = self.pipeline.process(frame, link) else { return };
        if !self.buffer.push(record) {
            let dropped = self.buffer.dropped();
            if dropped % 100 == 1 {
                warn!(dropped, capacity = self.buffer.capacity(), "packet buffer full, dropping packets");
            }
        }
        let accepted = self.pipeline.aggregator().totals().packets;
        if accepted % 100 == 0 {
            debug!(packets = accepted, buffered = self.buffer.len(), "capture progress");
        }
    }

    /// Alerts raised since the previous call.
    pub(crate) fn take_new_alerts(&mut self) -> Vec<Alert> {
        let alerts = self.pipeline.alerts();
        let fresh = alerts[self.alerts_delivered.min(alerts.len())..].to_vec();
        self.alerts_delivered = alerts.len();
        fresh
    }
}

/// Feeds frames from a source thread into the session.
#[derive(Clone)]
pub struct FrameIngest {
    state: Arc<Mutex<SessionState>>,
    tap: Arc<Mutex<ArchiveTap>>,
}

impl FrameIngest {
    pub(crate) fn new(state: Arc<Mutex<SessionState>>, tap: Arc<Mutex<ArchiveTap>>) -> Self {
        FrameIngest { state, tap }
    }

    pub fn accept(&self, frame: RawFrame, dlt: i32) {
        self.state.lock().ingest(&frame, LinkLayer::from_dlt(dlt));
        self.tap.lock().push(frame, dlt);
    }
}

/// What a source loop gets: where frames go, when to stop, where errors go.
pub struct SourceContext {
    pub ingest: FrameIngest,
    pub running: Arc<AtomicBool>,
    pub sink: Arc<dyn EventSink>,
}

impl SourceContext {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the session dead and report `message`, unless it is already
    /// stopping, in which case the failure is expected and only logged.
    pub fn fail(&self, message: String) {
        if self.running.swap(false, Ordering::SeqCst) {
            error!(%message, "capture failed");
            self.sink.emit(CaptureEvent::CaptureError { message });
        } else {
            debug!(%message, "capture source ended during shutdown");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub interface: String,
    pub running: bool,
    pub packets: u64,
    pub bytes: u64,
    pub buffered: usize,
    pub dropped: u64,
    pub alerts: usize,
    pub archived_frames: usize,
}

struct SourceThread {
    handle: thread::JoinHandle<()>,
    exited: Receiver<()>,
}

impl SourceThread {
    fn join(self, timeout: Duration) {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!("capture thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "capture thread did not stop in time, detaching it");
            }
        }
    }
}

fn spawn_source<F>(name: &str, body: F) -> Result<SourceThread>
where
    F: FnOnce() + Send + 'static,
{
    let (exited_tx, exited) = crossbeam_channel::bounded(1);
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        body();
        let _ = exited_tx.send(());
    })?;
    Ok(SourceThread { handle, exited })
}

/// One running capture: a source thread feeding the shared state plus the
/// dispatcher and DNS tasks reading from it.
pub struct CaptureSession {
    target: CaptureTarget,
    options: SessionOptions,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    tap: Arc<Mutex<ArchiveTap>>,
    source: Option<SourceThread>,
    process: Option<RemoteProcess>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    sink: Arc<dyn EventSink>,
}

impl CaptureSession {
    pub fn start(target: CaptureTarget, options: SessionOptions, env: &SessionEnv) -> Result<Self> {
        let batch = target.batch_tuning(&options.tuning);
        let dns_cache = options.resolve_dns.then(|| Arc::new(DnsCache::new()));
        let state = Arc::new(Mutex::new(SessionState::new(
            Pipeline::new(options.policy, dns_cache.clone()),
            batch.buffer_capacity,
        )));
        let tap = Arc::new(Mutex::new(ArchiveTap::new(options.tuning.archive_frame_limit)));
        let running = Arc::new(AtomicBool::new(true));
        let context = SourceContext {
            ingest: FrameIngest::new(Arc::clone(&state), Arc::clone(&tap)),
            running: Arc::clone(&running),
            sink: Arc::clone(&env.sink),
        };

        let (source, process) = match &target {
            CaptureTarget::Local { interface } => {
                let capture = sniff::open_interface(interface)?;
                let source = spawn_source("capture-live", move || sniff::capture_loop(capture, &context))?;
                (source, None)
            }
            CaptureTarget::Replay { path } => {
                let capture = replay::open(path)?;
                let source = spawn_source("capture-replay", move || replay::replay_loop(capture, &context))?;
                (source, None)
            }
            CaptureTarget::Remote(remote) => {
                let (mut process, stdout) = remote::launch(remote)?;
                let stderr_tail = process.stderr_tail();
                match spawn_source("capture-remote", move || remote::receive_loop(stdout, &context, &stderr_tail)) {
                    Ok(source) => (source, Some(process)),
                    Err(e) => {
                        process.terminate();
                        return Err(e);
                    }
                }
            }
        };

        let mut tasks = Vec::with_capacity(2);
        let dispatcher = BatchDispatcher::new(Arc::clone(&state), dns_cache.clone(), batch.max_packets);
        tasks.push(dispatch::spawn_dispatcher(
            &env.runtime,
            dispatcher,
            Arc::clone(&env.sink),
            Arc::clone(&running),
            batch.interval(),
        ));
        if let Some(cache) = dns_cache {
            tasks.push(dns::spawn_worker(
                &env.runtime,
                cache,
                Arc::clone(&env.resolver),
                Arc::clone(&running),
                options.tuning.dns,
            ));
        }

        info!(
            interface = %target,
            dns = options.resolve_dns,
            ipv4_only = options.policy.ipv4_only,
            private_only = options.policy.private_only,
            "capture session started"
        );

        Ok(CaptureSession {
            target,
            options,
            running,
            state,
            tap,
            source: Some(source),
            process,
            tasks,
            sink: Arc::clone(&env.sink),
        })
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// False once stopped or after the source failed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        let (packets, bytes, buffered, dropped, alerts) = {
            let state = self.state.lock();
            let totals = state.pipeline.aggregator().totals();
            (totals.packets, totals.bytes, state.buffer.len(), state.buffer.dropped(), state.pipeline.alerts().len())
        };
        SessionStatus {
            interface: self.target.label(),
            running: self.is_running(),
            packets,
            bytes,
            buffered,
            dropped,
            alerts,
            archived_frames: self.tap.lock().len(),
        }
    }

    /// Stop the source and background tasks, then archive what was captured.
    pub fn stop(mut self, archive: &ArchiveWriter) -> Option<SavedCapture> {
        self.running.store(false, Ordering::SeqCst);
        // the remote reader only sees EOF once the transport is gone
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        if let Some(source) = self.source.take() {
            source.join(self.options.tuning.stop_timeout());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(interface = %self.target, "capture session stopped");
        self.archive(archive)
    }

    fn archive(&self, archive: &ArchiveWriter) -> Option<SavedCapture> {
        let (frames, dlt) = self.tap.lock().take();
        match archive.save(&self.target.archive_name(), dlt, &frames) {
            Ok(Some(saved)) => {
                self.sink.emit(CaptureEvent::PcapSaved {
                    filename: saved.filename.clone(),
                    packet_count: saved.packet_count,
                });
                Some(saved)
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, dir = %archive.dir().display(), "failed to archive capture");
                None
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("target", &self.target)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
