//! Capture backend abstraction
//!
//! A backend performs the actual capture and encoding for one session. Two
//! variants exist: the in-process frame loop and an external capture process.

use super::frame_loop::FrameLoopBackend;
use super::process::ProcessBackend;
use super::state::{RecordingEvent, SessionStatus, StopKind};
use crate::capture::open_sources;
use crate::config::{BackendConfig, RecorderConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Capture backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Backend did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// What a backend reports once it has stopped and released its resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendReport {
    pub ending: StopKind,
    pub degraded: bool,
    pub frames: Option<u64>,
}

impl BackendReport {
    pub fn graceful(frames: Option<u64>) -> Self {
        Self {
            ending: StopKind::Graceful,
            degraded: false,
            frames,
        }
    }

    pub fn forced(frames: Option<u64>) -> Self {
        Self {
            ending: StopKind::Forced,
            degraded: true,
            frames,
        }
    }
}

/// Whether `path` is absent or has no bytes, i.e. certainly not playable
pub(crate) fn output_is_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

/// One capture mechanism, driven by the session manager.
///
/// `stop` must release every resource it holds (thread, writer, process)
/// before returning, whichever way the worker ended.
#[async_trait]
pub trait CaptureBackend: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Begin capturing into `output`. Returns once capture is confirmed.
    async fn start(&mut self, output: &Path) -> RecordingResult<()>;

    /// Signal the worker, wait up to `timeout`, then force it down.
    async fn stop(&mut self, timeout: Duration) -> BackendReport;

    /// Whether a worker is currently attached
    fn is_active(&self) -> bool;
}

/// Shared handles a backend's worker uses to report back to the manager.
///
/// Each session gets its own context. Once the manager releases a session
/// the context is retired, and anything a leftover worker reports through
/// it is dropped.
#[derive(Clone)]
pub struct WorkerContext {
    events: broadcast::Sender<RecordingEvent>,
    status: Arc<RwLock<SessionStatus>>,
    active_workers: Arc<AtomicUsize>,
    /// Set by any `mark_failed`, even one arriving before `Running`
    failed: Arc<AtomicBool>,
    retired: Arc<AtomicBool>,
}

impl WorkerContext {
    pub(crate) fn new(
        events: broadcast::Sender<RecordingEvent>,
        status: Arc<RwLock<SessionStatus>>,
        active_workers: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            events,
            status,
            active_workers,
            failed: Arc::new(AtomicBool::new(false)),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn emit(&self, event: RecordingEvent) {
        if self.is_retired() {
            tracing::debug!("Dropping event from a released session: {:?}", event);
            return;
        }
        let _ = self.events.send(event);
    }

    /// Move a running session to `Failed`. Any other status is left alone,
    /// and a retired context changes nothing.
    pub fn mark_failed(&self, reason: &str) {
        {
            let mut status = self.status.write();
            // Checked under the status lock so it orders against the next
            // session publishing `Running`
            if self.is_retired() {
                tracing::debug!("Ignoring failure from a released session: {}", reason);
                return;
            }
            self.failed.store(true, Ordering::SeqCst);
            if *status != SessionStatus::Running {
                return;
            }
            *status = SessionStatus::Failed;
        }
        tracing::error!("Recording failed: {}", reason);
        self.emit(RecordingEvent::Failed {
            reason: reason.to_string(),
        });
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Detach this context from the manager's status and event stream
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Count a live worker until every clone of the guard drops or one of
    /// them is released
    pub fn worker_guard(&self) -> WorkerGuard {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        WorkerGuard {
            slot: Arc::new(WorkerSlot {
                active_workers: self.active_workers.clone(),
                released: AtomicBool::new(false),
            }),
        }
    }
}

/// Keeps a worker counted in `SessionManager::active_workers`.
///
/// Clones share one slot, so the worker and its owner can both hold it and
/// whichever lets go first uncounts the worker.
#[derive(Clone)]
pub struct WorkerGuard {
    slot: Arc<WorkerSlot>,
}

struct WorkerSlot {
    active_workers: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl WorkerSlot {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.active_workers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl WorkerGuard {
    /// Stop counting the worker now. Later calls and drops do nothing.
    pub fn release(&self) {
        self.slot.release();
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Builds a fresh backend for every session
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        config: &RecorderConfig,
        ctx: WorkerContext,
    ) -> RecordingResult<Box<dyn CaptureBackend>>;
}

/// Builds the backend described by `RecorderConfig::backend`
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredBackends;

impl BackendFactory for ConfiguredBackends {
    fn create(
        &self,
        config: &RecorderConfig,
        ctx: WorkerContext,
    ) -> RecordingResult<Box<dyn CaptureBackend>> {
        match &config.backend {
            BackendConfig::FrameLoop(frame_loop) => {
                let sources = open_sources(&frame_loop.sources)?;
                Ok(Box::new(FrameLoopBackend::new(
                    sources,
                    frame_loop.encoder.clone(),
                    config.fps,
                    ctx,
                )))
            }
            BackendConfig::Process(process) => {
                Ok(Box::new(ProcessBackend::new(process.clone(), config.fps, ctx)))
            }
        }
    }
}
