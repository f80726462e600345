//! Recording session manager
//!
//! Owns at most one capture session, serializes start/stop, and guarantees
//! that a stopped session has released its worker and closed its file.

use super::backend::{
    output_is_empty, BackendFactory, CaptureBackend, ConfiguredBackends, RecordingResult,
    WorkerContext,
};
use super::state::{FinishedClip, RecordingEvent, SessionInfo, SessionSnapshot, SessionStatus};
use crate::config::RecorderConfig;
use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// The session currently held in the manager's slot
struct ActiveSession {
    info: SessionInfo,
    backend: Box<dyn CaptureBackend>,
    ctx: WorkerContext,
}

/// Manages one screen recording session at a time
pub struct SessionManager {
    /// Fixed at construction
    config: RecorderConfig,

    /// Builds a backend for every new session
    factory: Arc<dyn BackendFactory>,

    /// Current session; held across the whole of `start()` and `stop()`
    slot: Mutex<Option<ActiveSession>>,

    /// Published status, readable without the slot lock
    status: Arc<RwLock<SessionStatus>>,

    /// Published identity of the current session
    current: RwLock<Option<SessionInfo>>,

    /// Live capture workers across all sessions
    active_workers: Arc<AtomicUsize>,

    /// Event broadcaster
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl SessionManager {
    /// Create a manager that builds the backend named in `config`
    pub fn new(config: RecorderConfig) -> Self {
        Self::with_factory(config, Arc::new(ConfiguredBackends))
    }

    pub fn with_factory(config: RecorderConfig, factory: Arc<dyn BackendFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            factory,
            slot: Mutex::new(None),
            status: Arc::new(RwLock::new(SessionStatus::Idle)),
            current: RwLock::new(None),
            active_workers: Arc::new(AtomicUsize::new(0)),
            event_tx,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Whether a session is recording or being stopped.
    /// Never blocks on `start`/`stop`.
    pub fn is_running(&self) -> bool {
        self.status.read().is_active()
    }

    /// Snapshot of the current status
    pub fn status(&self) -> SessionSnapshot {
        let status = *self.status.read();
        let session = self.current.read().clone();
        let elapsed_ms = session.as_ref().map(SessionInfo::elapsed_ms);
        SessionSnapshot {
            status,
            session,
            elapsed_ms,
        }
    }

    /// Output path of the session in the slot, if any
    pub fn current_path(&self) -> Option<PathBuf> {
        self.current
            .read()
            .as_ref()
            .map(|session| session.output_path.clone())
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Capture threads or processes currently alive
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Start recording, or return the running session's path
    pub async fn start(&self) -> RecordingResult<PathBuf> {
        let mut slot = self.slot.lock().await;

        if let Some(active) = slot.as_ref() {
            if *self.status.read() != SessionStatus::Failed {
                tracing::debug!("Already recording to {:?}", active.info.output_path);
                return Ok(active.info.output_path.clone());
            }
        }

        // A failed session still holds its backend until released
        if let Some(failed) = slot.take() {
            let clip = self.release(failed).await;
            tracing::info!("Released failed session {:?}", clip.path);
        }

        let output_path = match clip_path(&self.config, Local::now()) {
            Ok(path) => path,
            Err(e) => {
                self.reset_idle();
                return Err(e.into());
            }
        };
        let ctx = WorkerContext::new(
            self.event_tx.clone(),
            self.status.clone(),
            self.active_workers.clone(),
        );

        let mut backend = match self.factory.create(&self.config, ctx.clone()) {
            Ok(backend) => backend,
            Err(e) => {
                ctx.retire();
                self.reset_idle();
                return Err(e);
            }
        };

        tracing::info!(
            "Starting recording to {:?} ({} backend)",
            output_path,
            backend.name()
        );

        if let Err(e) = backend.start(&output_path).await {
            tracing::warn!("Failed to start {} backend: {}", backend.name(), e);
            ctx.retire();
            remove_partial_file(&output_path);
            self.reset_idle();
            return Err(e);
        }

        let info = SessionInfo::new(output_path.clone());
        *self.current.write() = Some(info.clone());
        *self.status.write() = SessionStatus::Running;

        // The worker may have died before the status could record it
        if ctx.has_failed() || !backend.is_active() {
            ctx.mark_failed("capture ended during startup");
        }

        let _ = self.event_tx.send(RecordingEvent::Started {
            path: output_path.clone(),
        });
        tracing::info!("Recording started: {:?} (session {})", output_path, info.id);

        *slot = Some(ActiveSession { info, backend, ctx });
        Ok(output_path)
    }

    /// Stop recording. Returns `None` when nothing was recording.
    pub async fn stop(&self) -> Option<FinishedClip> {
        let mut slot = self.slot.lock().await;
        let active = slot.take()?;
        Some(self.release(active).await)
    }

    /// Stop the backend, wait for it to release everything, and finalize
    async fn release(&self, active: ActiveSession) -> FinishedClip {
        let ActiveSession {
            info,
            mut backend,
            ctx,
        } = active;

        let failed = {
            let mut status = self.status.write();
            let failed = *status == SessionStatus::Failed;
            if !failed {
                *status = SessionStatus::Stopping;
            }
            failed
        };

        tracing::info!("Stopping recording {:?}", info.output_path);
        let report = backend.stop(self.config.stop_timeout()).await;
        drop(backend);
        // A worker detached by a forced stop can no longer touch the status
        ctx.retire();

        let degraded = report.degraded || output_is_empty(&info.output_path);
        if degraded {
            tracing::warn!("Clip {:?} may not be playable", info.output_path);
        }

        let status = if failed {
            SessionStatus::Failed
        } else {
            SessionStatus::Finalized
        };
        *self.status.write() = status;
        *self.current.write() = None;

        let _ = self.event_tx.send(RecordingEvent::Stopped {
            path: info.output_path.clone(),
            ending: report.ending,
            degraded,
        });

        let duration_ms = (Utc::now() - info.started_at).num_milliseconds();
        tracing::info!(
            "Recording {:?}: {:?} ({:?}, {} ms)",
            status,
            info.output_path,
            report.ending,
            duration_ms
        );

        FinishedClip {
            id: info.id,
            path: info.output_path,
            status,
            ending: report.ending,
            degraded,
            frames: report.frames,
            started_at: info.started_at,
            duration_ms,
        }
    }

    fn reset_idle(&self) {
        *self.status.write() = SessionStatus::Idle;
        *self.current.write() = None;
    }
}

/// Pick `<clips_dir>/<prefix>_<YYYYMMDD_HHMMSS>.<container>`, creating the
/// directory. A clip from the same second gets a `_1`, `_2`, ... suffix.
fn clip_path(config: &RecorderConfig, now: DateTime<Local>) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(&config.clips_dir)?;

    let stem = format!(
        "{}_{}",
        config.filename_prefix,
        now.format("%Y%m%d_%H%M%S")
    );
    let mut path = config
        .clips_dir
        .join(format!("{}.{}", stem, config.container));

    let mut n = 1;
    while path.exists() {
        path = config
            .clips_dir
            .join(format!("{}_{}.{}", stem, n, config.container));
        n += 1;
    }

    Ok(path)
}

fn remove_partial_file(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed partial clip {:?}", path),
        Err(e) => tracing::warn!("Failed to remove partial clip {:?}: {}", path, e),
    }
}
