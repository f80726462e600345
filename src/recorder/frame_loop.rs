//! In-process frame loop backend
//!
//! One named OS thread grabs a frame from every source per tick, composites
//! them side by side and hands the result to a [`VideoWriter`]. The thread
//! paces itself by sleeping on the stop condition variable, so `stop()` wakes
//! it immediately instead of waiting out the interval.

use super::backend::{
    BackendReport, CaptureBackend, RecordingError, RecordingResult, WorkerContext, WorkerGuard,
};
use super::state::{RecordingEvent, StopKind};
use crate::capture::{Compositor, Frame, FrameSource};
use crate::config::EncoderConfig;
use crate::encode::{open_writer, VideoWriter, WriterReport};
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Extra time a forcibly closed writer gets to unblock the capture thread
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Stop request observed by the capture loop
pub struct StopSignal {
    requested: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            requested: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn request(&self) {
        *self.requested.lock() = true;
        self.condvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    /// Sleep up to `timeout`. Returns true as soon as a stop is requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.requested.lock();
        while !*requested {
            if self.condvar.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        *requested
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

struct LoopOutcome {
    writer: RecordingResult<WriterReport>,
}

/// State owned by the capture thread
struct CaptureLoop {
    sources: Vec<Box<dyn FrameSource>>,
    live: Vec<bool>,
    compositor: Compositor,
    writer: Arc<dyn VideoWriter>,
    stop: Arc<StopSignal>,
    interval: Duration,
    fps: u32,
    ctx: WorkerContext,
}

impl CaptureLoop {
    fn run(mut self, mut wait: Duration) -> LoopOutcome {
        loop {
            if self.stop.wait_timeout(wait) {
                break;
            }

            let tick = Instant::now();
            let frames = self.grab();

            if !self.live.iter().any(|&live| live) {
                // After a stop request the session is no longer ours to fail
                if !self.stop.is_requested() {
                    self.ctx.mark_failed("every capture source was lost");
                }
                break;
            }

            let composite = self.compositor.compose(&frames);
            if let Err(e) = self.writer.write_frame(composite) {
                if !self.stop.is_requested() {
                    self.ctx.mark_failed(&format!("encoder stopped accepting frames: {}", e));
                }
                break;
            }

            let count = self.writer.frame_count();
            if count % 60 == 0 {
                let (width, height) = self.compositor.dimensions();
                tracing::debug!(
                    "Captured {} frames ({:.1}s) at {}x{}",
                    count,
                    count as f64 / self.fps as f64,
                    width,
                    height
                );
            }

            // Running late is fine: the next tick starts at once and the
            // effective frame rate drops instead of frames being skipped.
            wait = self.interval.saturating_sub(tick.elapsed());
        }

        LoopOutcome {
            writer: self.writer.finish(),
        }
    }

    /// Capture every live source for this tick
    fn grab(&mut self) -> Vec<Option<Frame>> {
        let ctx = &self.ctx;
        self.sources
            .iter_mut()
            .zip(self.live.iter_mut())
            .map(|(source, live)| {
                if !*live {
                    return None;
                }
                match source.capture() {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        *live = false;
                        tracing::warn!(
                            "Capture source {} lost, blanking its region: {}",
                            source.id(),
                            e
                        );
                        ctx.emit(RecordingEvent::SourceLost {
                            source: source.id().to_string(),
                            reason: e.to_string(),
                        });
                        None
                    }
                }
            })
            .collect()
    }
}

struct Worker {
    stop: Arc<StopSignal>,
    writer: Arc<dyn VideoWriter>,
    output: PathBuf,
    done: oneshot::Receiver<()>,
    handle: thread::JoinHandle<LoopOutcome>,
    /// Shared with the thread, which releases it on exit
    guard: WorkerGuard,
}

/// Grabs screen frames in-process and encodes them through a [`VideoWriter`]
pub struct FrameLoopBackend {
    sources: Vec<Box<dyn FrameSource>>,
    encoder: EncoderConfig,
    fps: u32,
    ctx: WorkerContext,
    worker: Option<Worker>,
}

impl FrameLoopBackend {
    pub fn new(
        sources: Vec<Box<dyn FrameSource>>,
        encoder: EncoderConfig,
        fps: u32,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            sources,
            encoder,
            fps: fps.max(1),
            ctx,
            worker: None,
        }
    }
}

/// Abort off the async runtime; killing an encoder process waits for it
async fn abort_writer(writer: &Arc<dyn VideoWriter>) {
    let writer = writer.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || writer.abort()).await {
        tracing::error!("Failed to abort encoder: {}", e);
    }
}

async fn join_capture_thread(handle: thread::JoinHandle<LoopOutcome>) -> Option<LoopOutcome> {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(_)) => {
            tracing::error!("Capture thread panicked");
            None
        }
        Err(e) => {
            tracing::error!("Failed to join capture thread: {}", e);
            None
        }
    }
}

#[async_trait]
impl CaptureBackend for FrameLoopBackend {
    fn name(&self) -> &'static str {
        "frame-loop"
    }

    async fn start(&mut self, output: &Path) -> RecordingResult<()> {
        if self.worker.is_some() {
            return Err(RecordingError::Capture("frame loop already started".to_string()));
        }

        let mut sources = std::mem::take(&mut self.sources);
        if sources.is_empty() {
            return Err(RecordingError::BackendUnavailable(
                "no capture sources configured".to_string(),
            ));
        }

        let tick = Instant::now();
        let first: Vec<Option<Frame>> = sources
            .iter_mut()
            .map(|source| match source.capture() {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::warn!("Capture source {} produced no first frame: {}", source.id(), e);
                    None
                }
            })
            .collect();

        // The composite size is fixed here for the rest of the session
        let mut compositor = Compositor::from_first_frames(&first).ok_or_else(|| {
            RecordingError::BackendUnavailable("no capture source produced a frame".to_string())
        })?;
        let (width, height) = compositor.dimensions();

        let writer = open_writer(&self.encoder, output, width, height, self.fps)?;

        // Encoders often only fail once they see the first frame
        let grace = self.encoder.startup_grace();
        let written = writer.write_frame(compositor.compose(&first));
        let started = match written {
            Ok(()) => {
                if !grace.is_zero() {
                    tokio::time::sleep(grace).await;
                }
                writer.ensure_running()
            }
            Err(e) => Err(writer.ensure_running().err().unwrap_or(e)),
        };
        if let Err(e) = started {
            abort_writer(&writer).await;
            return Err(match e {
                RecordingError::BackendUnavailable(_) => e,
                other => RecordingError::BackendUnavailable(format!(
                    "encoder rejected the first frame: {}",
                    other
                )),
            });
        }

        let stop = Arc::new(StopSignal::new());
        let (done_tx, done_rx) = oneshot::channel();
        let interval = Duration::from_secs_f64(1.0 / self.fps as f64);
        let guard = self.ctx.worker_guard();
        let thread_guard = guard.clone();

        let capture = CaptureLoop {
            live: first.iter().map(Option::is_some).collect(),
            sources,
            compositor,
            writer: writer.clone(),
            stop: stop.clone(),
            interval,
            fps: self.fps,
            ctx: self.ctx.clone(),
        };
        let first_wait = interval.saturating_sub(tick.elapsed());

        let handle = thread::Builder::new()
            .name("frame-loop".to_string())
            .spawn(move || {
                let outcome = capture.run(first_wait);
                thread_guard.release();
                let _ = done_tx.send(());
                outcome
            })
            .map_err(|e| {
                writer.abort();
                RecordingError::BackendUnavailable(format!("cannot spawn capture thread: {}", e))
            })?;

        tracing::info!(
            "Frame loop started: {}x{} @ {}fps, output: {:?}",
            width,
            height,
            self.fps,
            output
        );

        self.worker = Some(Worker {
            stop,
            writer,
            output: output.to_path_buf(),
            done: done_rx,
            handle,
            guard,
        });
        Ok(())
    }

    async fn stop(&mut self, timeout: Duration) -> BackendReport {
        let Some(worker) = self.worker.take() else {
            return BackendReport::graceful(None);
        };
        let Worker {
            stop,
            writer,
            output,
            mut done,
            handle,
            guard,
        } = worker;

        stop.request();

        // A dropped sender means the thread already exited (or panicked)
        if tokio::time::timeout(timeout, &mut done).await.is_ok() {
            let report = match join_capture_thread(handle).await {
                Some(LoopOutcome { writer: Ok(report) }) => {
                    let intact = writer.verify(&output).unwrap_or(true);
                    BackendReport {
                        ending: StopKind::Graceful,
                        degraded: !report.clean || !intact,
                        frames: Some(report.frames),
                    }
                }
                Some(LoopOutcome { writer: Err(e) }) => {
                    tracing::warn!("Encoder did not finalize cleanly: {}", e);
                    BackendReport {
                        ending: StopKind::Graceful,
                        degraded: true,
                        frames: Some(writer.frame_count()),
                    }
                }
                None => {
                    abort_writer(&writer).await;
                    BackendReport::forced(Some(writer.frame_count()))
                }
            };
            tracing::info!("Frame loop stopped: {:?}", report);
            return report;
        }

        tracing::warn!(
            "{}; closing the encoder forcibly",
            RecordingError::ShutdownTimeout(timeout)
        );
        abort_writer(&writer).await;

        if tokio::time::timeout(ABORT_GRACE, &mut done).await.is_ok() {
            join_capture_thread(handle).await;
        } else {
            // It can no longer write, and the manager retires its context
            tracing::error!("Capture thread still busy after forced stop, detaching it");
            guard.release();
        }

        let intact = writer.verify(&output) == Some(true);
        BackendReport {
            ending: StopKind::Forced,
            degraded: !intact,
            frames: Some(writer.frame_count()),
        }
    }

    fn is_active(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }
}

impl Drop for FrameLoopBackend {
    fn drop(&mut self) {
        // The thread finalizes its writer on the way out
        if let Some(worker) = self.worker.take() {
            worker.stop.request();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, SyntheticSource};
    use crate::encode::y4m;
    use crate::recorder::state::SessionStatus;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct Harness {
        ctx: WorkerContext,
        status: Arc<RwLock<SessionStatus>>,
        workers: Arc<AtomicUsize>,
        events: broadcast::Receiver<RecordingEvent>,
    }

    fn harness() -> Harness {
        let (tx, events) = broadcast::channel(32);
        let status = Arc::new(RwLock::new(SessionStatus::Running));
        let workers = Arc::new(AtomicUsize::new(0));
        Harness {
            ctx: WorkerContext::new(tx, status.clone(), workers.clone()),
            status,
            workers,
            events,
        }
    }

    fn synthetic(
        index: usize,
        width: u32,
        height: u32,
        fail_after: Option<u64>,
    ) -> Box<dyn FrameSource> {
        Box::new(SyntheticSource::new(index, width, height, fail_after))
    }

    #[cfg(unix)]
    fn shell_encoder(script: &str, startup_grace_ms: u64) -> EncoderConfig {
        EncoderConfig::Ffmpeg {
            program: "sh".to_string(),
            prefix_args: vec!["-c".to_string(), script.to_string(), "encoder".to_string()],
            codec_args: Vec::new(),
            startup_grace_ms,
        }
    }

    /// Hangs on its second capture, then fails
    struct LateFailingSource {
        hold: Duration,
        frames: u64,
    }

    impl FrameSource for LateFailingSource {
        fn id(&self) -> &str {
            "late-failing"
        }

        fn capture(&mut self) -> Result<Frame, CaptureError> {
            self.frames += 1;
            if self.frames > 1 {
                thread::sleep(self.hold);
                return Err(CaptureError::Failed("display went away".to_string()));
            }
            Ok(Frame::new(2, 2, vec![0; 16]))
        }
    }

    /// Blocks inside `capture` until the test lets it go
    struct StuckSource {
        release: Arc<StopSignal>,
        frames: u64,
    }

    impl FrameSource for StuckSource {
        fn id(&self) -> &str {
            "stuck"
        }

        fn capture(&mut self) -> Result<Frame, CaptureError> {
            self.frames += 1;
            if self.frames > 1 {
                self.release.wait_timeout(Duration::from_secs(10));
            }
            Ok(Frame::new(2, 2, vec![0; 16]))
        }
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let signal = Arc::new(StopSignal::new());
        assert!(!signal.wait_timeout(Duration::from_millis(5)));

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = signal.wait_timeout(Duration::from_secs(10));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.request();

        let (stopped, waited) = waiter.join().unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_records_and_finalizes() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.y4m");

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 32, 24, None)],
            EncoderConfig::Native,
            20,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        assert!(backend.is_active());
        assert_eq!(h.workers.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = backend.stop(Duration::from_secs(5)).await;

        assert_eq!(report.ending, StopKind::Graceful);
        assert!(!report.degraded);
        assert!(!backend.is_active());
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);

        let info = y4m::probe(&output).unwrap();
        assert_eq!((info.width, info.height), (32, 24));
        assert_eq!(Some(info.frames), report.frames);
        assert!(info.frames >= 2);
    }

    #[tokio::test]
    async fn test_composites_sources_side_by_side() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.y4m");

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 16, 10, None), synthetic(1, 8, 6, None)],
            EncoderConfig::Native,
            20,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        backend.stop(Duration::from_secs(5)).await;

        let info = y4m::probe(&output).unwrap();
        assert_eq!((info.width, info.height), (24, 10));
    }

    #[tokio::test]
    async fn test_lost_source_keeps_session_alive() {
        let mut h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.y4m");

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 16, 8, None), synthetic(1, 16, 8, Some(2))],
            EncoderConfig::Native,
            50,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*h.status.read(), SessionStatus::Running);
        let report = backend.stop(Duration::from_secs(5)).await;
        assert!(!report.degraded);

        let info = y4m::probe(&output).unwrap();
        assert_eq!(info.width, 32);
        assert!(info.frames > 3);

        let mut lost = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let RecordingEvent::SourceLost { source, .. } = event {
                lost.push(source);
            }
        }
        assert_eq!(lost, vec!["synthetic-1".to_string()]);
    }

    #[tokio::test]
    async fn test_losing_every_source_fails_the_session() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.y4m");

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 8, 8, Some(3))],
            EncoderConfig::Native,
            50,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*h.status.read(), SessionStatus::Failed);
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);

        let report = backend.stop(Duration::from_secs(1)).await;
        assert_eq!(report.ending, StopKind::Graceful);
        assert_eq!(report.frames, Some(3));
        assert_eq!(y4m::probe(&output).unwrap().frames, 3);
    }

    #[tokio::test]
    async fn test_no_first_frame_is_unavailable() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 8, 8, Some(0))],
            EncoderConfig::Native,
            10,
            h.ctx.clone(),
        );
        let result = backend.start(&dir.path().join("clip.y4m")).await;
        assert!(matches!(result, Err(RecordingError::BackendUnavailable(_))));
        assert!(!backend.is_active());
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_encoder_is_unavailable() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 8, 8, None)],
            EncoderConfig::Ffmpeg {
                program: "simian-no-such-encoder".to_string(),
                prefix_args: Vec::new(),
                codec_args: Vec::new(),
                startup_grace_ms: 0,
            },
            10,
            h.ctx.clone(),
        );
        let result = backend.start(&dir.path().join("clip.mp4")).await;
        assert!(matches!(result, Err(RecordingError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stuck_capture_is_forced() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.y4m");
        let release = Arc::new(StopSignal::new());

        let mut backend = FrameLoopBackend::new(
            vec![Box::new(StuckSource {
                release: release.clone(),
                frames: 0,
            })],
            EncoderConfig::Native,
            50,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = backend.stop(Duration::from_millis(100)).await;
        assert_eq!(report.ending, StopKind::Forced);
        assert_eq!(report.frames, Some(1));

        // Closed with one whole frame, so still readable
        assert!(!report.degraded);
        assert_eq!(y4m::probe(&output).unwrap().frames, 1);
        // The detached thread no longer counts as a worker
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);
        release.request();
    }

    #[tokio::test]
    async fn test_detached_thread_failing_later_stays_quiet() {
        let mut h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.y4m");

        let mut backend = FrameLoopBackend::new(
            vec![Box::new(LateFailingSource {
                hold: Duration::from_millis(1200),
                frames: 0,
            })],
            EncoderConfig::Native,
            50,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = backend.stop(Duration::from_millis(100)).await;
        assert_eq!(report.ending, StopKind::Forced);
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);

        // Stands in for the next session, which now owns the status cell
        *h.status.write() = SessionStatus::Running;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(*h.status.read(), SessionStatus::Running);
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, RecordingEvent::Failed { .. }));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_exiting_at_startup_is_unavailable() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();

        for attempt in 0..5 {
            let output = dir.path().join(format!("clip_{}.mp4", attempt));
            let mut backend = FrameLoopBackend::new(
                vec![synthetic(0, 8, 8, None)],
                shell_encoder("echo 'Unknown encoder' >&2; exit 1", 200),
                10,
                h.ctx.clone(),
            );
            let result = backend.start(&output).await;
            assert!(
                matches!(result, Err(RecordingError::BackendUnavailable(_))),
                "attempt {}: {:?}",
                attempt,
                result
            );
            assert!(!backend.is_active());
        }
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_ignoring_eof_is_killed_within_bound() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mp4");

        let mut backend = FrameLoopBackend::new(
            vec![synthetic(0, 8, 8, None)],
            shell_encoder("exec sleep 5", 50),
            10,
            h.ctx.clone(),
        );
        backend.start(&output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let report = backend.stop(timeout).await;

        assert!(
            started.elapsed() < timeout + ABORT_GRACE + Duration::from_millis(500),
            "stop took {:?}",
            started.elapsed()
        );
        assert_eq!(report.ending, StopKind::Forced);
        assert!(report.degraded);
        assert_eq!(h.workers.load(Ordering::SeqCst), 0);
    }
}
