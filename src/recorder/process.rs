//! External capture process backend
//!
//! Spawns a capture+encode program (ffmpeg by default) writing straight to
//! the session's output path. A supervisor task owns the child: it notices
//! the program dying mid-session and carries out the stop sequence
//! (quit input or SIGTERM, bounded wait, then kill).

use super::backend::{
    output_is_empty, BackendReport, CaptureBackend, RecordingError, RecordingResult, WorkerContext,
    WorkerGuard,
};
use super::state::StopKind;
use crate::config::ProcessConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Worker {
    stop_tx: oneshot::Sender<Duration>,
    task: JoinHandle<BackendReport>,
}

pub struct ProcessBackend {
    config: ProcessConfig,
    fps: u32,
    ctx: WorkerContext,
    worker: Option<Worker>,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig, fps: u32, ctx: WorkerContext) -> Self {
        Self {
            config,
            fps,
            ctx,
            worker: None,
        }
    }
}

/// How the program was asked to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitRequest {
    /// Quit input or SIGTERM; the program can still finish its file
    Asked,
    /// Nothing gentler was available, so it was killed
    Killed,
}

impl ExitRequest {
    /// Stop kind once the program has exited in time
    fn ending(self) -> StopKind {
        match self {
            ExitRequest::Asked => StopKind::Graceful,
            ExitRequest::Killed => StopKind::Forced,
        }
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    /// `None` when the backend was dropped without stopping
    Stop(Option<Duration>),
}

async fn supervise(
    mut child: Child,
    stop_rx: oneshot::Receiver<Duration>,
    quit_input: Option<String>,
    output: PathBuf,
    ctx: WorkerContext,
    _guard: WorkerGuard,
) -> BackendReport {
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        request = stop_rx => Wake::Stop(request.ok()),
    };

    match wake {
        Wake::Exited(status) => {
            let reason = match status {
                Ok(status) => format!("capture process exited on its own ({})", status),
                Err(e) => format!("lost track of capture process: {}", e),
            };
            ctx.mark_failed(&reason);
            BackendReport {
                ending: StopKind::Graceful,
                degraded: output_is_empty(&output),
                frames: None,
            }
        }
        Wake::Stop(None) => {
            let _ = child.kill().await;
            BackendReport::forced(None)
        }
        Wake::Stop(Some(timeout)) => {
            match terminate(&mut child, quit_input.as_deref(), timeout).await {
                StopKind::Graceful => BackendReport {
                    ending: StopKind::Graceful,
                    degraded: output_is_empty(&output),
                    frames: None,
                },
                StopKind::Forced => BackendReport::forced(None),
            }
        }
    }
}

/// Ask the program to finish its file, then kill it if it ignores us
async fn terminate(child: &mut Child, quit_input: Option<&str>, timeout: Duration) -> StopKind {
    let request = request_exit(child, quit_input).await;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            // ffmpeg reports 255 when interrupted by a signal even though it
            // wrote the trailer, so the exit code is only logged
            tracing::debug!("Capture process exited with {} ({:?})", status, request);
            request.ending()
        }
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for capture process: {}", e);
            let _ = child.kill().await;
            StopKind::Forced
        }
        Err(_) => {
            tracing::warn!(
                "{}; killing capture process",
                RecordingError::ShutdownTimeout(timeout)
            );
            if let Err(e) = child.kill().await {
                tracing::error!("Failed to kill capture process: {}", e);
            }
            StopKind::Forced
        }
    }
}

async fn request_exit(child: &mut Child, quit_input: Option<&str>) -> ExitRequest {
    if let Some(input) = quit_input {
        // Dropping stdin afterwards also delivers EOF
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(input.as_bytes()).await {
                Ok(()) => {
                    let _ = stdin.flush().await;
                    return ExitRequest::Asked;
                }
                Err(e) => tracing::debug!("Capture process stdin closed: {}", e),
            }
        }
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: the child has not been reaped, so the pid is still ours
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                return ExitRequest::Asked;
            }
        }
    }

    tracing::warn!("No way to ask the capture process to exit, killing it");
    if let Err(e) = child.start_kill() {
        tracing::debug!("Capture process already gone: {}", e);
    }
    ExitRequest::Killed
}

#[async_trait]
impl CaptureBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(&mut self, output: &Path) -> RecordingResult<()> {
        if self.worker.is_some() {
            return Err(RecordingError::Capture("capture process already started".to_string()));
        }

        let program = &self.config.program;
        let args = self.config.expand_args(self.fps, output);
        tracing::debug!("Starting capture process: {} {:?}", program, args);

        let stdin = if self.config.quit_input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut child = Command::new(program)
            .args(&args)
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RecordingError::BackendUnavailable(format!("Failed to start {}: {}", program, e))
            })?;

        // A missing device or bad argument makes the program bail out at once
        tokio::time::sleep(self.config.startup_grace()).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(RecordingError::BackendUnavailable(format!(
                    "{} exited during startup ({})",
                    program, status
                )));
            }
            Err(e) => {
                let _ = child.kill().await;
                return Err(RecordingError::BackendUnavailable(format!(
                    "cannot query {}: {}",
                    program, e
                )));
            }
        }

        tracing::info!(
            "Capture process started: {} (pid {:?}) @ {}fps, output: {:?}",
            program,
            child.id(),
            self.fps,
            output
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            child,
            stop_rx,
            self.config.quit_input.clone(),
            output.to_path_buf(),
            self.ctx.clone(),
            self.ctx.worker_guard(),
        ));

        self.worker = Some(Worker { stop_tx, task });
        Ok(())
    }

    async fn stop(&mut self, timeout: Duration) -> BackendReport {
        let Some(Worker { stop_tx, task }) = self.worker.take() else {
            return BackendReport::graceful(None);
        };

        // Fails only if the supervisor already returned, which is fine
        let _ = stop_tx.send(timeout);

        match task.await {
            Ok(report) => {
                tracing::info!("Capture process stopped: {:?}", report);
                report
            }
            Err(e) => {
                tracing::error!("Capture supervisor failed: {}", e);
                BackendReport::forced(None)
            }
        }
    }

    fn is_active(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_fallback_is_never_graceful() {
        assert_eq!(ExitRequest::Asked.ending(), StopKind::Graceful);
        assert_eq!(ExitRequest::Killed.ending(), StopKind::Forced);
    }
}

#[cfg(all(test, unix))]
mod unix_tests {
    use super::*;
    use crate::recorder::state::{RecordingEvent, SessionStatus};
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn context() -> (WorkerContext, Arc<RwLock<SessionStatus>>, Arc<AtomicUsize>) {
        let (tx, _) = broadcast::channel::<RecordingEvent>(8);
        let status = Arc::new(RwLock::new(SessionStatus::Running));
        let workers = Arc::new(AtomicUsize::new(0));
        (WorkerContext::new(tx, status.clone(), workers.clone()), status, workers)
    }

    /// `sh -c <script> <output>`: the script sees the output path as `$0`
    fn shell(script: &str, quit_input: Option<&str>) -> ProcessConfig {
        ProcessConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "{output}".to_string()],
            source: String::new(),
            quit_input: quit_input.map(str::to_string),
            startup_grace_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_sigterm_stops_gracefully() {
        let (ctx, _, workers) = context();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mp4");

        let config = shell(
            r#"echo frame > "$0"; trap 'exit 0' TERM; while :; do sleep 0.05; done"#,
            None,
        );
        let mut backend = ProcessBackend::new(config, 10, ctx);
        backend.start(&output).await.unwrap();
        assert!(backend.is_active());
        assert_eq!(workers.load(Ordering::SeqCst), 1);

        let report = backend.stop(Duration::from_secs(3)).await;
        assert_eq!(report.ending, StopKind::Graceful);
        assert!(!report.degraded);
        assert!(!backend.is_active());
        assert_eq!(workers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quit_input_stops_gracefully() {
        let (ctx, _, _) = context();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mp4");

        let config = shell(r#"read line; echo "$line" > "$0""#, Some("q\n"));
        let mut backend = ProcessBackend::new(config, 10, ctx);
        backend.start(&output).await.unwrap();

        let report = backend.stop(Duration::from_secs(3)).await;
        assert_eq!(report.ending, StopKind::Graceful);
        assert!(!report.degraded);
        assert_eq!(std::fs::read_to_string(&output).unwrap().trim(), "q");
    }

    #[tokio::test]
    async fn test_ignored_sigterm_is_forced() {
        let (ctx, _, workers) = context();
        let dir = tempfile::tempdir().unwrap();

        let config = shell("trap '' TERM; while :; do sleep 0.05; done", None);
        let mut backend = ProcessBackend::new(config, 10, ctx);
        backend.start(&dir.path().join("clip.mp4")).await.unwrap();

        let report = backend.stop(Duration::from_millis(200)).await;
        assert_eq!(report.ending, StopKind::Forced);
        assert!(report.degraded);
        assert_eq!(workers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let (ctx, _, workers) = context();
        let mut config = shell("", None);
        config.program = "simian-no-such-grabber".to_string();

        let mut backend = ProcessBackend::new(config, 10, ctx);
        let result = backend.start(Path::new("/tmp/never.mp4")).await;
        assert!(matches!(result, Err(RecordingError::BackendUnavailable(_))));
        assert_eq!(workers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_early_exit_is_unavailable() {
        let (ctx, _, _) = context();
        let mut backend = ProcessBackend::new(shell("exit 3", None), 10, ctx);
        let result = backend.start(Path::new("/tmp/never.mp4")).await;
        assert!(matches!(result, Err(RecordingError::BackendUnavailable(_))));
        assert!(!backend.is_active());
    }

    #[tokio::test]
    async fn test_unexpected_exit_fails_session() {
        let (ctx, status, workers) = context();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mp4");

        let config = shell(r#"echo frame > "$0"; sleep 0.3"#, None);
        let mut backend = ProcessBackend::new(config, 10, ctx);
        backend.start(&output).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*status.read(), SessionStatus::Failed);
        assert_eq!(workers.load(Ordering::SeqCst), 0);
        assert!(!backend.is_active());

        let report = backend.stop(Duration::from_secs(1)).await;
        assert_eq!(report.ending, StopKind::Graceful);
        assert!(!report.degraded);
    }
}
