//! FFmpeg pipe writer
//!
//! Raw BGRA frames are written to an ffmpeg process's stdin, which encodes
//! them into the configured container. Closing stdin lets ffmpeg write the
//! trailer; killing the process leaves whatever was muxed so far.

use super::{VideoWriter, WriterReport};
use crate::recorder::{RecordingError, RecordingResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Encoder stderr lines kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// Interval between exit checks while `finish` waits for the encoder
const EXIT_POLL: Duration = Duration::from_millis(10);

/// How long to wait for the stderr reader to see EOF after an exit
const STDERR_SETTLE: Duration = Duration::from_millis(200);

pub struct FfmpegWriter {
    program: String,
    /// Frame pipe; locked for the duration of one frame write
    stdin: Mutex<Option<ChildStdin>>,
    /// Process handle. Only ever locked briefly, so `abort` can always kill.
    process: Mutex<Option<Child>>,
    stderr_reader: Mutex<Option<JoinHandle<()>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    frame_len: usize,
    frame_count: AtomicU64,
    running: AtomicBool,
}

/// Full ffmpeg argument list for a rawvideo stdin input
pub fn build_args(
    codec_args: &[String],
    output: &Path,
    width: u32,
    height: u32,
    fps: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pixel_format".into(),
        "bgra".into(),
        "-video_size".into(),
        format!("{}x{}", width, height),
        "-framerate".into(),
        fps.to_string(),
        "-i".into(),
        "-".into(),
    ];
    args.extend(codec_args.iter().cloned());
    args.extend(["-g".to_string(), (fps * 2).to_string()]);

    if output.extension().is_some_and(|ext| ext == "mp4" || ext == "mov") {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.push(output.to_string_lossy().to_string());
    args
}

/// Log encoder stderr as it arrives and keep the last few lines
fn drain_stderr(
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                tracing::debug!("ffmpeg: {}", line);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        })
}

impl FfmpegWriter {
    /// Spawn `program` with `args` and take frames of `width` x `height`.
    ///
    /// `args` is the complete command line, usually from [`build_args`].
    pub fn spawn(program: &str, args: &[String], width: u32, height: u32) -> RecordingResult<Self> {
        tracing::debug!("Starting encoder: {} {:?}", program, args);

        let mut process = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RecordingError::BackendUnavailable(format!("Failed to start {}: {}", program, e))
            })?;

        let (Some(stdin), Some(stderr)) = (process.stdin.take(), process.stderr.take()) else {
            let _ = process.kill();
            let _ = process.wait();
            return Err(RecordingError::BackendUnavailable(format!(
                "Failed to capture {} pipes",
                program
            )));
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_reader = match drain_stderr(stderr, stderr_tail.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(RecordingError::BackendUnavailable(format!(
                    "cannot spawn encoder log reader: {}",
                    e
                )));
            }
        };

        tracing::info!(
            "Started FFmpeg encoder (pid {}) for {}x{} frames",
            process.id(),
            width,
            height
        );

        Ok(Self {
            program: program.to_string(),
            stdin: Mutex::new(Some(stdin)),
            process: Mutex::new(Some(process)),
            stderr_reader: Mutex::new(Some(stderr_reader)),
            stderr_tail,
            frame_len: width as usize * height as usize * 4,
            frame_count: AtomicU64::new(0),
            running: AtomicBool::new(true),
        })
    }

    /// Exit status if the encoder has exited. Takes the handle when it has.
    fn try_reap(&self) -> io::Result<Option<ExitStatus>> {
        let mut guard = self.process.lock();
        let Some(process) = guard.as_mut() else {
            return Ok(None);
        };
        let status = process.try_wait()?;
        if status.is_some() {
            guard.take();
        }
        Ok(status)
    }

    /// Wait for the encoder to exit without holding the process lock.
    /// `None` means `abort` took the process first.
    fn wait_for_exit(&self) -> io::Result<Option<ExitStatus>> {
        loop {
            if self.process.lock().is_none() {
                return Ok(None);
            }
            if let Some(status) = self.try_reap()? {
                return Ok(Some(status));
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Last stderr lines, once the reader has caught up with an exit
    fn stderr_summary(&self) -> String {
        if let Some(reader) = self.stderr_reader.lock().take() {
            let deadline = Instant::now() + STDERR_SETTLE;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(EXIT_POLL);
            }
            // A grandchild may still hold the pipe; leave the reader behind
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        let tail = self.stderr_tail.lock();
        if tail.is_empty() {
            "no output".to_string()
        } else {
            tail.iter().map(String::as_str).collect::<Vec<_>>().join("; ")
        }
    }
}

impl VideoWriter for FfmpegWriter {
    fn write_frame(&self, bgra: &[u8]) -> RecordingResult<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(RecordingError::Encoder("encoder is closed".to_string()));
        }
        if bgra.len() != self.frame_len {
            return Err(RecordingError::Encoder(format!(
                "frame is {} bytes, expected {}",
                bgra.len(),
                self.frame_len
            )));
        }

        let mut guard = self.stdin.lock();
        let stdin = guard
            .as_mut()
            .ok_or_else(|| RecordingError::Encoder("encoder is closed".to_string()))?;
        stdin
            .write_all(bgra)
            .map_err(|e| RecordingError::Encoder(format!("encoder pipe closed: {}", e)))?;

        self.frame_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn ensure_running(&self) -> RecordingResult<()> {
        if self.process.lock().is_none() {
            return Err(RecordingError::Encoder("encoder is closed".to_string()));
        }
        let Some(status) = self.try_reap()? else {
            return Ok(());
        };

        self.running.store(false, Ordering::Relaxed);
        drop(self.stdin.lock().take());
        Err(RecordingError::BackendUnavailable(format!(
            "{} exited during startup ({}): {}",
            self.program,
            status,
            self.stderr_summary()
        )))
    }

    fn finish(&self) -> RecordingResult<WriterReport> {
        self.running.store(false, Ordering::Relaxed);
        drop(self.stdin.lock().take());

        let clean = match self.wait_for_exit()? {
            Some(status) if status.success() => {
                self.stderr_reader.lock().take();
                true
            }
            Some(status) => {
                tracing::warn!(
                    "FFmpeg exited with status {}: {}",
                    status,
                    self.stderr_summary()
                );
                false
            }
            None => false,
        };

        tracing::info!("FFmpeg finished: {} frames", self.frame_count());

        Ok(WriterReport {
            frames: self.frame_count(),
            clean,
        })
    }

    fn abort(&self) {
        self.running.store(false, Ordering::Relaxed);
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            tracing::warn!("Killing FFmpeg encoder (pid {})", process.id());
            let _ = process.kill();
            let _ = process.wait();
        }
        // A blocked write fails now that the reader is gone, releasing the lock
        if let Some(mut guard) = self.stdin.try_lock() {
            guard.take();
        }
    }

    fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.get_mut().take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string(), "encoder".to_string()]
    }

    #[test]
    fn test_args_describe_raw_input() {
        let codec = ["-c:v".to_string(), "libx264".to_string()];
        let args = build_args(&codec, Path::new("out.mp4"), 640, 480, 20);
        let joined = args.join(" ");
        assert!(joined.contains("-pixel_format bgra"));
        assert!(joined.contains("-video_size 640x480"));
        assert!(joined.contains("-framerate 20"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-g 40"));
        assert!(joined.contains("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_faststart_only_for_mp4_family() {
        let args = build_args(&[], Path::new("out.mkv"), 2, 2, 5);
        assert!(!args.iter().any(|a| a == "-movflags"));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let result = FfmpegWriter::spawn("simian-no-such-encoder", &[], 2, 2);
        assert!(matches!(result, Err(RecordingError::BackendUnavailable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_pipes_frames_to_program() {
        // `cat` stands in for ffmpeg: it drains stdin and exits cleanly on EOF
        let writer = FfmpegWriter::spawn("cat", &[], 2, 2).unwrap();
        writer.ensure_running().unwrap();

        writer.write_frame(&[0u8; 16]).unwrap();
        writer.write_frame(&[0u8; 16]).unwrap();
        let report = writer.finish().unwrap();
        assert_eq!(
            report,
            WriterReport {
                frames: 2,
                clean: true,
            }
        );
        assert!(writer.write_frame(&[0u8; 16]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_during_startup_reports_stderr() {
        let writer = FfmpegWriter::spawn(
            "sh",
            &shell("echo 'Unknown encoder libx265' >&2; exit 1"),
            2,
            2,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(300));

        match writer.ensure_running() {
            Err(RecordingError::BackendUnavailable(message)) => {
                assert!(message.contains("Unknown encoder libx265"), "{}", message);
            }
            other => panic!("expected BackendUnavailable, got {:?}", other.err()),
        }
        assert!(writer.write_frame(&[0u8; 16]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_abort_interrupts_a_blocked_finish() {
        // Ignores EOF on stdin, so only a kill ends it
        let writer = Arc::new(FfmpegWriter::spawn("sh", &shell("exec sleep 5"), 2, 2).unwrap());
        writer.write_frame(&[0u8; 16]).unwrap();

        let finishing = writer.clone();
        let finisher = thread::spawn(move || finishing.finish());
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        writer.abort();
        let report = finisher.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!report.clean);
        assert_eq!(report.frames, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_noisy_encoder_does_not_stall() {
        // Far more stderr than a pipe buffer holds, then drain stdin
        let script = concat!(
            "i=0; while [ $i -lt 4000 ]; do ",
            "echo \"frame $i of encoder noise\" >&2; i=$((i+1)); ",
            "done; cat >/dev/null"
        );
        let writer = FfmpegWriter::spawn("sh", &shell(script), 2, 2).unwrap();

        let started = Instant::now();
        for _ in 0..50 {
            writer.write_frame(&[0u8; 16]).unwrap();
        }
        let report = writer.finish().unwrap();
        assert!(report.clean);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
