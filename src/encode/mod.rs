//! Video writers used by the in-process frame loop
//!
//! Writers take tightly packed BGRA frames of a size fixed at open time. They
//! use interior mutability so the capture thread can write while the session
//! manager holds a handle it can `abort()` from another thread.

pub mod ffmpeg;
pub mod y4m;

pub use ffmpeg::FfmpegWriter;
pub use y4m::Y4mWriter;

use crate::config::EncoderConfig;
use crate::recorder::RecordingResult;
use std::path::Path;
use std::sync::Arc;

/// Outcome of closing a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterReport {
    /// Frames accepted by the writer
    pub frames: u64,
    /// Whether the container was closed normally (trailer written, flushed)
    pub clean: bool,
}

pub trait VideoWriter: Send + Sync {
    /// Append one frame. Fails once the writer is finished or aborted.
    fn write_frame(&self, bgra: &[u8]) -> RecordingResult<()>;

    /// Confirm the writer is still accepting frames after startup.
    /// Writers backed by another process check it has not exited.
    fn ensure_running(&self) -> RecordingResult<()> {
        Ok(())
    }

    /// Flush and close the container. Calling it twice is harmless.
    fn finish(&self) -> RecordingResult<WriterReport>;

    /// Close without finalizing. Must not block on an in-flight `write_frame`.
    fn abort(&self);

    /// Frames written so far
    fn frame_count(&self) -> u64;

    /// Inspect the written file, when the format allows it
    fn verify(&self, _path: &Path) -> Option<bool> {
        None
    }
}

/// Open the writer selected by `config`
pub fn open_writer(
    config: &EncoderConfig,
    output: &Path,
    width: u32,
    height: u32,
    fps: u32,
) -> RecordingResult<Arc<dyn VideoWriter>> {
    match config {
        EncoderConfig::Native => Ok(Arc::new(Y4mWriter::create(output, width, height, fps)?)),
        EncoderConfig::Ffmpeg {
            program,
            prefix_args,
            codec_args,
            ..
        } => {
            let mut args = prefix_args.clone();
            args.extend(ffmpeg::build_args(codec_args, output, width, height, fps));
            Ok(Arc::new(FfmpegWriter::spawn(program, &args, width, height)?))
        }
    }
}
