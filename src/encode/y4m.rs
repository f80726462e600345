//! YUV4MPEG2 writer and probe
//!
//! Y4M is an uncompressed container that ffmpeg, mpv and VLC play directly.
//! Each frame is `FRAME\n` followed by full-resolution Y, U and V planes
//! (4:4:4, full-range BT.601), so a clip is valid after any complete frame.

use super::{VideoWriter, WriterReport};
use crate::recorder::{RecordingError, RecordingResult};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const MAGIC: &str = "YUV4MPEG2";

struct Inner {
    out: BufWriter<File>,
    planes: Vec<u8>,
}

/// Native writer producing `.y4m` files
pub struct Y4mWriter {
    inner: Mutex<Option<Inner>>,
    width: u32,
    height: u32,
    frame_count: AtomicU64,
    aborted: AtomicBool,
}

impl Y4mWriter {
    pub fn create(output: &Path, width: u32, height: u32, fps: u32) -> RecordingResult<Self> {
        let open_err = |e: io::Error| {
            RecordingError::BackendUnavailable(format!(
                "cannot open {:?} for writing: {}",
                output, e
            ))
        };

        let file = File::create(output).map_err(open_err)?;
        let mut out = BufWriter::with_capacity(1 << 20, file);
        writeln!(
            out,
            "{} W{} H{} F{}:1 Ip A1:1 C444 XCOLORRANGE=FULL",
            MAGIC, width, height, fps
        )
        .map_err(open_err)?;

        tracing::info!(
            "Opened Y4M writer: {}x{} @ {}fps, output: {:?}",
            width,
            height,
            fps,
            output
        );

        Ok(Self {
            inner: Mutex::new(Some(Inner {
                out,
                planes: vec![0; width as usize * height as usize * 3],
            })),
            width,
            height,
            frame_count: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        })
    }
}

impl VideoWriter for Y4mWriter {
    fn write_frame(&self, bgra: &[u8]) -> RecordingResult<()> {
        let expected = self.width as usize * self.height as usize * 4;
        if bgra.len() != expected {
            return Err(RecordingError::Encoder(format!(
                "frame is {} bytes, expected {}",
                bgra.len(),
                expected
            )));
        }

        let mut guard = self.inner.lock();
        let inner = guard
            .as_mut()
            .ok_or_else(|| RecordingError::Encoder("Y4M writer is closed".to_string()))?;

        bgra_to_yuv444(bgra, &mut inner.planes);
        inner.out.write_all(b"FRAME\n")?;
        inner.out.write_all(&inner.planes)?;
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> RecordingResult<WriterReport> {
        let taken = self.inner.lock().take();
        let clean = match taken {
            Some(inner) => {
                let file = inner.out.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                !self.aborted.load(Ordering::Relaxed)
            }
            None => !self.aborted.load(Ordering::Relaxed),
        };

        tracing::info!("Y4M writer finished: {} frames", self.frame_count());

        Ok(WriterReport {
            frames: self.frame_count(),
            clean,
        })
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
        match self.inner.try_lock_for(Duration::from_millis(250)) {
            // Dropping the BufWriter flushes whole frames and closes the file
            Some(mut guard) => drop(guard.take()),
            None => tracing::warn!("Y4M writer busy, file closes when the current frame completes"),
        }
    }

    fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    fn verify(&self, path: &Path) -> Option<bool> {
        probe(path).ok().map(|info| !info.truncated)
    }
}

/// Full-range BT.601 conversion into planar Y, U, V
fn bgra_to_yuv444(bgra: &[u8], planes: &mut [u8]) {
    let pixels = bgra.len() / 4;
    let (y_plane, chroma) = planes.split_at_mut(pixels);
    let (u_plane, v_plane) = chroma.split_at_mut(pixels);

    for (i, px) in bgra.chunks_exact(4).enumerate() {
        let (b, g, r) = (px[0] as i32, px[1] as i32, px[2] as i32);
        y_plane[i] = ((77 * r + 150 * g + 29 * b + 128) >> 8) as u8;
        u_plane[i] = (((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        v_plane[i] = (((128 * r - 107 * g - 21 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
    }
}

/// Result of parsing a Y4M file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Y4mInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    /// Complete frames in the file
    pub frames: u64,
    /// Whether the file ends inside a frame
    pub truncated: bool,
}

impl Y4mInfo {
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            self.fps_num as f64 / self.fps_den as f64
        }
    }
}

/// Parse the stream header and count complete frames
pub fn probe(path: &Path) -> io::Result<Y4mInfo> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);

    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let header = read_line(&mut reader)?.ok_or_else(|| invalid("missing Y4M header".to_string()))?;
    let mut tokens = header.split(' ');
    if tokens.next() != Some(MAGIC) {
        return Err(invalid(format!("not a Y4M stream: {:?}", header)));
    }

    let (mut width, mut height) = (0u32, 0u32);
    let (mut fps_num, mut fps_den) = (0u32, 1u32);
    let mut colorspace = "420jpeg";

    for token in tokens {
        let mut chars = token.chars();
        let tag = chars.next();
        let value = chars.as_str();
        match tag {
            Some('W') => {
                width = value
                    .parse()
                    .map_err(|_| invalid(format!("bad width {}", value)))?;
            }
            Some('H') => {
                height = value
                    .parse()
                    .map_err(|_| invalid(format!("bad height {}", value)))?;
            }
            Some('F') => {
                if let Some((num, den)) = value.split_once(':') {
                    fps_num = num.parse().unwrap_or(0);
                    fps_den = den.parse().unwrap_or(1);
                }
            }
            Some('C') => colorspace = value,
            _ => {}
        }
    }

    if width == 0 || height == 0 {
        return Err(invalid("Y4M header has no frame size".to_string()));
    }

    let frame_len = frame_len(colorspace, width as u64, height as u64)
        .ok_or_else(|| invalid(format!("unsupported colorspace {}", colorspace)))?;

    let mut pos = header.len() as u64 + 1;
    let mut frames = 0u64;
    let mut truncated = false;

    while pos < len {
        let Some(line) = read_line(&mut reader)? else {
            truncated = true;
            break;
        };
        if !line.starts_with("FRAME") {
            return Err(invalid(format!("expected FRAME marker at byte {}", pos)));
        }
        pos += line.len() as u64 + 1;

        if pos + frame_len > len {
            truncated = true;
            break;
        }
        reader.seek_relative(frame_len as i64)?;
        pos += frame_len;
        frames += 1;
    }

    Ok(Y4mInfo {
        width,
        height,
        fps_num,
        fps_den,
        frames,
        truncated,
    })
}

fn frame_len(colorspace: &str, width: u64, height: u64) -> Option<u64> {
    let luma = width * height;
    let half_w = width.div_ceil(2);
    let half_h = height.div_ceil(2);
    match colorspace {
        "444" => Some(luma * 3),
        "422" => Some(luma + 2 * half_w * height),
        "mono" => Some(luma),
        c if c.starts_with("420") => Some(luma + 2 * half_w * half_h),
        _ => None,
    }
}

/// Read one `\n`-terminated line; `None` at EOF or on an unterminated line
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    reader.by_ref().take(4096).read_until(b'\n', &mut buf)?;
    if buf.last() != Some(&b'\n') {
        return Ok(None);
    }
    buf.pop();
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
