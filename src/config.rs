//! Recorder configuration
//!
//! Everything a [`SessionManager`](crate::recorder::SessionManager) needs is fixed
//! at construction time: frame rate, output directory, filename prefix, container
//! and which capture backend to run.
//!
//! Load order (later wins):
//! 1. Compiled defaults
//! 2. A JSON file, when a path is given and exists
//! 3. Environment variables (`SIMIAN_CLIPS_DIR`, `SIMIAN_FPS`, `SIMIAN_CONTAINER`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Directory clips are written to (created on demand)
    pub clips_dir: PathBuf,

    /// Filename prefix, e.g. `simian` for `simian_20250101_120000.mp4`
    pub filename_prefix: String,

    /// Target frames per second
    pub fps: u32,

    /// Container extension of the output file
    pub container: String,

    /// How long `stop()` waits for a graceful shutdown before killing the worker
    pub stop_timeout_ms: u64,

    /// Capture backend
    pub backend: BackendConfig,
}

/// Which capture mechanism a session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum BackendConfig {
    /// Grab frames in-process and feed them to a video writer
    FrameLoop(FrameLoopConfig),
    /// Spawn an external capture+encode program
    Process(ProcessConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLoopConfig {
    /// Capture sources, composited side by side in this order
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub encoder: EncoderConfig,
}

/// A single in-process capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SourceConfig {
    /// A physical display, by index, optionally cropped to `region`
    #[serde(rename_all = "camelCase")]
    Display {
        id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<Region>,
    },

    /// Generated test pattern
    #[serde(rename_all = "camelCase")]
    Synthetic {
        width: u32,
        height: u32,
        /// Fail every capture after this many frames
        #[serde(default)]
        fail_after: Option<u64>,
    },
}

/// A rectangle of a display, in pixels from its top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// The part of this region that lies on a `width` x `height` surface,
    /// or `None` when they do not overlap
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        if self.left >= width || self.top >= height {
            return None;
        }
        let clamped = Region {
            left: self.left,
            top: self.top,
            width: self.width.min(width - self.left),
            height: self.height.min(height - self.top),
        };
        (clamped.width > 0 && clamped.height > 0).then_some(clamped)
    }
}

/// Video writer used by the frame loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum EncoderConfig {
    /// Built-in YUV4MPEG2 writer
    #[default]
    Native,

    /// Pipe raw frames to an ffmpeg process
    #[serde(rename_all = "camelCase")]
    Ffmpeg {
        #[serde(default = "default_ffmpeg_program")]
        program: String,
        /// Placed before the generated arguments, for wrappers like `nice`
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        prefix_args: Vec<String>,
        #[serde(default = "default_codec_args")]
        codec_args: Vec<String>,
        /// How long the encoder must survive the first frame
        #[serde(default = "default_encoder_grace_ms")]
        startup_grace_ms: u64,
    },
}

impl EncoderConfig {
    /// Wait after the first frame before the encoder counts as started
    pub fn startup_grace(&self) -> Duration {
        match self {
            EncoderConfig::Native => Duration::ZERO,
            EncoderConfig::Ffmpeg {
                startup_grace_ms, ..
            } => Duration::from_millis(*startup_grace_ms),
        }
    }
}

/// External capture program settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    /// Program to spawn
    pub program: String,

    /// Argument template; `{fps}`, `{source}` and `{output}` are substituted
    pub args: Vec<String>,

    /// Capture source handed to the program (display name, device index, ...)
    pub source: String,

    /// Written to stdin to request a graceful stop; SIGTERM is used when unset
    pub quit_input: Option<String>,

    /// How long the program must stay alive before capture counts as started
    pub startup_grace_ms: u64,
}

fn default_ffmpeg_program() -> String {
    "ffmpeg".to_string()
}

fn default_encoder_grace_ms() -> u64 {
    300
}

fn default_codec_args() -> Vec<String> {
    ["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p", "-crf", "18"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        // In-process display capture exists for macOS and Windows; elsewhere
        // the external ffmpeg grabber is the only real capture path.
        let backend = if cfg!(any(target_os = "macos", target_os = "windows")) {
            BackendConfig::FrameLoop(FrameLoopConfig {
                sources: vec![SourceConfig::Display {
                    id: 0,
                    region: None,
                }],
                encoder: EncoderConfig::Ffmpeg {
                    program: default_ffmpeg_program(),
                    prefix_args: Vec::new(),
                    codec_args: default_codec_args(),
                    startup_grace_ms: default_encoder_grace_ms(),
                },
            })
        } else {
            BackendConfig::Process(ProcessConfig::default())
        };

        Self {
            clips_dir: PathBuf::from("data/clips"),
            filename_prefix: "simian".to_string(),
            fps: 20,
            container: "mp4".to_string(),
            stop_timeout_ms: 5000,
            backend,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        let (input_format, source, quit_input) = if cfg!(target_os = "macos") {
            ("avfoundation", "1:none", None)
        } else if cfg!(target_os = "windows") {
            ("gdigrab", "desktop", Some("q".to_string()))
        } else {
            ("x11grab", ":0.0", None)
        };

        let mut args: Vec<String> = [
            "-y",
            "-loglevel",
            "error",
            "-f",
            input_format,
            "-framerate",
            "{fps}",
            "-i",
            "{source}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(default_codec_args());
        args.push("{output}".to_string());

        Self {
            program: default_ffmpeg_program(),
            args,
            source: source.to_string(),
            quit_input,
            startup_grace_ms: 300,
        }
    }
}

impl RecorderConfig {
    /// Build a frame-loop configuration around the native writer.
    pub fn native(clips_dir: impl Into<PathBuf>, sources: Vec<SourceConfig>) -> Self {
        Self {
            clips_dir: clips_dir.into(),
            container: "y4m".to_string(),
            backend: BackendConfig::FrameLoop(FrameLoopConfig {
                sources,
                encoder: EncoderConfig::Native,
            }),
            ..Self::default()
        }
    }

    /// Load configuration from an optional JSON file and the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::debug!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        tracing::debug!("Loaded recorder config from {:?}", path);
        Ok(config)
    }

    /// Apply `SIMIAN_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("SIMIAN_CLIPS_DIR") {
            self.clips_dir = PathBuf::from(dir);
        }

        if let Some(fps) = lookup("SIMIAN_FPS") {
            self.fps = fps.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("SIMIAN_FPS is not a number: {}", fps))
            })?;
        }

        if let Some(container) = lookup("SIMIAN_CONTAINER") {
            self.container = container.trim().trim_start_matches('.').to_string();
        }

        Ok(())
    }

    /// Reject configurations no backend could honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps == 0 {
            return Err(ConfigError::Invalid("fps must be at least 1".to_string()));
        }

        if self.container.is_empty() {
            return Err(ConfigError::Invalid("container must not be empty".to_string()));
        }

        match &self.backend {
            BackendConfig::FrameLoop(frame_loop) => {
                if frame_loop.sources.is_empty() {
                    return Err(ConfigError::Invalid(
                        "frame loop needs at least one capture source".to_string(),
                    ));
                }
                let empty_region = frame_loop.sources.iter().any(|source| {
                    matches!(
                        source,
                        SourceConfig::Display {
                            region: Some(region),
                            ..
                        } if region.width == 0 || region.height == 0
                    )
                });
                if empty_region {
                    return Err(ConfigError::Invalid(
                        "display region must have a non-zero size".to_string(),
                    ));
                }
                if frame_loop.encoder == EncoderConfig::Native && self.container != "y4m" {
                    return Err(ConfigError::Invalid(format!(
                        "native encoder writes y4m, not {}",
                        self.container
                    )));
                }
            }
            BackendConfig::Process(process) => {
                if process.program.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "capture program must not be empty".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl ProcessConfig {
    /// Expand the argument template for one session.
    pub fn expand_args(&self, fps: u32, output: &Path) -> Vec<String> {
        let fps = fps.to_string();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{fps}", &fps)
                    .replace("{source}", &self.source)
                    .replace("{output}", &output)
            })
            .collect()
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}
