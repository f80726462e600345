//! In-process capture sources
//!
//! Platform screen grabbers (GDI on Windows, CoreGraphics on macOS) and a
//! synthetic test pattern, all behind the [`FrameSource`] trait.

pub mod composite;
pub mod synthetic;
pub mod traits;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

pub use composite::Compositor;
pub use synthetic::SyntheticSource;
pub use traits::{has_screen_recording_permission, CaptureError, DisplayInfo, Frame, FrameSource};

use crate::config::{Region, SourceConfig};
use crate::recorder::{RecordingError, RecordingResult};

/// Get list of available displays
pub fn get_displays() -> Vec<DisplayInfo> {
    #[cfg(target_os = "macos")]
    {
        macos::screen::get_displays()
    }

    #[cfg(target_os = "windows")]
    {
        windows::screen::get_displays()
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Vec::new()
    }
}

/// Open every configured source, in order.
///
/// Failing to open any of them is a `BackendUnavailable`: a session never
/// starts with fewer sources than it was configured with.
pub fn open_sources(configs: &[SourceConfig]) -> RecordingResult<Vec<Box<dyn FrameSource>>> {
    configs
        .iter()
        .enumerate()
        .map(|(index, config)| open_source(index, config))
        .collect()
}

fn open_source(index: usize, config: &SourceConfig) -> RecordingResult<Box<dyn FrameSource>> {
    match config {
        SourceConfig::Synthetic {
            width,
            height,
            fail_after,
        } => {
            if *width == 0 || *height == 0 {
                return Err(RecordingError::BackendUnavailable(format!(
                    "synthetic source {} has an empty frame size",
                    index
                )));
            }
            Ok(Box::new(SyntheticSource::new(index, *width, *height, *fail_after)))
        }
        SourceConfig::Display { id, region } => open_display(*id, *region),
    }
}

#[cfg(target_os = "macos")]
fn open_display(id: u32, region: Option<Region>) -> RecordingResult<Box<dyn FrameSource>> {
    macos::screen::DisplaySource::open(id, region)
        .map(|s| Box::new(s) as Box<dyn FrameSource>)
        .map_err(|e| RecordingError::BackendUnavailable(e.to_string()))
}

#[cfg(target_os = "windows")]
fn open_display(id: u32, region: Option<Region>) -> RecordingResult<Box<dyn FrameSource>> {
    windows::screen::DisplaySource::open(id, region)
        .map(|s| Box::new(s) as Box<dyn FrameSource>)
        .map_err(|e| RecordingError::BackendUnavailable(e.to_string()))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn open_display(id: u32, _region: Option<Region>) -> RecordingResult<Box<dyn FrameSource>> {
    Err(RecordingError::BackendUnavailable(format!(
        "in-process capture of display {} is not supported on this platform; \
         use the process backend",
        id
    )))
}
