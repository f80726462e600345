//! Capture trait definitions
//!
//! Platform-agnostic types for in-process frame sources.

use crate::config::Region;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Information about a display/screen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Display index used by `SourceConfig::Display`
    pub id: u32,

    /// Display name
    pub name: String,

    /// Left edge in desktop coordinates
    pub x: i32,

    /// Top edge in desktop coordinates
    pub y: i32,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Whether this is the primary display
    pub is_primary: bool,
}

/// Errors raised by a single frame source
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Display {0} not found")]
    DisplayNotFound(u32),

    #[error("Capture failed: {0}")]
    Failed(String),
}

/// One captured frame, tightly packed BGRA
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        Self { width, height, data }
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.width as usize * 4;
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    /// Copy out `region`, clamped to this frame
    pub fn crop(&self, region: &Region) -> Result<Frame, CaptureError> {
        let clamped = region.clamp_to(self.width, self.height).ok_or_else(|| {
            CaptureError::Failed(format!(
                "region {:?} lies outside the {}x{} frame",
                region, self.width, self.height
            ))
        })?;

        let left = clamped.left as usize * 4;
        let row_len = clamped.width as usize * 4;
        let mut data = Vec::with_capacity(row_len * clamped.height as usize);
        for y in clamped.top..clamped.top + clamped.height {
            data.extend_from_slice(&self.row(y)[left..left + row_len]);
        }
        Ok(Frame::new(clamped.width, clamped.height, data))
    }
}

/// A source of screen frames, polled once per tick by the capture loop.
///
/// Sources are moved into the capture thread and owned by it exclusively.
pub trait FrameSource: Send {
    /// Identifier used in logs and events
    fn id(&self) -> &str;

    /// Grab the current frame
    fn capture(&mut self) -> Result<Frame, CaptureError>;
}

/// Check if screen recording permission is granted
pub fn has_screen_recording_permission() -> bool {
    #[cfg(target_os = "macos")]
    {
        crate::capture::macos::permissions::has_screen_recording_permission()
    }

    #[cfg(not(target_os = "macos"))]
    {
        // Windows and X11 have no capture permission gate
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Compositor;

    /// Each pixel's blue byte is its x, green byte its y
    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        Frame::new(width, height, data)
    }

    #[test]
    fn test_crop_copies_the_region() {
        let frame = gradient(8, 6);
        let region = Region {
            left: 2,
            top: 1,
            width: 3,
            height: 2,
        };

        let cropped = frame.crop(&region).unwrap();
        assert_eq!((cropped.width, cropped.height), (3, 2));
        assert_eq!(cropped.data.len(), 3 * 2 * 4);
        assert_eq!(&cropped.row(0)[..4], &[2, 1, 0, 255]);
        assert_eq!(&cropped.row(1)[8..], &[4, 2, 0, 255]);
    }

    #[test]
    fn test_crop_clamps_to_frame_edge() {
        let frame = gradient(8, 6);
        let region = Region {
            left: 6,
            top: 4,
            width: 100,
            height: 100,
        };
        let cropped = frame.crop(&region).unwrap();
        assert_eq!((cropped.width, cropped.height), (2, 2));

        let outside = Region {
            left: 8,
            top: 0,
            width: 1,
            height: 1,
        };
        assert!(frame.crop(&outside).is_err());
    }

    #[test]
    fn test_cropped_source_sets_composite_size() {
        let region = Region {
            left: 10,
            top: 5,
            width: 20,
            height: 12,
        };
        let first = vec![
            Some(gradient(64, 48).crop(&region).unwrap()),
            Some(gradient(8, 8)),
        ];
        let compositor = Compositor::from_first_frames(&first).unwrap();
        assert_eq!(compositor.dimensions(), (28, 12));
    }
}
