//! macOS screen capture using CoreGraphics
//!
//! `CGDisplay::image()` returns a 32-bit BGRA snapshot of the display. Rows
//! may carry padding past `width * 4`, which is stripped before the frame
//! leaves this module. A configured region is cut out of the snapshot
//! afterwards, since its size in pixels depends on the display's scale.

use crate::capture::traits::{CaptureError, DisplayInfo, Frame, FrameSource};
use crate::config::Region;
use core_graphics::display::CGDisplay;

/// Get list of available displays
pub fn get_displays() -> Vec<DisplayInfo> {
    let display_ids = CGDisplay::active_displays().unwrap_or_default();

    display_ids
        .iter()
        .enumerate()
        .map(|(index, &id)| {
            let display = CGDisplay::new(id);
            let bounds = display.bounds();
            let is_main = display.is_main();

            DisplayInfo {
                id: index as u32,
                name: if is_main {
                    "Main Display".to_string()
                } else {
                    format!("Display {}", index + 1)
                },
                x: bounds.origin.x as i32,
                y: bounds.origin.y as i32,
                width: display.pixels_wide() as u32,
                height: display.pixels_high() as u32,
                is_primary: is_main,
            }
        })
        .collect()
}

/// In-process capture of one display
pub struct DisplaySource {
    id: String,
    display: CGDisplay,
    region: Option<Region>,
}

impl DisplaySource {
    pub fn open(display_id: u32, region: Option<Region>) -> Result<Self, CaptureError> {
        if !super::permissions::has_screen_recording_permission() {
            super::permissions::request_screen_recording_permission();
            return Err(CaptureError::Failed(
                "Screen recording permission not granted. Please allow in System Settings."
                    .to_string(),
            ));
        }

        let ids = CGDisplay::active_displays().unwrap_or_default();
        let cg_id = *ids
            .get(display_id as usize)
            .ok_or(CaptureError::DisplayNotFound(display_id))?;

        tracing::info!(
            "macOS display source {} (CGDirectDisplayID {}), region {:?}",
            display_id,
            cg_id,
            region
        );

        Ok(Self {
            id: format!("display-{}", display_id),
            display: CGDisplay::new(cg_id),
            region,
        })
    }
}

impl FrameSource for DisplaySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let image = self
            .display
            .image()
            .ok_or_else(|| CaptureError::Failed(format!("{} returned no image", self.id)))?;

        if image.bits_per_pixel() != 32 {
            return Err(CaptureError::Failed(format!(
                "unsupported pixel depth {}",
                image.bits_per_pixel()
            )));
        }

        let width = image.width();
        let height = image.height();
        let stride = image.bytes_per_row();
        let row_len = width * 4;
        let data = image.data();
        let bytes = data.bytes();

        let mut pixels = Vec::with_capacity(row_len * height);
        for row in 0..height {
            let start = row * stride;
            pixels.extend_from_slice(&bytes[start..start + row_len]);
        }

        let frame = Frame::new(width as u32, height as u32, pixels);
        match &self.region {
            Some(region) => frame.crop(region),
            None => Ok(frame),
        }
    }
}
