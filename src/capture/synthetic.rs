//! Generated test-pattern source
//!
//! Produces a moving gradient of a fixed size. Used for diagnostics on hosts
//! without a capturable display, and to exercise source loss via `fail_after`.

use super::traits::{CaptureError, Frame, FrameSource};

pub struct SyntheticSource {
    id: String,
    width: u32,
    height: u32,
    fail_after: Option<u64>,
    frames: u64,
}

impl SyntheticSource {
    pub fn new(index: usize, width: u32, height: u32, fail_after: Option<u64>) -> Self {
        Self {
            id: format!("synthetic-{}", index),
            width,
            height,
            fail_after,
            frames: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.fail_after.is_some_and(|limit| self.frames >= limit) {
            return Err(CaptureError::Failed(format!(
                "{} stopped after {} frames",
                self.id, self.frames
            )));
        }

        let tick = self.frames as u32;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(x.wrapping_add(tick * 4) as u8);
                data.push(y.wrapping_add(tick * 2) as u8);
                data.push((x ^ y) as u8);
                data.push(0xff);
            }
        }

        self.frames += 1;
        Ok(Frame::new(self.width, self.height, data))
    }
}
