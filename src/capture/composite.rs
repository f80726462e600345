//! Side-by-side frame composition
//!
//! Frames from several sources are placed left to right and padded to a common
//! height. The layout is fixed from the first set of frames: every later tick
//! produces a buffer of exactly the same size, whatever the sources return.

use super::traits::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    x: u32,
    width: u32,
    height: u32,
}

/// Builds composite BGRA frames with a layout fixed at construction.
#[derive(Debug)]
pub struct Compositor {
    slots: Vec<Slot>,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl Compositor {
    /// Fix the layout from the first frame of each source.
    ///
    /// A source that produced no first frame gets a zero-width slot. Returns
    /// `None` when no source produced anything.
    pub fn from_first_frames(frames: &[Option<Frame>]) -> Option<Self> {
        let mut slots = Vec::with_capacity(frames.len());
        let mut x = 0;
        let mut height = 0;

        for frame in frames {
            let (width, frame_height) = frame
                .as_ref()
                .map(|f| (f.width, f.height))
                .unwrap_or((0, 0));
            slots.push(Slot { x, width, height: frame_height });
            x += width;
            height = height.max(frame_height);
        }

        if x == 0 || height == 0 {
            return None;
        }

        Some(Self {
            slots,
            width: x,
            height,
            buffer: vec![0; x as usize * height as usize * 4],
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Size in bytes of every composite this compositor produces
    pub fn frame_len(&self) -> usize {
        self.buffer.len()
    }

    /// Compose one tick. Missing frames leave their slot black; frames whose
    /// size changed since the first tick are cropped or padded into the slot.
    pub fn compose(&mut self, frames: &[Option<Frame>]) -> &[u8] {
        self.buffer.fill(0);
        let stride = self.width as usize * 4;

        for (slot, frame) in self.slots.iter().zip(frames) {
            let Some(frame) = frame else { continue };
            let cols = slot.width.min(frame.width) as usize * 4;
            let rows = slot.height.min(frame.height);
            let offset = slot.x as usize * 4;

            for y in 0..rows {
                let dst = y as usize * stride + offset;
                self.buffer[dst..dst + cols].copy_from_slice(&frame.row(y)[..cols]);
            }
        }

        &self.buffer
    }
}
