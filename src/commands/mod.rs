//! Command handlers
//!
//! The caller-facing surface: HTTP routes, GUI buttons and the voice
//! dispatcher all go through these functions rather than the manager.

pub mod recording;
pub mod voice;

pub use recording::RecorderState;
