//! macOS permission handling

use core_graphics::access::ScreenCaptureAccess;

/// Check if screen recording permission is granted
pub fn has_screen_recording_permission() -> bool {
    ScreenCaptureAccess.preflight()
}

/// Request screen recording permission
///
/// The system shows its own prompt; returns true only if already granted.
pub fn request_screen_recording_permission() -> bool {
    ScreenCaptureAccess.request()
}
