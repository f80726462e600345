//! Recording commands

use crate::capture::{self, has_screen_recording_permission, DisplayInfo};
use crate::config::{BackendConfig, RecorderConfig, SourceConfig};
use crate::recorder::{FinishedClip, SessionManager, SessionSnapshot};
use crate::utils::{AppError, AppResult, ErrorResponse};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application state for recording
#[derive(Clone)]
pub struct RecorderState {
    pub manager: Arc<SessionManager>,
}

impl RecorderState {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            manager: Arc::new(SessionManager::new(config)),
        }
    }

    /// Build from a config file plus environment overrides
    pub fn load(config_path: Option<&Path>) -> AppResult<Self> {
        Ok(Self::new(RecorderConfig::load(config_path)?))
    }
}

impl From<Arc<SessionManager>> for RecorderState {
    fn from(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

/// Whether the configured backend reads the real screen
fn captures_screen(config: &RecorderConfig) -> bool {
    match &config.backend {
        BackendConfig::Process(_) => true,
        BackendConfig::FrameLoop(frame_loop) => frame_loop
            .sources
            .iter()
            .any(|source| matches!(source, SourceConfig::Display { .. })),
    }
}

/// Get list of available displays
pub async fn get_displays() -> Result<Vec<DisplayInfo>, ErrorResponse> {
    Ok(capture::get_displays())
}

/// Check if screen recording permission is granted
pub async fn check_screen_permission() -> Result<bool, ErrorResponse> {
    Ok(has_screen_recording_permission())
}

/// Start recording; returns the clip path, which is the running one if any
pub async fn start_recording(state: &RecorderState) -> Result<PathBuf, ErrorResponse> {
    if captures_screen(state.manager.config()) && !has_screen_recording_permission() {
        return Err(AppError::Platform(
            "Screen recording permission not granted. \
             Please allow it in System Settings and try again."
                .to_string(),
        )
        .into());
    }

    state.manager.start().await.map_err(ErrorResponse::from)
}

/// Stop recording; `None` when nothing was recording
pub async fn stop_recording(state: &RecorderState) -> Result<Option<FinishedClip>, ErrorResponse> {
    Ok(state.manager.stop().await)
}

pub async fn is_recording(state: &RecorderState) -> Result<bool, ErrorResponse> {
    Ok(state.manager.is_running())
}

/// Get current recording status
pub async fn recording_status(state: &RecorderState) -> Result<SessionSnapshot, ErrorResponse> {
    Ok(state.manager.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, FrameLoopConfig, ProcessConfig};
    use crate::recorder::SessionStatus;

    fn synthetic_state(dir: &std::path::Path) -> RecorderState {
        RecorderState::new(RecorderConfig::native(
            dir,
            vec![SourceConfig::Synthetic {
                width: 16,
                height: 16,
                fail_after: None,
            }],
        ))
    }

    #[test]
    fn test_screen_capture_detection() {
        let synthetic = RecorderConfig::native(
            "clips",
            vec![SourceConfig::Synthetic {
                width: 4,
                height: 4,
                fail_after: None,
            }],
        );
        assert!(!captures_screen(&synthetic));

        let mut display = synthetic.clone();
        display.backend = BackendConfig::FrameLoop(FrameLoopConfig {
            sources: vec![SourceConfig::Display {
                id: 0,
                region: None,
            }],
            encoder: EncoderConfig::Native,
        });
        assert!(captures_screen(&display));

        let mut process = synthetic;
        process.backend = BackendConfig::Process(ProcessConfig::default());
        assert!(captures_screen(&process));
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = synthetic_state(dir.path());

        assert!(!is_recording(&state).await.unwrap());
        let path = start_recording(&state).await.unwrap();
        assert!(is_recording(&state).await.unwrap());

        let status = recording_status(&state).await.unwrap();
        assert_eq!(status.status, SessionStatus::Running);
        assert_eq!(status.session.map(|s| s.output_path), Some(path.clone()));

        let clip = stop_recording(&state).await.unwrap().unwrap();
        assert_eq!(clip.path, path);
        assert!(stop_recording(&state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_failure_maps_to_error_code() {
        let dir = tempfile::tempdir().unwrap();
        let state = RecorderState::new(RecorderConfig::native(
            dir.path(),
            vec![SourceConfig::Synthetic {
                width: 8,
                height: 8,
                fail_after: Some(0),
            }],
        ));

        let error = start_recording(&state).await.unwrap_err();
        assert_eq!(error.code, "BACKEND_UNAVAILABLE");
        assert!(!is_recording(&state).await.unwrap());
    }
}
