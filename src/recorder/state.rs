//! Recording state management
//!
//! Defines the session state machine and the values handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Status of the manager's session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session
    #[default]
    Idle,
    /// Backend confirmed capture has begun
    Running,
    /// `stop()` is waiting for the backend
    Stopping,
    /// Backend stopped and released; the file is closed
    Finalized,
    /// Every capture source was lost mid-session
    Failed,
}

impl SessionStatus {
    /// Whether the session counts as recording for `is_running()`
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Stopping)
    }
}

/// How the backend ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopKind {
    /// Terminated within the stop timeout
    Graceful,
    /// Killed after the stop timeout
    Forced,
}

/// Identity of the current session, published for lock-free status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub output_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            output_path,
            started_at: Utc::now(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

/// Read-only view of the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session: Option<SessionInfo>,
    pub elapsed_ms: Option<i64>,
}

/// A session that has been stopped and released
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedClip {
    pub id: Uuid,
    pub path: PathBuf,
    /// `Finalized`, or `Failed` when every source had been lost
    pub status: SessionStatus,
    pub ending: StopKind,
    /// The file is known or suspected to be unplayable
    pub degraded: bool,
    /// Frames written, when the backend counts them
    pub frames: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Capture began
    Started { path: PathBuf },
    /// Session released
    Stopped {
        path: PathBuf,
        ending: StopKind,
        degraded: bool,
    },
    /// One capture source dropped out; the session continues
    SourceLost { source: String, reason: String },
    /// Every capture source dropped out
    Failed { reason: String },
}
