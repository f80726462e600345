//! Recording session module
//!
//! - `SessionManager` owns one session at a time and serializes start/stop
//! - `CaptureBackend` with two variants: in-process frame loop and external process
//! - Session state, finished-clip reports and events

pub mod backend;
pub mod frame_loop;
pub mod manager;
pub mod process;
pub mod state;

pub use backend::{
    BackendFactory, BackendReport, CaptureBackend, ConfiguredBackends, RecordingError,
    RecordingResult, WorkerContext,
};
pub use frame_loop::FrameLoopBackend;
pub use manager::SessionManager;
pub use process::ProcessBackend;
pub use state::{
    FinishedClip, RecordingEvent, SessionInfo, SessionSnapshot, SessionStatus, StopKind,
};
