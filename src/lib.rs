//! Simian Recorder - screen clip recording for the Simian desktop assistant.
//!
//! The [`recorder::SessionManager`] owns one capture session at a time and
//! guarantees a stopped session leaves no worker or open file behind.
//! Capture runs either in-process (platform frame sources composited and fed
//! to a video writer) or through an external capture program.

pub mod capture;
pub mod commands;
pub mod config;
pub mod encode;
pub mod recorder;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simian_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
