//! macOS capture implementations

pub mod permissions;
pub mod screen;
