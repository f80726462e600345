//! Windows capture implementations

pub mod screen;
