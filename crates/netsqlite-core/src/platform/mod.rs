//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than
//! scattered throughout the codebase.
//!
//! - `process` - stopping child processes (signals, reaping)

pub mod process;

pub use process::{request_stop, terminate_child};
