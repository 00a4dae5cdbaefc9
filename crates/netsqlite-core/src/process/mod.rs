//! Server process management.
//!
//! A client that finds no server for its database starts one through a
//! [`ServerLauncher`]. The default launcher runs the `netsqlite-server`
//! binary as a child process; [`InProcessLauncher`] hosts the server on the
//! caller's runtime instead.
//!
//! Whatever is launched is owned by the client that launched it and is
//! stopped when that client closes.

mod in_process;
mod launcher;

pub use in_process::{InProcessLauncher, InProcessServer};
pub use launcher::{ChildServer, LaunchRequest, ProcessLauncher, ServerLauncher, ServerProcess};
