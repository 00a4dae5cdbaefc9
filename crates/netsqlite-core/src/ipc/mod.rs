//! Local TCP messaging between clients and the server process.
//!
//! Uses length-prefixed JSON frames over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Protocol**: request and response types plus the JSON codec
//! - **Transport**: framing on top of one TCP stream
//! - **Auth**: the shared-secret handshake run first on every connection
//! - **Server**: accepts connections and executes requests against the database

pub mod auth;
pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{ErrorCategory, RemoteError, Request, Response};
pub use server::{Server, ServerConfig, ServerHandle};
pub use transport::Transport;
