//! Error types for NetSQLite.
//!
//! A single enum covers the whole taxonomy. Connection-level failures
//! (`Unreachable`, `Disconnected`) are the only ones the connection facade
//! recovers from on its own; everything else reaches the caller unchanged.

use crate::ipc::protocol::{ErrorCategory, RemoteError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the NetSQLite library.
#[derive(Debug, Error)]
pub enum NetSqliteError {
    // Connection errors
    #[error("No server listening at {addr}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection to server lost: {message}")]
    Disconnected { message: String },

    // Authentication errors
    #[error("Authentication required: {message}")]
    AuthenticationRequired { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // Protocol errors
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Failed to decode message: {message}")]
    Decode { message: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Engine errors
    /// The SQL engine rejected a call. The message is the engine's own.
    #[error("{message}")]
    Engine {
        message: String,
        /// Engine error code name, when the engine reported one.
        code: Option<String>,
    },

    #[error("Failed to open database '{database}': {message}")]
    Database {
        database: String,
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Discovery errors
    #[error("Spawned server at {addr} was not ready after {waited:?}")]
    SpawnTimeout { addr: SocketAddr, waited: Duration },

    #[error("No server available for '{database}' among {candidates} candidate addresses")]
    NoServerAvailable { database: String, candidates: usize },

    #[error("Failed to launch server: {message}")]
    Spawn { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // System errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Server error: {message}")]
    Internal { message: String },
}

/// Result type alias for NetSQLite operations.
pub type Result<T> = std::result::Result<T, NetSqliteError>;

impl From<std::io::Error> for NetSqliteError {
    fn from(err: std::io::Error) -> Self {
        NetSqliteError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for NetSqliteError {
    fn from(err: serde_json::Error) -> Self {
        NetSqliteError::Decode {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for NetSqliteError {
    fn from(err: rusqlite::Error) -> Self {
        NetSqliteError::Engine {
            message: err.to_string(),
            code: err.sqlite_error_code().map(|code| format!("{:?}", code)),
        }
    }
}

impl From<RemoteError> for NetSqliteError {
    fn from(err: RemoteError) -> Self {
        let message = err.message;
        match ErrorCategory::parse(&err.category) {
            ErrorCategory::AuthenticationRequired => {
                NetSqliteError::AuthenticationRequired { message }
            }
            ErrorCategory::AuthenticationFailed => NetSqliteError::AuthenticationFailed { message },
            ErrorCategory::InvalidMessage => NetSqliteError::InvalidMessage { message },
            ErrorCategory::UnknownMethod => NetSqliteError::UnknownMethod { method: message },
            ErrorCategory::EngineError => NetSqliteError::Engine {
                message,
                code: err.code,
            },
            ErrorCategory::Internal | ErrorCategory::Unknown => {
                NetSqliteError::Internal { message }
            }
        }
    }
}

impl NetSqliteError {
    /// Shorthand for a dropped stream.
    pub fn disconnected(message: impl Into<String>) -> Self {
        NetSqliteError::Disconnected {
            message: message.into(),
        }
    }

    /// True when the failure means the transport is gone and a reconnect may help.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            NetSqliteError::Unreachable { .. } | NetSqliteError::Disconnected { .. }
        )
    }

    /// True for handshake rejections. These are never retried.
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            NetSqliteError::AuthenticationRequired { .. }
                | NetSqliteError::AuthenticationFailed { .. }
        )
    }

    /// Wire category used when this error is sent back to a client.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetSqliteError::AuthenticationRequired { .. } => ErrorCategory::AuthenticationRequired,
            NetSqliteError::AuthenticationFailed { .. } => ErrorCategory::AuthenticationFailed,
            NetSqliteError::InvalidMessage { .. }
            | NetSqliteError::Decode { .. }
            | NetSqliteError::FrameTooLarge { .. } => ErrorCategory::InvalidMessage,
            NetSqliteError::UnknownMethod { .. } => ErrorCategory::UnknownMethod,
            NetSqliteError::Engine { .. } => ErrorCategory::EngineError,
            _ => ErrorCategory::Internal,
        }
    }

    /// Convert into the tagged error record carried by a response frame.
    ///
    /// The record's message is the bare payload so that the client can
    /// rebuild the same variant without stacking display prefixes.
    pub fn to_remote(&self) -> RemoteError {
        let message = match self {
            NetSqliteError::Disconnected { message }
            | NetSqliteError::AuthenticationRequired { message }
            | NetSqliteError::AuthenticationFailed { message }
            | NetSqliteError::InvalidMessage { message }
            | NetSqliteError::Decode { message }
            | NetSqliteError::Engine { message, .. }
            | NetSqliteError::Internal { message } => message.clone(),
            NetSqliteError::UnknownMethod { method } => method.clone(),
            other => other.to_string(),
        };
        let code = match self {
            NetSqliteError::Engine { code, .. } => code.clone(),
            _ => None,
        };
        RemoteError::new(self.category(), message).with_code(code)
    }
}
