//! NetSQLite Core - share one embedded SQLite database between local processes.
//!
//! Instead of every process opening the database file, one server process
//! owns the only connection and every client sends it SQL over a local TCP
//! socket. Clients find the server for their database on a small range of
//! well-known ports, and start one there if nobody serves it yet.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> netsqlite_core::Result<()> {
//!     let conn = netsqlite_core::connect("/var/lib/app/app.db", None).await?;
//!
//!     conn.execute("CREATE TABLE IF NOT EXISTS t(x int)", &[]).await?;
//!     conn.execute("INSERT INTO t VALUES(?)", &[json!(1)]).await?;
//!     let rows = conn.execute("SELECT * FROM t", &[]).await?;
//!     println!("{:?}", rows);
//!
//!     conn.close().await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod process;

// Re-export commonly used types
pub use config::{BackoffConfig, ClientConfig, DiscoveryConfig, ProtocolConfig, ServerDefaults};
pub use connection::{connect, Connection};
pub use engine::{DatabaseBackend, Row, Rows, SqliteBackend};
pub use error::{NetSqliteError, Result};
pub use ipc::{Server, ServerConfig, ServerHandle};
pub use process::{InProcessLauncher, ProcessLauncher, ServerLauncher, ServerProcess};
