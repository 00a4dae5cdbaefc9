//! The embedded SQL engine behind a server.
//!
//! The server never interprets SQL. It hands every call to a
//! `DatabaseBackend` while holding the executor's mutex.

mod sqlite;

pub use sqlite::SqliteBackend;

use crate::error::Result;
use serde_json::Value;

/// One result row, in column order.
pub type Row = Vec<Value>;

/// All rows produced by one statement, in engine order.
pub type Rows = Vec<Row>;

/// An engine handle that can run one statement at a time.
///
/// Implementations are driven from a blocking thread and are never called
/// concurrently.
pub trait DatabaseBackend: Send + 'static {
    /// Run `query` with positional `params` and fetch every resulting row.
    fn execute(&mut self, query: &str, params: &[Value]) -> Result<Rows>;
}
