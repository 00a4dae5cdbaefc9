//! SQLite backend built on `rusqlite`.

use super::{DatabaseBackend, Rows};
use crate::config::ServerDefaults;
use crate::error::{NetSqliteError, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Batch, Connection};
use serde_json::Value;
use tracing::debug;

/// A single SQLite connection owned by a server.
pub struct SqliteBackend {
    conn: Connection,
    identity: String,
}

impl SqliteBackend {
    /// Reserved identity for a private in-memory database.
    pub const MEMORY_IDENTITY: &'static str = ":memory:";

    /// Open the database named by `identity`.
    ///
    /// `:memory:` opens a fresh in-memory database private to this backend.
    /// Anything else is treated as a file path and created if missing.
    pub fn open(identity: &str) -> Result<Self> {
        let opened = if identity == Self::MEMORY_IDENTITY {
            Connection::open_in_memory()
        } else {
            Connection::open(identity)
        };

        let conn = opened.map_err(|e| NetSqliteError::Database {
            database: identity.to_string(),
            message: e.to_string(),
            source: Some(e),
        })?;

        conn.busy_timeout(ServerDefaults::BUSY_TIMEOUT)
            .map_err(|e| NetSqliteError::Database {
                database: identity.to_string(),
                message: format!("Failed to set busy timeout: {}", e),
                source: Some(e),
            })?;

        debug!("Opened SQLite database '{}'", identity);

        Ok(Self {
            conn,
            identity: identity.to_string(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl DatabaseBackend for SqliteBackend {
    fn execute(&mut self, query: &str, params: &[Value]) -> Result<Rows> {
        let bound = params
            .iter()
            .map(to_sql_value)
            .collect::<Result<Vec<_>>>()?;

        let mut batch = Batch::new(&self.conn, query);
        let Some(mut stmt) = batch.next()? else {
            // Only whitespace or comments
            return Ok(Vec::new());
        };
        if !matches!(batch.next(), Ok(None)) {
            return Err(NetSqliteError::Engine {
                message: "You can only execute one statement at a time.".to_string(),
                code: Some("ApiMisuse".to_string()),
            });
        }

        let column_count = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                values.push(from_value_ref(row.get_ref(idx)?));
            }
            out.push(values);
        }

        Ok(out)
    }
}

/// Map a JSON parameter onto a SQLite value.
fn to_sql_value(value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(NetSqliteError::InvalidMessage {
                    message: format!("unsupported numeric parameter: {}", n),
                })
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(NetSqliteError::InvalidMessage {
            message: format!(
                "parameters must be scalars (null, bool, number, string), got: {}",
                value
            ),
        }),
    }
}

/// Map a SQLite column value onto JSON.
fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        // JSON has no NaN or infinity
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}
