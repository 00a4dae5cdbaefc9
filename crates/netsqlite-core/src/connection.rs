//! Long-lived client handle.
//!
//! A [`Connection`] holds one transport to the server for its database. When
//! that server goes away, the next call runs discovery again and retries
//! once on whatever server it finds or starts.

use crate::config::ClientConfig;
use crate::discovery::{discover, Discovered};
use crate::engine::Rows;
use crate::error::{NetSqliteError, Result};
use crate::ipc::protocol::{rows_from_value, PONG};
use crate::ipc::{Request, Transport};
use crate::process::ServerProcess;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connect to the server for `database`, starting one if needed.
///
/// Uses [`ClientConfig::from_env`]. An empty token counts as no token.
pub async fn connect(database: &str, auth_token: Option<&str>) -> Result<Connection> {
    Connection::open(database, auth_token, ClientConfig::from_env()?).await
}

struct ConnectionState {
    transport: Option<Transport>,
    addr: SocketAddr,
    /// Server started by this connection, stopped on close.
    server: Option<Box<dyn ServerProcess>>,
    closed: bool,
}

/// Client handle for one database.
///
/// Calls on one `Connection` are serialized: concurrent callers queue on an
/// internal lock instead of interleaving frames.
pub struct Connection {
    database: String,
    auth_token: Option<String>,
    config: Arc<ClientConfig>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Open a connection with an explicit configuration.
    pub async fn open(
        database: impl Into<String>,
        auth_token: Option<&str>,
        config: ClientConfig,
    ) -> Result<Self> {
        let database = database.into();
        let auth_token = auth_token.filter(|t| !t.is_empty()).map(str::to_string);

        let Discovered {
            transport,
            addr,
            server,
        } = discover(&config, &database, auth_token.as_deref()).await?;

        info!(
            "Connected to server for '{}' on {}{}",
            database,
            addr,
            if server.is_some() { " (started)" } else { "" }
        );

        Ok(Self {
            database,
            auth_token,
            config: Arc::new(config),
            state: Mutex::new(ConnectionState {
                transport: Some(transport),
                addr,
                server,
                closed: false,
            }),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run one SQL statement and return all of its rows.
    ///
    /// A lost server is replaced transparently, at most once per call.
    /// Engine errors come back unchanged.
    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<Rows> {
        let request = Request::execute(query, params);
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;

        if self.config.check_liveness && !Self::ping(&mut state).await {
            debug!("Server on {} did not answer ping, reconnecting", state.addr);
            self.reconnect(&mut state).await?;
            return Self::call(&mut state, &request).await;
        }

        match Self::call(&mut state, &request).await {
            Err(e) if e.is_connection_lost() => {
                warn!("Lost server on {}: {}; reconnecting", state.addr, e);
                self.reconnect(&mut state).await?;
                Self::call(&mut state, &request).await
            }
            result => result,
        }
    }

    /// Check whether the current server answers a ping.
    ///
    /// Never reconnects.
    pub async fn is_alive(&self) -> bool {
        let mut state = self.state.lock().await;
        !state.closed && Self::ping(&mut state).await
    }

    /// Close the transport and stop the server if this connection started it.
    ///
    /// Idempotent. Any later `execute` fails.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;

        if let Some(mut transport) = state.transport.take() {
            transport.close().await;
        }

        if let Some(mut server) = state.server.take() {
            info!("Stopping server for '{}' on {}", self.database, state.addr);
            tokio::task::spawn_blocking(move || server.terminate())
                .await
                .map_err(|e| NetSqliteError::Internal {
                    message: format!("Server shutdown task failed: {}", e),
                })??;
        }

        Ok(())
    }

    /// Address of the server currently in use.
    pub async fn server_addr(&self) -> SocketAddr {
        self.state.lock().await.addr
    }

    /// Process id of the server this connection started, if any.
    pub async fn server_pid(&self) -> Option<u32> {
        self.state
            .lock()
            .await
            .server
            .as_ref()
            .and_then(|server| server.id())
    }

    /// True when this connection started, and therefore owns, its server.
    pub async fn owns_server(&self) -> bool {
        self.state.lock().await.server.is_some()
    }

    fn ensure_open(state: &ConnectionState) -> Result<()> {
        if state.closed {
            return Err(NetSqliteError::disconnected("connection is closed"));
        }
        Ok(())
    }

    async fn call(state: &mut ConnectionState, request: &Request) -> Result<Rows> {
        let transport = match state.transport.as_mut() {
            Some(transport) => transport,
            None => return Err(NetSqliteError::disconnected("no transport to server")),
        };

        let value = transport.call(request).await;
        if transport.is_closed() {
            state.transport = None;
        }
        rows_from_value(value?)
    }

    async fn ping(state: &mut ConnectionState) -> bool {
        let Some(transport) = state.transport.as_mut() else {
            return false;
        };

        match transport.call(&Request::Ping).await {
            Ok(value) => value == PONG,
            Err(e) => {
                debug!("Ping to {} failed: {}", state.addr, e);
                if transport.is_closed() {
                    state.transport = None;
                }
                false
            }
        }
    }

    async fn reconnect(&self, state: &mut ConnectionState) -> Result<()> {
        if let Some(mut stale) = state.transport.take() {
            stale.close().await;
        }

        let Discovered {
            transport,
            addr,
            server,
        } = discover(&self.config, &self.database, self.auth_token.as_deref()).await?;

        info!(
            "Reconnected to server for '{}' on {}{}",
            self.database,
            addr,
            if server.is_some() { " (started)" } else { "" }
        );

        state.transport = Some(transport);
        state.addr = addr;
        if let Some(server) = server {
            // The previous server is gone; dropping its handle reaps it
            state.server = Some(server);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("database", &self.database)
            .field("authenticated", &self.auth_token.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
