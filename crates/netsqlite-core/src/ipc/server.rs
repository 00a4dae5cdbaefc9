//! TCP server that owns the one database handle.
//!
//! Listens on a configured port slot, accepts connections from clients, and
//! dispatches requests against the database.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. All engine calls go
//! through one `std::sync::Mutex` on a blocking thread, so database access
//! is totally ordered across every client regardless of how many handling
//! tasks are waiting.

use super::auth::{accept_handshake, constant_time_eq};
use super::protocol::{parse_request, Request, Response, AUTHENTICATED, PONG};
use super::transport::Transport;
use crate::config::ServerDefaults;
use crate::engine::{DatabaseBackend, Rows, SqliteBackend};
use crate::error::{NetSqliteError, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// What a server serves and where.
#[derive(Clone)]
pub struct ServerConfig {
    /// Database identity, reported back to clients verbatim.
    pub database: String,
    /// Port slot to bind.
    pub addr: SocketAddr,
    /// Shared secret. `None` disables authentication.
    pub auth_token: Option<String>,
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn new(database: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            database: database.into(),
            addr,
            auth_token: None,
            max_connections: ServerDefaults::MAX_CONNECTIONS,
        }
    }

    /// Set the shared secret. An empty string counts as no secret.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("database", &self.database)
            .field("addr", &self.addr)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Handle to a running server. Dropping shuts down the server.
pub struct ServerHandle {
    addr: SocketAddr,
    database: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Shut the server down.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait until the accept loop has exited.
    pub async fn stopped(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Request executor shared by all connection tasks.
struct Executor<B: DatabaseBackend> {
    database: String,
    secret: Option<String>,
    backend: Arc<Mutex<B>>,
}

impl<B: DatabaseBackend> Executor<B> {
    /// Decode, dispatch and answer one frame.
    ///
    /// The returned flag asks the caller to drop the connection after
    /// sending the response.
    async fn process(&self, frame: &[u8]) -> (Response, bool) {
        let request = match parse_request(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting request: {}", e);
                return (Response::failure(&e), false);
            }
        };

        match self.dispatch(request).await {
            Ok(value) => (value, false),
            Err(e) => {
                let fatal = e.is_authentication_error();
                (Response::failure(&e), fatal)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Ping => Ok(Response::success(PONG)),
            Request::TargetDatabase => Ok(Response::success(self.database.clone())),
            Request::Authenticate { token } => match &self.secret {
                Some(secret) if !constant_time_eq(token.as_bytes(), secret.as_bytes()) => {
                    Err(NetSqliteError::AuthenticationFailed {
                        message: "Invalid authentication token".to_string(),
                    })
                }
                _ => Ok(Response::success(AUTHENTICATED)),
            },
            Request::Execute { query, params } => self
                .execute(query, params.unwrap_or_default())
                .await
                .map(Response::rows),
        }
    }

    async fn execute(&self, query: String, params: Vec<Value>) -> Result<Rows> {
        debug!("Query: {} with parameters: {:?}", query, params);

        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let mut db = backend.lock().unwrap_or_else(PoisonError::into_inner);
            db.execute(&query, &params)
        })
        .await
        .map_err(|e| NetSqliteError::Internal {
            message: format!("Query task failed: {}", e),
        })?
    }
}

/// Server that owns a database handle and listens for clients.
pub struct Server;

impl Server {
    /// Open the SQLite database named in `config` and start serving it.
    pub async fn open(config: ServerConfig) -> Result<ServerHandle> {
        let backend = SqliteBackend::open(&config.database)?;
        info!("Connected to sqlite database: '{}'", config.database);
        Self::start(config, backend).await
    }

    /// Start serving `backend` on the configured port slot.
    ///
    /// Binding fails if the slot is already taken; the caller decides what
    /// that means.
    pub async fn start<B: DatabaseBackend>(config: ServerConfig, backend: B) -> Result<ServerHandle> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|e| NetSqliteError::Io {
                message: format!("Failed to bind {}: {}", config.addr, e),
                source: Some(e),
            })?;
        let addr = listener.local_addr()?;

        info!(
            "Serving '{}' on {}{}",
            config.database,
            addr,
            if config.auth_token.is_some() {
                " (authentication required)"
            } else {
                ""
            }
        );

        let executor = Arc::new(Executor {
            database: config.database.clone(),
            secret: config.auth_token.clone(),
            backend: Arc::new(Mutex::new(backend)),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            executor,
            config.max_connections,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(ServerHandle {
            addr,
            database: config.database,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<B: DatabaseBackend>(
        listener: TcpListener,
        executor: Arc<Executor<B>>,
        max_connections: usize,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let executor = executor.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, peer_addr, &executor, &mut conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<B: DatabaseBackend>(
        stream: TcpStream,
        peer_addr: SocketAddr,
        executor: &Executor<B>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut transport = Transport::from_stream(stream, peer_addr)?;

        if let Some(secret) = &executor.secret {
            tokio::select! {
                result = accept_handshake(&mut transport, secret) => result?,
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }

        loop {
            let frame = tokio::select! {
                result = transport.receive() => match result {
                    Ok(frame) => frame,
                    Err(e) if e.is_connection_lost() => return Ok(()), // Client went away
                    Err(e) => return Err(e),
                },
                _ = shutdown_rx.changed() => {
                    transport.close().await;
                    return Ok(());
                }
            };

            let (response, close_after) = executor.process(&frame).await;
            transport.respond(&response).await?;

            if close_after {
                transport.close().await;
                return Ok(());
            }
        }
    }
}
