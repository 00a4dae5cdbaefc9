//! Servers hosted on the caller's own tokio runtime.
//!
//! Used by tests and by embedders that want one process to own the database
//! while still serving other local processes.

use super::launcher::{LaunchRequest, ServerLauncher, ServerProcess};
use crate::error::Result;
use crate::ipc::{Server, ServerConfig, ServerHandle};
use async_trait::async_trait;
use tracing::debug;

/// Starts a [`Server`] task on the current runtime instead of a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessLauncher;

impl InProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServerLauncher for InProcessLauncher {
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn ServerProcess>> {
        let config = ServerConfig::new(request.database, request.addr)
            .with_auth_token(request.auth_token.map(str::to_string));

        // A lost bind race looks like a process that exited right away
        let server = match Server::open(config).await {
            Ok(handle) => InProcessServer {
                handle: Some(handle),
                failure: None,
            },
            Err(e) => {
                debug!("In-process server for '{}' did not start: {}", request.database, e);
                InProcessServer {
                    handle: None,
                    failure: Some(e.to_string()),
                }
            }
        };
        Ok(Box::new(server))
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}

/// A server task started by [`InProcessLauncher`].
pub struct InProcessServer {
    handle: Option<ServerHandle>,
    failure: Option<String>,
}

impl InProcessServer {
    pub fn addr(&self) -> Option<std::net::SocketAddr> {
        self.handle.as_ref().map(ServerHandle::addr)
    }
}

impl std::fmt::Debug for InProcessServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessServer")
            .field("addr", &self.addr())
            .field("failure", &self.failure)
            .finish()
    }
}

impl ServerProcess for InProcessServer {
    fn id(&self) -> Option<u32> {
        None
    }

    fn exit_status(&mut self) -> Option<String> {
        match (&self.handle, &self.failure) {
            (_, Some(failure)) => Some(failure.clone()),
            (None, None) => Some("stopped".to_string()),
            (Some(_), None) => None,
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle.shutdown();
        }
        Ok(())
    }
}
