//! Starting server processes for the discovery procedure.

use crate::config::ServerDefaults;
use crate::error::{NetSqliteError, Result};
use crate::platform;
use async_trait::async_trait;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// What a launcher is asked to start.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub database: &'a str,
    pub addr: SocketAddr,
    pub auth_token: Option<&'a str>,
}

/// Starts a server for one database on one port slot.
///
/// Launching only starts the server. Whether it came up, and whether it won
/// the slot, is found out by polling the slot afterwards.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn ServerProcess>>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// A server started by this client.
///
/// Dropping the value stops the server.
pub trait ServerProcess: Send + std::fmt::Debug {
    /// OS process id, if the server runs in its own process.
    fn id(&self) -> Option<u32>;

    /// Description of how the server ended, or `None` while it is running.
    fn exit_status(&mut self) -> Option<String>;

    /// Stop the server and wait for it. Idempotent.
    fn terminate(&mut self) -> Result<()>;
}

/// Launches the `netsqlite-server` binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    log_file: Option<PathBuf>,
}

impl ProcessLauncher {
    /// File name of the server binary.
    pub const SERVER_BIN_NAME: &'static str = "netsqlite-server";

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_file: None,
        }
    }

    /// Find the server binary next to the running executable.
    ///
    /// Looks in the executable's directory and its parent (test binaries
    /// live one level below the build output). Falls back to the bare name,
    /// resolved through `PATH` at launch time.
    pub fn locate() -> Self {
        let file_name = format!("{}{}", Self::SERVER_BIN_NAME, std::env::consts::EXE_SUFFIX);

        let found = std::env::current_exe().ok().and_then(|exe| {
            exe.ancestors()
                .skip(1)
                .take(2)
                .map(|dir| dir.join(&file_name))
                .find(|candidate| candidate.is_file())
        });

        match found {
            Some(path) => {
                debug!("Using server binary at {}", path.display());
                Self::new(path)
            }
            None => Self::new(file_name),
        }
    }

    /// Send the server's log output to `path` instead of discarding it.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, request: &LaunchRequest<'_>) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--database")
            .arg(request.database)
            .arg("--host")
            .arg(request.addr.ip().to_string())
            .arg("--port")
            .arg(request.addr.port().to_string());

        // The secret travels in the environment so it never shows up in argv
        match request.auth_token {
            Some(token) => cmd.env(ServerDefaults::AUTH_TOKEN_ENV, token),
            None => cmd.env_remove(ServerDefaults::AUTH_TOKEN_ENV),
        };

        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        match &self.log_file {
            Some(log_file) => {
                if let Some(parent) = log_file.parent() {
                    fs::create_dir_all(parent).ok();
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_file)
                    .map_err(|e| NetSqliteError::Io {
                        message: format!("Failed to open log file {}: {}", log_file.display(), e),
                        source: Some(e),
                    })?;
                cmd.stderr(Stdio::from(file));
            }
            None => {
                cmd.stderr(Stdio::null());
            }
        }

        Ok(cmd)
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::locate()
    }
}

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn ServerProcess>> {
        let child = self
            .command(request)?
            .spawn()
            .map_err(|e| NetSqliteError::Spawn {
                message: format!("{}: {}", self.program.display(), e),
            })?;

        info!(
            "Started server process {} for '{}' on {}",
            child.id(),
            request.database,
            request.addr
        );

        Ok(Box::new(ChildServer {
            child: Some(child),
            addr: request.addr,
        }))
    }

    fn describe(&self) -> String {
        format!("process({})", self.program.display())
    }
}

/// A server running as a child process of this client.
#[derive(Debug)]
pub struct ChildServer {
    child: Option<Child>,
    addr: SocketAddr,
}

impl ServerProcess for ChildServer {
    fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn exit_status(&mut self) -> Option<String> {
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Some("stopped".to_string()),
        };
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            debug!("Stopping server process {} on {}", child.id(), self.addr);
            platform::terminate_child(&mut child, ServerDefaults::STOP_TIMEOUT)?;
        }
        Ok(())
    }
}

impl Drop for ChildServer {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let addr = self.addr;
        debug!("Stopping dropped server process {} on {}", child.id(), addr);

        platform::request_stop(&mut child);
        let mut reap = move || {
            if let Err(e) = platform::terminate_child(&mut child, ServerDefaults::STOP_TIMEOUT) {
                warn!("Failed to stop server process on {}: {}", addr, e);
            }
        };

        // The grace period must not stall a runtime worker
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}
