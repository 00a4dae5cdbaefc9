//! Finding, or starting, the one server for a database.
//!
//! Candidate addresses are tried in order. For each one:
//!
//! 1. Nothing listening: launch a server there and poll until it answers.
//! 2. A server answers: authenticate if a token is set, then ask for its
//!    database. A match ends the search; a mismatch moves on to the next slot.
//! 3. Authentication rejected: stop and report it. A rejection is never a
//!    reason to try another slot.
//!
//! Exhausting the list fails with `NoServerAvailable`.

use crate::config::ClientConfig;
use crate::error::{NetSqliteError, Result};
use crate::ipc::auth;
use crate::ipc::{Request, Transport};
use crate::process::{LaunchRequest, ServerProcess};
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a successful discovery.
#[derive(Debug)]
pub struct Discovered {
    /// Verified (and, if required, authenticated) transport to the server.
    pub transport: Transport,
    pub addr: SocketAddr,
    /// Set when this discovery started the server.
    pub server: Option<Box<dyn ServerProcess>>,
}

/// What a listener at a slot turned out to be.
#[derive(Debug)]
enum SlotCheck {
    /// The right server; the transport is ready for requests.
    Match(Transport),
    /// A server for another database.
    Mismatch(String),
}

enum PollOutcome {
    Ready { transport: Transport, owned: bool },
    SlotTaken(String),
}

/// Locate the server for `database`, starting one if none is running.
pub async fn discover(
    config: &ClientConfig,
    database: &str,
    auth_token: Option<&str>,
) -> Result<Discovered> {
    for &addr in &config.candidates {
        match check_slot(addr, database, auth_token).await {
            Ok(SlotCheck::Match(transport)) => {
                debug!("Found server for '{}' on {}", database, addr);
                return Ok(Discovered {
                    transport,
                    addr,
                    server: None,
                });
            }
            Ok(SlotCheck::Mismatch(found)) => {
                debug!("Slot {} serves {}, trying next slot", addr, found);
            }
            Err(NetSqliteError::Unreachable { .. }) => {
                match spawn_at(config, addr, database, auth_token).await? {
                    Some(discovered) => return Ok(discovered),
                    None => continue,
                }
            }
            Err(e) if e.is_authentication_error() => return Err(e),
            Err(e) => {
                warn!("Slot {} is held by an unrecognised listener: {}", addr, e);
            }
        }
    }

    Err(NetSqliteError::NoServerAvailable {
        database: database.to_string(),
        candidates: config.candidates.len(),
    })
}

/// Connect to `addr` and check which database it serves.
async fn check_slot(addr: SocketAddr, database: &str, auth_token: Option<&str>) -> Result<SlotCheck> {
    let mut transport = Transport::connect(addr).await?;

    if let Some(token) = auth_token {
        auth::authenticate(&mut transport, token).await?;
    }

    let target = transport.call(&Request::TargetDatabase).await?;
    match target.as_str() {
        Some(served) if served == database => Ok(SlotCheck::Match(transport)),
        _ => {
            transport.close().await;
            Ok(SlotCheck::Mismatch(target.to_string()))
        }
    }
}

/// Launch a server at a free slot and wait for it.
///
/// Returns `None` when another database's server won the slot meanwhile.
async fn spawn_at(
    config: &ClientConfig,
    addr: SocketAddr,
    database: &str,
    auth_token: Option<&str>,
) -> Result<Option<Discovered>> {
    info!(
        "No server on {}, starting one for '{}' ({})",
        addr,
        database,
        config.launcher.describe()
    );

    let request = LaunchRequest {
        database,
        addr,
        auth_token,
    };
    let mut server = config.launcher.launch(&request).await?;

    match poll_until_ready(config, server.as_mut(), &request).await? {
        PollOutcome::Ready { transport, owned } => Ok(Some(Discovered {
            transport,
            addr,
            server: owned.then_some(server),
        })),
        PollOutcome::SlotTaken(found) => {
            debug!("Slot {} was taken by {} while starting", addr, found);
            Ok(None)
        }
    }
}

/// Poll the slot with backoff until the launched server verifies.
///
/// A listener for another database keeps the wait going, since the launched
/// server may simply not have bound yet. If the launched server has exited,
/// one last check decides between someone else's server and a failed launch.
async fn poll_until_ready(
    config: &ClientConfig,
    server: &mut dyn ServerProcess,
    request: &LaunchRequest<'_>,
) -> Result<PollOutcome> {
    let backoff = &config.backoff;
    let started = Instant::now();
    let deadline = started + backoff.timeout;
    let mut attempt = 0u32;

    loop {
        match check_slot(request.addr, request.database, request.auth_token).await {
            Ok(SlotCheck::Match(transport)) => {
                debug!("Server on {} ready after {:?}", request.addr, started.elapsed());
                return Ok(PollOutcome::Ready {
                    transport,
                    owned: server.exit_status().is_none(),
                });
            }
            Ok(SlotCheck::Mismatch(found)) => {
                debug!("{} still answers for {}, waiting", request.addr, found);
            }
            Err(e) if e.is_authentication_error() => return Err(e),
            Err(e) => debug!("Server on {} not ready: {}", request.addr, e),
        }

        if let Some(status) = server.exit_status() {
            return match check_slot(request.addr, request.database, request.auth_token).await {
                Ok(SlotCheck::Match(transport)) => Ok(PollOutcome::Ready {
                    transport,
                    owned: false,
                }),
                Ok(SlotCheck::Mismatch(found)) => Ok(PollOutcome::SlotTaken(found)),
                Err(e) if e.is_authentication_error() => Err(e),
                Err(_) => Err(NetSqliteError::Spawn {
                    message: format!(
                        "server for '{}' on {} exited before becoming ready: {}",
                        request.database, request.addr, status
                    ),
                }),
            };
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(NetSqliteError::SpawnTimeout {
                addr: request.addr,
                waited: now - started,
            });
        }

        let delay = backoff.delay_for(attempt).min(deadline - now);
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}
