//! NetSQLite server - owns one SQLite database and serves local clients.
//!
//! Clients normally start this binary themselves when they find no server
//! for their database. The shared secret, if any, comes from the
//! `NETSQLITE_AUTH_TOKEN` environment variable so it never appears in the
//! process's argument list.

use anyhow::{Context, Result};
use clap::Parser;
use netsqlite_core::{DiscoveryConfig, Server, ServerConfig, ServerDefaults};
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "netsqlite-server")]
#[command(about = "Serve one SQLite database to local NetSQLite clients")]
struct Args {
    /// Database to serve: a file path, or `:memory:` for a private in-memory database
    #[arg(long)]
    database: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DiscoveryConfig::BASE_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting NetSQLite server");

    // Signal handlers go in before binding
    let shutdown = shutdown_signal()?;

    let auth_token = std::env::var(ServerDefaults::AUTH_TOKEN_ENV).ok();
    let addr = SocketAddr::new(args.host, args.port);
    let config = ServerConfig::new(&args.database, addr).with_auth_token(auth_token);

    let mut handle = Server::open(config)
        .await
        .with_context(|| format!("failed to serve '{}' on {}", args.database, addr))?;

    info!("Server running on {}", handle.addr());

    shutdown.await?;
    info!("Shutdown signal received, exiting");

    handle.shutdown();
    handle.stopped().await;

    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on Unix.
fn shutdown_signal() -> Result<impl std::future::Future<Output = std::io::Result<()>>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result,
                _ = terminate.recv() => Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await
        }
    })
}
