//! Centralized configuration for NetSQLite.
//!
//! Protocol limits, discovery defaults and the client-side runtime
//! configuration (`ClientConfig`) live here.

use crate::error::{NetSqliteError, Result};
use crate::process::{ProcessLauncher, ServerLauncher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Wire protocol limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest frame payload accepted by either side.
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Port slot defaults used when no explicit candidate list is given.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    pub const BASE_PORT: u16 = 25432;
    pub const SLOT_COUNT: u16 = 10;

    pub const BASE_PORT_ENV: &'static str = "NETSQLITE_BASE_PORT";
    pub const SLOT_COUNT_ENV: &'static str = "NETSQLITE_SLOT_COUNT";
    pub const SERVER_BIN_ENV: &'static str = "NETSQLITE_SERVER_BIN";
}

/// Server process defaults.
pub struct ServerDefaults;

impl ServerDefaults {
    pub const MAX_CONNECTIONS: usize = 256;
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
    /// Grace period between SIGTERM and SIGKILL when stopping a spawned server.
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);
    /// Environment variable carrying the shared secret into a spawned server.
    pub const AUTH_TOKEN_ENV: &'static str = "NETSQLITE_AUTH_TOKEN";
}

/// Exponential backoff used while waiting for a spawned server to come up.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every attempt.
    pub growth_factor: f64,
    /// Cap on the delay between two attempts.
    pub max_delay: Duration,
    /// Wall-clock budget for the whole wait.
    pub timeout: Duration,
}

impl BackoffConfig {
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay to sleep after the given (0-indexed) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.growth_factor.max(1.0).powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            growth_factor: Self::DEFAULT_GROWTH_FACTOR,
            max_delay: Self::DEFAULT_MAX_DELAY,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Client-side runtime configuration.
///
/// The candidate list is the rendezvous mechanism: every client targeting the
/// same database must see the same list in the same order for them to
/// converge on one server.
#[derive(Clone)]
pub struct ClientConfig {
    /// Addresses tried, in order, when looking for or starting a server.
    pub candidates: Vec<SocketAddr>,
    /// Polling schedule after a spawn.
    pub backoff: BackoffConfig,
    /// Ping the server before every `execute`.
    pub check_liveness: bool,
    /// How new servers are started.
    pub launcher: Arc<dyn ServerLauncher>,
}

impl ClientConfig {
    /// Default configuration: the well-known port range and the server binary.
    pub fn new() -> Self {
        Self {
            candidates: port_range(
                DiscoveryConfig::HOST,
                DiscoveryConfig::BASE_PORT,
                DiscoveryConfig::SLOT_COUNT,
            ),
            backoff: BackoffConfig::default(),
            check_liveness: true,
            launcher: Arc::new(ProcessLauncher::locate()),
        }
    }

    /// Default configuration with environment overrides applied.
    ///
    /// Reads `NETSQLITE_BASE_PORT`, `NETSQLITE_SLOT_COUNT` and
    /// `NETSQLITE_SERVER_BIN`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        let base = env_u16(DiscoveryConfig::BASE_PORT_ENV)?.unwrap_or(DiscoveryConfig::BASE_PORT);
        let count =
            env_u16(DiscoveryConfig::SLOT_COUNT_ENV)?.unwrap_or(DiscoveryConfig::SLOT_COUNT);
        config = config.with_port_range(DiscoveryConfig::HOST, base, count)?;

        if let Ok(bin) = std::env::var(DiscoveryConfig::SERVER_BIN_ENV) {
            if !bin.is_empty() {
                config.launcher = Arc::new(ProcessLauncher::new(bin));
            }
        }

        Ok(config)
    }

    /// Replace the candidate list with an explicit one.
    pub fn with_candidates(mut self, candidates: Vec<SocketAddr>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Replace the candidate list with `count` consecutive ports from `base`.
    pub fn with_port_range(mut self, host: IpAddr, base: u16, count: u16) -> Result<Self> {
        if count == 0 {
            return Err(NetSqliteError::Config {
                message: "port slot count must be at least 1".to_string(),
            });
        }
        if base.checked_add(count - 1).is_none() {
            return Err(NetSqliteError::Config {
                message: format!("port range {}+{} exceeds 65535", base, count),
            });
        }
        self.candidates = port_range(host, base, count);
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_liveness_check(mut self, enabled: bool) -> Self {
        self.check_liveness = enabled;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("candidates", &self.candidates)
            .field("backoff", &self.backoff)
            .field("check_liveness", &self.check_liveness)
            .field("launcher", &self.launcher.describe())
            .finish()
    }
}

fn port_range(host: IpAddr, base: u16, count: u16) -> Vec<SocketAddr> {
    (0..count)
        .filter_map(|offset| base.checked_add(offset))
        .map(|port| SocketAddr::new(host, port))
        .collect()
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|e| NetSqliteError::Config {
                message: format!("{} must be a port number, got '{}': {}", name, raw, e),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let backoff = BackoffConfig::default();

        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(150));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(225));
        // 0.1 * 1.5^20 is far above the cap
        assert_eq!(backoff.delay_for(20), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_builder() {
        let backoff = BackoffConfig::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_growth_factor(2.0)
            .with_max_delay(Duration::from_millis(35))
            .with_timeout(Duration::from_secs(1));

        assert_eq!(backoff.delay_for(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(35));
        assert_eq!(backoff.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_default_candidates_are_the_well_known_slots() {
        let config = ClientConfig::new();

        assert_eq!(config.candidates.len(), DiscoveryConfig::SLOT_COUNT as usize);
        assert_eq!(config.candidates[0].port(), DiscoveryConfig::BASE_PORT);
        assert_eq!(config.candidates[9].port(), DiscoveryConfig::BASE_PORT + 9);
        assert!(config.candidates.iter().all(|addr| addr.ip().is_loopback()));
    }

    #[test]
    fn test_port_range_validation() {
        let host = DiscoveryConfig::HOST;
        assert!(ClientConfig::new().with_port_range(host, 40000, 0).is_err());
        assert!(ClientConfig::new().with_port_range(host, 65530, 10).is_err());

        let config = ClientConfig::new().with_port_range(host, 65530, 6).unwrap();
        assert_eq!(config.candidates.last().unwrap().port(), 65535);
    }
}
