//! chatcast configuration
//!
//! Configuration comes from:
//! 1. Environment variables (`CHATCAST_*`, plus `PORT` for hosted platforms)
//! 2. Command-line flags, which override the environment

use std::net::SocketAddr;
use std::time::Duration;

/// Default listen port
const DEFAULT_PORT: u16 = 3000;

/// Default heartbeat interval in seconds
const DEFAULT_PING_INTERVAL: u64 = 25;

/// Default per-connection outbound queue bound
const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Default pub/sub stream carrying persisted messages
pub const DEFAULT_DELIVERY_STREAM: &str = "new_message";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub bind: SocketAddr,
    /// Origins allowed to make cross-origin requests
    pub allowed_origins: Vec<String>,
    /// Heartbeat interval in seconds (0 disables)
    pub ping_interval: u64,
    /// Bound of each connection's outbound queue
    pub outbound_capacity: usize,
    /// Secret for signed identity tokens; unsigned handshakes when absent
    pub handshake_secret: Option<String>,
    /// Bearer token for the internal deliver endpoint; open when absent
    pub deliver_token: Option<String>,
    /// PostgreSQL connection string (postgres pub/sub backend)
    pub database_url: Option<String>,
    /// Pub/sub stream carrying persisted messages
    pub delivery_stream: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            allowed_origins: Vec::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            handshake_secret: None,
            deliver_token: None,
            database_url: None,
            delivery_stream: DEFAULT_DELIVERY_STREAM.to_string(),
        }
    }
}

impl Config {
    /// Create config from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(bind) = lookup("CHATCAST_BIND") {
            config.bind = bind
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("CHATCAST_BIND", "expected host:port"))?;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("PORT", "expected u16"))?;
            config.bind.set_port(port);
        }

        if let Some(origins) = lookup("CHATCAST_ALLOWED_ORIGINS") {
            config.allowed_origins = parse_list(&origins);
        }

        if let Some(interval) = lookup("CHATCAST_PING_INTERVAL") {
            config.ping_interval = interval
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("CHATCAST_PING_INTERVAL", "expected u64"))?;
        }

        if let Some(capacity) = lookup("CHATCAST_OUTBOUND_CAPACITY") {
            let capacity: usize = capacity.parse().map_err(|_| {
                ConfigError::InvalidEnv("CHATCAST_OUTBOUND_CAPACITY", "expected usize")
            })?;
            if capacity == 0 {
                return Err(ConfigError::InvalidEnv(
                    "CHATCAST_OUTBOUND_CAPACITY",
                    "must be greater than zero",
                ));
            }
            config.outbound_capacity = capacity;
        }

        config.handshake_secret = lookup("CHATCAST_HANDSHAKE_SECRET").filter(|s| !s.is_empty());
        config.deliver_token = lookup("CHATCAST_DELIVER_TOKEN").filter(|s| !s.is_empty());
        config.database_url = lookup("CHATCAST_DATABASE_URL").filter(|s| !s.is_empty());

        if let Some(stream) = lookup("CHATCAST_DELIVERY_STREAM")
            && !stream.trim().is_empty()
        {
            config.delivery_stream = stream.trim().to_string();
        }

        Ok(config)
    }

    /// Heartbeat period, if enabled
    pub fn ping_period(&self) -> Option<Duration> {
        (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
