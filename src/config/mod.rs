//! Configuration management for the muster gateway

pub mod file;

use std::path::PathBuf;

/// Default listen port for the WebSocket/HTTP server
pub const DEFAULT_PORT: u16 = 8820;

/// Default `send_command` deadline in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Default liveness check interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default silence threshold before force-close, in milliseconds
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 90_000;

/// Default grace period for the first auth frame, in milliseconds
pub const DEFAULT_AUTH_GRACE_MS: u64 = 10_000;

/// Muster gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the WebSocket/HTTP server listens on
    pub port: u16,

    /// Path to data directory (database lives here)
    pub data_dir: PathBuf,

    /// API key for the control endpoints (from `MUSTER_API_KEY` env)
    pub api_key: Option<String>,

    /// Broker timing knobs
    pub broker: BrokerConfig,

    /// Webhook URL for device event forwarding
    pub event_webhook_url: Option<String>,
}

/// Timing configuration consumed by the connection broker
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// Default deadline for `send_command` callers, in milliseconds
    pub command_timeout_ms: u64,

    /// How often each session's liveness is checked, in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Silence threshold before a session is force-closed, in milliseconds
    pub heartbeat_timeout_ms: u64,

    /// Grace period for the first auth frame on a new socket, in milliseconds
    pub auth_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            auth_grace_ms: DEFAULT_AUTH_GRACE_MS,
        }
    }
}

impl Config {
    /// Load configuration with precedence env > TOML file > default
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be created
    pub fn load() -> crate::Result<Self> {
        let fc = file::load_config_file();

        let port = env_parse("MUSTER_PORT")
            .or(fc.server.port)
            .unwrap_or(DEFAULT_PORT);

        let api_key = std::env::var("MUSTER_API_KEY").ok().or(fc.server.api_key);

        let broker = BrokerConfig {
            command_timeout_ms: env_parse("MUSTER_COMMAND_TIMEOUT_MS")
                .or(fc.broker.command_timeout_ms)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
            heartbeat_interval_ms: env_parse("MUSTER_HEARTBEAT_INTERVAL_MS")
                .or(fc.broker.heartbeat_interval_ms)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout_ms: env_parse("MUSTER_HEARTBEAT_TIMEOUT_MS")
                .or(fc.broker.heartbeat_timeout_ms)
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            auth_grace_ms: env_parse("MUSTER_AUTH_GRACE_MS")
                .or(fc.broker.auth_grace_ms)
                .unwrap_or(DEFAULT_AUTH_GRACE_MS),
        };

        let event_webhook_url = std::env::var("MUSTER_EVENT_WEBHOOK")
            .ok()
            .or(fc.events.webhook_url);

        // Data directory (~/.local/share/omni/muster on Linux)
        let data_dir = std::env::var("MUSTER_DATA_DIR")
            .ok()
            .or(fc.server.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        std::fs::create_dir_all(&data_dir)
            .map_err(|e| crate::Error::Config(format!("cannot create data dir: {e}")))?;

        Ok(Self {
            port,
            data_dir,
            api_key,
            broker,
            event_webhook_url,
        })
    }

    /// Path to the `SQLite` database file
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("muster.db")
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("omni").join("muster"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_defaults() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.command_timeout_ms, 30_000);
        assert_eq!(broker.heartbeat_interval_ms, 30_000);
        assert_eq!(broker.heartbeat_timeout_ms, 90_000);
        assert_eq!(broker.auth_grace_ms, 10_000);
    }

    #[test]
    fn heartbeat_timeout_exceeds_interval() {
        // A timeout shorter than the check interval would close every
        // session on its first tick.
        let broker = BrokerConfig::default();
        assert!(broker.heartbeat_timeout_ms > broker.heartbeat_interval_ms);
    }
}
