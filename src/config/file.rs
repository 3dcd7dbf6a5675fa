//! TOML configuration file loading
//!
//! Supports `~/.config/omni/muster/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MusterConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Broker timing configuration
    #[serde(default)]
    pub broker: BrokerFileConfig,

    /// Event forwarding configuration
    #[serde(default)]
    pub events: EventsFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Listen port for the WebSocket/HTTP server
    pub port: Option<u16>,

    /// API key for the control endpoints
    pub api_key: Option<String>,

    /// Data directory override
    pub data_dir: Option<String>,
}

/// Broker timing configuration (all durations in milliseconds)
#[derive(Debug, Default, Deserialize)]
pub struct BrokerFileConfig {
    /// Default deadline for `send_command` callers
    pub command_timeout_ms: Option<u64>,

    /// How often each session's liveness is checked
    pub heartbeat_interval_ms: Option<u64>,

    /// Silence threshold before a session is force-closed
    pub heartbeat_timeout_ms: Option<u64>,

    /// Grace period for the first auth frame on a new socket
    pub auth_grace_ms: Option<u64>,
}

/// Event forwarding configuration
#[derive(Debug, Default, Deserialize)]
pub struct EventsFileConfig {
    /// Webhook URL to POST device events to
    pub webhook_url: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `MusterConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> MusterConfigFile {
    let Some(path) = config_file_path() else {
        return MusterConfigFile::default();
    };

    if !path.exists() {
        return MusterConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                MusterConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            MusterConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/muster/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("muster")
            .join("config.toml")
    })
}
