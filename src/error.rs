//! Error types for the muster gateway

use thiserror::Error;

/// Result type alias for muster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the muster gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Device has no live session
    #[error("device '{0}' is not connected")]
    DeviceOffline(String),

    /// Device is connected but not approved for commands
    #[error("device '{0}' is not approved")]
    DeviceNotApproved(String),

    /// Command envelope could not be handed to the device socket
    #[error("failed to deliver command to device '{0}'")]
    CommandDelivery(String),

    /// No response arrived within the command deadline
    #[error("command '{0}' timed out")]
    CommandTimeout(String),

    /// Device answered the command with an explicit error
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Session tore down while the command was outstanding
    #[error("device disconnected")]
    DeviceDisconnected,

    /// Event hand-off to the forwarding sink failed
    #[error("event forward error: {0}")]
    Forward(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),
}
