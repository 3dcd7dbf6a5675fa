//! Wire protocol frames for the device WebSocket
//!
//! Frames are JSON objects carrying a snake_case `type` tag with the payload
//! fields inlined alongside it. Payload keys are camelCase to match the
//! mobile clients. Decoding is strict: an unknown tag or a malformed payload
//! is an error, and the caller decides whether that is fatal.

use serde::{Deserialize, Serialize};

use super::types::{ApprovalStatus, DeviceProfile};

/// Close code when the auth grace period expires without a valid auth frame
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;

/// Close code when heartbeats stop for longer than the configured timeout
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4002;

/// Close code when an operator rejects the device
pub const CLOSE_REJECTED: u16 = 4003;

/// Close code when a newer connection for the same device ID takes over
pub const CLOSE_SUPERSEDED: u16 = 4004;

/// Incoming frame from a device
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceFrame {
    /// Identify this connection; first frame on every connection
    Auth(DeviceProfile),

    /// Response to a previously dispatched command
    CommandResponse {
        id: String,
        success: bool,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },

    /// Device-initiated event (battery, screen state, etc.)
    Event {
        #[serde(rename = "eventType")]
        event_type: String,
        #[serde(default)]
        data: serde_json::Value,
        timestamp: i64,
    },

    /// Keep-alive ping
    Heartbeat { timestamp: i64 },
}

/// Outgoing frame to a device
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Verdict on an auth frame
    AuthResult {
        success: bool,
        status: ApprovalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Command dispatched to the device
    Command {
        id: String,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Acknowledgement of a heartbeat, carrying the gateway's current time
    HeartbeatAck { timestamp: i64 },
}

/// Unit of work for a connection's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialize and send a frame
    Frame(BrokerFrame),

    /// Send a close frame with the given code, then stop writing
    Close { code: u16, reason: &'static str },
}

/// Current time as epoch milliseconds, the wire timestamp unit
#[must_use]
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
