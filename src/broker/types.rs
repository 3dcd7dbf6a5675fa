//! Broker types for device sessions and command dispatch

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::protocol::Outbound;

/// Approval status gating command dispatch to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Seen but not yet approved by an operator
    #[default]
    Pending,

    /// Approved for command dispatch
    Approved,

    /// Rejected; commands are refused
    Rejected,
}

impl ApprovalStatus {
    /// Parse from string representation
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Device platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Android => write!(f, "android"),
            Self::Ios => write!(f, "ios"),
        }
    }
}

/// Device identity as declared in an auth frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub device_id: String,
    pub device_name: String,
    pub model: String,
    pub manufacturer: String,
    pub platform: Platform,
    pub os_version: String,
    pub app_version: String,
}

/// Outcome of a command relayed to a device
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// A live device connection
///
/// Owned by the session registry. Dropping a session drops its pending
/// command senders, which wakes every in-flight `send_command` with a
/// disconnect error.
#[derive(Debug)]
pub struct Session {
    /// Unique per-connection ID; distinguishes a superseded connection
    /// from its replacement under the same device ID
    pub session_id: String,

    /// Identity from the most recent auth frame on this connection
    pub profile: DeviceProfile,

    /// Approval status at auth time, updated live on approve/reject
    pub status: ApprovalStatus,

    /// Outbound frame queue for this connection's writer task
    pub outbound: mpsc::Sender<Outbound>,

    /// When the connection authenticated
    pub connected_at: DateTime<Utc>,

    /// Last heartbeat arrival, checked by the per-session watchdog
    pub last_heartbeat: Instant,

    /// In-flight commands keyed by correlation ID
    pub(crate) pending: HashMap<String, oneshot::Sender<CommandReply>>,
}

impl Session {
    /// Create a session for a freshly authenticated connection
    #[must_use]
    pub fn new(profile: DeviceProfile, status: ApprovalStatus, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            profile,
            status,
            outbound,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
            pending: HashMap::new(),
        }
    }

    /// Serializable view of this session
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            device_id: self.profile.device_id.clone(),
            device_name: self.profile.device_name.clone(),
            platform: self.profile.platform,
            status: self.status,
            connected_at: self.connected_at,
        }
    }
}

/// Serializable view of a connected session (for the control API)
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: Platform,
    pub status: ApprovalStatus,
    pub connected_at: DateTime<Utc>,
}
