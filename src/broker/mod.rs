//! Device connection broker
//!
//! Sits between the control API and the WebSocket handlers: tracks which
//! devices are online, relays commands and correlates their responses,
//! applies approval decisions, and hands device events to the forwarder.
//!
//! All session state lives behind a single async mutex. The lock is held
//! only for map operations; frame delivery and response waits always happen
//! after it is released.

pub mod protocol;
pub mod registry;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::config::BrokerConfig;
use crate::db::DeviceRepo;
use crate::events::{DeviceEvent, EventForwarder};
use crate::{Error, Result};

pub use protocol::{
    BrokerFrame, CLOSE_AUTH_TIMEOUT, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_REJECTED, CLOSE_SUPERSEDED,
    DeviceFrame, Outbound, epoch_millis,
};
pub use registry::SessionRegistry;
pub use types::{ApprovalStatus, CommandReply, DeviceProfile, Platform, Session, SessionInfo};

/// Shared session registry state
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// Command action used for the post-approval extended info fetch
const EXTENDED_INFO_ACTION: &str = "get_device_info";

/// Delay before fetching extended info from a freshly approved session
const EXTENDED_INFO_DELAY: Duration = Duration::from_secs(2);

/// The device connection broker
#[derive(Clone)]
pub struct Broker {
    registry: SharedRegistry,
    devices: DeviceRepo,
    forwarder: Arc<dyn EventForwarder>,
    config: BrokerConfig,
}

impl Broker {
    /// Create a broker over the given device store and event forwarder
    #[must_use]
    pub fn new(devices: DeviceRepo, forwarder: Arc<dyn EventForwarder>, config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(SessionRegistry::new())),
            devices,
            forwarder,
            config,
        }
    }

    /// Broker timing configuration
    #[must_use]
    pub const fn config(&self) -> BrokerConfig {
        self.config
    }

    /// Device repository backing this broker
    #[must_use]
    pub const fn devices(&self) -> &DeviceRepo {
        &self.devices
    }

    /// Admit an authenticated connection
    ///
    /// Upserts the device profile (approval status is never changed here),
    /// registers the session as the device's live connection, and closes any
    /// previous connection for the same device ID with a superseded code.
    /// Returns the new session ID and the device's current approval status.
    ///
    /// # Errors
    ///
    /// Returns error if the device store rejects the upsert
    pub async fn authenticate(
        &self,
        profile: DeviceProfile,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<(String, ApprovalStatus)> {
        let record = self.devices.upsert(&profile)?;

        let session = Session::new(profile, record.status, outbound);
        let session_id = session.session_id.clone();
        let device_id = session.profile.device_id.clone();

        let displaced = {
            let mut reg = self.registry.lock().await;
            reg.register(session)
        };

        if let Some(old) = displaced {
            tracing::info!(
                device_id = %device_id,
                old_session = %old.session_id,
                "device reconnected, closing superseded session"
            );
            let _ = old
                .outbound
                .send(Outbound::Close {
                    code: CLOSE_SUPERSEDED,
                    reason: "superseded by newer connection",
                })
                .await;
            // Dropping the old session fails its in-flight commands
        }

        tracing::info!(
            device_id = %device_id,
            session_id = %session_id,
            status = %record.status,
            "device authenticated"
        );

        Ok((session_id, record.status))
    }

    /// Apply a repeat auth frame on an established connection
    ///
    /// Updates the stored and live profiles in place; approval status is
    /// untouched. The session keeps its ID and heartbeat watchdog.
    ///
    /// # Errors
    ///
    /// Returns error if the device store rejects the upsert
    pub async fn reauthenticate(
        &self,
        device_id: &str,
        session_id: &str,
        profile: DeviceProfile,
    ) -> Result<ApprovalStatus> {
        let record = self.devices.upsert(&profile)?;

        let mut reg = self.registry.lock().await;
        if !reg.refresh_profile(device_id, session_id, profile) {
            tracing::warn!(device_id, "re-auth for a session no longer registered");
        }

        Ok(record.status)
    }

    /// Tear down a session when its connection ends
    ///
    /// Guarded by session ID: a superseded connection's teardown never
    /// removes its replacement. Dropping the session fails all of its
    /// pending commands.
    pub async fn disconnect(&self, device_id: &str, session_id: &str) {
        let removed = {
            let mut reg = self.registry.lock().await;
            reg.remove(device_id, session_id)
        };

        if let Some(session) = removed {
            let pending = session.pending.len();
            if pending > 0 {
                tracing::info!(device_id, pending, "failing in-flight commands on disconnect");
            }
            if let Err(e) = self.devices.touch_last_seen(device_id) {
                tracing::warn!(device_id, error = %e, "could not update last seen");
            }
            tracing::info!(device_id, session_id, "device disconnected");
        }
    }

    /// Record a heartbeat for a session
    ///
    /// Returns true if the session is still the device's live connection;
    /// the caller acks only in that case.
    pub async fn heartbeat(&self, device_id: &str, session_id: &str) -> bool {
        let mut reg = self.registry.lock().await;
        reg.touch_heartbeat(device_id, session_id)
    }

    /// Whether a session has gone longer than the heartbeat timeout without
    /// a heartbeat
    ///
    /// Returns None when the session is gone or superseded, which tells the
    /// watchdog to stop.
    pub async fn heartbeat_overdue(&self, device_id: &str, session_id: &str) -> Option<bool> {
        let reg = self.registry.lock().await;
        reg.heartbeat_elapsed(device_id, session_id)
            .map(|elapsed| elapsed > Duration::from_millis(self.config.heartbeat_timeout_ms))
    }

    /// Resolve a command response received on a session
    ///
    /// Returns false for unmatched correlation IDs and for responses arriving
    /// on a connection that no longer owns the pending entry; callers log
    /// and drop those.
    pub async fn handle_response(
        &self,
        device_id: &str,
        session_id: &str,
        correlation_id: &str,
        reply: CommandReply,
    ) -> bool {
        let mut reg = self.registry.lock().await;
        reg.resolve_pending(device_id, session_id, correlation_id, reply)
    }

    /// Dispatch a command to a device and wait for its response
    ///
    /// Fails fast when the device is offline or not approved. The pending
    /// entry is registered before the frame is handed to the writer, so a
    /// response can never arrive unmatched; delivery failure withdraws it
    /// again. On timeout, whichever side removes the pending entry first
    /// decides the outcome, so a response racing the deadline is returned
    /// rather than dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceOffline`], [`Error::DeviceNotApproved`],
    /// [`Error::CommandDelivery`], [`Error::CommandTimeout`],
    /// [`Error::CommandFailed`], or [`Error::DeviceDisconnected`]
    pub async fn send_command(
        &self,
        device_id: &str,
        action: &str,
        params: Option<serde_json::Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Option<serde_json::Value>> {
        let (correlation_id, mut rx, outbound) = {
            let mut reg = self.registry.lock().await;
            let Some(session) = reg.get(device_id) else {
                return Err(Error::DeviceOffline(device_id.to_string()));
            };
            if session.status != ApprovalStatus::Approved {
                return Err(Error::DeviceNotApproved(device_id.to_string()));
            }
            reg.prepare_command(device_id)
                .ok_or_else(|| Error::DeviceOffline(device_id.to_string()))?
        };

        let frame = BrokerFrame::Command {
            id: correlation_id.clone(),
            action: action.to_string(),
            params,
        };

        tracing::debug!(device_id, action, correlation_id = %correlation_id, "dispatching command");

        if outbound.send(Outbound::Frame(frame)).await.is_err() {
            let mut reg = self.registry.lock().await;
            reg.take_pending(device_id, &correlation_id);
            return Err(Error::CommandDelivery(device_id.to_string()));
        }

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(self.config.command_timeout_ms));
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply_to_result(reply),
            Ok(Err(_)) => Err(Error::DeviceDisconnected),
            Err(_) => {
                let withdrawn = {
                    let mut reg = self.registry.lock().await;
                    reg.take_pending(device_id, &correlation_id).is_some()
                };
                if withdrawn {
                    tracing::warn!(device_id, action, "command timed out");
                    return Err(Error::CommandTimeout(action.to_string()));
                }
                // The entry is gone: a response beat the deadline to the
                // registry, or the session tore down
                match rx.try_recv() {
                    Ok(reply) => reply_to_result(reply),
                    Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                        Err(Error::DeviceDisconnected)
                    }
                    Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {
                        Err(Error::CommandTimeout(action.to_string()))
                    }
                }
            }
        }
    }

    /// Approve a device for command dispatch
    ///
    /// Persists the status and pushes the fresh verdict to the device's live
    /// session when there is one. Returns false for unknown device IDs.
    ///
    /// # Errors
    ///
    /// Returns error if the device store rejects the update
    pub async fn approve_device(&self, device_id: &str) -> Result<bool> {
        if !self.devices.set_status(device_id, ApprovalStatus::Approved)? {
            return Ok(false);
        }

        let outbound = {
            let mut reg = self.registry.lock().await;
            reg.update_status(device_id, ApprovalStatus::Approved)
        };

        if let Some(tx) = outbound {
            let frame = BrokerFrame::AuthResult {
                success: true,
                status: ApprovalStatus::Approved,
                message: None,
            };
            if tx.send(Outbound::Frame(frame)).await.is_err() {
                tracing::warn!(device_id, "could not push approval to live session");
            }
        }

        Ok(true)
    }

    /// Reject a device
    ///
    /// Persists the status, pushes the verdict to the device's live session,
    /// and closes the connection with the rejected code. Returns false for
    /// unknown device IDs.
    ///
    /// # Errors
    ///
    /// Returns error if the device store rejects the update
    pub async fn reject_device(&self, device_id: &str) -> Result<bool> {
        if !self.devices.set_status(device_id, ApprovalStatus::Rejected)? {
            return Ok(false);
        }

        let outbound = {
            let mut reg = self.registry.lock().await;
            reg.update_status(device_id, ApprovalStatus::Rejected)
        };

        if let Some(tx) = outbound {
            let frame = BrokerFrame::AuthResult {
                success: false,
                status: ApprovalStatus::Rejected,
                message: Some("device rejected".to_string()),
            };
            let _ = tx.send(Outbound::Frame(frame)).await;
            let _ = tx
                .send(Outbound::Close {
                    code: CLOSE_REJECTED,
                    reason: "device rejected",
                })
                .await;
        }

        Ok(true)
    }

    /// Whether a device currently has a live session
    pub async fn is_device_online(&self, device_id: &str) -> bool {
        let reg = self.registry.lock().await;
        reg.is_online(device_id)
    }

    /// Snapshot of all connected sessions
    pub async fn connected_devices(&self) -> Vec<SessionInfo> {
        let reg = self.registry.lock().await;
        reg.list()
    }

    /// Fetch extended device info over the live session and cache it
    ///
    /// # Errors
    ///
    /// Returns error if the command fails or the cache write fails
    pub async fn fetch_and_cache_extended_info(
        &self,
        device_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let info = self
            .send_command(device_id, EXTENDED_INFO_ACTION, None, None)
            .await?;

        if let Some(ref data) = info {
            self.devices.set_extended_info(device_id, data)?;
        }

        Ok(info)
    }

    /// Schedule the post-approval extended info fetch (fire-and-forget)
    ///
    /// Delayed so the device finishes its own connection setup first.
    /// Failures are logged and swallowed.
    pub fn spawn_extended_info_fetch(&self, device_id: &str) {
        let broker = self.clone();
        let device_id = device_id.to_string();
        drop(tokio::spawn(async move {
            tokio::time::sleep(EXTENDED_INFO_DELAY).await;
            match broker.fetch_and_cache_extended_info(&device_id).await {
                Ok(Some(_)) => tracing::debug!(device_id = %device_id, "extended info cached"),
                Ok(None) => {
                    tracing::debug!(device_id = %device_id, "device returned no extended info");
                }
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "extended info fetch failed");
                }
            }
        }));
    }

    /// Forward a device event to the configured sink (fire-and-forget)
    pub async fn forward_event(
        &self,
        device_id: &str,
        session_id: &str,
        event_type: String,
        data: serde_json::Value,
        timestamp: i64,
    ) {
        let profile = {
            let reg = self.registry.lock().await;
            reg.get(device_id)
                .filter(|s| s.session_id == session_id)
                .map(|s| s.profile.clone())
        };

        let Some(profile) = profile else {
            tracing::warn!(device_id, "event from unregistered session dropped");
            return;
        };

        let event = DeviceEvent {
            device_id: device_id.to_string(),
            manufacturer: profile.manufacturer,
            model: profile.model,
            os_version: profile.os_version,
            event_type,
            data,
            timestamp,
        };

        crate::events::dispatch(Arc::clone(&self.forwarder), event);
    }
}

/// Map a device's reply onto the command result
fn reply_to_result(reply: CommandReply) -> Result<Option<serde_json::Value>> {
    if reply.success {
        Ok(reply.data)
    } else {
        Err(Error::CommandFailed(
            reply
                .error
                .unwrap_or_else(|| "device reported failure".to_string()),
        ))
    }
}
