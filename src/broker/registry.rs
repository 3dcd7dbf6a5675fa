//! Session registry for tracking connected devices
//!
//! Keyed by device ID, one session per device. A new connection for an
//! already-connected device ID displaces the old session; callers are
//! responsible for closing the displaced connection. Removal and heartbeat
//! updates are guarded by session ID so a stale connection's teardown can
//! never evict its replacement.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::protocol::Outbound;
use super::types::{ApprovalStatus, CommandReply, DeviceProfile, Session, SessionInfo};

/// Registry of live device sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Register a session, returning the displaced session if the device
    /// was already connected
    ///
    /// Dropping the displaced session fails all of its in-flight commands.
    pub fn register(&mut self, session: Session) -> Option<Session> {
        self.sessions
            .insert(session.profile.device_id.clone(), session)
    }

    /// Remove a session, but only if the session ID still matches
    ///
    /// Returns None when the device is offline or the entry now belongs to
    /// a newer connection.
    pub fn remove(&mut self, device_id: &str, session_id: &str) -> Option<Session> {
        match self.sessions.get(device_id) {
            Some(s) if s.session_id == session_id => self.sessions.remove(device_id),
            _ => None,
        }
    }

    /// Get a session by device ID
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<&Session> {
        self.sessions.get(device_id)
    }

    /// Whether a device currently has a live session
    #[must_use]
    pub fn is_online(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    /// List all connected sessions
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(Session::info).collect()
    }

    /// Update the profile of a live session in place (re-auth on the same
    /// connection), guarded by session ID
    ///
    /// Returns true if the session was found and updated.
    pub fn refresh_profile(
        &mut self,
        device_id: &str,
        session_id: &str,
        profile: DeviceProfile,
    ) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(s) if s.session_id == session_id => {
                s.profile = profile;
                true
            }
            _ => false,
        }
    }

    /// Update the approval status of a live session, returning its outbound
    /// sender so the caller can push the verdict after releasing the lock
    pub fn update_status(
        &mut self,
        device_id: &str,
        status: ApprovalStatus,
    ) -> Option<mpsc::Sender<Outbound>> {
        let session = self.sessions.get_mut(device_id)?;
        session.status = status;
        Some(session.outbound.clone())
    }

    /// Record a heartbeat arrival, guarded by session ID
    ///
    /// Returns true if the session was found and touched.
    pub fn touch_heartbeat(&mut self, device_id: &str, session_id: &str) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(s) if s.session_id == session_id => {
                s.last_heartbeat = std::time::Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Time since the last heartbeat on the given session
    ///
    /// Returns None when the session is gone or the entry belongs to a newer
    /// connection, which tells the caller's watchdog to stop.
    #[must_use]
    pub fn heartbeat_elapsed(&self, device_id: &str, session_id: &str) -> Option<Duration> {
        self.sessions
            .get(device_id)
            .filter(|s| s.session_id == session_id)
            .map(|s| s.last_heartbeat.elapsed())
    }

    /// Register a pending command on a connected device
    ///
    /// Returns `(correlation_id, receiver, outbound sender)` so the caller
    /// can release the lock before writing and waiting. Returns None when
    /// the device is offline.
    pub fn prepare_command(
        &mut self,
        device_id: &str,
    ) -> Option<(String, oneshot::Receiver<CommandReply>, mpsc::Sender<Outbound>)> {
        let session = self.sessions.get_mut(device_id)?;

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        session.pending.insert(correlation_id.clone(), tx);

        Some((correlation_id, rx, session.outbound.clone()))
    }

    /// Resolve a pending command with a reply from the device
    ///
    /// Only resolves within the session the response arrived on: a response
    /// relayed over a different (e.g., superseded) connection is ignored.
    /// Returns true if the correlation ID was found and the waiter was woken.
    pub fn resolve_pending(
        &mut self,
        device_id: &str,
        session_id: &str,
        correlation_id: &str,
        reply: CommandReply,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(device_id) else {
            return false;
        };
        if session.session_id != session_id {
            return false;
        }

        if let Some(tx) = session.pending.remove(correlation_id) {
            tx.send(reply).is_ok()
        } else {
            false
        }
    }

    /// Withdraw a pending command, e.g. on timeout or failed delivery
    ///
    /// Returns the sender if the command was still pending. None means a
    /// response already claimed it or the session is gone.
    pub fn take_pending(
        &mut self,
        device_id: &str,
        correlation_id: &str,
    ) -> Option<oneshot::Sender<CommandReply>> {
        self.sessions
            .get_mut(device_id)?
            .pending
            .remove(correlation_id)
    }

    /// Number of connected devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no devices are connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
