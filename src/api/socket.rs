//! WebSocket endpoint for device connections
//!
//! Devices connect here, authenticate in-band with an `auth` frame, and
//! then exchange command, event, and heartbeat frames for the lifetime
//! of the connection. Each socket gets a writer task fed by an mpsc
//! channel, a reader task, and a heartbeat watchdog.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ApiState;
use crate::broker::{
    ApprovalStatus, Broker, BrokerFrame, CLOSE_AUTH_TIMEOUT, CLOSE_HEARTBEAT_TIMEOUT, CommandReply,
    DeviceFrame, DeviceProfile, Outbound, epoch_millis,
};

/// Outbound channel depth per device connection
const OUTBOUND_BUFFER: usize = 32;

/// Build the WebSocket routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/device", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state))
}

/// Drive one device connection from upgrade to teardown
async fn handle_device_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();

    let Some(profile) = await_auth(&mut sender, &mut receiver, &state).await else {
        return;
    };
    let device_id = profile.device_id.clone();

    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let (session_id, status) = match state.broker.authenticate(profile, tx.clone()).await {
        Ok(admitted) => admitted,
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "authentication failed");
            return;
        }
    };

    let mut send_task = spawn_writer(sender, rx);

    let verdict = BrokerFrame::AuthResult {
        success: status == ApprovalStatus::Approved,
        status,
        message: auth_message(status),
    };
    if tx.send(Outbound::Frame(verdict)).await.is_err() {
        state.broker.disconnect(&device_id, &session_id).await;
        return;
    }

    if status == ApprovalStatus::Approved {
        state.broker.spawn_extended_info_fetch(&device_id);
    }

    let watchdog = spawn_watchdog(
        state.broker.clone(),
        device_id.clone(),
        session_id.clone(),
        tx.clone(),
    );

    let recv_broker = state.broker.clone();
    let recv_device = device_id.clone();
    let recv_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<DeviceFrame>(&text) {
                    Ok(frame) => {
                        handle_frame(&recv_broker, &recv_device, &recv_session, &tx, frame).await;
                    }
                    Err(e) => {
                        tracing::warn!(device_id = %recv_device, error = %e, "unrecognized frame dropped");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    watchdog.abort();

    state.broker.disconnect(&device_id, &session_id).await;
}

/// Wait for a valid `auth` frame within the configured grace period
///
/// Frames arriving before authentication are logged and dropped. Returns
/// None when the grace period elapses or the socket closes first.
async fn await_auth(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    state: &ApiState,
) -> Option<DeviceProfile> {
    let grace = Duration::from_millis(state.broker.config().auth_grace_ms);
    let deadline = tokio::time::Instant::now() + grace;

    loop {
        let Ok(next) = tokio::time::timeout_at(deadline, receiver.next()).await else {
            tracing::warn!("connection closed, no authentication within grace period");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_AUTH_TIMEOUT,
                    reason: "authentication timeout".into(),
                })))
                .await;
            return None;
        };

        match next {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<DeviceFrame>(&text) {
                Ok(DeviceFrame::Auth(profile)) => return Some(profile),
                Ok(_) => tracing::warn!("frame before authentication dropped"),
                Err(e) => tracing::warn!(error = %e, "unrecognized frame dropped"),
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(error = %e, "socket error before authentication");
                return None;
            }
        }
    }
}

/// Pump broker-side messages out to the socket
///
/// A close instruction sends the close frame and ends the task, which
/// tears the connection down via the select in the socket handler.
fn spawn_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize outbound frame"),
                },
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    })
}

/// Periodically check the session's heartbeat and close it when overdue
fn spawn_watchdog(
    broker: Broker,
    device_id: String,
    session_id: String,
    outbound: mpsc::Sender<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(broker.config().heartbeat_interval_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match broker.heartbeat_overdue(&device_id, &session_id).await {
                // Session gone or superseded, nothing left to watch
                None => break,
                Some(false) => {}
                Some(true) => {
                    tracing::warn!(device_id = %device_id, "heartbeat timeout, closing connection");
                    let _ = outbound
                        .send(Outbound::Close {
                            code: CLOSE_HEARTBEAT_TIMEOUT,
                            reason: "heartbeat timeout",
                        })
                        .await;
                    break;
                }
            }
        }
    })
}

/// Dispatch one decoded frame from an authenticated device
async fn handle_frame(
    broker: &Broker,
    device_id: &str,
    session_id: &str,
    outbound: &mpsc::Sender<Outbound>,
    frame: DeviceFrame,
) {
    match frame {
        DeviceFrame::Auth(profile) => {
            if profile.device_id != device_id {
                tracing::warn!(
                    device_id = %device_id,
                    claimed = %profile.device_id,
                    "re-auth with different device id dropped"
                );
                return;
            }
            match broker.reauthenticate(device_id, session_id, profile).await {
                Ok(status) => {
                    let verdict = BrokerFrame::AuthResult {
                        success: status == ApprovalStatus::Approved,
                        status,
                        message: auth_message(status),
                    };
                    let _ = outbound.send(Outbound::Frame(verdict)).await;
                }
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "re-authentication failed");
                }
            }
        }
        DeviceFrame::CommandResponse {
            id,
            success,
            data,
            error,
        } => {
            let reply = CommandReply {
                success,
                data,
                error,
            };
            if !broker
                .handle_response(device_id, session_id, &id, reply)
                .await
            {
                tracing::warn!(
                    device_id = %device_id,
                    correlation_id = %id,
                    "no pending command for response"
                );
            }
        }
        DeviceFrame::Event {
            event_type,
            data,
            timestamp,
        } => {
            broker
                .forward_event(device_id, session_id, event_type, data, timestamp)
                .await;
        }
        DeviceFrame::Heartbeat { .. } => {
            if broker.heartbeat(device_id, session_id).await {
                let ack = BrokerFrame::HeartbeatAck {
                    timestamp: epoch_millis(),
                };
                let _ = outbound.send(Outbound::Frame(ack)).await;
            } else {
                tracing::warn!(device_id = %device_id, "heartbeat for unregistered session");
            }
        }
    }
}

/// Human-readable companion to the auth verdict
fn auth_message(status: ApprovalStatus) -> Option<String> {
    match status {
        ApprovalStatus::Approved => None,
        ApprovalStatus::Pending => Some("awaiting approval".to_string()),
        ApprovalStatus::Rejected => Some("device rejected".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_matches_status() {
        assert!(auth_message(ApprovalStatus::Approved).is_none());
        assert_eq!(
            auth_message(ApprovalStatus::Pending).as_deref(),
            Some("awaiting approval")
        );
        assert_eq!(
            auth_message(ApprovalStatus::Rejected).as_deref(),
            Some("device rejected")
        );
    }
}
