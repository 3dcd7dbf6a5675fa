//! Device management REST endpoints
//!
//! The dashboard-facing surface: device listing, approval decisions,
//! command dispatch, extended info, and the per-device event log.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::Error;
use crate::broker::{ApprovalStatus, SessionInfo};
use crate::db::{DeviceRecord, EventRecord};

/// REST view of a device record, with live session state merged in
#[derive(Serialize)]
pub struct DeviceResponse {
    pub id: String,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub platform: String,
    pub os_version: String,
    pub app_version: String,
    pub status: ApprovalStatus,
    pub online: bool,
    pub first_seen: String,
    pub last_seen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

impl DeviceResponse {
    fn new(record: DeviceRecord, session: Option<SessionInfo>) -> Self {
        Self {
            id: record.id,
            name: record.name,
            model: record.model,
            manufacturer: record.manufacturer,
            platform: record.platform,
            os_version: record.os_version,
            app_version: record.app_version,
            status: record.status,
            online: session.is_some(),
            first_seen: record.first_seen.to_rfc3339(),
            last_seen: record.last_seen.to_rfc3339(),
            extended_info: record.extended_info,
            session,
        }
    }
}

/// REST response after an approval decision
#[derive(Serialize)]
pub struct ApprovalResponse {
    pub id: String,
    pub status: ApprovalStatus,
    pub online: bool,
}

/// REST request for dispatching a command
#[derive(Deserialize)]
pub struct CommandBody {
    pub action: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// REST response for a command result
#[derive(Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Query parameters for the event log
#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

const fn default_events_limit() -> usize {
    50
}

/// Build device routes, guarded by the API key middleware
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_devices))
        .route("/{device_id}", get(get_device))
        .route("/{device_id}/approve", post(approve_device))
        .route("/{device_id}/reject", post(reject_device))
        .route("/{device_id}/command", post(dispatch_command))
        .route("/{device_id}/info", get(device_info))
        .route("/{device_id}/events", get(device_events))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            super::auth::require_api_key,
        ))
        .with_state(state)
}

/// List all known devices with live connection state
async fn list_devices(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<DeviceResponse>>, StatusCode> {
    let records = state.devices.list().map_err(internal_error)?;

    let mut sessions: HashMap<String, SessionInfo> = state
        .broker
        .connected_devices()
        .await
        .into_iter()
        .map(|s| (s.device_id.clone(), s))
        .collect();

    let devices = records
        .into_iter()
        .map(|r| {
            let session = sessions.remove(&r.id);
            DeviceResponse::new(r, session)
        })
        .collect();

    Ok(Json(devices))
}

/// Get a single device with its live session, if any
async fn get_device(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceResponse>, StatusCode> {
    let record = state
        .devices
        .find(&device_id)
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let session = state
        .broker
        .connected_devices()
        .await
        .into_iter()
        .find(|s| s.device_id == device_id);

    Ok(Json(DeviceResponse::new(record, session)))
}

/// Approve a device for command dispatch
async fn approve_device(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
) -> Result<Json<ApprovalResponse>, StatusCode> {
    match state.broker.approve_device(&device_id).await {
        Ok(true) => Ok(Json(ApprovalResponse {
            online: state.broker.is_device_online(&device_id).await,
            id: device_id,
            status: ApprovalStatus::Approved,
        })),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal_error(e)),
    }
}

/// Reject a device, closing its live connection
async fn reject_device(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
) -> Result<Json<ApprovalResponse>, StatusCode> {
    match state.broker.reject_device(&device_id).await {
        Ok(true) => Ok(Json(ApprovalResponse {
            online: state.broker.is_device_online(&device_id).await,
            id: device_id,
            status: ApprovalStatus::Rejected,
        })),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal_error(e)),
    }
}

/// Dispatch a command to a device and wait for the result
async fn dispatch_command(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandResult>, (StatusCode, Json<CommandResult>)> {
    match state
        .broker
        .send_command(&device_id, &body.action, body.params, body.timeout_ms)
        .await
    {
        Ok(data) => Ok(Json(CommandResult {
            success: true,
            data,
            error: None,
        })),
        Err(e) => Err((
            error_status(&e),
            Json(CommandResult {
                success: false,
                data: None,
                error: Some(e.to_string()),
            }),
        )),
    }
}

/// Fetch fresh extended info from the device and cache it
async fn device_info(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<CommandResult>)> {
    match state.broker.fetch_and_cache_extended_info(&device_id).await {
        Ok(info) => Ok(Json(info.unwrap_or(serde_json::Value::Null))),
        Err(e) => Err((
            error_status(&e),
            Json(CommandResult {
                success: false,
                data: None,
                error: Some(e.to_string()),
            }),
        )),
    }
}

/// Recent events for a device, newest first
async fn device_events(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventRecord>>, StatusCode> {
    let events = state
        .events
        .recent(&device_id, query.limit)
        .map_err(internal_error)?;
    Ok(Json(events))
}

/// Map a broker error onto the HTTP status for the command surface
fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::DeviceOffline(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::DeviceNotApproved(_) => StatusCode::FORBIDDEN,
        Error::CommandTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::CommandDelivery(_) | Error::CommandFailed(_) | Error::DeviceDisconnected => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn internal_error(e: Error) -> StatusCode {
    tracing::error!(error = %e, "device endpoint failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
