//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use tokio::sync::mpsc;
use tower::ServiceExt;

use muster_gateway::api::{self, ApiState};
use muster_gateway::broker::{BrokerFrame, CLOSE_REJECTED, Outbound};
use muster_gateway::db::{DeviceRepo, EventLogRepo};
use muster_gateway::events::NullForwarder;
use muster_gateway::{Broker, BrokerConfig, CommandReply, DbPool};

mod common;
use common::{setup_test_db, test_profile};

const TEST_API_KEY: &str = "test-api-key";

/// Build a test API router and the broker behind it
fn build_test_router(db: DbPool) -> (Router, Broker) {
    let devices = DeviceRepo::new(db.clone());
    let events = EventLogRepo::new(db.clone());

    let broker = Broker::new(
        devices.clone(),
        Arc::new(NullForwarder),
        BrokerConfig {
            command_timeout_ms: 200,
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 150,
            auth_grace_ms: 1_000,
        },
    );

    let state = Arc::new(ApiState {
        db,
        api_key: Some(TEST_API_KEY.to_string()),
        broker: broker.clone(),
        devices,
        events,
    });

    let router = Router::new()
        .nest("/api/devices", api::devices::router(state.clone()))
        .merge(api::health::router())
        .merge(api::health::ready_router(state));

    (router, broker)
}

/// Register a fake device session directly with the broker
async fn connect_device(broker: &Broker, device_id: &str) -> (String, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(8);
    let (session_id, _status) = broker
        .authenticate(test_profile(device_id), tx)
        .await
        .expect("authenticate");
    (session_id, rx)
}

/// Answer every command frame on the session with an echo reply
fn spawn_device_worker(
    broker: Broker,
    device_id: &str,
    session_id: String,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let device_id = device_id.to_string();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            if let Outbound::Frame(BrokerFrame::Command { id, params, .. }) = out {
                broker
                    .handle_response(
                        &device_id,
                        &session_id,
                        &id,
                        CommandReply {
                            success: true,
                            data: Some(serde_json::json!({ "echo": params })),
                            error: None,
                        },
                    )
                    .await;
            }
        }
    });
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"))
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connected_devices"], 0);
    assert_eq!(json["checks"]["database"]["status"], "ok");
}

#[tokio::test]
async fn test_devices_require_api_key() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/devices")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_devices_empty() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app.oneshot(get("/api/devices")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json, serde_json::json!([]));
}

#[tokio::test]
async fn test_listing_merges_online_state() {
    let db = setup_test_db();
    let (app, broker) = build_test_router(db);

    let (_session_id, _rx) = connect_device(&broker, "dev-1").await;

    let response = app
        .clone()
        .oneshot(get("/api/devices"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json.as_array().map(Vec::len), Some(1));
    assert_eq!(json[0]["id"], "dev-1");
    assert_eq!(json[0]["status"], "pending");
    assert_eq!(json[0]["online"], true);

    let response = app.oneshot(get("/api/devices/dev-1")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["online"], true);
    assert!(json["session"]["session_id"].is_string());
}

#[tokio::test]
async fn test_unknown_device_is_404() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app.oneshot(get("/api/devices/ghost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_approve_pushes_to_live_session() {
    let db = setup_test_db();
    let (app, broker) = build_test_router(db);

    let (_session_id, mut rx) = connect_device(&broker, "dev-1").await;

    let response = app
        .oneshot(post("/api/devices/dev-1/approve"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "approved");
    assert_eq!(json["online"], true);

    let Some(Outbound::Frame(BrokerFrame::AuthResult { success, .. })) = rx.recv().await else {
        panic!("expected auth result after approval");
    };
    assert!(success);
}

#[tokio::test]
async fn test_reject_pushes_verdict_then_close() {
    let db = setup_test_db();
    let (app, broker) = build_test_router(db);

    let (_session_id, mut rx) = connect_device(&broker, "dev-1").await;

    let response = app
        .oneshot(post("/api/devices/dev-1/reject"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "rejected");

    let Some(Outbound::Frame(BrokerFrame::AuthResult { success, .. })) = rx.recv().await else {
        panic!("expected auth result after rejection");
    };
    assert!(!success);

    let Some(Outbound::Close { code, .. }) = rx.recv().await else {
        panic!("expected close after rejection");
    };
    assert_eq!(code, CLOSE_REJECTED);
}

#[tokio::test]
async fn test_approve_unknown_device_is_404() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app
        .oneshot(post("/api/devices/ghost/approve"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_command_to_offline_device_is_404() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db);

    let response = app
        .oneshot(post_json(
            "/api/devices/ghost/command",
            &serde_json::json!({ "action": "ping" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_command_to_unapproved_device_is_403() {
    let db = setup_test_db();
    let (app, broker) = build_test_router(db);

    let (_session_id, _rx) = connect_device(&broker, "dev-1").await;

    let response = app
        .oneshot(post_json(
            "/api/devices/dev-1/command",
            &serde_json::json!({ "action": "ping" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_command_round_trip() {
    let db = setup_test_db();
    let (app, broker) = build_test_router(db);

    let (session_id, rx) = connect_device(&broker, "dev-1").await;
    broker.approve_device("dev-1").await.expect("approve");
    spawn_device_worker(broker.clone(), "dev-1", session_id, rx);

    let response = app
        .oneshot(post_json(
            "/api/devices/dev-1/command",
            &serde_json::json!({ "action": "ping", "params": { "x": 1 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["echo"]["x"], 1);
}

#[tokio::test]
async fn test_info_endpoint_fetches_and_caches() {
    let db = setup_test_db();
    let (app, broker) = build_test_router(db);

    let (session_id, rx) = connect_device(&broker, "dev-1").await;
    broker.approve_device("dev-1").await.expect("approve");
    spawn_device_worker(broker.clone(), "dev-1", session_id, rx);

    let response = app
        .clone()
        .oneshot(get("/api/devices/dev-1/info"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The echo worker answers the info fetch like any other command
    let json = body_json(response).await;
    assert!(json.get("echo").is_some());

    let response = app.oneshot(get("/api/devices/dev-1")).await.unwrap();
    let json = body_json(response).await;
    assert!(json["extended_info"].is_object());
}

#[tokio::test]
async fn test_device_events_endpoint() {
    let db = setup_test_db();
    let (app, _broker) = build_test_router(db.clone());

    let devices = DeviceRepo::new(db.clone());
    devices.upsert(&test_profile("dev-1")).expect("upsert");

    let events = EventLogRepo::new(db);
    for i in 0..3 {
        events
            .insert(
                "dev-1",
                "battery_low",
                &serde_json::json!({ "level": i }),
                1_000 + i,
            )
            .expect("insert event");
    }

    let response = app
        .clone()
        .oneshot(get("/api/devices/dev-1/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json.as_array().map(Vec::len), Some(3));
    assert_eq!(json[0]["event_type"], "battery_low");

    let response = app
        .oneshot(get("/api/devices/dev-1/events?limit=1"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().map(Vec::len), Some(1));
}
