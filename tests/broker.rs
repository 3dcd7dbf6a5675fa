//! Broker integration tests
//!
//! End-to-end flows through the broker with a real event log, exercising
//! the approval lifecycle, command correlation, and session supersession
//! together rather than in isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use muster_gateway::broker::{ApprovalStatus, BrokerFrame, CLOSE_SUPERSEDED, Outbound};
use muster_gateway::db::{DeviceRepo, EventLogRepo};
use muster_gateway::events::{EventForwarder, EventLogForwarder, FanoutForwarder};
use muster_gateway::{Broker, BrokerConfig, CommandReply, DbPool, Error};

mod common;
use common::{setup_test_db, test_profile};

fn build_broker(db: &DbPool) -> Broker {
    let sinks: Vec<Arc<dyn EventForwarder>> = vec![Arc::new(EventLogForwarder::new(
        EventLogRepo::new(db.clone()),
    ))];

    Broker::new(
        DeviceRepo::new(db.clone()),
        Arc::new(FanoutForwarder::new(sinks)),
        BrokerConfig {
            command_timeout_ms: 200,
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 60,
            auth_grace_ms: 1_000,
        },
    )
}

async fn connect(broker: &Broker, device_id: &str) -> (String, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(8);
    let (session_id, _status) = broker
        .authenticate(test_profile(device_id), tx)
        .await
        .expect("authenticate");
    (session_id, rx)
}

/// Wait for the spawn-and-forget event dispatch to land in the log
async fn wait_for_events(log: &EventLogRepo, device_id: &str) -> Vec<muster_gateway::EventRecord> {
    for _ in 0..50 {
        let events = log.recent(device_id, 10).expect("query events");
        if !events.is_empty() {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no events recorded for {device_id}");
}

#[tokio::test]
async fn test_full_device_lifecycle() {
    let db = setup_test_db();
    let broker = build_broker(&db);

    // Authenticate: device lands pending and online
    let (session_id, mut rx) = connect(&broker, "dev-1").await;
    assert!(broker.is_device_online("dev-1").await);

    let record = broker
        .devices()
        .find("dev-1")
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ApprovalStatus::Pending);

    // Approval reaches both the database and the live session
    assert!(broker.approve_device("dev-1").await.expect("approve"));
    let Some(Outbound::Frame(BrokerFrame::AuthResult { success, status, .. })) = rx.recv().await
    else {
        panic!("expected pushed auth result");
    };
    assert!(success);
    assert_eq!(status, ApprovalStatus::Approved);

    // Command round trip against the now-approved device
    let worker_broker = broker.clone();
    let worker_session = session_id.clone();
    let worker = tokio::spawn(async move {
        let Some(Outbound::Frame(BrokerFrame::Command { id, .. })) = rx.recv().await else {
            panic!("expected command frame");
        };
        worker_broker
            .handle_response(
                "dev-1",
                &worker_session,
                &id,
                CommandReply {
                    success: true,
                    data: Some(serde_json::json!({ "pong": true })),
                    error: None,
                },
            )
            .await;
        rx
    });

    let data = broker
        .send_command("dev-1", "ping", None, None)
        .await
        .expect("command");
    assert_eq!(data, Some(serde_json::json!({ "pong": true })));
    let _rx = worker.await.expect("worker");

    // Disconnect leaves the record behind but takes the device offline
    broker.disconnect("dev-1", &session_id).await;
    assert!(!broker.is_device_online("dev-1").await);

    let record = broker
        .devices()
        .find("dev-1")
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_events_reach_the_log() {
    let db = setup_test_db();
    let broker = build_broker(&db);
    let log = EventLogRepo::new(db.clone());

    let (session_id, _rx) = connect(&broker, "dev-1").await;

    broker
        .forward_event(
            "dev-1",
            &session_id,
            "battery_low".to_string(),
            serde_json::json!({ "level": 9 }),
            1_700_000_000_000,
        )
        .await;

    let events = wait_for_events(&log, "dev-1").await;
    assert_eq!(events[0].event_type, "battery_low");
    assert_eq!(events[0].data["level"], 9);
    assert_eq!(events[0].timestamp, 1_700_000_000_000);
}

#[tokio::test]
async fn test_superseding_connection_isolates_old_session() {
    let db = setup_test_db();
    let broker = build_broker(&db);

    let (old_session, mut old_rx) = connect(&broker, "dev-1").await;
    broker.approve_device("dev-1").await.expect("approve");

    // Drain the pushed approval before the second connect
    let Some(Outbound::Frame(BrokerFrame::AuthResult { .. })) = old_rx.recv().await else {
        panic!("expected auth result on old session");
    };

    let (new_session, mut new_rx) = connect(&broker, "dev-1").await;
    assert_ne!(old_session, new_session);

    let Some(Outbound::Close { code, .. }) = old_rx.recv().await else {
        panic!("expected close on superseded session");
    };
    assert_eq!(code, CLOSE_SUPERSEDED);

    // The old socket's teardown must not touch the new session
    broker.disconnect("dev-1", &old_session).await;
    assert!(broker.is_device_online("dev-1").await);

    // A command flows through the new session; replies claiming the old
    // session are refused
    let worker_broker = broker.clone();
    let worker_old = old_session.clone();
    let worker_new = new_session.clone();
    let worker = tokio::spawn(async move {
        let Some(Outbound::Frame(BrokerFrame::Command { id, .. })) = new_rx.recv().await else {
            panic!("expected command frame");
        };

        let stale = worker_broker
            .handle_response(
                "dev-1",
                &worker_old,
                &id,
                CommandReply {
                    success: true,
                    data: None,
                    error: None,
                },
            )
            .await;
        assert!(!stale);

        let live = worker_broker
            .handle_response(
                "dev-1",
                &worker_new,
                &id,
                CommandReply {
                    success: true,
                    data: Some(serde_json::json!({ "ok": true })),
                    error: None,
                },
            )
            .await;
        assert!(live);
    });

    let data = broker
        .send_command("dev-1", "ping", None, None)
        .await
        .expect("command");
    assert_eq!(data, Some(serde_json::json!({ "ok": true })));
    worker.await.expect("worker");
}

#[tokio::test]
async fn test_reauth_preserves_approval() {
    let db = setup_test_db();
    let broker = build_broker(&db);

    let (session_id, mut rx) = connect(&broker, "dev-1").await;
    broker.approve_device("dev-1").await.expect("approve");
    let _ = rx.recv().await;

    let mut profile = test_profile("dev-1");
    profile.device_name = "Renamed Device".to_string();
    profile.os_version = "15".to_string();

    let status = broker
        .reauthenticate("dev-1", &session_id, profile)
        .await
        .expect("reauthenticate");
    assert_eq!(status, ApprovalStatus::Approved);

    let record = broker
        .devices()
        .find("dev-1")
        .expect("find")
        .expect("record");
    assert_eq!(record.name, "Renamed Device");
    assert_eq!(record.os_version, "15");
    assert_eq!(record.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_disconnect_fails_inflight_command() {
    let db = setup_test_db();
    let broker = build_broker(&db);

    let (session_id, _rx) = connect(&broker, "dev-1").await;
    broker.approve_device("dev-1").await.expect("approve");

    let cmd_broker = broker.clone();
    let inflight =
        tokio::spawn(async move { cmd_broker.send_command("dev-1", "ping", None, None).await });

    // Let the command register its pending entry before tearing down
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.disconnect("dev-1", &session_id).await;

    let result = inflight.await.expect("join");
    assert!(matches!(result, Err(Error::DeviceDisconnected)));
}
