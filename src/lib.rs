//! Muster Gateway - Connection broker for managed mobile devices
//!
//! This library provides the core functionality for the Muster gateway:
//! - Persistent WebSocket sessions for mobile devices
//! - Command dispatch with correlated request/response
//! - Device approval lifecycle (pending, approved, rejected)
//! - Heartbeat supervision and event forwarding
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Devices                          │
//! │      Android  │  iOS  │  (WebSocket clients)         │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ws: auth / command / event / heartbeat
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Muster Gateway                       │
//! │   Sessions  │  Broker  │  Approval  │  Event log     │
//! └────────────────────┬────────────────────────────────┘
//!                      │ REST + webhooks
//! ┌────────────────────▼────────────────────────────────┐
//! │              Operators and Consumers                 │
//! │   Dashboard  │  CLI  │  Downstream event sinks       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use broker::{ApprovalStatus, Broker, CommandReply, DeviceProfile, Platform, SessionInfo};
pub use config::{BrokerConfig, Config};
pub use db::{DbConn, DbPool, DeviceRecord, DeviceRepo, EventLogRepo, EventRecord};
pub use error::{Error, Result};
pub use events::{
    DeviceEvent, EventForwarder, EventLogForwarder, FanoutForwarder, NullForwarder,
    WebhookForwarder,
};
