//! HTTP API server for the device gateway
//!
//! Hosts the device WebSocket endpoint alongside the management REST
//! surface and health probes.

mod auth;
pub mod devices;
pub mod health;
pub mod socket;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::broker::Broker;
use crate::config::Config;
use crate::db::{DbPool, DeviceRepo, EventLogRepo};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub api_key: Option<String>,
    pub broker: Broker,
    pub devices: DeviceRepo,
    pub events: EventLogRepo,
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Create a new API server
    #[must_use]
    pub fn new(config: &Config, db: DbPool, broker: Broker) -> Self {
        let state = Arc::new(ApiState {
            devices: broker.devices().clone(),
            events: EventLogRepo::new(db.clone()),
            db,
            api_key: config.api_key.clone(),
            broker,
        });

        Self {
            state,
            port: config.port,
        }
    }

    /// Build the router with all routes
    fn router(&self) -> Router {
        // CORS layer for cross-origin requests from the dashboard
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/api/devices", devices::router(self.state.clone()))
            .nest("/ws", socket::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
