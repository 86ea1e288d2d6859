//! Rendezvous relay for Tidepool endpoints.
//!
//! Endpoints connect over WebSocket, sign in under an identifier of their
//! choosing, and exchange negotiation frames addressed by identifier. The
//! relay keeps one [`registry::Registry`] of live connections and never
//! looks inside a payload.

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::registry::Registry;
use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: Arc<RelayConfig>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            relay: Relay::new(Registry::new()),
            config: Arc::new(config),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited with error")
}
