//! HTTP API for the stream relay
//!
//! Runs beside the WebSocket listener on its own port:
//! - `GET /health` - Liveness probe
//! - `GET /metrics` - Relay metrics
//! - `GET /api/connections` - Stats for every open connection
//! - `GET /api/connections/:id` - Stats for one connection
//! - `DELETE /api/connections/:id` - Stop a connection's relay and close it

pub mod connections;

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::ConnectionRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Open connections
    pub registry: Arc<ConnectionRegistry>,
    /// Relay metrics
    pub metrics: Arc<Metrics>,
    /// Service configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<Metrics>, config: Arc<Config>) -> Self {
        Self {
            registry,
            metrics,
            config,
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/connections", get(connections::list_connections))
        .route(
            "/api/connections/:id",
            get(connections::get_connection).delete(connections::close_connection),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_creation() {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new(10, metrics.clone()));
        let config = Arc::new(Config::default());
        let state = AppState::new(registry, metrics, config);

        assert_eq!(state.config.server.http_port, 8081);
    }

    #[tokio::test]
    async fn test_metrics_handler_reads_shared_metrics() {
        let metrics = Arc::new(Metrics::new());
        metrics.chunk_received(42);
        let registry = Arc::new(ConnectionRegistry::new(10, metrics.clone()));
        let state = AppState::new(registry, metrics, Arc::new(Config::default()));

        let Json(snapshot) = metrics_handler(State(state)).await;
        assert_eq!(snapshot.bytes_received, 42);
    }
}
