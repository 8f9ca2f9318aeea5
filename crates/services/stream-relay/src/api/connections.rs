//! Connection inspection endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::AppState;
use crate::session::{CloseReason, SessionStats};

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Response body for the connection list
#[derive(Debug, Serialize)]
pub struct ConnectionList {
    pub count: usize,
    pub max_connections: usize,
    pub connections: Vec<SessionStats>,
}

/// List open connections
///
/// GET /api/connections
pub async fn list_connections(State(state): State<AppState>) -> Json<ConnectionList> {
    let connections = state.registry.all_stats().await;
    Json(ConnectionList {
        count: connections.len(),
        max_connections: state.config.relay.max_connections,
        connections,
    })
}

/// Get one connection's session stats
///
/// GET /api/connections/:id
pub async fn get_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.stats(&connection_id).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

/// Stop a connection's relay and close the socket
///
/// DELETE /api/connections/:id
pub async fn close_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> impl IntoResponse {
    match state
        .registry
        .close(&connection_id, CloseReason::ServerShutdown)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

fn not_found(message: String) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "connection_not_found".to_string(),
            message,
        }),
    )
        .into_response()
}
