//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::Result;
use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub owners: usize,
    pub timestamps: usize,
    /// Open WebSocket connections
    pub connections: usize,
    /// Connections with sync sessions on the worker
    pub peers: usize,
    pub errors: u64,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let stats = state.worker.stats().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.config.node_id.to_string(),
        owners: stats.owners,
        timestamps: stats.timestamps,
        connections: state.conn_manager.connection_count(),
        peers: stats.peers,
        errors: stats.errors,
    }))
}

/// Root handler.
async fn root() -> &'static str {
    "Accord Relay"
}
