//! Accord Relay - sync server for local-first replicas.
//!
//! Clients open a WebSocket at `/sync` and run the range reconciliation
//! protocol from `accord-engine` against the relay's copy of each owner's
//! history. Everything the relay learns is persisted to SQLite and relayed
//! to the other connections syncing the same owner.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod journal;
pub mod routes;
pub mod websocket;
pub mod worker;

use crate::config::Config;
use crate::websocket::ConnectionManager;
use crate::worker::WorkerHandle;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub worker: WorkerHandle,
    pub conn_manager: Arc<ConnectionManager>,
}

/// Build the router with all routes and layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
