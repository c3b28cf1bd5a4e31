//! Sync endpoint routes.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync", get(sync_socket))
}

/// GET /sync - Upgrade to a binary WebSocket sync connection.
async fn sync_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.worker.clone(), state.conn_manager.clone())
    })
}
