//! WebSocket handler for real-time sync.
//!
//! Forwards binary protocol frames to the storage worker, sends its replies
//! back, and relays newly stored entries to other connections.

use std::sync::Arc;

use accord_engine::Message as SyncMessage;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::websocket::ConnectionManager;
use crate::worker::WorkerHandle;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing frames
/// 3. Processes incoming frames in a loop
/// 4. Aborts the connection's sessions and cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    worker: WorkerHandle,
    conn_manager: Arc<ConnectionManager>,
) {
    // Split the socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending frames to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let conn_id = conn_manager.register(tx);

    tracing::info!(conn_id = %conn_id, "WebSocket client connected");

    // Spawn task to forward frames from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                tracing::warn!("Failed to send WebSocket frame: {}", e);
                break;
            }
        }
    });

    // Process incoming frames
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Binary(data)) => {
                if let Err(e) = process_frame(&worker, &conn_manager, &conn_id, data.to_vec()).await
                {
                    tracing::error!(conn_id = %conn_id, "Dropping connection: {}", e);
                    break;
                }
            }
            Ok(Message::Text(_)) => {
                tracing::warn!(conn_id = %conn_id, "Text frames are not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // Clean up
    if let Err(e) = worker.disconnect(&conn_id).await {
        tracing::warn!(conn_id = %conn_id, "Failed to release sessions: {}", e);
    }
    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Run one frame through the worker and route what comes back.
pub async fn process_frame(
    worker: &WorkerHandle,
    conn_manager: &ConnectionManager,
    conn_id: &str,
    frame: Vec<u8>,
) -> Result<()> {
    let outcome = worker.handle_frame(conn_id, frame).await?;

    for reply in outcome.replies {
        conn_manager.send_to(conn_id, reply);
    }

    let Some(owner) = outcome.owner else {
        return Ok(());
    };
    conn_manager.subscribe(conn_id, owner);

    if !outcome.applied.is_empty() {
        let relay = SyncMessage::Entries {
            owner,
            entries: outcome.applied,
            need: Vec::new(),
            missing: Vec::new(),
        };
        match relay.encode() {
            Ok(frame) => {
                conn_manager.broadcast_except(conn_id, &owner, &frame);
            }
            // Subscribers pick the entries up on their next sync.
            Err(e) => tracing::warn!(conn_id, %owner, "Skipping relay of stored entries: {}", e),
        }
    }

    Ok(())
}
