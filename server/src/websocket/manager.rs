//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections and the owners each one syncs, and
//! relays frames to the connections interested in an owner.

use std::collections::HashSet;
use std::sync::Arc;

use accord_engine::OwnerId;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender for outgoing binary frames.
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Channel to send frames to this connection
    pub sender: FrameSender,
    /// Owners this connection has sent frames for
    owners: HashSet<OwnerId>,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connections by owner for relaying.
    by_owner: DashMap<OwnerId, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, sender: FrameSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        let connection = Connection {
            id: conn_id.clone(),
            sender,
            owners: HashSet::new(),
        };
        self.connections.insert(conn_id.clone(), connection);

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Record that `conn_id` syncs `owner`. Returns `false` if it already did
    /// or the connection is gone.
    pub fn subscribe(&self, conn_id: &str, owner: OwnerId) -> bool {
        let Some(mut conn) = self.connections.get_mut(conn_id) else {
            return false;
        };
        if !conn.owners.insert(owner) {
            return false;
        }
        drop(conn);

        self.by_owner
            .entry(owner)
            .or_default()
            .push(conn_id.to_string());

        tracing::debug!(conn_id = %conn_id, %owner, "Connection subscribed to owner");
        true
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            for owner in &conn.owners {
                if let Some(mut conn_ids) = self.by_owner.get_mut(owner) {
                    conn_ids.retain(|id| id != conn_id);
                    // Clean up empty entries
                    if conn_ids.is_empty() {
                        drop(conn_ids);
                        self.by_owner.remove(owner);
                    }
                }
            }

            tracing::info!(
                conn_id = %conn_id,
                owners = conn.owners.len(),
                "WebSocket connection unregistered"
            );
        }
    }

    /// Send a frame to every connection syncing `owner` except the sender.
    ///
    /// Returns the number of connections that received the frame.
    pub fn broadcast_except(&self, sender_conn_id: &str, owner: &OwnerId, frame: &[u8]) -> usize {
        let Some(conn_ids) = self.by_owner.get(owner).map(|ids| ids.clone()) else {
            return 0;
        };

        let mut sent_count = 0;
        for conn_id in conn_ids.iter().filter(|id| id.as_str() != sender_conn_id) {
            if self.send_to(conn_id, frame.to_vec()) {
                sent_count += 1;
            }
        }

        tracing::debug!(
            sender = %sender_conn_id,
            %owner,
            recipients = sent_count,
            "Relayed frame to connections"
        );

        sent_count
    }

    /// Send a frame to a specific connection.
    pub fn send_to(&self, conn_id: &str, frame: Vec<u8>) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of owners with at least one subscribed connection.
    pub fn owner_count(&self) -> usize {
        self.by_owner.len()
    }
}
