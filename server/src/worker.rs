//! Background storage worker.
//!
//! One task owns the in-memory timestamp index, the relay clock and every
//! connection's sessions. Connections talk to it over a bounded channel, so
//! protocol messages are applied one at a time and never observe a
//! half-written batch.
//!
//! Payloads are never cached: before a frame is handled, the worker fetches
//! from SQLite exactly the payloads the session will send, and the frame
//! runs against that scratch store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use accord_engine::{
    abort_frame, pending_sends, BinaryTimestamp, Clock, EncodeError, Entry, ErrorListeners,
    EventStore, MemoryEventStore, MemoryPayloadStore, Message, OwnerId, PayloadStore, Replica,
    SessionSet, StorageError, SyncConfig, SyncError, TimeSource,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::{AppError, Result};
use crate::journal::{roll_back, JournaledStore};

/// Commands queued before senders wait.
const COMMAND_BUFFER: usize = 1024;

/// Wall-clock time for the relay clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Result of handling one inbound frame.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Owner the frame was about, if it could be decoded
    pub owner: Option<OwnerId>,
    /// Encoded frames to send back to the same connection
    pub replies: Vec<Vec<u8>>,
    /// Entries newly stored, to be relayed to other connections
    pub applied: Vec<Entry>,
}

/// Snapshot of the worker's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub owners: usize,
    pub timestamps: usize,
    /// Connections that have sent at least one frame and not disconnected
    pub peers: usize,
    pub errors: u64,
}

enum Command {
    Frame {
        conn_id: String,
        frame: Vec<u8>,
        reply: oneshot::Sender<FrameOutcome>,
    },
    Disconnect {
        conn_id: String,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
}

/// Cloneable handle for sending work to the storage worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Command>,
}

impl WorkerHandle {
    /// Apply one protocol frame received on `conn_id`.
    pub async fn handle_frame(&self, conn_id: &str, frame: Vec<u8>) -> Result<FrameOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Frame {
            conn_id: conn_id.to_string(),
            frame,
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::WorkerUnavailable)
    }

    /// Abort and forget every session of `conn_id`.
    pub async fn disconnect(&self, conn_id: &str) -> Result<()> {
        self.send(Command::Disconnect {
            conn_id: conn_id.to_string(),
        })
        .await
    }

    pub async fn stats(&self) -> Result<WorkerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| AppError::WorkerUnavailable)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| AppError::WorkerUnavailable)
    }
}

/// Owner of all sync state on the relay.
pub struct StorageWorker {
    pool: Pool,
    store: MemoryEventStore,
    clock: Clock,
    sync: SyncConfig,
    session_timeout_ms: u64,
    sessions: HashMap<String, SessionSet>,
    listeners: ErrorListeners,
    errors: Arc<AtomicU64>,
}

impl StorageWorker {
    /// Rebuild the index from the database.
    pub async fn load(pool: Pool, config: &Config) -> Result<Self> {
        let rows = db::load_timestamps(&pool).await?;

        let mut store = MemoryEventStore::new();
        for row in &rows {
            let (owner, timestamp) = row.to_key()?;
            store.insert(&owner, timestamp).map_err(SyncError::from)?;
        }

        tracing::info!(
            owners = store.owners().count(),
            timestamps = store.total_len(),
            "Loaded timestamp index"
        );

        let listeners = ErrorListeners::new();
        let errors = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&errors);
        // Stays registered for the worker's lifetime.
        let _ = listeners.subscribe(move |error| {
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %error, "Sync error");
        });

        Ok(Self {
            pool,
            store,
            clock: Clock::new(config.node_id, config.clock),
            sync: config.sync,
            session_timeout_ms: config.session_timeout_ms,
            sessions: HashMap::new(),
            listeners,
            errors,
        })
    }

    /// Run the worker on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(self.run(rx));
        WorkerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let period = Duration::from_millis((self.session_timeout_ms / 2).max(100));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        tracing::info!("Storage worker stopped");
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::Frame {
                conn_id,
                frame,
                reply,
            } => {
                let outcome = self.handle_frame(&conn_id, &frame).await;
                let _ = reply.send(outcome);
            }
            Command::Disconnect { conn_id } => self.disconnect(&conn_id),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn handle_frame(&mut self, conn_id: &str, frame: &[u8]) -> FrameOutcome {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.listeners.notify(&SyncError::Decode(e));
                let replies = self
                    .sessions_of(conn_id)
                    .abort_all()
                    .iter()
                    .map(|notice| abort_frame(notice.owner()))
                    .collect();
                return FrameOutcome {
                    replies,
                    ..FrameOutcome::default()
                };
            }
        };
        let owner = *message.owner();
        let kind = message.kind_name();

        let mut payloads = match self.prefetch(&owner, &message).await {
            Ok(payloads) => payloads,
            Err(e) => return self.fail_frame(conn_id, owner, e),
        };

        let clock = self.clock.clone();
        let time = WallClock;
        let sessions = self
            .sessions
            .entry(conn_id.to_string())
            .or_insert_with(|| SessionSet::new(self.sync).with_listeners(self.listeners.clone()));
        let mut journal = JournaledStore::new(&mut self.store);
        let result = {
            let mut replica = Replica::new(&mut journal, &mut payloads, &mut self.clock, &time);
            sessions.handle(&mut replica, message)
        };
        let added = journal.into_added();

        if let Err(e) = self.persist(&added, &payloads).await {
            roll_back(&added, &mut self.store);
            self.clock = clock;
            return self.fail_frame(conn_id, owner, e);
        }

        match result {
            Ok(handled) => {
                tracing::debug!(
                    conn_id,
                    %owner,
                    kind,
                    replies = handled.messages.len(),
                    applied = handled.applied.len(),
                    completed = handled.completed,
                    "Handled frame"
                );
                match encode_all(&handled.messages) {
                    Ok(replies) => FrameOutcome {
                        owner: Some(owner),
                        replies,
                        applied: handled.applied,
                    },
                    // The entries are stored; only the reply is lost.
                    Err(e) => FrameOutcome {
                        applied: handled.applied,
                        ..self.fail_frame(conn_id, owner, SyncError::Encode(e))
                    },
                }
            }
            // Listeners already saw the error. A session that was aborted
            // before this frame has nothing left to tell the peer.
            Err(SyncError::Aborted) => FrameOutcome {
                owner: Some(owner),
                ..FrameOutcome::default()
            },
            Err(_) => FrameOutcome {
                owner: Some(owner),
                replies: vec![abort_frame(&owner)],
                applied: Vec::new(),
            },
        }
    }

    fn sessions_of(&mut self, conn_id: &str) -> &mut SessionSet {
        self.sessions
            .entry(conn_id.to_string())
            .or_insert_with(|| SessionSet::new(self.sync).with_listeners(self.listeners.clone()))
    }

    /// Load the payloads handling `message` will send: the entries a listed
    /// range lacks on the peer, or the entries the peer asked for.
    async fn prefetch(
        &self,
        owner: &OwnerId,
        message: &Message,
    ) -> std::result::Result<MemoryPayloadStore, SyncError> {
        let wanted = match message {
            Message::Ranges { ranges, .. } => pending_sends(&self.store, owner, ranges)?,
            Message::Entries { need, .. } => need.clone(),
            Message::Abort { .. } => Vec::new(),
        };

        let mut payloads = MemoryPayloadStore::new();
        if wanted.is_empty() {
            return Ok(payloads);
        }
        let entries = db::load_payloads(&self.pool, owner, &wanted)
            .await
            .map_err(backend)?;
        for entry in entries {
            payloads.write_payload(owner, entry.timestamp, entry.payload)?;
        }
        Ok(payloads)
    }

    /// Write the timestamps a frame added, with their payloads, in one
    /// transaction.
    async fn persist(
        &self,
        added: &[(OwnerId, BinaryTimestamp)],
        payloads: &MemoryPayloadStore,
    ) -> std::result::Result<(), SyncError> {
        if added.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(added.len());
        for (owner, timestamp) in added {
            let payload = payloads.read_payload(owner, timestamp)?.ok_or_else(|| {
                StorageError::Backend(format!("no payload received for {timestamp:?}"))
            })?;
            rows.push((*owner, Entry::new(*timestamp, payload)));
        }
        db::insert_entries(&self.pool, &rows)
            .await
            .map_err(backend)
    }

    /// Report a relay-side failure and abort `owner` on `conn_id`.
    ///
    /// The peer is always told, even when no session existed yet, so it
    /// does not wait for a reply that will never come.
    fn fail_frame(&mut self, conn_id: &str, owner: OwnerId, error: SyncError) -> FrameOutcome {
        tracing::error!(conn_id, %owner, error = %error, "Failed to handle frame");
        self.listeners.notify(&error);
        self.sessions_of(conn_id).abort(&owner);
        FrameOutcome {
            owner: Some(owner),
            replies: vec![abort_frame(&owner)],
            applied: Vec::new(),
        }
    }

    fn disconnect(&mut self, conn_id: &str) {
        if let Some(mut sessions) = self.sessions.remove(conn_id) {
            let aborted = sessions.abort_all().len();
            tracing::debug!(conn_id, aborted, "Dropped connection sessions");
        }
    }

    fn sweep(&mut self) {
        let now = WallClock.now_millis();
        for (conn_id, sessions) in self.sessions.iter_mut() {
            let expired = sessions.expire(now, self.session_timeout_ms);
            if !expired.is_empty() {
                tracing::debug!(conn_id = %conn_id, expired = expired.len(), "Timed out sessions");
            }
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            owners: self.store.owners().count(),
            timestamps: self.store.total_len(),
            peers: self.sessions.len(),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

fn backend(error: sqlx::Error) -> SyncError {
    SyncError::Storage(StorageError::Backend(error.to_string()))
}

fn encode_all(messages: &[Message]) -> std::result::Result<Vec<Vec<u8>>, EncodeError> {
    messages.iter().map(Message::encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_engine::{NodeId, Timestamp};

    const OWNER: OwnerId = OwnerId([0x24; 16]);

    async fn worker() -> StorageWorker {
        let config = Config::from_lookup(|name| match name {
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "NODE_ID" => Some("0000000000000001".to_string()),
            _ => None,
        })
        .unwrap();
        let pool = db::create_pool(&config.database_url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        StorageWorker::load(pool, &config).await.unwrap()
    }

    fn ahead(millis: u64) -> BinaryTimestamp {
        Timestamp::new(WallClock.now_millis() + millis, 0, NodeId([9; 8]))
            .unwrap()
            .to_binary()
    }

    #[tokio::test]
    async fn failed_commit_restores_the_clock() {
        let mut worker = worker().await;
        let before = worker.clock.clone();
        sqlx::query("DROP TABLE accord_message")
            .execute(&worker.pool)
            .await
            .unwrap();

        let t = ahead(60_000);
        let frame = Message::Entries {
            owner: OWNER,
            entries: vec![Entry::new(t, b"ahead".to_vec())],
            need: Vec::new(),
            missing: Vec::new(),
        }
        .encode()
        .unwrap();
        let outcome = worker.handle_frame("conn-1", &frame).await;

        assert_eq!(outcome.replies, vec![abort_frame(&OWNER)]);
        assert!(outcome.applied.is_empty());
        assert_eq!(worker.clock, before);
        assert!(!worker.store.contains(&OWNER, &t));
        assert_eq!(
            worker.sessions["conn-1"].get(&OWNER).unwrap().state(),
            accord_engine::SessionState::Aborted
        );
    }

    #[tokio::test]
    async fn unreadable_payloads_abort_the_owner() {
        let mut worker = worker().await;
        sqlx::query("DROP TABLE accord_message")
            .execute(&worker.pool)
            .await
            .unwrap();

        let frame = Message::Entries {
            owner: OWNER,
            entries: Vec::new(),
            need: vec![ahead(0)],
            missing: Vec::new(),
        }
        .encode()
        .unwrap();
        let outcome = worker.handle_frame("conn-1", &frame).await;

        assert_eq!(outcome.owner, Some(OWNER));
        assert_eq!(outcome.replies, vec![abort_frame(&OWNER)]);
        assert_eq!(worker.stats().errors, 1);
    }
}
