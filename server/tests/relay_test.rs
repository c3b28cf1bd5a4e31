//! Integration tests for the relay worker.
//!
//! These run against an in-memory SQLite database.

use accord_engine::{
    abort_frame, BinaryTimestamp, Clock, ClockConfig, Entry, EventStore, MemoryEventStore,
    MemoryPayloadStore, Message, NodeId, OwnerId, PayloadStore, Range, Replica, SessionSet,
    SessionState, SyncConfig, TimeSource, Timestamp, UpperBound,
};
use accord_server::config::Config;
use accord_server::db::{self, Pool};
use accord_server::handlers::process_frame;
use accord_server::websocket::ConnectionManager;
use accord_server::worker::{StorageWorker, WallClock, WorkerHandle};
use tokio::sync::mpsc;

const OWNER: OwnerId = OwnerId([0x42; 16]);

fn test_config() -> Config {
    Config::from_lookup(|name| match name {
        "DATABASE_URL" => Some("sqlite::memory:".to_string()),
        "NODE_ID" => Some("00000000000000ff".to_string()),
        _ => None,
    })
    .unwrap()
}

async fn relay() -> (Pool, WorkerHandle) {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let worker = StorageWorker::load(pool.clone(), &test_config())
        .await
        .unwrap()
        .spawn();
    (pool, worker)
}

/// A client replica speaking encoded frames.
struct Client {
    store: MemoryEventStore,
    payloads: MemoryPayloadStore,
    clock: Clock,
    sessions: SessionSet,
}

impl Client {
    fn new(node: u8) -> Self {
        Self {
            store: MemoryEventStore::new(),
            payloads: MemoryPayloadStore::new(),
            clock: Clock::new(NodeId([node; 8]), ClockConfig::default()),
            sessions: SessionSet::new(SyncConfig::default()),
        }
    }

    /// Add `count` recent entries issued by this client's clock.
    fn with_entries(node: u8, count: usize) -> Self {
        let mut client = Self::new(node);
        for i in 0..count {
            let t = client.clock.next(&WallClock).unwrap().to_binary();
            client.store.insert(&OWNER, t).unwrap();
            client
                .payloads
                .write_payload(&OWNER, t, format!("change {i}").into_bytes())
                .unwrap();
        }
        client
    }

    fn start(&mut self, owner: OwnerId) -> Vec<Vec<u8>> {
        let mut replica = Replica::new(
            &mut self.store,
            &mut self.payloads,
            &mut self.clock,
            &WallClock,
        );
        self.sessions
            .start(&mut replica, owner)
            .unwrap()
            .iter()
            .map(|message| message.encode().unwrap())
            .collect()
    }

    fn receive(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let mut replica = Replica::new(
            &mut self.store,
            &mut self.payloads,
            &mut self.clock,
            &WallClock,
        );
        self.sessions
            .handle_frame(&mut replica, frame)
            .unwrap()
            .messages
            .iter()
            .map(|message| message.encode().unwrap())
            .collect()
    }

    fn all(&self) -> Vec<BinaryTimestamp> {
        self.store
            .collect_range(&OWNER, 0, self.store.size(&OWNER))
            .unwrap()
    }

    fn entries(&self) -> Vec<Entry> {
        self.all()
            .into_iter()
            .map(|t| Entry::new(t, self.payloads.read_payload(&OWNER, &t).unwrap().unwrap()))
            .collect()
    }
}

/// Run one reconciliation cycle directly against the worker.
async fn sync(client: &mut Client, worker: &WorkerHandle, conn_id: &str) {
    let mut outgoing = client.start(OWNER);
    let mut rounds = 0;
    while !outgoing.is_empty() {
        let mut incoming = Vec::new();
        for frame in outgoing.drain(..) {
            let outcome = worker.handle_frame(conn_id, frame).await.unwrap();
            incoming.extend(outcome.replies);
        }
        for frame in incoming {
            outgoing.extend(client.receive(&frame));
        }
        rounds += 1;
        assert!(rounds < 1000, "reconciliation did not terminate");
    }
}

/// Run one reconciliation cycle through the connection routing layer.
async fn sync_routed(
    client: &mut Client,
    worker: &WorkerHandle,
    manager: &ConnectionManager,
    conn_id: &str,
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut outgoing = client.start(OWNER);
    let mut rounds = 0;
    while !outgoing.is_empty() {
        for frame in outgoing.drain(..) {
            process_frame(worker, manager, conn_id, frame).await.unwrap();
        }
        while let Ok(frame) = rx.try_recv() {
            outgoing.extend(client.receive(&frame));
        }
        rounds += 1;
        assert!(rounds < 1000, "reconciliation did not terminate");
    }
}

#[tokio::test]
async fn upload_is_persisted_and_reloaded() {
    let (pool, worker) = relay().await;
    let mut client = Client::with_entries(1, 300);

    sync(&mut client, &worker, "conn-1").await;

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.timestamps, 300);
    assert_eq!(stats.owners, 1);
    assert_eq!(db::count_timestamps(&pool, &OWNER).await.unwrap(), 300);
    assert_eq!(db::count_payloads(&pool, &OWNER).await.unwrap(), 300);

    // A fresh worker rebuilds the same index from the database.
    let reloaded = StorageWorker::load(pool.clone(), &test_config())
        .await
        .unwrap()
        .spawn();
    let stats = reloaded.stats().await.unwrap();
    assert_eq!(stats.timestamps, 300);
    assert_eq!(stats.owners, 1);
}

#[tokio::test]
async fn second_client_downloads_everything() {
    let (_pool, worker) = relay().await;
    let mut uploader = Client::with_entries(1, 120);
    let mut downloader = Client::with_entries(2, 30);

    sync(&mut uploader, &worker, "conn-1").await;
    sync(&mut downloader, &worker, "conn-2").await;

    assert_eq!(downloader.store.size(&OWNER), 150);
    assert_eq!(worker.stats().await.unwrap().timestamps, 150);

    // The uploader catches up with the downloader's entries.
    sync(&mut uploader, &worker, "conn-1").await;
    assert_eq!(uploader.all(), downloader.all());

    let t = uploader.all()[0];
    assert_eq!(
        uploader.payloads.read_payload(&OWNER, &t).unwrap(),
        downloader.payloads.read_payload(&OWNER, &t).unwrap()
    );
}

#[tokio::test]
async fn uploads_are_relayed_to_subscribed_connections() {
    let (_pool, worker) = relay().await;
    let manager = ConnectionManager::new();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_a = manager.register(tx_a);
    let conn_b = manager.register(tx_b);

    // B syncs first so the relay knows it follows the owner.
    let mut b = Client::new(2);
    sync_routed(&mut b, &worker, &manager, &conn_b, &mut rx_b).await;
    assert_eq!(manager.owner_count(), 1);

    let mut a = Client::with_entries(1, 25);
    sync_routed(&mut a, &worker, &manager, &conn_a, &mut rx_a).await;

    // B never asked, but receives the entries A uploaded.
    let mut relayed = 0;
    while let Ok(frame) = rx_b.try_recv() {
        match Message::decode(&frame).unwrap() {
            Message::Entries { entries, need, .. } => {
                assert!(need.is_empty());
                relayed += entries.len();
            }
            other => panic!("unexpected relay: {other:?}"),
        }
        assert!(b.receive(&frame).is_empty());
    }
    assert_eq!(relayed, 25);
    assert_eq!(b.all(), a.all());
}

#[tokio::test]
async fn garbage_frame_is_counted_and_ignored() {
    let (_pool, worker) = relay().await;

    let outcome = worker.handle_frame("conn-1", vec![0xff, 0x01]).await.unwrap();
    assert!(outcome.owner.is_none());
    assert!(outcome.replies.is_empty());

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.timestamps, 0);
}

#[tokio::test]
async fn frames_after_abort_are_dropped() {
    let (_pool, worker) = relay().await;

    // A converged advertisement needs no answer.
    let converged = Message::Ranges {
        owner: OWNER,
        round: 0,
        ranges: vec![Range::skip(UpperBound::Infinite)],
    }
    .encode()
    .unwrap();
    let outcome = worker.handle_frame("conn-1", converged.clone()).await.unwrap();
    assert_eq!(outcome.owner, Some(OWNER));
    assert!(outcome.replies.is_empty());

    let abort = abort_frame(&OWNER);
    let outcome = worker.handle_frame("conn-1", abort.clone()).await.unwrap();
    assert!(outcome.replies.is_empty());
    assert_eq!(worker.stats().await.unwrap().errors, 0);

    // The aborted session refuses further traffic without answering.
    let outcome = worker.handle_frame("conn-1", abort).await.unwrap();
    assert!(outcome.replies.is_empty());
    assert_eq!(worker.stats().await.unwrap().errors, 1);

    // The peer may reopen the owner with a new advertisement.
    let outcome = worker.handle_frame("conn-1", converged).await.unwrap();
    assert!(outcome.replies.is_empty());
    assert_eq!(worker.stats().await.unwrap().errors, 1);
}

#[tokio::test]
async fn disconnect_drops_sessions_but_keeps_data() {
    let (_pool, worker) = relay().await;
    let mut client = Client::with_entries(1, 10);
    sync(&mut client, &worker, "conn-1").await;
    assert_eq!(worker.stats().await.unwrap().peers, 1);

    worker.disconnect("conn-1").await.unwrap();

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.peers, 0);
    assert_eq!(stats.timestamps, 10);
}

#[tokio::test]
async fn drifting_upload_is_rejected() {
    let (_pool, worker) = relay().await;
    let far = WallClock.now_millis() + 60 * 60 * 1000;
    let t = Timestamp::new(far, 0, NodeId([9; 8])).unwrap().to_binary();

    let upload = Message::Entries {
        owner: OWNER,
        entries: vec![Entry::new(t, b"from the future".to_vec())],
        need: Vec::new(),
        missing: Vec::new(),
    };
    let outcome = worker
        .handle_frame("conn-1", upload.encode().unwrap())
        .await
        .unwrap();

    assert!(outcome.applied.is_empty());
    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.timestamps, 0);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn failed_write_rolls_back_and_aborts() {
    let (pool, worker) = relay().await;
    let mut first = Client::with_entries(1, 5);
    sync(&mut first, &worker, "conn-1").await;

    sqlx::query("DROP TABLE accord_timestamp")
        .execute(&pool)
        .await
        .unwrap();

    let late = Client::with_entries(3, 3);
    let upload = Message::Entries {
        owner: OWNER,
        entries: late.entries(),
        need: Vec::new(),
        missing: Vec::new(),
    };
    let outcome = worker
        .handle_frame("conn-2", upload.encode().unwrap())
        .await
        .unwrap();

    assert!(outcome.applied.is_empty());
    assert_eq!(outcome.replies, vec![abort_frame(&OWNER)]);
    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.timestamps, 5);
    assert_eq!(stats.errors, 1);

    sqlx::query(
        r#"CREATE TABLE accord_timestamp (
            "ownerId" blob(16) NOT NULL,
            "t" blob(16) NOT NULL,
            PRIMARY KEY ("ownerId", "t")
        ) WITHOUT ROWID"#,
    )
    .execute(&pool)
    .await
    .unwrap();

    // Nothing of the failed upload is offered to other clients.
    let mut fresh = Client::new(4);
    sync(&mut fresh, &worker, "conn-3").await;
    assert_eq!(fresh.all(), first.all());
    assert_eq!(worker.stats().await.unwrap().errors, 1);
}

#[tokio::test]
async fn payloads_are_served_from_the_database() {
    let (pool, worker) = relay().await;
    let mut uploader = Client::with_entries(1, 3);
    sync(&mut uploader, &worker, "conn-1").await;

    sqlx::query(r#"UPDATE accord_message SET "change" = ?"#)
        .bind(b"rewritten".to_vec())
        .execute(&pool)
        .await
        .unwrap();

    let mut downloader = Client::new(2);
    sync(&mut downloader, &worker, "conn-2").await;
    let entries = downloader.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.payload == b"rewritten"));
}

#[tokio::test]
async fn lost_payload_does_not_stall_download() {
    let (pool, worker) = relay().await;
    let mut uploader = Client::with_entries(1, 10);
    sync(&mut uploader, &worker, "conn-1").await;

    let lost = uploader.all()[4];
    sqlx::query(r#"DELETE FROM accord_message WHERE "timestamp" = ?"#)
        .bind(lost.as_bytes().to_vec())
        .execute(&pool)
        .await
        .unwrap();

    let mut downloader = Client::new(2);
    sync(&mut downloader, &worker, "conn-2").await;

    assert_eq!(downloader.store.size(&OWNER), 9);
    assert!(!downloader.store.contains(&OWNER, &lost));
    let session = downloader.sessions.get(&OWNER).unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.outstanding(), 0);
    assert_eq!(session.stats().entries_unavailable, 1);
}
