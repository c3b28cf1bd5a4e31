//! # Accord Engine
//!
//! The sync core of a local-first platform: causally ordered timestamps,
//! per-owner timestamp sets with incremental fingerprints, and a range-based
//! reconciliation protocol that lets two replicas converge while exchanging
//! only what differs.
//!
//! ## Design Principles
//!
//! - **No IO**: The engine never touches sockets, files or threads
//! - **Deterministic**: Wall time is injected through [`TimeSource`]
//! - **Pluggable storage**: Sessions work against [`EventStore`] and
//!   [`PayloadStore`]; in-memory implementations are provided
//!
//! ## Core Concepts
//!
//! ### Hybrid logical clock
//!
//! A [`Clock`] issues [`Timestamp`]s (48-bit millis, 16-bit counter, 8-byte
//! node id) that respect causality and stay within a drift bound of wall
//! time. The 16-byte [`BinaryTimestamp`] encoding sorts bytewise exactly
//! like the timestamps themselves.
//!
//! ### Event store
//!
//! An [`EventStore`] keeps each owner's timestamps ordered and deduplicated
//! and answers XOR [`Fingerprint`] queries over ordinal ranges.
//!
//! ### Reconciliation
//!
//! A [`Session`] advertises `(upper bound, fingerprint)` ranges, splits the
//! ranges that differ, and finally exchanges the missing [`Entry`]s. A
//! [`SessionSet`] multiplexes the sessions of one connection by owner.
//!
//! ## Quick Start
//!
//! ```rust
//! use accord_engine::{
//!     Clock, ClockConfig, EventStore, MemoryEventStore, MemoryPayloadStore,
//!     NodeId, OwnerId, PayloadStore, Replica, SessionSet, SyncConfig,
//! };
//!
//! let owner = OwnerId([7; 16]);
//! let now = || 1_700_000_000_000u64;
//!
//! // A replica with one local event.
//! let mut store = MemoryEventStore::new();
//! let mut payloads = MemoryPayloadStore::new();
//! let mut clock = Clock::new(NodeId([1; 8]), ClockConfig::default());
//! let t = clock.next(&now).unwrap().to_binary();
//! store.insert(&owner, t).unwrap();
//! payloads.write_payload(&owner, t, b"hello".to_vec()).unwrap();
//!
//! // An empty peer.
//! let mut peer_store = MemoryEventStore::new();
//! let mut peer_payloads = MemoryPayloadStore::new();
//! let mut peer_clock = Clock::new(NodeId([2; 8]), ClockConfig::default());
//!
//! let mut ours = SessionSet::new(SyncConfig::default());
//! let mut theirs = SessionSet::new(SyncConfig::default());
//!
//! let mut to_peer = ours
//!     .start(&mut Replica::new(&mut store, &mut payloads, &mut clock, &now), owner)
//!     .unwrap();
//! while !to_peer.is_empty() {
//!     let mut to_us = Vec::new();
//!     for message in to_peer.drain(..) {
//!         let mut replica =
//!             Replica::new(&mut peer_store, &mut peer_payloads, &mut peer_clock, &now);
//!         to_us.extend(theirs.handle(&mut replica, message).unwrap().messages);
//!     }
//!     for message in to_us {
//!         let mut replica = Replica::new(&mut store, &mut payloads, &mut clock, &now);
//!         to_peer.extend(ours.handle(&mut replica, message).unwrap().messages);
//!     }
//! }
//!
//! assert!(peer_store.contains(&owner, &t));
//! ```

pub mod buckets;
pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod listeners;
pub mod message;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod store;
pub mod timestamp;

// Re-export main types at crate root
pub use buckets::{compute_balanced_buckets, BucketConfig, DEFAULT_FAN_OUT};
pub use clock::{Clock, ClockConfig, TimeSource, DEFAULT_MAX_DRIFT_MILLIS};
pub use error::{
    ClockError, DecodeError, EncodeError, PlannerError, Result, StorageError, SyncError,
};
pub use fingerprint::{Fingerprint, FingerprintRange, FINGERPRINT_SIZE};
pub use listeners::{ErrorListeners, Unsubscribe};
pub use message::{
    abort_frame, Envelope, Message, Plaintext, Range, RangeKind, PROTOCOL_VERSION,
};
pub use payload::{Entry, MemoryPayloadStore, PayloadStore};
pub use protocol::{initial_ranges, pending_sends, process_ranges, RangeOutcome, SyncConfig};
pub use session::{Handled, Replica, Role, Session, SessionSet, SessionState, SessionStats};
pub use store::{EventStore, MemoryEventStore};
pub use timestamp::{
    BinaryTimestamp, NodeId, OwnerId, Timestamp, UpperBound, BINARY_TIMESTAMP_SIZE, MAX_MILLIS,
};
