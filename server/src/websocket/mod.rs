//! WebSocket support for real-time sync.
//!
//! Clients connect via WebSocket and exchange binary protocol frames. Entries
//! a client uploads are relayed to the other connections that sync the same
//! owner.

mod manager;

pub use manager::{ConnectionManager, FrameSender};
