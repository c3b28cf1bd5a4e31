//! Request handlers for sync connections.

mod websocket;

pub use websocket::*;
