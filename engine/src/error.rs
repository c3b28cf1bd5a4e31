//! Error types for the Accord engine.
//!
//! Each fallible concern has its own closed enum so callers can match
//! exhaustively. [`SyncError`] is the umbrella used by reconciliation
//! sessions.

use crate::session::SessionState;
use thiserror::Error;

/// Errors from the hybrid logical clock.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    #[error("clock drift: next millis {next} leads local time {now} beyond the drift bound")]
    Drift { next: u64, now: u64 },

    #[error("counter overflow within millis {millis}")]
    CounterOverflow { millis: u64 },

    #[error("time out of range: {0}")]
    TimeOutOfRange(u64),
}

/// Errors from decoding binary timestamps and wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("unknown range kind: {0}")]
    UnknownRangeKind(u8),

    #[error("unknown bound tag: {0}")]
    UnknownBoundTag(u8),

    #[error("malformed ranges: {0}")]
    MalformedRanges(&'static str),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Errors from encoding wire messages.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("length {len} does not fit a u32 length prefix")]
    TooLong { len: usize },
}

/// Errors from the storage handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("index {index} out of range for size {size}")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("invalid range [{begin}, {end})")]
    InvalidRange { begin: usize, end: usize },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Invalid input to bucket planning.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PlannerError {
    #[error("negative element count: {0}")]
    NegativeCount(i64),

    #[error("fan-out must be positive")]
    ZeroFanOut,
}

/// Errors surfaced by reconciliation sessions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error("unexpected {message} message in state {state:?}")]
    UnexpectedMessage {
        state: SessionState,
        message: &'static str,
    },

    #[error("expected ranges round {expected}, got {actual}")]
    UnexpectedRound { expected: u32, actual: u32 },

    #[error("session aborted")]
    Aborted,
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SyncError>;
