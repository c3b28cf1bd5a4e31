//! Timestamps and their order-preserving binary encoding.
//!
//! A [`BinaryTimestamp`] is 16 bytes laid out as
//!
//! ```text
//! | millis (6 bytes BE) | counter (2 bytes BE) | node id (8 bytes) |
//! ```
//!
//! so unsigned byte-wise comparison is exactly timestamp order. It is the
//! only key used for storage and fingerprinting.

use crate::error::{ClockError, DecodeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of an encoded timestamp in bytes.
pub const BINARY_TIMESTAMP_SIZE: usize = 16;

/// Largest representable millis value (48 bits).
pub const MAX_MILLIS: u64 = (1 << 48) - 1;

/// Per-device identifier, the final tie-break of timestamp order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 8]);

impl NodeId {
    /// Parse a node id from 16 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        let bytes = hex::decode(s).map_err(|_| DecodeError::InvalidLength {
            expected: 8,
            actual: s.len() / 2,
        })?;
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::InvalidLength {
                expected: 8,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// Binary identity of an owner. Every owner has its own timestamp set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OwnerId(pub [u8; 16]);

impl OwnerId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl TryFrom<&[u8]> for OwnerId {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; 16] = bytes.try_into().map_err(|_| DecodeError::InvalidLength {
            expected: 16,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({self})")
    }
}

/// A hybrid logical clock value.
///
/// Ordering rules:
/// 1. Higher millis wins
/// 2. If millis equal, higher counter wins
/// 3. If both equal, byte-wise higher node id wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Wall-clock derived milliseconds, monotonic per node
    pub millis: u64,
    /// Disambiguates events within the same millisecond
    pub counter: u16,
    /// The node that issued this timestamp
    pub node_id: NodeId,
}

impl Timestamp {
    /// Create a timestamp, rejecting millis that do not fit in 48 bits.
    pub fn new(millis: u64, counter: u16, node_id: NodeId) -> Result<Self, ClockError> {
        if millis > MAX_MILLIS {
            return Err(ClockError::TimeOutOfRange(millis));
        }
        Ok(Self {
            millis,
            counter,
            node_id,
        })
    }

    /// Encode to the 16-byte order-preserving form.
    pub fn to_binary(&self) -> BinaryTimestamp {
        let mut bytes = [0u8; BINARY_TIMESTAMP_SIZE];
        bytes[..6].copy_from_slice(&(self.millis & MAX_MILLIS).to_be_bytes()[2..]);
        bytes[6..8].copy_from_slice(&self.counter.to_be_bytes());
        bytes[8..].copy_from_slice(&self.node_id.0);
        BinaryTimestamp(bytes)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04x}-{}", self.millis, self.counter, self.node_id)
    }
}

/// A timestamp encoded so that byte order equals timestamp order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinaryTimestamp(pub [u8; BINARY_TIMESTAMP_SIZE]);

impl BinaryTimestamp {
    pub fn as_bytes(&self) -> &[u8; BINARY_TIMESTAMP_SIZE] {
        &self.0
    }

    /// Decode back into a [`Timestamp`]. Every 16-byte value is valid.
    pub fn to_timestamp(&self) -> Timestamp {
        let mut millis = [0u8; 8];
        millis[2..].copy_from_slice(&self.0[..6]);
        let counter = u16::from_be_bytes([self.0[6], self.0[7]]);
        let mut node_id = [0u8; 8];
        node_id.copy_from_slice(&self.0[8..]);
        Timestamp {
            millis: u64::from_be_bytes(millis),
            counter,
            node_id: NodeId(node_id),
        }
    }
}

impl TryFrom<&[u8]> for BinaryTimestamp {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; BINARY_TIMESTAMP_SIZE] =
            bytes.try_into().map_err(|_| DecodeError::InvalidLength {
                expected: BINARY_TIMESTAMP_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }
}

impl From<Timestamp> for BinaryTimestamp {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.to_binary()
    }
}

impl fmt::Debug for BinaryTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryTimestamp({})", self.to_timestamp())
    }
}

/// Exclusive upper bound of a range of timestamps.
///
/// Variant order matters: `Infinite` sorts after every timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpperBound {
    Timestamp(BinaryTimestamp),
    /// No further elements.
    Infinite,
}

impl UpperBound {
    /// Whether `timestamp` lies strictly below this bound.
    pub fn admits(&self, timestamp: &BinaryTimestamp) -> bool {
        match self {
            UpperBound::Timestamp(bound) => timestamp < bound,
            UpperBound::Infinite => true,
        }
    }
}

impl From<BinaryTimestamp> for UpperBound {
    fn from(timestamp: BinaryTimestamp) -> Self {
        UpperBound::Timestamp(timestamp)
    }
}
