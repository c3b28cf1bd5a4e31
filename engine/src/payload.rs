//! Entry payloads.
//!
//! The event store only knows timestamps. The bytes that travel with them
//! belong to the mutation layer, reached through [`PayloadStore`]. Payloads
//! are opaque here; they arrive already encrypted.

use crate::error::StorageError;
use crate::timestamp::{BinaryTimestamp, OwnerId};
use std::collections::HashMap;

/// A timestamp with its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub timestamp: BinaryTimestamp,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(timestamp: BinaryTimestamp, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }
}

/// Access to the payloads stored alongside timestamps.
pub trait PayloadStore {
    fn read_payload(
        &self,
        owner: &OwnerId,
        timestamp: &BinaryTimestamp,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    fn write_payload(
        &mut self,
        owner: &OwnerId,
        timestamp: BinaryTimestamp,
        payload: Vec<u8>,
    ) -> Result<(), StorageError>;
}

/// In-memory [`PayloadStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPayloadStore {
    payloads: HashMap<(OwnerId, BinaryTimestamp), Vec<u8>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a payload, returning it if present.
    pub fn remove(&mut self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> Option<Vec<u8>> {
        self.payloads.remove(&(*owner, *timestamp))
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn read_payload(
        &self,
        owner: &OwnerId,
        timestamp: &BinaryTimestamp,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.payloads.get(&(*owner, *timestamp)).cloned())
    }

    fn write_payload(
        &mut self,
        owner: &OwnerId,
        timestamp: BinaryTimestamp,
        payload: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.payloads.insert((*owner, timestamp), payload);
        Ok(())
    }
}
