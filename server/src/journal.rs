//! Insert journal over the in-memory index.
//!
//! The storage worker runs each protocol message against a [`JournaledStore`]
//! so it knows exactly which timestamps the message added. Those are then
//! written to SQLite; if the write fails they are taken out of memory again.

use accord_engine::{
    BinaryTimestamp, EventStore, Fingerprint, MemoryEventStore, OwnerId, StorageError, UpperBound,
};

/// An [`EventStore`] that can take a timestamp back out.
pub trait Retract {
    /// Remove `timestamp`. Returns `false` when it was not present.
    fn retract(&mut self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool;
}

impl Retract for MemoryEventStore {
    fn retract(&mut self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool {
        self.remove(owner, timestamp)
    }
}

/// [`EventStore`] wrapper recording every newly inserted timestamp.
pub struct JournaledStore<'a, S> {
    inner: &'a mut S,
    added: Vec<(OwnerId, BinaryTimestamp)>,
}

impl<'a, S: EventStore + Retract> JournaledStore<'a, S> {
    pub fn new(inner: &'a mut S) -> Self {
        Self {
            inner,
            added: Vec::new(),
        }
    }

    /// Timestamps added through this wrapper, in insertion order.
    pub fn into_added(self) -> Vec<(OwnerId, BinaryTimestamp)> {
        self.added
    }
}

/// Take journaled timestamps back out of the index.
pub fn roll_back<S: Retract>(added: &[(OwnerId, BinaryTimestamp)], store: &mut S) {
    for (owner, timestamp) in added {
        store.retract(owner, timestamp);
    }
}

impl<S: EventStore + Retract> EventStore for JournaledStore<'_, S> {
    fn insert(
        &mut self,
        owner: &OwnerId,
        timestamp: BinaryTimestamp,
    ) -> Result<bool, StorageError> {
        let new = self.inner.insert(owner, timestamp)?;
        if new {
            self.added.push((*owner, timestamp));
        }
        Ok(new)
    }

    fn insert_batch(
        &mut self,
        owner: &OwnerId,
        timestamps: &[BinaryTimestamp],
    ) -> Result<usize, StorageError> {
        let mark = self.added.len();
        for timestamp in timestamps {
            if let Err(e) = self.insert(owner, *timestamp) {
                let partial: Vec<_> = self.added.drain(mark..).collect();
                roll_back(&partial, self.inner);
                return Err(e);
            }
        }
        Ok(self.added.len() - mark)
    }

    fn size(&self, owner: &OwnerId) -> usize {
        self.inner.size(owner)
    }

    fn timestamp_at(&self, owner: &OwnerId, index: usize) -> Result<BinaryTimestamp, StorageError> {
        self.inner.timestamp_at(owner, index)
    }

    fn fingerprint(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
    ) -> Result<Fingerprint, StorageError> {
        self.inner.fingerprint(owner, begin, end)
    }

    fn iterate<F>(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
        visitor: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(BinaryTimestamp, usize) -> bool,
    {
        self.inner.iterate(owner, begin, end, visitor)
    }

    fn contains(&self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool {
        self.inner.contains(owner, timestamp)
    }

    fn lower_bound(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
        target: &UpperBound,
    ) -> Result<usize, StorageError> {
        self.inner.lower_bound(owner, begin, end, target)
    }
}
