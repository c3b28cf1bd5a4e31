//! Event store - the per-owner ordered timestamp set.
//!
//! [`EventStore`] is the storage capability reconciliation runs against:
//! a deduplicated set of [`BinaryTimestamp`]s per owner with ordinal access
//! and range fingerprints. Ordinal positions are the unit peers negotiate
//! in; [`EventStore::lower_bound`] converts a peer's timestamp boundary into
//! a local ordinal.
//!
//! [`MemoryEventStore`] keeps each owner's set in sorted blocks that cache
//! their own fingerprint, so inserting updates a single block digest and a
//! range fingerprint only hashes the elements of the partially covered
//! blocks at its edges.

use crate::error::StorageError;
use crate::fingerprint::{Fingerprint, FingerprintRange};
use crate::timestamp::{BinaryTimestamp, OwnerId, UpperBound};
use std::collections::HashMap;

/// Ordered, deduplicated, per-owner timestamp storage.
pub trait EventStore {
    /// Insert a timestamp. Returns `false` when it was already present.
    fn insert(&mut self, owner: &OwnerId, timestamp: BinaryTimestamp)
        -> Result<bool, StorageError>;

    /// Insert many timestamps atomically: either all of them become visible
    /// or, on error, none do. Returns the number of new timestamps.
    fn insert_batch(
        &mut self,
        owner: &OwnerId,
        timestamps: &[BinaryTimestamp],
    ) -> Result<usize, StorageError>;

    /// Number of distinct timestamps stored for `owner`; 0 if unknown.
    fn size(&self, owner: &OwnerId) -> usize;

    /// The timestamp at ordinal `index` in ascending order.
    fn timestamp_at(&self, owner: &OwnerId, index: usize) -> Result<BinaryTimestamp, StorageError>;

    /// XOR-fold of the element hashes with ordinal in `[begin, end)`.
    fn fingerprint(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
    ) -> Result<Fingerprint, StorageError>;

    /// Visit timestamps in `[begin, end)` in ascending order with their index
    /// relative to `begin`. Stops as soon as `visitor` returns `false`.
    fn iterate<F>(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
        visitor: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(BinaryTimestamp, usize) -> bool;

    /// Whether `timestamp` is stored for `owner`.
    fn contains(&self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool;

    /// Ordinal of the first timestamp in `[begin, end)` that is not below
    /// `target`, or `end` if there is none.
    fn lower_bound(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
        target: &UpperBound,
    ) -> Result<usize, StorageError> {
        check_range(begin, end, self.size(owner))?;
        let target = match target {
            UpperBound::Infinite => return Ok(end),
            UpperBound::Timestamp(t) => t,
        };
        let (mut lo, mut hi) = (begin, end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.timestamp_at(owner, mid)? < *target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Fingerprints of the ranges `[0, b_1), [b_1, b_2), ... [b_{k-1}, b_k)`.
    ///
    /// Every range's upper bound is the first timestamp it excludes; the
    /// last one is [`UpperBound::Infinite`].
    fn fingerprint_ranges(
        &self,
        owner: &OwnerId,
        boundaries: &[usize],
    ) -> Result<Vec<FingerprintRange>, StorageError> {
        self.fingerprint_ranges_from(owner, 0, boundaries, UpperBound::Infinite)
    }

    /// Like [`fingerprint_ranges`](EventStore::fingerprint_ranges) for a
    /// sub-range starting at `begin`, with absolute `boundaries` and the
    /// final range closed by `last_upper`.
    fn fingerprint_ranges_from(
        &self,
        owner: &OwnerId,
        begin: usize,
        boundaries: &[usize],
        last_upper: UpperBound,
    ) -> Result<Vec<FingerprintRange>, StorageError> {
        let mut ranges = Vec::with_capacity(boundaries.len());
        let mut previous = begin;
        for (i, &boundary) in boundaries.iter().enumerate() {
            let fingerprint = self.fingerprint(owner, previous, boundary)?;
            let upper_bound = if i + 1 == boundaries.len() {
                last_upper
            } else {
                UpperBound::Timestamp(self.timestamp_at(owner, boundary)?)
            };
            ranges.push(FingerprintRange {
                upper_bound,
                fingerprint,
            });
            previous = boundary;
        }
        Ok(ranges)
    }

    /// Collect the timestamps in `[begin, end)`.
    fn collect_range(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
    ) -> Result<Vec<BinaryTimestamp>, StorageError> {
        let mut out = Vec::with_capacity(end.saturating_sub(begin));
        self.iterate(owner, begin, end, |timestamp, _| {
            out.push(timestamp);
            true
        })?;
        Ok(out)
    }
}

fn check_range(begin: usize, end: usize, size: usize) -> Result<(), StorageError> {
    if begin > end {
        return Err(StorageError::InvalidRange { begin, end });
    }
    if end > size {
        return Err(StorageError::IndexOutOfRange { index: end, size });
    }
    Ok(())
}

/// Blocks split once they exceed this many timestamps.
const MAX_BLOCK_LEN: usize = 256;

/// A sorted run of timestamps with its cached fingerprint.
#[derive(Debug, Clone, Default)]
struct Block {
    items: Vec<BinaryTimestamp>,
    fingerprint: Fingerprint,
}

impl Block {
    fn from_items(items: Vec<BinaryTimestamp>) -> Self {
        let fingerprint = Fingerprint::of_all(&items);
        Self { items, fingerprint }
    }

    fn last(&self) -> Option<&BinaryTimestamp> {
        self.items.last()
    }
}

/// One owner's timestamps.
#[derive(Debug, Clone, Default)]
struct OwnerSet {
    blocks: Vec<Block>,
    len: usize,
}

impl OwnerSet {
    /// Index of the block that holds, or would hold, `timestamp`.
    fn block_for(&self, timestamp: &BinaryTimestamp) -> usize {
        let i = self
            .blocks
            .partition_point(|b| b.last().is_some_and(|last| last < timestamp));
        i.min(self.blocks.len().saturating_sub(1))
    }

    fn contains(&self, timestamp: &BinaryTimestamp) -> bool {
        self.blocks
            .get(self.block_for(timestamp))
            .is_some_and(|b| b.items.binary_search(timestamp).is_ok())
    }

    fn insert(&mut self, timestamp: BinaryTimestamp) -> bool {
        if self.blocks.is_empty() {
            self.blocks.push(Block::default());
        }
        let index = self.block_for(&timestamp);
        let block = &mut self.blocks[index];
        let Err(position) = block.items.binary_search(&timestamp) else {
            return false;
        };
        block.items.insert(position, timestamp);
        block.fingerprint ^= Fingerprint::of(&timestamp);
        self.len += 1;

        if block.items.len() > MAX_BLOCK_LEN {
            let tail = block.items.split_off(block.items.len() / 2);
            let tail = Block::from_items(tail);
            block.fingerprint ^= tail.fingerprint;
            self.blocks.insert(index + 1, tail);
        }
        true
    }

    fn remove(&mut self, timestamp: &BinaryTimestamp) -> bool {
        if self.blocks.is_empty() {
            return false;
        }
        let index = self.block_for(timestamp);
        let block = &mut self.blocks[index];
        let Ok(position) = block.items.binary_search(timestamp) else {
            return false;
        };
        block.items.remove(position);
        block.fingerprint ^= Fingerprint::of(timestamp);
        self.len -= 1;
        if block.items.is_empty() {
            self.blocks.remove(index);
        }
        true
    }

    /// Block index and offset of ordinal `index`.
    fn locate(&self, mut index: usize) -> Option<(usize, usize)> {
        for (i, block) in self.blocks.iter().enumerate() {
            if index < block.items.len() {
                return Some((i, index));
            }
            index -= block.items.len();
        }
        None
    }

    /// Number of timestamps strictly below `target`.
    fn rank(&self, target: &BinaryTimestamp) -> usize {
        let mut rank = 0;
        for block in &self.blocks {
            match block.last() {
                Some(last) if last < target => rank += block.items.len(),
                _ => return rank + block.items.partition_point(|t| t < target),
            }
        }
        rank
    }

    fn fingerprint(&self, begin: usize, end: usize) -> Fingerprint {
        let mut fingerprint = Fingerprint::ZERO;
        let mut offset = 0;
        for block in &self.blocks {
            let block_end = offset + block.items.len();
            if block_end <= begin {
                offset = block_end;
                continue;
            }
            if offset >= end {
                break;
            }
            if begin <= offset && block_end <= end {
                fingerprint ^= block.fingerprint;
            } else {
                let from = begin.saturating_sub(offset);
                let to = end.min(block_end) - offset;
                fingerprint ^= Fingerprint::of_all(&block.items[from..to]);
            }
            offset = block_end;
        }
        fingerprint
    }

    fn iter_from(&self, begin: usize) -> impl Iterator<Item = &BinaryTimestamp> + '_ {
        let (block, offset) = self.locate(begin).unwrap_or((self.blocks.len(), 0));
        self.blocks
            .iter()
            .skip(block)
            .flat_map(|b| b.items.iter())
            .skip(offset)
    }
}

/// In-memory [`EventStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    owners: HashMap<OwnerId, OwnerSet>,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a timestamp. Returns `false` if it was not present.
    ///
    /// Used to roll back a batch whose durable write failed.
    pub fn remove(&mut self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool {
        let Some(set) = self.owners.get_mut(owner) else {
            return false;
        };
        let removed = set.remove(timestamp);
        if set.len == 0 {
            self.owners.remove(owner);
        }
        removed
    }

    /// Owners with at least one timestamp.
    pub fn owners(&self) -> impl Iterator<Item = &OwnerId> {
        self.owners.keys()
    }

    /// Total number of timestamps across all owners.
    pub fn total_len(&self) -> usize {
        self.owners.values().map(|s| s.len).sum()
    }
}

impl EventStore for MemoryEventStore {
    fn insert(
        &mut self,
        owner: &OwnerId,
        timestamp: BinaryTimestamp,
    ) -> Result<bool, StorageError> {
        Ok(self.owners.entry(*owner).or_default().insert(timestamp))
    }

    fn insert_batch(
        &mut self,
        owner: &OwnerId,
        timestamps: &[BinaryTimestamp],
    ) -> Result<usize, StorageError> {
        // In-memory inserts cannot fail part way, so the batch is atomic.
        if timestamps.is_empty() {
            return Ok(0);
        }
        let set = self.owners.entry(*owner).or_default();
        Ok(timestamps.iter().filter(|t| set.insert(**t)).count())
    }

    fn size(&self, owner: &OwnerId) -> usize {
        self.owners.get(owner).map_or(0, |s| s.len)
    }

    fn timestamp_at(&self, owner: &OwnerId, index: usize) -> Result<BinaryTimestamp, StorageError> {
        let size = self.size(owner);
        self.owners
            .get(owner)
            .and_then(|set| {
                set.locate(index)
                    .map(|(block, offset)| set.blocks[block].items[offset])
            })
            .ok_or(StorageError::IndexOutOfRange { index, size })
    }

    fn fingerprint(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
    ) -> Result<Fingerprint, StorageError> {
        check_range(begin, end, self.size(owner))?;
        Ok(self
            .owners
            .get(owner)
            .map_or(Fingerprint::ZERO, |set| set.fingerprint(begin, end)))
    }

    fn iterate<F>(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
        mut visitor: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(BinaryTimestamp, usize) -> bool,
    {
        check_range(begin, end, self.size(owner))?;
        let Some(set) = self.owners.get(owner) else {
            return Ok(());
        };
        for (i, timestamp) in set.iter_from(begin).take(end - begin).enumerate() {
            if !visitor(*timestamp, i) {
                break;
            }
        }
        Ok(())
    }

    fn contains(&self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool {
        self.owners
            .get(owner)
            .is_some_and(|set| set.contains(timestamp))
    }

    fn lower_bound(
        &self,
        owner: &OwnerId,
        begin: usize,
        end: usize,
        target: &UpperBound,
    ) -> Result<usize, StorageError> {
        check_range(begin, end, self.size(owner))?;
        let rank = match (target, self.owners.get(owner)) {
            (UpperBound::Infinite, _) | (_, None) => end,
            (UpperBound::Timestamp(t), Some(set)) => set.rank(t),
        };
        Ok(rank.clamp(begin, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::{compute_balanced_buckets, BucketConfig};
    use crate::timestamp::{NodeId, Timestamp};

    const OWNER: OwnerId = OwnerId([1; 16]);
    const OTHER: OwnerId = OwnerId([2; 16]);

    fn bt(millis: u64, counter: u16) -> BinaryTimestamp {
        Timestamp::new(millis, counter, NodeId([0; 8]))
            .unwrap()
            .to_binary()
    }

    fn store_with(millis: impl IntoIterator<Item = u64>) -> MemoryEventStore {
        let mut store = MemoryEventStore::new();
        for m in millis {
            store.insert(&OWNER, bt(m, 0)).unwrap();
        }
        store
    }

    #[test]
    fn empty_store() {
        let store = MemoryEventStore::new();
        assert_eq!(store.size(&OWNER), 0);
        assert_eq!(store.fingerprint(&OWNER, 0, 0).unwrap().0, [0u8; 12]);
        assert_eq!(
            store
                .lower_bound(&OWNER, 0, 0, &UpperBound::Timestamp(bt(1, 0)))
                .unwrap(),
            0
        );
        assert!(store.fingerprint_ranges(&OWNER, &[]).unwrap().is_empty());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut store = MemoryEventStore::new();
        assert!(store.insert(&OWNER, bt(1, 0)).unwrap());
        let fingerprint = store.fingerprint(&OWNER, 0, 1).unwrap();
        assert!(!store.insert(&OWNER, bt(1, 0)).unwrap());
        assert_eq!(store.size(&OWNER), 1);
        assert_eq!(store.fingerprint(&OWNER, 0, 1).unwrap(), fingerprint);
    }

    #[test]
    fn owners_are_isolated() {
        let mut store = store_with(1..=5);
        store.insert(&OTHER, bt(100, 0)).unwrap();
        assert_eq!(store.size(&OWNER), 5);
        assert_eq!(store.size(&OTHER), 1);
        assert!(!store.contains(&OWNER, &bt(100, 0)));
        assert!(store.contains(&OTHER, &bt(100, 0)));
    }

    #[test]
    fn timestamp_at_out_of_range() {
        let store = store_with(1..=3);
        assert_eq!(store.timestamp_at(&OWNER, 2).unwrap(), bt(3, 0));
        assert_eq!(
            store.timestamp_at(&OWNER, 3),
            Err(StorageError::IndexOutOfRange { index: 3, size: 3 })
        );
        assert_eq!(
            store.timestamp_at(&OTHER, 0),
            Err(StorageError::IndexOutOfRange { index: 0, size: 0 })
        );
    }

    #[test]
    fn lower_bound_counter_breaks_ties() {
        let store = store_with(1..=10);
        let lb = |t| store.lower_bound(&OWNER, 0, 10, &UpperBound::Timestamp(t)).unwrap();
        assert_eq!(lb(bt(2, 0)), 1);
        assert_eq!(lb(bt(2, 1)), 2);
        assert_eq!(lb(bt(1, 0)), 0);
        assert_eq!(lb(bt(0, 0)), 0);
        assert_eq!(lb(bt(11, 0)), 10);
        assert_eq!(
            store
                .lower_bound(&OWNER, 0, 10, &UpperBound::Infinite)
                .unwrap(),
            10
        );
    }

    #[test]
    fn lower_bound_clamps_to_sub_range() {
        let store = store_with(1..=10);
        let lb = |begin, end, t| {
            store
                .lower_bound(&OWNER, begin, end, &UpperBound::Timestamp(t))
                .unwrap()
        };
        assert_eq!(lb(3, 7, bt(1, 0)), 3);
        assert_eq!(lb(3, 7, bt(6, 0)), 5);
        assert_eq!(lb(3, 7, bt(10, 0)), 7);
        assert_eq!(lb(4, 4, bt(6, 0)), 4);
    }

    #[test]
    fn default_lower_bound_matches_block_search() {
        struct Plain<'a>(&'a MemoryEventStore);

        // Forwards everything except lower_bound, which uses the provided
        // binary search.
        impl EventStore for Plain<'_> {
            fn insert(&mut self, _: &OwnerId, _: BinaryTimestamp) -> Result<bool, StorageError> {
                unreachable!()
            }
            fn insert_batch(
                &mut self,
                _: &OwnerId,
                _: &[BinaryTimestamp],
            ) -> Result<usize, StorageError> {
                unreachable!()
            }
            fn size(&self, owner: &OwnerId) -> usize {
                self.0.size(owner)
            }
            fn timestamp_at(
                &self,
                owner: &OwnerId,
                index: usize,
            ) -> Result<BinaryTimestamp, StorageError> {
                self.0.timestamp_at(owner, index)
            }
            fn fingerprint(
                &self,
                owner: &OwnerId,
                begin: usize,
                end: usize,
            ) -> Result<Fingerprint, StorageError> {
                self.0.fingerprint(owner, begin, end)
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
                self.0.iterate(owner, begin, end, visitor)
            }
            fn contains(&self, owner: &OwnerId, timestamp: &BinaryTimestamp) -> bool {
                self.0.contains(owner, timestamp)
            }
        }

        let store = store_with((0..1000).map(|i| i * 2));
        let plain = Plain(&store);
        for millis in [0, 1, 2, 501, 998, 1999, 2000, 5000] {
            let target = UpperBound::Timestamp(bt(millis, 0));
            for (begin, end) in [(0, 1000), (100, 900), (500, 500)] {
                assert_eq!(
                    plain.lower_bound(&OWNER, begin, end, &target).unwrap(),
                    store.lower_bound(&OWNER, begin, end, &target).unwrap(),
                    "target {millis} in [{begin}, {end})"
                );
            }
        }
    }

    #[test]
    fn blocks_split_and_stay_sorted() {
        // Descending inserts always hit the first block.
        let store = store_with((0..2000).rev());
        assert_eq!(store.size(&OWNER), 2000);
        let all = store.collect_range(&OWNER, 0, 2000).unwrap();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.timestamp_at(&OWNER, 1234).unwrap(), bt(1234, 0));
        assert!(store.owners[&OWNER].blocks.len() > 1);
    }

    #[test]
    fn fingerprint_matches_brute_force_on_every_range() {
        let store = store_with((0..700).map(|i| i * 7 % 1000));
        let all = store.collect_range(&OWNER, 0, 700).unwrap();
        for (begin, end) in [(0, 700), (0, 1), (1, 699), (255, 257), (256, 512), (300, 300)] {
            assert_eq!(
                store.fingerprint(&OWNER, begin, end).unwrap(),
                Fingerprint::of_all(&all[begin..end]),
                "range [{begin}, {end})"
            );
        }
    }

    #[test]
    fn fingerprint_rejects_bad_ranges() {
        let store = store_with(1..=3);
        assert_eq!(
            store.fingerprint(&OWNER, 0, 4),
            Err(StorageError::IndexOutOfRange { index: 4, size: 3 })
        );
        assert_eq!(
            store.fingerprint(&OWNER, 2, 1),
            Err(StorageError::InvalidRange { begin: 2, end: 1 })
        );
    }

    #[test]
    fn fingerprint_ranges_partition_the_set() {
        let store = store_with(0..100);
        let boundaries = compute_balanced_buckets(100, &BucketConfig::default()).unwrap();
        let ranges = store.fingerprint_ranges(&OWNER, &boundaries).unwrap();

        assert_eq!(ranges.len(), boundaries.len());
        assert_eq!(ranges.last().unwrap().upper_bound, UpperBound::Infinite);
        let mut previous = 0;
        for (range, &boundary) in ranges.iter().zip(&boundaries) {
            assert_eq!(
                range.fingerprint,
                store.fingerprint(&OWNER, previous, boundary).unwrap()
            );
            if boundary < 100 {
                assert_eq!(
                    range.upper_bound,
                    UpperBound::Timestamp(store.timestamp_at(&OWNER, boundary).unwrap())
                );
            }
            previous = boundary;
        }
        let combined: Fingerprint = ranges.iter().map(|r| r.fingerprint).collect();
        assert_eq!(combined, store.fingerprint(&OWNER, 0, 100).unwrap());
    }

    #[test]
    fn iterate_stops_early() {
        let store = store_with(1..=10);
        let mut seen = Vec::new();
        store
            .iterate(&OWNER, 2, 10, |t, i| {
                assert_eq!(i, seen.len());
                seen.push(t);
                seen.len() < 3
            })
            .unwrap();
        assert_eq!(seen, vec![bt(3, 0), bt(4, 0), bt(5, 0)]);
    }

    #[test]
    fn remove_restores_previous_state() {
        let mut store = store_with(1..=5);
        let before = store.fingerprint(&OWNER, 0, 5).unwrap();
        store.insert(&OWNER, bt(10, 0)).unwrap();
        assert!(store.remove(&OWNER, &bt(10, 0)));
        assert!(!store.remove(&OWNER, &bt(10, 0)));
        assert_eq!(store.size(&OWNER), 5);
        assert_eq!(store.fingerprint(&OWNER, 0, 5).unwrap(), before);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn history() -> impl Strategy<Value = Vec<BinaryTimestamp>> {
            prop::collection::vec((0u64..5_000, 0u16..4), 0..600)
                .prop_map(|items| items.into_iter().map(|(m, c)| bt(m, c)).collect())
        }

        fn build(items: &[BinaryTimestamp]) -> MemoryEventStore {
            let mut store = MemoryEventStore::new();
            for t in items {
                store.insert(&OWNER, *t).unwrap();
            }
            store
        }

        proptest! {
            #[test]
            fn double_insert_changes_nothing(items in history()) {
                let once = build(&items);
                let mut twice = build(&items);
                for t in items.iter().rev() {
                    prop_assert!(!twice.insert(&OWNER, *t).unwrap());
                }
                let size = once.size(&OWNER);
                prop_assert_eq!(twice.size(&OWNER), size);
                prop_assert_eq!(
                    twice.fingerprint(&OWNER, 0, size).unwrap(),
                    once.fingerprint(&OWNER, 0, size).unwrap()
                );
            }

            #[test]
            fn insertion_order_is_irrelevant(items in history()) {
                let mut sorted = items.clone();
                sorted.sort();
                let mut reversed = sorted.clone();
                reversed.reverse();

                let a = build(&items);
                let b = build(&sorted);
                let c = build(&reversed);
                let size = a.size(&OWNER);
                prop_assert_eq!(b.size(&OWNER), size);
                prop_assert_eq!(c.size(&OWNER), size);
                let fp = a.fingerprint(&OWNER, 0, size).unwrap();
                prop_assert_eq!(b.fingerprint(&OWNER, 0, size).unwrap(), fp);
                prop_assert_eq!(c.fingerprint(&OWNER, 0, size).unwrap(), fp);
            }

            #[test]
            fn fingerprint_equals_independent_fold(items in history()) {
                let store = build(&items);
                let mut unique = items.clone();
                unique.sort();
                unique.dedup();
                prop_assert_eq!(
                    store.fingerprint(&OWNER, 0, store.size(&OWNER)).unwrap(),
                    Fingerprint::of_all(&unique)
                );
            }

            #[test]
            fn bucket_ranges_cover_the_set(items in history(), fan_out in 1usize..40) {
                let store = build(&items);
                let size = store.size(&OWNER);
                let config = BucketConfig { fan_out };
                let boundaries = compute_balanced_buckets(size as i64, &config).unwrap();
                let ranges = store.fingerprint_ranges(&OWNER, &boundaries).unwrap();

                let combined: Fingerprint = ranges.iter().map(|r| r.fingerprint).collect();
                prop_assert_eq!(combined, store.fingerprint(&OWNER, 0, size).unwrap());
                let mut previous = 0;
                let mut counted = 0;
                for &boundary in &boundaries {
                    counted += boundary - previous;
                    previous = boundary;
                }
                prop_assert_eq!(counted, size);
            }

            #[test]
            fn lower_bound_finds_smallest_not_less(
                items in history(),
                point in (0u64..5_100, 0u16..4),
            ) {
                let store = build(&items);
                let size = store.size(&OWNER);
                let target = bt(point.0, point.1);
                let index = store
                    .lower_bound(&OWNER, 0, size, &UpperBound::Timestamp(target))
                    .unwrap();

                let all = store.collect_range(&OWNER, 0, size).unwrap();
                match all.iter().position(|t| *t >= target) {
                    Some(expected) => {
                        prop_assert_eq!(index, expected);
                        prop_assert_eq!(store.timestamp_at(&OWNER, index).unwrap(), all[expected]);
                    }
                    None => prop_assert_eq!(index, size),
                }
            }
        }
    }
}
