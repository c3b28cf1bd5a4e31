//! Range-based set reconciliation.
//!
//! # Algorithm
//!
//! 1. The initiator splits its whole set into balanced buckets and
//!    advertises `(upper bound, fingerprint)` for each
//! 2. The receiver translates every upper bound into its own ordinal with
//!    `lower_bound` and compares fingerprints range by range
//! 3. Equal ranges are answered with `Skip`; differing ranges are split
//!    again over the receiver's elements and advertised back
//! 4. Once a differing range is small enough (or the round limit is hit)
//!    the concrete timestamps are sent instead; the other side answers with
//!    the entries the sender lacks and asks for the ones it lacks itself
//! 5. A message made only of `Skip` ranges ends the exchange
//!
//! Both sides run the same [`process_ranges`] step, so the protocol is
//! symmetric apart from who sends the first advertisement.

use crate::buckets::{compute_balanced_buckets, BucketConfig};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::message::{Range, RangeKind};
use crate::store::EventStore;
use crate::timestamp::{BinaryTimestamp, OwnerId, UpperBound};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default size below which a differing range is resolved by listing
/// timestamps.
pub const DEFAULT_LEAF_THRESHOLD: usize = 16;

/// Default limit on refinement rounds processed by one side.
pub const DEFAULT_MAX_DEPTH: usize = 12;

/// Reconciliation tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Bucket planning per round
    pub bucket: BucketConfig,
    /// Ranges with at most this many local elements are listed, not split
    pub leaf_threshold: usize,
    /// After this many rounds every differing range is listed
    pub max_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bucket: BucketConfig::default(),
            leaf_threshold: DEFAULT_LEAF_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Result of processing one incoming range advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOutcome {
    /// The reply advertisement
    pub ranges: Vec<Range>,
    /// Local timestamps the peer lacks
    pub send: Vec<BinaryTimestamp>,
    /// Peer timestamps we lack
    pub need: Vec<BinaryTimestamp>,
}

impl RangeOutcome {
    /// Whether the reply carries nothing but `Skip`.
    pub fn is_converged(&self) -> bool {
        self.ranges.iter().all(Range::is_skip)
    }

    fn push_skip(&mut self, upper_bound: UpperBound) {
        match self.ranges.last_mut() {
            Some(last) if last.is_skip() => last.upper_bound = upper_bound,
            _ => self.ranges.push(Range::skip(upper_bound)),
        }
    }
}

/// The top-level advertisement of an owner's whole set.
pub fn initial_ranges<S: EventStore>(
    store: &S,
    owner: &OwnerId,
    config: &SyncConfig,
) -> Result<Vec<Range>> {
    let size = store.size(owner);
    if size == 0 {
        return Ok(vec![Range::fingerprint(
            UpperBound::Infinite,
            Fingerprint::ZERO,
        )]);
    }
    let boundaries = compute_balanced_buckets(size as i64, &config.bucket)?;
    Ok(store
        .fingerprint_ranges(owner, &boundaries)?
        .into_iter()
        .map(Range::from)
        .collect())
}

/// Compare a peer's advertisement against the local set and build the reply.
///
/// `round` counts the advertisements this side has processed in the current
/// cycle; from `config.max_depth` on, differing ranges are always listed.
pub fn process_ranges<S: EventStore>(
    store: &S,
    owner: &OwnerId,
    incoming: &[Range],
    round: usize,
    config: &SyncConfig,
) -> Result<RangeOutcome> {
    let size = store.size(owner);
    let mut outcome = RangeOutcome::default();
    let mut begin = 0;

    for range in incoming {
        let end = store.lower_bound(owner, begin, size, &range.upper_bound)?;
        match &range.kind {
            RangeKind::Skip => outcome.push_skip(range.upper_bound),
            RangeKind::Fingerprint(theirs) => {
                if store.fingerprint(owner, begin, end)? == *theirs {
                    outcome.push_skip(range.upper_bound);
                } else {
                    refine(store, owner, begin, end, range.upper_bound, round, config, &mut outcome)?;
                }
            }
            RangeKind::Timestamps(theirs) => {
                let ours = store.collect_range(owner, begin, end)?;
                diff_sorted(&ours, theirs, &mut outcome.send, &mut outcome.need);
                outcome.push_skip(range.upper_bound);
            }
        }
        begin = end;
    }
    Ok(outcome)
}

/// Local timestamps that answering `incoming` will send to the peer.
///
/// Only listed ranges send entries, so this is what [`process_ranges`]
/// returns in [`RangeOutcome::send`], computed without building the reply.
/// Stores that keep payloads out of memory use it to fetch them ahead of
/// the session.
pub fn pending_sends<S: EventStore>(
    store: &S,
    owner: &OwnerId,
    incoming: &[Range],
) -> Result<Vec<BinaryTimestamp>> {
    let size = store.size(owner);
    let (mut send, mut need) = (Vec::new(), Vec::new());
    let mut begin = 0;

    for range in incoming {
        let end = store.lower_bound(owner, begin, size, &range.upper_bound)?;
        if let RangeKind::Timestamps(theirs) = &range.kind {
            let ours = store.collect_range(owner, begin, end)?;
            diff_sorted(&ours, theirs, &mut send, &mut need);
        }
        begin = end;
    }
    Ok(send)
}

#[allow(clippy::too_many_arguments)]
fn refine<S: EventStore>(
    store: &S,
    owner: &OwnerId,
    begin: usize,
    end: usize,
    upper_bound: UpperBound,
    round: usize,
    config: &SyncConfig,
    outcome: &mut RangeOutcome,
) -> Result<()> {
    let count = end - begin;
    if count <= config.leaf_threshold || round >= config.max_depth {
        let timestamps = store.collect_range(owner, begin, end)?;
        outcome.ranges.push(Range::timestamps(upper_bound, timestamps));
        return Ok(());
    }
    let boundaries: Vec<usize> = compute_balanced_buckets(count as i64, &config.bucket)?
        .into_iter()
        .map(|b| begin + b)
        .collect();
    outcome.ranges.extend(
        store
            .fingerprint_ranges_from(owner, begin, &boundaries, upper_bound)?
            .into_iter()
            .map(Range::from),
    );
    Ok(())
}

/// Split two ascending lists into `ours − theirs` and `theirs − ours`.
fn diff_sorted(
    ours: &[BinaryTimestamp],
    theirs: &[BinaryTimestamp],
    only_ours: &mut Vec<BinaryTimestamp>,
    only_theirs: &mut Vec<BinaryTimestamp>,
) {
    let (mut i, mut j) = (0, 0);
    while i < ours.len() && j < theirs.len() {
        match ours[i].cmp(&theirs[j]) {
            Ordering::Less => {
                only_ours.push(ours[i]);
                i += 1;
            }
            Ordering::Greater => {
                only_theirs.push(theirs[j]);
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    only_ours.extend_from_slice(&ours[i..]);
    only_theirs.extend_from_slice(&theirs[j..]);
}
