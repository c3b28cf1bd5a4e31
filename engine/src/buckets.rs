//! Balanced bucket planning.
//!
//! A reconciliation round splits a range of `count` elements into at most
//! `fan_out` contiguous buckets whose sizes differ by at most one. The
//! returned boundaries are the exclusive end ordinal of each bucket.

use crate::error::PlannerError;
use serde::{Deserialize, Serialize};

/// Default number of buckets per round.
pub const DEFAULT_FAN_OUT: usize = 16;

/// Bucket planning configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    /// Maximum number of buckets per round
    pub fan_out: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

/// Compute strictly increasing bucket boundaries in `[1, count]`, the last
/// equal to `count`.
///
/// Larger buckets come first when `count` does not divide evenly. A count
/// of zero yields no buckets.
pub fn compute_balanced_buckets(
    count: i64,
    config: &BucketConfig,
) -> Result<Vec<usize>, PlannerError> {
    if count < 0 {
        return Err(PlannerError::NegativeCount(count));
    }
    if config.fan_out == 0 {
        return Err(PlannerError::ZeroFanOut);
    }
    let count = count as usize;
    let buckets = config.fan_out.min(count);
    if buckets == 0 {
        return Ok(Vec::new());
    }

    let per_bucket = count / buckets;
    let extra = count % buckets;

    let mut boundaries = Vec::with_capacity(buckets);
    let mut end = 0;
    for i in 0..buckets {
        end += per_bucket + usize::from(i < extra);
        boundaries.push(end);
    }
    Ok(boundaries)
}
