//! Hybrid logical clock for causal ordering of mutations.
//!
//! The clock keeps the last issued `(millis, counter)` pair. Local events
//! advance it with [`Clock::next`]; timestamps learned from peers are merged
//! with [`Clock::receive`], which refuses values that lead local wall-clock
//! time by more than the configured drift bound.

use crate::error::ClockError;
use crate::timestamp::{NodeId, Timestamp, MAX_MILLIS};
use serde::{Deserialize, Serialize};

/// Default bound on how far a timestamp may lead wall-clock time (5 minutes).
pub const DEFAULT_MAX_DRIFT_MILLIS: u64 = 5 * 60 * 1000;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait TimeSource {
    fn now_millis(&self) -> u64;
}

impl<F> TimeSource for F
where
    F: Fn() -> u64,
{
    fn now_millis(&self) -> u64 {
        self()
    }
}

/// Clock configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockConfig {
    /// Maximum lead of a timestamp over local wall-clock time
    pub max_drift_millis: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_drift_millis: DEFAULT_MAX_DRIFT_MILLIS,
        }
    }
}

/// A hybrid logical clock owned by one node.
///
/// Every timestamp returned by [`next`](Clock::next) or
/// [`receive`](Clock::receive) is strictly greater than all timestamps
/// previously issued or merged by this clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clock {
    node_id: NodeId,
    millis: u64,
    counter: u16,
    config: ClockConfig,
}

impl Clock {
    /// Create a clock starting at millis 0.
    pub fn new(node_id: NodeId, config: ClockConfig) -> Self {
        Self {
            node_id,
            millis: 0,
            counter: 0,
            config,
        }
    }

    /// Restore a clock from a previously observed timestamp.
    pub fn restore(last: Timestamp, config: ClockConfig) -> Self {
        Self {
            node_id: last.node_id,
            millis: last.millis,
            counter: last.counter,
            config,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// The last timestamp issued or merged.
    pub fn last(&self) -> Timestamp {
        Timestamp {
            millis: self.millis,
            counter: self.counter,
            node_id: self.node_id,
        }
    }

    /// Issue a timestamp for a local event.
    pub fn next(&mut self, time: &impl TimeSource) -> Result<Timestamp, ClockError> {
        let millis = self.next_millis(time, &[self.millis])?;
        let counter = if millis == self.millis {
            self.counter
                .checked_add(1)
                .ok_or(ClockError::CounterOverflow { millis })?
        } else {
            0
        };
        Ok(self.advance(millis, counter))
    }

    /// Merge a remote timestamp and return the timestamp the next local
    /// event is causally ordered after.
    ///
    /// On error the clock is left unchanged.
    pub fn receive(
        &mut self,
        time: &impl TimeSource,
        remote: &Timestamp,
    ) -> Result<Timestamp, ClockError> {
        let millis = self.next_millis(time, &[self.millis, remote.millis])?;
        let counter = match (millis == self.millis, millis == remote.millis) {
            (true, true) => self.counter.max(remote.counter).checked_add(1),
            (true, false) => self.counter.checked_add(1),
            (false, true) => remote.counter.checked_add(1),
            (false, false) => Some(0),
        }
        .ok_or(ClockError::CounterOverflow { millis })?;
        Ok(self.advance(millis, counter))
    }

    fn next_millis(&self, time: &impl TimeSource, candidates: &[u64]) -> Result<u64, ClockError> {
        let now = time.now_millis();
        if now > MAX_MILLIS {
            return Err(ClockError::TimeOutOfRange(now));
        }
        let next = candidates.iter().copied().fold(now, u64::max);
        if next > MAX_MILLIS {
            return Err(ClockError::TimeOutOfRange(next));
        }
        if next - now > self.config.max_drift_millis {
            return Err(ClockError::Drift { next, now });
        }
        Ok(next)
    }

    fn advance(&mut self, millis: u64, counter: u16) -> Timestamp {
        self.millis = millis;
        self.counter = counter;
        self.last()
    }
}
