//! Component B (spec.md §3 "Query state", §4.D): the immutable cursor
//! snapshot threaded through live queries. Replaced wholesale on every
//! transition rather than mutated in place, per the "Immutable state
//! transitions" design note (spec.md §9).

use std::time::Instant;

use crate::{
    histogram::BucketHistogram,
    types::TimestampOffset,
};

#[derive(Clone, Debug)]
pub struct QueryState {
    /// Forward cursor. Monotonically non-decreasing across the driver's
    /// lifetime (invariant 1).
    pub latest: TimestampOffset,
    /// Cursor used while `backtracking = true`. Always
    /// `<= latest.timestamp` (invariant 2).
    pub latest_backtracking: TimestampOffset,
    /// Rows returned by the last completed query.
    pub row_count: usize,
    /// Monotonically increasing query counter.
    pub query_count: u64,
    /// Consecutive empty queries since the last non-empty one.
    pub idle_count: u64,
    /// Whether the coordinator is currently re-reading a past window.
    pub backtracking: bool,
    /// Cached histogram, with its own `created_at` stamp for refresh
    /// policy.
    pub buckets: BucketHistogram,
}

impl QueryState {
    pub fn new(start: TimestampOffset, now: Instant) -> Self {
        QueryState {
            latest: start,
            latest_backtracking: TimestampOffset::zero(),
            row_count: 0,
            query_count: 0,
            idle_count: 0,
            backtracking: false,
            buckets: BucketHistogram::empty(now),
        }
    }
}
