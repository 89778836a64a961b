//! Component A: bucket histogram (spec.md §4.A).
//!
//! A sorted `bucketStart -> count` mapping plus a `created_at` stamp, used to
//! pick a cheap upper-bound timestamp for the next query before the database
//! applies its own row limit. Backed by `imbl::OrdMap` rather than a
//! `BTreeMap` so that `add`/`clear_until` can be O(log n) copy-on-write
//! transitions shared across `QueryState` clones (spec.md §9 "Sorted mapping
//! over epoch seconds" / "Immutable state transitions").

use std::time::Instant;

use imbl::OrdMap;

use crate::types::Timestamp;

pub const BUCKET_SECONDS: i64 = 10;
pub const HISTOGRAM_BUCKET_LIMIT: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Bucket {
    pub start_epoch_second: i64,
    pub count: u64,
}

#[derive(Clone, Debug)]
pub struct BucketHistogram {
    buckets: OrdMap<i64, u64>,
    created_at: Instant,
}

impl BucketHistogram {
    pub fn empty(created_at: Instant) -> Self {
        BucketHistogram {
            buckets: OrdMap::new(),
            created_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Rebases `created_at` to `now`, keeping the buckets. Used by the
    /// coordinator's histogram-refresh step (spec.md §4.D.5): a refresh that
    /// fetches new buckets also resets the staleness clock, otherwise the
    /// `now - createdAt > 60s` check would never clear once tripped.
    pub fn touch(&self, now: Instant) -> Self {
        BucketHistogram {
            buckets: self.buckets.clone(),
            created_at: now,
        }
    }

    /// Replace-or-insert each bucket. `created_at` is *not* refreshed here;
    /// it records when the histogram was first constructed, not when it was
    /// last extended (spec.md §4.A).
    pub fn add(&self, fetched: impl IntoIterator<Item = Bucket>) -> Self {
        let mut buckets = self.buckets.clone();
        for bucket in fetched {
            buckets.insert(bucket.start_epoch_second, bucket.count);
        }
        while buckets.len() > HISTOGRAM_BUCKET_LIMIT {
            let first_key = *buckets.keys().next().expect("checked non-empty above");
            buckets.remove(&first_key);
        }
        BucketHistogram {
            buckets,
            created_at: self.created_at,
        }
    }

    /// Drop entries with key `<= (t - BUCKET_SECONDS)`. Never empties a
    /// non-empty map: if the drop would remove everything, the last entry is
    /// retained (spec.md §3 invariant 5). Idempotent when nothing would be
    /// dropped.
    pub fn clear_until(&self, t: Timestamp) -> Self {
        let cutoff = t.millis().div_euclid(1000) - BUCKET_SECONDS;
        let to_drop: Vec<i64> = self
            .buckets
            .keys()
            .filter(|&&key| key <= cutoff)
            .copied()
            .collect();
        if to_drop.is_empty() {
            return self.clone();
        }
        if to_drop.len() == self.buckets.len() {
            // Retain only the last entry rather than emptying the map.
            if let Some(&(last_key, last_count)) = self.buckets.get_max() {
                let mut buckets = OrdMap::new();
                buckets.insert(last_key, last_count);
                return BucketHistogram {
                    buckets,
                    created_at: self.created_at,
                };
            }
            return self.clone();
        }
        let mut buckets = self.buckets.clone();
        for key in to_drop {
            buckets.remove(&key);
        }
        BucketHistogram {
            buckets,
            created_at: self.created_at,
        }
    }

    /// Scan forward from the first bucket strictly after `from`, summing
    /// counts, and return the *end* of the first bucket whose cumulative sum
    /// meets or exceeds `at_least_n`. Absent if the scan exhausts first
    /// (spec.md §4.A).
    pub fn find_time_for_limit(&self, from: Timestamp, at_least_n: u64) -> Option<Timestamp> {
        let from_epoch_second = from.millis().div_euclid(1000);
        let mut sum = 0u64;
        for (&start, &count) in self.buckets.range((from_epoch_second + 1)..) {
            sum += count;
            if sum >= at_least_n {
                let end_epoch_second = start + BUCKET_SECONDS;
                return Some(Timestamp(end_epoch_second * 1000));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn histogram_with(buckets: &[(i64, u64)]) -> BucketHistogram {
        BucketHistogram::empty(Instant::now()).add(
            buckets
                .iter()
                .map(|&(start, count)| Bucket {
                    start_epoch_second: start,
                    count,
                }),
        )
    }

    #[test]
    fn find_time_for_limit_matches_spec_scenario_5() {
        // spec.md §8 scenario 5: buckets at t0, t0+10, t0+20 with counts
        // 3, 5, 7; buffer_size 10 => the t0+20 bucket (cumulative 15) is the
        // first to reach 10, so the answer is its end, t0+30s.
        let t0_sec = 1_700_000_000i64;
        let hist = histogram_with(&[(t0_sec, 3), (t0_sec + 10, 5), (t0_sec + 20, 7)]);
        let from = Timestamp(t0_sec * 1000);
        let found = hist.find_time_for_limit(from, 10).unwrap();
        assert_eq!(found, Timestamp((t0_sec + 30) * 1000));
    }

    #[test]
    fn find_time_for_limit_absent_when_not_enough_rows() {
        let t0_sec = 1_700_000_000i64;
        let hist = histogram_with(&[(t0_sec, 3), (t0_sec + 10, 5)]);
        let from = Timestamp(t0_sec * 1000);
        assert!(hist.find_time_for_limit(from, 100).is_none());
    }

    #[test]
    fn clear_until_retains_last_entry_instead_of_emptying() {
        let t0_sec = 1_700_000_000i64;
        let hist = histogram_with(&[(t0_sec, 3), (t0_sec + 10, 5)]);
        let cleared = hist.clear_until(Timestamp((t0_sec + 1000) * 1000));
        assert!(!cleared.is_empty());
        assert_eq!(cleared.buckets.len(), 1);
        assert_eq!(*cleared.buckets.keys().next().unwrap(), t0_sec + 10);
    }

    #[test]
    fn clear_until_is_idempotent_when_nothing_would_drop() {
        let t0_sec = 1_700_000_000i64;
        let hist = histogram_with(&[(t0_sec, 3), (t0_sec + 10, 5)]);
        let cleared = hist.clear_until(Timestamp((t0_sec - 1000) * 1000));
        assert_eq!(cleared.buckets, hist.buckets);
    }

    proptest::proptest! {
        #[test]
        fn add_then_clear_until_never_empties_a_nonempty_histogram(
            starts in proptest::collection::vec(0i64..1_000_000, 1..50),
            cutoff_offset in -100i64..1_000_000,
        ) {
            let buckets: Vec<Bucket> = starts
                .into_iter()
                .map(|s| Bucket { start_epoch_second: s * BUCKET_SECONDS, count: 1 })
                .collect();
            let hist = BucketHistogram::empty(Instant::now()).add(buckets);
            let cleared = hist.clear_until(Timestamp(cutoff_offset * 1000));
            proptest::prop_assert!(!cleared.is_empty());
        }

        #[test]
        fn find_time_for_limit_upper_bound_is_honest(
            buckets in proptest::collection::vec(
                (0i64..1_000_000, proptest::arbitrary::any::<u64>())
                    .prop_map(|(start_epoch_second, count)| Bucket { start_epoch_second, count }),
                0..20,
            ),
            from_sec in 0i64..10_000,
            at_least_n in 1u64..50,
        ) {
            // De-dup start_epoch_second so `add`'s replace-or-insert semantics
            // match a plain sum over the input (spec.md §8 "Histogram
            // upper-bound correctness").
            let mut by_start = std::collections::BTreeMap::new();
            for b in buckets {
                by_start.insert(b.start_epoch_second, b.count);
            }
            let hist = BucketHistogram::empty(Instant::now()).add(
                by_start.iter().map(|(&start_epoch_second, &count)| Bucket { start_epoch_second, count }),
            );
            let from = Timestamp(from_sec * 1000);
            if let Some(t) = hist.find_time_for_limit(from, at_least_n) {
                let t_sec = t.millis() / 1000;
                let sum: u64 = by_start
                    .range((from_sec + 1)..t_sec)
                    .map(|(_, &count)| count)
                    .sum();
                proptest::prop_assert!(sum >= at_least_n);
            }
        }
    }
}
