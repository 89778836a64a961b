//! Ambient test tooling (SPEC_FULL.md §4.J): an in-memory [`SliceDao`], used
//! by this crate's own tests and available to downstream crates under the
//! `testing` feature. Not part of the production surface — the spec scopes
//! the real DAO implementation out (spec.md §1).
//!
//! Modeled on `crates/database/src/test_helpers` in the teacher repo: ship a
//! minimal in-process fixture alongside the trait, rather than mocking it
//! per call site.

use std::{
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::{
    self,
    BoxStream,
};
use parking_lot::Mutex;

use crate::{
    dao::SliceDao,
    error::DaoError,
    histogram::Bucket,
    types::{
        Row,
        Slice,
        Timestamp,
    },
};

/// A `SliceDao` backed by an in-process, timestamp-sorted buffer.
///
/// Does not model `entityType`/slice filtering — it keeps one global row
/// list and returns everything in the requested timestamp window,
/// sufficient for exercising the coordinator's query-shaping logic without
/// a real index. `push_rows` can insert rows with timestamps earlier than
/// ones already queried, which is exactly what "a commit becomes visible
/// late" looks like from the coordinator's side (spec.md §8 scenario 4).
pub struct InMemorySliceDao<P> {
    rows: Mutex<Vec<Row<P>>>,
    current_time: Mutex<Timestamp>,
    count_buckets_may_change: bool,
    rows_by_slices_calls: AtomicUsize,
}

impl<P> InMemorySliceDao<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(count_buckets_may_change: bool) -> Self {
        InMemorySliceDao {
            rows: Mutex::new(Vec::new()),
            current_time: Mutex::new(Timestamp::EPOCH),
            count_buckets_may_change,
            rows_by_slices_calls: AtomicUsize::new(0),
        }
    }

    /// Number of completed `rows_by_slices` calls so far. Lets tests assert
    /// on how many bounded queries the coordinator actually issued, e.g. the
    /// current-mode termination rule's confirmation query (spec.md §8
    /// scenario 6).
    pub fn rows_by_slices_call_count(&self) -> usize {
        self.rows_by_slices_calls.load(Ordering::SeqCst)
    }

    /// Appends rows and re-sorts by `(db_timestamp, entity_id, seq_nr)`,
    /// the ordering the DAO contract requires (spec.md §3).
    pub fn push_rows(&self, rows: impl IntoIterator<Item = Row<P>>) {
        let mut guard = self.rows.lock();
        guard.extend(rows);
        guard.sort_by(|a, b| {
            (a.db_timestamp, &a.entity_id, a.seq_nr).cmp(&(b.db_timestamp, &b.entity_id, b.seq_nr))
        });
    }

    /// Advances the DAO's read-your-writes clock, consulted by
    /// `current_by_slices` and by `behind_current_time` filtering.
    pub fn set_current_time(&self, now: Timestamp) {
        *self.current_time.lock() = now;
    }
}

#[async_trait]
impl<P> SliceDao<P> for InMemorySliceDao<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn current_db_timestamp(&self) -> Result<Timestamp, DaoError> {
        Ok(*self.current_time.lock())
    }

    fn rows_by_slices(
        &self,
        _entity_type: &str,
        _min_slice: Slice,
        _max_slice: Slice,
        from_timestamp: Timestamp,
        to_timestamp: Option<Timestamp>,
        behind_current_time: Duration,
        _backtracking: bool,
    ) -> BoxStream<'_, Result<Row<P>, DaoError>> {
        self.rows_by_slices_calls.fetch_add(1, Ordering::SeqCst);
        let now = *self.current_time.lock();
        let visibility_bound = now.minus(behind_current_time);
        let matched: Vec<Row<P>> = self
            .rows
            .lock()
            .iter()
            .filter(|row| row.db_timestamp >= from_timestamp)
            .filter(|row| to_timestamp.map_or(true, |to| row.db_timestamp <= to))
            .filter(|row| behind_current_time.is_zero() || row.db_timestamp <= visibility_bound)
            .cloned()
            .collect();
        Box::pin(stream::iter(matched.into_iter().map(Ok)))
    }

    fn count_buckets_may_change(&self) -> bool {
        self.count_buckets_may_change
    }

    async fn count_buckets(
        &self,
        _entity_type: &str,
        _min_slice: Slice,
        _max_slice: Slice,
        from_timestamp: Timestamp,
        limit: usize,
    ) -> Result<Vec<Bucket>, DaoError> {
        let mut buckets: std::collections::BTreeMap<i64, u64> = std::collections::BTreeMap::new();
        for row in self.rows.lock().iter() {
            if row.db_timestamp < from_timestamp {
                continue;
            }
            *buckets.entry(row.db_timestamp.bucket_start_epoch_second()).or_insert(0) += 1;
        }
        Ok(buckets
            .into_iter()
            .take(limit)
            .map(|(start_epoch_second, count)| Bucket {
                start_epoch_second,
                count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::types::{
        EntityId,
        SeqNr,
    };

    fn row(entity: &str, seq: u64, ts_millis: i64) -> Row<u64> {
        Row {
            entity_id: EntityId::from(entity),
            seq_nr: SeqNr(seq),
            db_timestamp: Timestamp(ts_millis),
            read_db_timestamp: Timestamp(ts_millis),
            payload: seq,
        }
    }

    #[tokio::test]
    async fn late_visible_row_appears_once_pushed() {
        let dao = InMemorySliceDao::new(false);
        dao.push_rows([row("p1", 1, 1000), row("p1", 2, 2000)]);

        let first: Vec<Row<u64>> = dao
            .rows_by_slices("Account", 0, 1, Timestamp(0), None, Duration::ZERO, false)
            .map(|r| r.expect("no error expected"))
            .collect()
            .await;
        assert_eq!(first.len(), 2);

        dao.push_rows([row("p2", 1, 1500)]);
        let second: Vec<Row<u64>> = dao
            .rows_by_slices("Account", 0, 1, Timestamp(0), None, Duration::ZERO, false)
            .map(|r| r.expect("no error expected"))
            .collect()
            .await;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].entity_id, EntityId::from("p2"));
    }

    #[tokio::test]
    async fn behind_current_time_excludes_recent_rows() {
        let dao = InMemorySliceDao::new(false);
        dao.push_rows([row("p1", 1, 1000), row("p1", 2, 9_000)]);
        dao.set_current_time(Timestamp(10_000));

        let visible: Vec<Row<u64>> = dao
            .rows_by_slices(
                "Account",
                0,
                1,
                Timestamp(0),
                None,
                Duration::from_millis(2000),
                false,
            )
            .map(|r| r.expect("no error expected"))
            .collect()
            .await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].seq_nr, SeqNr(1));
    }
}
