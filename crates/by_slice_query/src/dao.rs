//! Component F (spec.md §6.1): the DAO contract. No implementation lives
//! here — SQL, connection pooling and row decoding are explicitly out of
//! scope (spec.md §1). Shaped after `common::persistence::PersistenceReader`
//! in the teacher repo, generalized to an opaque row payload.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    error::DaoError,
    histogram::Bucket,
    types::{
        Row,
        Slice,
        Timestamp,
    },
};

#[async_trait]
pub trait SliceDao<P>: Send + Sync {
    /// A read-your-writes clock from the database. Used only by
    /// `current_by_slices` (spec.md §4.D.1).
    async fn current_db_timestamp(&self) -> Result<Timestamp, DaoError>;

    /// Lazy, ascending-by-`(db_timestamp, entity_id, seq_nr)` row stream.
    /// Rows with `db_timestamp < from_timestamp` must not appear; if
    /// `to_timestamp` is present, no row with a greater timestamp may
    /// appear; if `behind_current_time` is nonzero, no row with
    /// `db_timestamp > now - behind_current_time` may appear.
    fn rows_by_slices(
        &self,
        entity_type: &str,
        min_slice: Slice,
        max_slice: Slice,
        from_timestamp: Timestamp,
        to_timestamp: Option<Timestamp>,
        behind_current_time: Duration,
        backtracking: bool,
    ) -> BoxStream<'_, Result<Row<P>, DaoError>>;

    /// Whether bucket counts for this domain can change after being
    /// reported (true for mutable/durable-state domains, false for
    /// append-only event logs).
    fn count_buckets_may_change(&self) -> bool;

    /// Sorted ascending by `start_time`.
    async fn count_buckets(
        &self,
        entity_type: &str,
        min_slice: Slice,
        max_slice: Slice,
        from_timestamp: Timestamp,
        limit: usize,
    ) -> Result<Vec<Bucket>, DaoError>;
}
