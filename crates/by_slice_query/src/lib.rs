//! A time-ordered, by-slice event query engine: repeatedly issues bounded
//! time-window queries against a backing DAO, maintains a query cursor,
//! interleaves forward progress with periodic backtracking windows, and
//! post-processes raw rows into offset-bearing envelopes with duplicate
//! suppression.
//!
//! The crate does not implement the DAO itself ([`dao::SliceDao`] is the
//! contract a storage backend fulfills), the offset persistence store used
//! by downstream projections, or the stream-processing runtime that drives
//! the pull loop — those are external collaborators.

pub mod clock;
pub mod coordinator;
pub mod dao;
pub mod driver;
pub mod error;
pub mod histogram;
pub mod metrics;
pub mod post_processor;
pub mod query_state;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use coordinator::{
    BySliceQueryCoordinator,
    Settings,
};
pub use dao::SliceDao;
pub use error::{
    DaoError,
    EngineError,
};
pub use types::{
    EntityId,
    Row,
    SeqNr,
    Slice,
    StartingOffset,
    Timestamp,
    TimestampOffset,
};
