//! Error taxonomy, spec.md §7.
//!
//! The spec's taxonomy is a set of *kinds*, not necessarily Rust types;
//! we give each a variant on one error enum so callers can `match` instead
//! of string-sniffing an `anyhow::Error`, following the teacher's habit of a
//! dedicated `thiserror` enum per subsystem boundary (e.g.
//! `postgres::connection`'s connection-pool errors).

use thiserror::Error;

/// Failure from the DAO boundary (spec.md §6.1). Implementors classify their
/// own failures as transient or not; the coordinator never retries either
/// way (spec.md §7), but downstream embedding code can use the distinction
/// to decide whether to restart the whole driver.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error("transient storage error: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("storage error: {0}")]
    Other(#[source] anyhow::Error),
}

impl DaoError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DaoError::Transient(_))
    }
}

/// Top-level error yielded on the coordinator's output stream.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The row post-processor or the offset updater observed a timestamp
    /// regression. Fatal: the DAO violated its sort contract (spec.md §7,
    /// §4.D.6).
    #[error("out of order emission: saw timestamp {observed} after cursor at {cursor}")]
    OutOfOrderEmission {
        observed: crate::types::Timestamp,
        cursor: crate::types::Timestamp,
    },

    /// The in-memory dedup buffer for one timestamp grew past `buffer_size`
    /// entities. Indicates a histogram or DAO bug, not a normal condition
    /// (spec.md §4.B).
    #[error(
        "too many distinct entities ({count}) at a single timestamp {timestamp}, buffer_size is \
         {buffer_size}"
    )]
    TooManyEventsSameTimestamp {
        timestamp: crate::types::Timestamp,
        count: usize,
        buffer_size: usize,
    },

    /// The DAO's stream or future failed. Not recovered inside the core;
    /// surfaced to the outer stream (spec.md §7).
    #[error("dao error: {0}")]
    Dao(#[from] DaoError),

    /// The outer stream was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
}
