//! Core data model: spec.md §3.

use std::fmt;

use imbl::HashMap;

/// Database commit instant, milliseconds since the Unix epoch.
///
/// A newtype rather than a bare `i64` so that ordering comparisons in the
/// coordinator and post-processor can't silently compare timestamps against
/// row counts or slice numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// Epoch second floored to a 10-second bucket boundary (spec.md §4.A).
    pub fn bucket_start_epoch_second(self) -> i64 {
        let epoch_second = self.0.div_euclid(1000);
        epoch_second.div_euclid(super::histogram::BUCKET_SECONDS) * super::histogram::BUCKET_SECONDS
    }

    pub fn minus(self, duration: std::time::Duration) -> Self {
        Timestamp(self.0 - duration.as_millis() as i64)
    }

    pub fn plus(self, duration: std::time::Duration) -> Self {
        Timestamp(self.0 + duration.as_millis() as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts({})", self.0)
    }
}

/// Stable hash-assigned partition identifier, see GLOSSARY "Slice".
pub type Slice = i32;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNr(pub u64);

/// A single raw record read from the DAO. Invariant required of the DAO
/// (spec.md §3 "Row"): within one query response, rows are sorted ascending
/// by `(db_timestamp, entity_id, seq_nr)`.
#[derive(Clone, Debug)]
pub struct Row<P> {
    pub entity_id: EntityId,
    pub seq_nr: SeqNr,
    pub db_timestamp: Timestamp,
    /// Reader-side clock when the row was fetched. Diagnostic only, never
    /// consulted for ordering (spec.md §9).
    pub read_db_timestamp: Timestamp,
    pub payload: P,
}

/// The `(timestamp, readTimestamp, seen)` triple threaded through the
/// coordinator and handed to callers so they can persist it as a resumption
/// offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimestampOffset {
    pub timestamp: Timestamp,
    pub read_timestamp: Timestamp,
    /// Highest seq_nr already emitted per entity id, *at exactly*
    /// `timestamp`. Reset whenever `timestamp` strictly advances.
    pub seen: HashMap<EntityId, SeqNr>,
}

impl TimestampOffset {
    pub fn zero() -> Self {
        TimestampOffset {
            timestamp: Timestamp::EPOCH,
            read_timestamp: Timestamp::EPOCH,
            seen: HashMap::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.timestamp == Timestamp::EPOCH
    }
}

impl Default for TimestampOffset {
    fn default() -> Self {
        Self::zero()
    }
}

/// The public `offset` argument to `current_by_slices`/`live_by_slices`
/// (spec.md §6.2): "either 'none' ... or a TimestampOffset".
#[derive(Clone, Debug)]
pub enum StartingOffset {
    None,
    Exact(TimestampOffset),
}

impl StartingOffset {
    pub fn resolve(self) -> TimestampOffset {
        match self {
            StartingOffset::None => TimestampOffset::zero(),
            StartingOffset::Exact(offset) => offset,
        }
    }
}

impl From<TimestampOffset> for StartingOffset {
    fn from(offset: TimestampOffset) -> Self {
        StartingOffset::Exact(offset)
    }
}
