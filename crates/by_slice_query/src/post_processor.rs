//! Converts a raw row stream into an envelope stream, assigning offsets and
//! suppressing duplicates within one timestamp.
//!
//! `current_timestamp` and `current_sequence_nrs` are ordinary locals
//! inside the generator body below, so they live and die with one
//! downstream consumer's stream instance rather than being shared across
//! subscribers. Uses `async-stream`'s `try_stream!` rather than a
//! nightly-only generator macro (see DESIGN.md).

use futures::Stream;
use imbl::HashMap;

use crate::{
    error::{
        DaoError,
        EngineError,
    },
    types::{
        Row,
        TimestampOffset,
    },
};

/// Runs the row stream through duplicate suppression, yielding one `Out`
/// envelope per surviving row. The coordinator recovers the offset each
/// envelope carries via its own `extract_offset` callback (spec.md §4.D
/// constructor parameters) rather than this function handing it back
/// directly, so the envelope type stays the single source of truth for
/// what was actually emitted.
pub fn process_rows<P, Out, F>(
    seed: TimestampOffset,
    buffer_size: usize,
    rows: impl Stream<Item = Result<Row<P>, DaoError>>,
    make_envelope: F,
) -> impl Stream<Item = Result<Out, EngineError>>
where
    F: Fn(TimestampOffset, P) -> Out,
{
    async_stream::try_stream! {
        futures::pin_mut!(rows);
        let mut current_timestamp = seed.timestamp;
        let mut have_seen_any = !seed.is_zero();
        let mut current_sequence_nrs: HashMap<_, _> = seed.seen;

        while let Some(row) = futures::StreamExt::next(&mut rows).await {
            let row = row?;

            let same_timestamp = have_seen_any && row.db_timestamp == current_timestamp;

            if same_timestamp {
                if let Some(&seen_seq_nr) = current_sequence_nrs.get(&row.entity_id) {
                    if seen_seq_nr >= row.seq_nr {
                        // Duplicate or already-seen replay: drop silently.
                        continue;
                    }
                }
                if current_sequence_nrs.len() >= buffer_size
                    && !current_sequence_nrs.contains_key(&row.entity_id)
                {
                    tracing::error!(
                        %current_timestamp,
                        count = current_sequence_nrs.len(),
                        buffer_size,
                        "too many distinct entities at one timestamp"
                    );
                    Err(EngineError::TooManyEventsSameTimestamp {
                        timestamp: current_timestamp,
                        count: current_sequence_nrs.len(),
                        buffer_size,
                    })?;
                }
                current_sequence_nrs.insert(row.entity_id.clone(), row.seq_nr);
            } else {
                current_timestamp = row.db_timestamp;
                current_sequence_nrs = HashMap::unit(row.entity_id.clone(), row.seq_nr);
                have_seen_any = true;
            }

            let offset = TimestampOffset {
                timestamp: current_timestamp,
                read_timestamp: row.read_db_timestamp,
                seen: current_sequence_nrs.clone(),
            };
            let envelope = make_envelope(offset.clone(), row.payload);
            yield envelope;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::types::{
        EntityId,
        SeqNr,
        Timestamp,
    };

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Envelope {
        offset: TimestampOffset,
        payload: u64,
    }

    fn row(entity: &str, seq: u64, ts_millis: i64) -> Row<u64> {
        Row {
            entity_id: EntityId::from(entity),
            seq_nr: SeqNr(seq),
            db_timestamp: Timestamp(ts_millis),
            read_db_timestamp: Timestamp(ts_millis),
            payload: seq,
        }
    }

    async fn run(
        seed: TimestampOffset,
        buffer_size: usize,
        rows: Vec<Row<u64>>,
    ) -> Result<Vec<Envelope>, EngineError> {
        let input = futures::stream::iter(rows.into_iter().map(Ok));
        let stream = process_rows(seed, buffer_size, input, |offset, payload| Envelope {
            offset,
            payload,
        });
        futures::pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn simple_forward_scenario_1() {
        let rows = vec![row("p1", 1, T0), row("p1", 2, T0 + 1), row("p1", 3, T0 + 2)];
        let out = run(TimestampOffset::zero(), 100, rows).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[0].offset.seen.get(&EntityId::from("p1")),
            Some(&SeqNr(1))
        );
        assert_eq!(
            out[1].offset.seen.get(&EntityId::from("p1")),
            Some(&SeqNr(2))
        );
        assert_eq!(
            out[2].offset.seen.get(&EntityId::from("p1")),
            Some(&SeqNr(3))
        );
    }

    #[tokio::test]
    async fn same_timestamp_tie_scenario_2() {
        let rows = vec![row("p1", 1, T0), row("p2", 1, T0), row("p1", 2, T0 + 1)];
        let out = run(TimestampOffset::zero(), 100, rows).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].offset.timestamp, Timestamp(T0));
        assert_eq!(out[1].offset.timestamp, Timestamp(T0));
        assert_eq!(out[1].offset.seen.len(), 2);
        assert_eq!(
            out[1].offset.seen.get(&EntityId::from("p1")),
            Some(&SeqNr(1))
        );
        assert_eq!(
            out[1].offset.seen.get(&EntityId::from("p2")),
            Some(&SeqNr(1))
        );
    }

    #[tokio::test]
    async fn duplicate_suppression_scenario_3() {
        let rows = vec![row("p1", 1, T0), row("p1", 1, T0), row("p1", 2, T0 + 1)];
        let out = run(TimestampOffset::zero(), 100, rows).await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn round_trip_duplicate_prefix_is_a_no_op() {
        let base = vec![row("p1", 1, T0), row("p2", 1, T0), row("p1", 2, T0 + 1)];
        let mut with_dupes = vec![row("p1", 1, T0), row("p2", 1, T0)];
        with_dupes.extend(base.clone());

        let plain = run(TimestampOffset::zero(), 100, base).await.unwrap();
        let deduped = run(TimestampOffset::zero(), 100, with_dupes).await.unwrap();
        let plain_payloads: Vec<_> = plain.into_iter().map(|e| e.payload).collect();
        let deduped_payloads: Vec<_> = deduped.into_iter().map(|e| e.payload).collect();
        assert_eq!(plain_payloads, deduped_payloads);
    }

    #[tokio::test]
    async fn safety_rail_trips_on_too_many_distinct_entities() {
        let rows = vec![row("p1", 1, T0), row("p2", 1, T0), row("p3", 1, T0)];
        let result = run(TimestampOffset::zero(), 2, rows).await;
        assert!(matches!(
            result,
            Err(EngineError::TooManyEventsSameTimestamp { .. })
        ));
    }
}
