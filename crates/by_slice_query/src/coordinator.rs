//! The by-slice query coordinator. This is where query shape, backtracking,
//! pacing and histogram refresh policy live; `driver::ContinuousQuery` only
//! supplies the pull-loop skeleton.
//!
//! Implements a "decide next bounded window, fetch, fold into cursor state,
//! pace, repeat" loop over a row source, generalized to a by-slice
//! `TimestampOffset` cursor (see DESIGN.md for grounding).

use std::{
    sync::Arc,
    time::Duration,
};

use futures::{
    future::BoxFuture,
    stream::BoxStream,
    Stream,
    StreamExt,
};

use crate::{
    clock::Clock,
    dao::SliceDao,
    driver::ContinuousQuery,
    error::{
        DaoError,
        EngineError,
    },
    histogram::{
        Bucket,
        BucketHistogram,
        HISTOGRAM_BUCKET_LIMIT,
    },
    post_processor::process_rows,
    query_state::QueryState,
    types::{
        Row,
        Slice,
        StartingOffset,
        Timestamp,
        TimestampOffset,
    },
};

/// `EVENT_BUCKET_COUNT_INTERVAL` from spec.md §4.D: how long a cached
/// histogram is trusted before a refresh is even considered.
const HISTOGRAM_STALE_AFTER: Duration = Duration::from_secs(60);

/// Injected configuration (spec.md §6.3). No field has a process-wide
/// default baked into the coordinator; callers that want the teacher's
/// usual magnitudes get them from [`Settings::default`].
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub buffer_size: usize,
    pub refresh_interval: Duration,
    pub behind_current_time: Duration,
    pub backtracking_enabled: bool,
    pub backtracking_window: Duration,
    pub backtracking_behind_current_time: Duration,
    /// Consecutive empty live queries before backtracking is considered.
    /// Hardcoded to `5` in the system this spec describes; promoted to a
    /// setting per the Open Questions note (spec.md §9).
    pub backtracking_idle_threshold: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            buffer_size: 1000,
            refresh_interval: Duration::from_secs(10),
            behind_current_time: Duration::from_millis(500),
            backtracking_enabled: true,
            backtracking_window: Duration::from_secs(20 * 60),
            backtracking_behind_current_time: Duration::from_secs(5),
            backtracking_idle_threshold: 5,
        }
    }
}

impl Settings {
    fn half_backtracking_window(&self) -> Duration {
        self.backtracking_window / 2
    }

    fn first_backtracking_window(&self) -> Duration {
        self.backtracking_window + self.backtracking_behind_current_time
    }
}

/// Component E. Generic over the DAO's row payload `P` and the outward
/// envelope type `Out` the caller wants back.
pub struct BySliceQueryCoordinator<P, Out> {
    dao: Arc<dyn SliceDao<P>>,
    settings: Settings,
    clock: Arc<dyn Clock>,
    make_envelope: Arc<dyn Fn(TimestampOffset, P) -> Out + Send + Sync>,
    extract_offset: Arc<dyn Fn(&Out) -> TimestampOffset + Send + Sync>,
}

impl<P, Out> BySliceQueryCoordinator<P, Out>
where
    P: Send + Sync + 'static,
    Out: Send + 'static,
{
    pub fn new(
        dao: Arc<dyn SliceDao<P>>,
        settings: Settings,
        clock: Arc<dyn Clock>,
        make_envelope: impl Fn(TimestampOffset, P) -> Out + Send + Sync + 'static,
        extract_offset: impl Fn(&Out) -> TimestampOffset + Send + Sync + 'static,
    ) -> Self {
        BySliceQueryCoordinator {
            dao,
            settings,
            clock,
            make_envelope: Arc::new(make_envelope),
            extract_offset: Arc::new(extract_offset),
        }
    }

    /// `currentBySlices` (spec.md §4.D.1): finite, stops once the data
    /// already committed at call time has been fully observed.
    pub fn current_by_slices(
        &self,
        log_prefix: impl Into<String>,
        entity_type: impl Into<String>,
        min_slice: Slice,
        max_slice: Slice,
        offset: StartingOffset,
    ) -> impl Stream<Item = Result<Out, EngineError>> {
        let log_prefix = log_prefix.into();
        let entity_type = entity_type.into();
        let seed = offset.resolve();
        let dao = self.dao.clone();
        let settings = self.settings;
        let clock = self.clock.clone();
        let make_envelope = self.make_envelope.clone();
        let extract_offset = self.extract_offset.clone();

        async_stream::try_stream! {
            let current_db_time = dao.current_db_timestamp().await.map_err(EngineError::Dao)?;
            tracing::debug!(%log_prefix, %entity_type, %current_db_time, "current_by_slices: starting");

            let state = CurrentState {
                qs: QueryState::new(seed, clock.now()),
                current_db_time,
                row_count_two_ago: None,
                terminated: false,
            };

            let query = ContinuousQuery {
                initial_state: state,
                before_query: Box::new({
                    let dao = dao.clone();
                    let log_prefix = log_prefix.clone();
                    let entity_type = entity_type.clone();
                    let clock = clock.clone();
                    let settings = settings;
                    move |state: CurrentState| -> BoxFuture<'static, Result<CurrentState, EngineError>> {
                        let dao = dao.clone();
                        let log_prefix = log_prefix.clone();
                        let entity_type = entity_type.clone();
                        let clock = clock.clone();
                        Box::pin(async move {
                            let qs = refresh_histogram_with_clock(
                                state.qs, &*dao, &log_prefix, &entity_type, min_slice, max_slice, &settings, &*clock,
                            ).await?;
                            Ok(CurrentState { qs, ..state })
                        })
                    }
                }),
                next_query: Box::new({
                    let dao = dao.clone();
                    let entity_type = entity_type.clone();
                    let make_envelope = make_envelope.clone();
                    move |state: CurrentState| -> BoxFuture<'static, Result<(CurrentState, Option<BoxStream<'static, Result<Out, EngineError>>>), EngineError>> {
                        let dao = dao.clone();
                        let entity_type = entity_type.clone();
                        let make_envelope = make_envelope.clone();
                        Box::pin(async move {
                            Ok(begin_current_query(
                                state, &dao, &entity_type, min_slice, max_slice, &settings, make_envelope,
                            ))
                        })
                    }
                }),
                update_state: Box::new({
                    let extract_offset = extract_offset.clone();
                    move |mut state: CurrentState, out: &Out| {
                        let offset = (extract_offset)(out);
                        if offset.timestamp < state.qs.latest.timestamp {
                            tracing::error!(
                                observed = %offset.timestamp,
                                cursor = %state.qs.latest.timestamp,
                                "out of order emission"
                            );
                            return Err(EngineError::OutOfOrderEmission {
                                observed: offset.timestamp,
                                cursor: state.qs.latest.timestamp,
                            });
                        }
                        state.qs.latest = offset;
                        state.qs.row_count += 1;
                        Ok(state)
                    }
                }),
                delay_next_query: Box::new(|_state: &CurrentState| None),
            };

            let stream = query.run();
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let out = item?;
                yield out;
            }
        }
    }

    /// `liveBySlices` (spec.md §4.D.1): infinite, runs the backtracking
    /// protocol (§4.D.2) and pacing (§4.D.4).
    pub fn live_by_slices(
        &self,
        log_prefix: impl Into<String>,
        entity_type: impl Into<String>,
        min_slice: Slice,
        max_slice: Slice,
        offset: StartingOffset,
    ) -> impl Stream<Item = Result<Out, EngineError>> {
        let log_prefix = log_prefix.into();
        let entity_type = entity_type.into();
        let seed = offset.resolve();
        let dao = self.dao.clone();
        let settings = self.settings;
        let clock = self.clock.clone();
        let make_envelope = self.make_envelope.clone();
        let extract_offset = self.extract_offset.clone();

        async_stream::try_stream! {
            tracing::debug!(%log_prefix, %entity_type, "live_by_slices: starting");

            let state = LiveState {
                qs: QueryState::new(seed, clock.now()),
            };

            let query = ContinuousQuery {
                initial_state: state,
                before_query: Box::new({
                    let dao = dao.clone();
                    let log_prefix = log_prefix.clone();
                    let entity_type = entity_type.clone();
                    let clock = clock.clone();
                    let settings = settings;
                    move |state: LiveState| -> BoxFuture<'static, Result<LiveState, EngineError>> {
                        let dao = dao.clone();
                        let log_prefix = log_prefix.clone();
                        let entity_type = entity_type.clone();
                        let clock = clock.clone();
                        Box::pin(async move {
                            let qs = refresh_histogram_with_clock(
                                state.qs, &*dao, &log_prefix, &entity_type, min_slice, max_slice, &settings, &*clock,
                            ).await?;
                            Ok(LiveState { qs })
                        })
                    }
                }),
                next_query: Box::new({
                    let dao = dao.clone();
                    let log_prefix = log_prefix.clone();
                    let entity_type = entity_type.clone();
                    let make_envelope = make_envelope.clone();
                    move |state: LiveState| -> BoxFuture<'static, Result<(LiveState, Option<BoxStream<'static, Result<Out, EngineError>>>), EngineError>> {
                        let dao = dao.clone();
                        let log_prefix = log_prefix.clone();
                        let entity_type = entity_type.clone();
                        let make_envelope = make_envelope.clone();
                        Box::pin(async move {
                            Ok(begin_live_query(
                                state, &dao, &log_prefix, &entity_type, min_slice, max_slice, &settings, make_envelope,
                            ))
                        })
                    }
                }),
                update_state: Box::new({
                    let extract_offset = extract_offset.clone();
                    move |mut state: LiveState, out: &Out| {
                        let offset = (extract_offset)(out);
                        if state.qs.backtracking {
                            if offset.timestamp < state.qs.latest_backtracking.timestamp {
                                tracing::error!(
                                    observed = %offset.timestamp,
                                    cursor = %state.qs.latest_backtracking.timestamp,
                                    "out of order emission while backtracking"
                                );
                                return Err(EngineError::OutOfOrderEmission {
                                    observed: offset.timestamp,
                                    cursor: state.qs.latest_backtracking.timestamp,
                                });
                            }
                            state.qs.latest_backtracking = offset;
                        } else {
                            if offset.timestamp < state.qs.latest.timestamp {
                                tracing::error!(
                                    observed = %offset.timestamp,
                                    cursor = %state.qs.latest.timestamp,
                                    "out of order emission"
                                );
                                return Err(EngineError::OutOfOrderEmission {
                                    observed: offset.timestamp,
                                    cursor: state.qs.latest.timestamp,
                                });
                            }
                            state.qs.latest = offset;
                        }
                        state.qs.row_count += 1;
                        Ok(state)
                    }
                }),
                delay_next_query: Box::new({
                    let settings = settings;
                    move |state: &LiveState| default_delay(state.qs.row_count, &settings)
                }),
            };

            let stream = query.run();
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let out = item?;
                yield out;
            }
        }
    }
}

/// State threaded through `currentBySlices`'s driver instance.
struct CurrentState {
    qs: QueryState,
    /// Clamp resolved once, at the start of the call (spec.md §4.D.1, §9
    /// open question: "preserve" the clamp to the driver's start instant).
    current_db_time: Timestamp,
    /// Row count of the query before the one that just completed, used by
    /// the two-empty-queries-in-a-row termination rule (spec.md §8
    /// scenario 6).
    row_count_two_ago: Option<usize>,
    terminated: bool,
}

/// State threaded through `liveBySlices`'s driver instance.
struct LiveState {
    qs: QueryState,
}

type NextQueryOutcome<State, Out> = (State, Option<BoxStream<'static, Result<Out, EngineError>>>);

fn begin_current_query<P, Out>(
    mut state: CurrentState,
    dao: &Arc<dyn SliceDao<P>>,
    entity_type: &str,
    min_slice: Slice,
    max_slice: Slice,
    settings: &Settings,
    make_envelope: Arc<dyn Fn(TimestampOffset, P) -> Out + Send + Sync>,
) -> NextQueryOutcome<CurrentState, Out>
where
    P: Send + Sync + 'static,
    Out: Send + 'static,
{
    if state.terminated {
        return (state, None);
    }

    // `row_count_two_ago` only holds a real row count once two queries have
    // actually completed; gating on `query_count >= 2` keeps the `None`
    // placeholder from call 1 (before any query has run) from being
    // mistaken for a genuine zero-row result (spec.md §4.D.1, §8 scenario 6).
    if state.qs.query_count >= 2 && state.row_count_two_ago == Some(0) && state.qs.row_count == 0 {
        state.terminated = true;
        return (state, None);
    }

    if state.qs.query_count > 0 {
        crate::metrics::record_query("current", state.qs.row_count);
        state.row_count_two_ago = Some(state.qs.row_count);
    }
    state.qs.row_count = 0;
    state.qs.query_count += 1;

    let from_timestamp = state.qs.latest.timestamp;
    let to_timestamp = next_query_to_timestamp(
        &state.qs.buckets,
        from_timestamp,
        settings.buffer_size,
        false,
        from_timestamp,
    )
    .map(|t| t.min(state.current_db_time))
    .or(Some(state.current_db_time));

    let seed = state.qs.latest.clone();
    let dao = dao.clone();
    let entity_type = entity_type.to_string();
    let rows = owned_rows_stream(
        dao,
        entity_type,
        min_slice,
        max_slice,
        from_timestamp,
        to_timestamp,
        Duration::ZERO,
        false,
    );
    let stream = process_rows(seed, settings.buffer_size, rows, move |offset, payload| {
        (make_envelope)(offset, payload)
    });
    (state, Some(Box::pin(stream)))
}

fn begin_live_query<P, Out>(
    mut state: LiveState,
    dao: &Arc<dyn SliceDao<P>>,
    log_prefix: &str,
    entity_type: &str,
    min_slice: Slice,
    max_slice: Slice,
    settings: &Settings,
    make_envelope: Arc<dyn Fn(TimestampOffset, P) -> Out + Send + Sync>,
) -> NextQueryOutcome<LiveState, Out>
where
    P: Send + Sync + 'static,
    Out: Send + 'static,
{
    if state.qs.query_count > 0 {
        let just_completed = state.qs.row_count;
        crate::metrics::record_query(
            if state.qs.backtracking { "backtracking" } else { "forward" },
            just_completed,
        );
        state.qs.idle_count = if just_completed == 0 {
            state.qs.idle_count + 1
        } else {
            0
        };

        if state.qs.backtracking {
            if just_completed < settings.buffer_size.saturating_sub(1) {
                state.qs.backtracking = false;
                crate::metrics::record_backtracking_transition("exit");
                tracing::info!(%log_prefix, %entity_type, "backtracking: exiting, window not saturated");
            }
        } else if settings.backtracking_enabled && !state.qs.latest.is_zero() {
            let gap_millis = state.qs.latest.timestamp.millis() - state.qs.latest_backtracking.timestamp.millis();
            let half_window_millis = settings.half_backtracking_window().as_millis() as i64;
            crate::metrics::record_idle_streak(state.qs.idle_count);
            if state.qs.idle_count >= settings.backtracking_idle_threshold as u64
                || gap_millis > half_window_millis
            {
                state.qs.backtracking = true;
                if state.qs.latest_backtracking.is_zero() {
                    state.qs.latest_backtracking = TimestampOffset {
                        timestamp: state.qs.latest.timestamp.minus(settings.first_backtracking_window()),
                        read_timestamp: state.qs.latest.timestamp.minus(settings.first_backtracking_window()),
                        seen: imbl::HashMap::new(),
                    };
                }
                crate::metrics::record_backtracking_transition("enter");
                tracing::info!(%log_prefix, %entity_type, idle_count = state.qs.idle_count, "backtracking: entering");
            }
        }
    }

    state.qs.row_count = 0;
    state.qs.query_count += 1;

    let (from_timestamp, to_timestamp, behind_current_time, backtracking) = if state.qs.backtracking {
        let from_timestamp = state.qs.latest_backtracking.timestamp;
        let to_timestamp = next_query_to_timestamp(
            &state.qs.buckets,
            from_timestamp,
            settings.buffer_size,
            true,
            state.qs.latest.timestamp,
        );
        (
            from_timestamp,
            to_timestamp,
            settings.backtracking_behind_current_time,
            true,
        )
    } else {
        let from_timestamp = state.qs.latest.timestamp;
        let to_timestamp = next_query_to_timestamp(
            &state.qs.buckets,
            from_timestamp,
            settings.buffer_size,
            false,
            from_timestamp,
        );
        (from_timestamp, to_timestamp, settings.behind_current_time, false)
    };

    let seed = if backtracking {
        state.qs.latest_backtracking.clone()
    } else {
        state.qs.latest.clone()
    };
    let dao = dao.clone();
    let entity_type = entity_type.to_string();
    let rows = owned_rows_stream(
        dao,
        entity_type,
        min_slice,
        max_slice,
        from_timestamp,
        to_timestamp,
        behind_current_time,
        backtracking,
    );
    let stream = process_rows(seed, settings.buffer_size, rows, move |offset, payload| {
        (make_envelope)(offset, payload)
    });
    (state, Some(Box::pin(stream)))
}

/// `nextQueryToTimestamp` (spec.md §4.D.3).
fn next_query_to_timestamp(
    buckets: &BucketHistogram,
    from_timestamp: Timestamp,
    buffer_size: usize,
    backtracking: bool,
    latest_timestamp: Timestamp,
) -> Option<Timestamp> {
    match buckets.find_time_for_limit(from_timestamp, buffer_size as u64) {
        Some(t) if backtracking => Some(t.min(latest_timestamp)),
        Some(t) => Some(t),
        None if backtracking => Some(latest_timestamp),
        None => None,
    }
}

/// Pacing (spec.md §4.D.4): linear ramp from no delay at `buffer_size`
/// rows down to `refresh_interval` at zero rows.
fn default_delay(row_count: usize, settings: &Settings) -> Option<Duration> {
    if row_count >= settings.buffer_size || settings.buffer_size == 0 {
        return None;
    }
    let fraction = 1.0 - (row_count as f64 / settings.buffer_size as f64);
    let millis = (settings.refresh_interval.as_millis() as f64) * fraction;
    Some(Duration::from_millis(millis.round() as u64))
}

/// Histogram refresh (spec.md §4.D.5), shared by both public operations
/// per the Open Question resolution recorded in DESIGN.md: the spec marks
/// backtracking (§4.D.2) and pacing (§4.D.4) "(live only)" explicitly but
/// does not mark refresh that way, so it runs in both modes.
async fn refresh_histogram_with_clock<P>(
    mut qs: QueryState,
    dao: &dyn SliceDao<P>,
    log_prefix: &str,
    entity_type: &str,
    min_slice: Slice,
    max_slice: Slice,
    settings: &Settings,
    clock: &dyn Clock,
) -> Result<QueryState, EngineError> {
    let now = clock.now();
    let stale = qs.buckets.is_empty() || now.saturating_duration_since(qs.buckets.created_at()) > HISTOGRAM_STALE_AFTER;
    if !stale {
        return Ok(qs);
    }

    let may_change = dao.count_buckets_may_change();
    let horizon_ok = qs
        .buckets
        .find_time_for_limit(qs.latest.timestamp, settings.buffer_size as u64)
        .is_some();
    if !may_change && horizon_ok {
        return Ok(qs);
    }

    let from_timestamp = if qs.latest_backtracking.is_zero() && qs.latest.is_zero() {
        Timestamp::EPOCH
    } else if qs.latest_backtracking.is_zero() {
        qs.latest.timestamp.minus(settings.first_backtracking_window())
    } else {
        qs.latest_backtracking.timestamp
    };

    let fetched: Vec<Bucket> = dao
        .count_buckets(entity_type, min_slice, max_slice, from_timestamp, HISTOGRAM_BUCKET_LIMIT)
        .await
        .map_err(EngineError::Dao)?;

    crate::metrics::record_histogram_refresh(if may_change { "mutable" } else { "event_sourced" });
    tracing::debug!(%log_prefix, %entity_type, ?from_timestamp, fetched = fetched.len(), "histogram refreshed");

    qs.buckets = qs.buckets.clear_until(from_timestamp).add(fetched).touch(now);
    Ok(qs)
}

/// Moves an owned DAO handle into the generator so the returned stream has
/// no borrow on `&self` and can be boxed with a `'static` lifetime, even
/// though [`SliceDao::rows_by_slices`] itself only promises `BoxStream<'_, _>`.
fn owned_rows_stream<P>(
    dao: Arc<dyn SliceDao<P>>,
    entity_type: String,
    min_slice: Slice,
    max_slice: Slice,
    from_timestamp: Timestamp,
    to_timestamp: Option<Timestamp>,
    behind_current_time: Duration,
    backtracking: bool,
) -> BoxStream<'static, Result<Row<P>, DaoError>>
where
    P: Send + Sync + 'static,
{
    Box::pin(async_stream::try_stream! {
        let stream = dao.rows_by_slices(
            &entity_type,
            min_slice,
            max_slice,
            from_timestamp,
            to_timestamp,
            behind_current_time,
            backtracking,
        );
        futures::pin_mut!(stream);
        while let Some(row) = stream.next().await {
            let row = row?;
            yield row;
        }
    })
}
