//! Ambient metrics (SPEC_FULL.md §4.H).
//!
//! The teacher wraps `prometheus` registration behind `register_convex_counter!`
//! / `register_convex_histogram!` macros backed by a process-wide custom
//! registry (`crates/metrics`). That crate pulls in several nightly-only
//! feature gates we don't carry into this workspace (see DESIGN.md), so
//! metrics here register directly against `prometheus::default_registry()`
//! via `once_cell::sync::Lazy`, the same underlying crate, one layer
//! thinner.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec,
    register_int_counter_vec,
    HistogramVec,
    IntCounterVec,
};

pub static QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "by_slice_query_queries_total",
        "Number of bounded time-window queries issued",
        &["mode"]
    )
    .expect("metric registration is infallible outside of duplicate registration bugs")
});

pub static ROWS_PER_QUERY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "by_slice_query_rows_per_query",
        "Rows returned by a single bounded query",
        &["mode"]
    )
    .expect("metric registration is infallible outside of duplicate registration bugs")
});

pub static BACKTRACKING_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "by_slice_query_backtracking_transitions_total",
        "Transitions into or out of backtracking mode",
        &["direction"]
    )
    .expect("metric registration is infallible outside of duplicate registration bugs")
});

pub static HISTOGRAM_REFRESH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "by_slice_query_histogram_refresh_total",
        "Bucket histogram refreshes against the DAO",
        &["reason"]
    )
    .expect("metric registration is infallible outside of duplicate registration bugs")
});

pub static IDLE_STREAK: Lazy<prometheus::Histogram> = Lazy::new(|| {
    prometheus::register_histogram!(
        "by_slice_query_idle_streak",
        "idleCount observed at each backtracking-entry check"
    )
    .expect("metric registration is infallible outside of duplicate registration bugs")
});

pub fn record_query(mode: &str, row_count: usize) {
    QUERIES_TOTAL.with_label_values(&[mode]).inc();
    ROWS_PER_QUERY
        .with_label_values(&[mode])
        .observe(row_count as f64);
}

pub fn record_backtracking_transition(direction: &str) {
    BACKTRACKING_TRANSITIONS_TOTAL
        .with_label_values(&[direction])
        .inc();
}

pub fn record_histogram_refresh(reason: &str) {
    HISTOGRAM_REFRESH_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_idle_streak(idle_count: u64) {
    IDLE_STREAK.observe(idle_count as f64);
}
