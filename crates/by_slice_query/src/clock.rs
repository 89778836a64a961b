//! Injectable "now" source.
//!
//! The coordinator only ever calls `now()` inside `before_query`, to decide
//! whether the cached bucket histogram has gone stale (spec.md §4.D.5). A
//! trait keeps that check deterministic in tests instead of racing the wall
//! clock.

use std::{
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::{
        Duration,
        Instant,
    },
};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: starts at `Instant::now()` and only moves
/// forward when told to, via `advance`.
pub struct TestClock {
    base: Instant,
    elapsed_millis: AtomicU64,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed_millis: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed_millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.elapsed_millis.load(Ordering::SeqCst))
    }
}
