//! Component D (spec.md §4.C): the continuous-query driver collaborator.
//!
//! A generic, cooperative, single-threaded pull loop: `before_query ->
//! next_query -> consume inner stream -> delay -> repeat`. The by-slice
//! coordinator (`coordinator.rs`) is the only caller in this crate, but the
//! contract is kept generic over `State`/`Out` exactly as spec.md §4.C
//! describes it, rather than folded directly into the coordinator, so the
//! pull-loop skeleton and the by-slice query-shaping policy stay testable
//! independently.
//!
//! Closures are boxed trait objects rather than generic type parameters:
//! `next_query` and `before_query` must be callable repeatedly from inside
//! a loop and each invocation returns a distinct future/stream, which is
//! awkward to express without either boxing or an `async closures`
//! nightly feature. The teacher reaches for `Box<dyn Trait>` at exactly
//! this kind of seam (e.g. `Box<dyn SpawnHandle>`, `Box<dyn Persistence>`).

use std::time::Duration;

use futures::{
    future::BoxFuture,
    stream::BoxStream,
    Stream,
    StreamExt,
};

type NextQueryResult<State, Out, Err> = Result<(State, Option<BoxStream<'static, Result<Out, Err>>>), Err>;

pub struct ContinuousQuery<State, Out, Err> {
    pub initial_state: State,
    /// Invoked before every `next_query`. Returns the (possibly unchanged)
    /// state to use for that call. A no-op implementation that returns the
    /// input state immediately models the spec's "absent" case.
    pub before_query: Box<dyn FnMut(State) -> BoxFuture<'static, Result<State, Err>> + Send>,
    /// Decides the next bounded query, or `None` to end the stream.
    pub next_query: Box<dyn FnMut(State) -> BoxFuture<'static, NextQueryResult<State, Out, Err>> + Send>,
    /// Folds one emitted value into the state. Invoked once per item. Can
    /// fail, e.g. when the by-slice coordinator's ordering check (spec.md
    /// §4.D.6) detects an out-of-order emission and treats it as fatal.
    pub update_state: Box<dyn FnMut(State, &Out) -> Result<State, Err> + Send>,
    /// Pacing delay applied between the end of one inner stream and the
    /// next `before_query`/`next_query` pair. `None` means no delay.
    pub delay_next_query: Box<dyn FnMut(&State) -> Option<Duration> + Send>,
}

impl<State, Out, Err> ContinuousQuery<State, Out, Err>
where
    State: Send + 'static,
    Out: Send + 'static,
    Err: Send + 'static,
{
    /// Runs the pull loop as a cold stream. Dropping the returned stream
    /// before it completes drops the in-flight inner stream/future with it
    /// (spec.md §5: cancellation propagates structurally, no detached
    /// tasks are ever spawned).
    pub fn run(self) -> impl Stream<Item = Result<Out, Err>> {
        async_stream::try_stream! {
            let mut this = self;
            let mut state = this.initial_state;
            loop {
                state = (this.before_query)(state).await?;
                let (next_state, maybe_stream) = (this.next_query)(state).await?;
                state = next_state;
                let Some(mut inner) = maybe_stream else { break };
                while let Some(item) = inner.next().await {
                    let out = item?;
                    state = (this.update_state)(state, &out)?;
                    yield out;
                }
                if let Some(delay) = (this.delay_next_query)(&state) {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
