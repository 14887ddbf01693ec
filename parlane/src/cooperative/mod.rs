//! Cooperative execution: async functions on the caller's task.
//!
//! Invocations are not spawned. They are polled together by one future and
//! gated by a semaphore, so at most `workers` (or `min(32, items)`) of them
//! are in flight at once. Results keep input order. The error strategy is
//! applied once every invocation has settled; under `raise` the failure of
//! the earliest item is returned.
//!
//! Dropping the returned future drops every unsettled invocation.
//!
//! A per-invocation timeout needs a tokio runtime with the time driver;
//! without a timeout any executor works.

use crate::config::{Config, ErrorStrategy};
use crate::core::{Ordered, Outcome, Tally};
use crate::engine::cooperative_limit;
use crate::errors::{ParlaneError, TaskFailure};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Awaits `f` on every item.
pub async fn map<T, R, E, F, Fut>(
    f: F,
    items: impl IntoIterator<Item = T>,
    config: &Config,
) -> Result<Ordered<R>, ParlaneError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<anyhow::Error>,
{
    let strategy = config.error_strategy();
    let outcomes = settle_all(&f, items.into_iter().collect(), config).await;
    Ok(apply(outcomes, strategy)?)
}

/// Keeps the items whose async predicate holds. A predicate failure aborts
/// the call whatever the configured strategy.
pub async fn filter<T, E, F, Fut>(
    predicate: F,
    items: impl IntoIterator<Item = T>,
    config: &Config,
) -> Result<Vec<T>, ParlaneError>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Into<anyhow::Error>,
{
    let items: Vec<T> = items.into_iter().collect();
    let outcomes = settle_all(&predicate, items.clone(), config).await;
    let mask = apply(outcomes, ErrorStrategy::Raise)?.into_values();
    Ok(items
        .into_iter()
        .zip(mask)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect())
}

/// Awaits `f` on every item for its side effects.
pub async fn for_each<T, R, E, F, Fut>(
    f: F,
    items: impl IntoIterator<Item = T>,
    config: &Config,
) -> Result<Ordered<()>, ParlaneError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<anyhow::Error>,
{
    let strategy = config.error_strategy();
    let outcomes = settle_all(&f, items.into_iter().collect(), config)
        .await
        .into_iter()
        .map(|outcome| outcome.map(drop))
        .collect();
    Ok(apply(outcomes, strategy)?)
}

async fn settle_all<T, R, E, F, Fut>(f: &F, items: Vec<T>, config: &Config) -> Vec<Outcome<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<anyhow::Error>,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let limit = cooperative_limit(config.workers(), total);
    let timeout = config.timeout();
    let gate = Semaphore::new(limit);
    let tally = Mutex::new(Tally::new(config.progress(), total));

    let span = info_span!(
        "parlane.cooperative",
        run_id = %Uuid::new_v4(),
        limit,
        items = total,
        strategy = %config.error_strategy(),
    );

    let invocations = items.into_iter().enumerate().map(|(index, item)| {
        let gate = &gate;
        let tally = &tally;
        async move {
            let outcome = match gate.acquire().await {
                Ok(_permit) => invoke(f, index, item, timeout).await,
                Err(_) => Err(TaskFailure::cancelled(index)),
            };
            tally.lock().settle(index, outcome.is_ok());
            outcome
        }
    });

    let outcomes = join_all(invocations).instrument(span).await;
    debug!(items = total, "Cooperative run settled");
    outcomes
}

async fn invoke<T, R, E, F, Fut>(
    f: &F,
    index: usize,
    item: T,
    timeout: Option<Duration>,
) -> Outcome<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Into<anyhow::Error>,
{
    let future = match catch_unwind(AssertUnwindSafe(|| f(item))) {
        Ok(future) => future,
        Err(payload) => return Err(TaskFailure::panicked(index, payload.as_ref())),
    };
    let guarded = AssertUnwindSafe(future).catch_unwind();

    let settled = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(settled) => settled,
            Err(_) => return Err(TaskFailure::timed_out(index, limit)),
        },
        None => guarded.await,
    };

    match settled {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskFailure::failed(index, e)),
        Err(payload) => Err(TaskFailure::panicked(index, payload.as_ref())),
    }
}

fn apply<R>(outcomes: Vec<Outcome<R>>, strategy: ErrorStrategy) -> Result<Ordered<R>, TaskFailure> {
    let outcomes = match strategy {
        ErrorStrategy::Raise => outcomes
            .into_iter()
            .map(|outcome| outcome.map(Ok))
            .collect::<Result<Vec<_>, _>>()?,
        ErrorStrategy::Skip => outcomes.into_iter().filter(Result::is_ok).collect(),
        ErrorStrategy::Collect => outcomes,
    };
    Ok(Ordered::new(outcomes, strategy))
}
