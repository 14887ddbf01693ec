//! Error strategies over a running backend.
//!
//! Two dispatch paths exist:
//!
//! - Fast: `raise` without progress. Items go out in chunks through
//!   [`Backend::map`], which stops at the first failure.
//! - Tracked: everything else. One item per task, each settled item is
//!   counted for progress exactly once and then routed by the strategy.
//!
//! Under `raise` both paths report the failure at the lowest position. They
//! stop waiting once every position before it has settled; the caller then
//! shuts the backend down, which cancels whatever is still queued.

use crate::backend::{Backend, Completions};
use crate::config::ErrorStrategy;
use crate::core::{restore_order, EarliestFailure, Ordered, ProgressSink, Tally};
use crate::errors::TaskFailure;
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

/// Dispatch settings for one run.
pub(crate) struct Plan<'a> {
    pub(crate) strategy: ErrorStrategy,
    pub(crate) chunk_size: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) progress: Option<&'a dyn ProgressSink>,
}

impl Plan<'_> {
    fn is_fast(&self) -> bool {
        self.strategy == ErrorStrategy::Raise && self.progress.is_none()
    }
}

pub(crate) fn execute<T, R>(
    backend: &dyn Backend<T, R>,
    items: Vec<T>,
    plan: &Plan<'_>,
) -> Result<Ordered<R>, TaskFailure> {
    if plan.is_fast() {
        let values = backend.map(items, plan.chunk_size, plan.timeout)?;
        return Ok(Ordered::new(
            values.into_iter().map(Ok).collect(),
            ErrorStrategy::Raise,
        ));
    }

    let total = items.len();
    let (tx, rx) = mpsc::channel();
    for (index, item) in items.into_iter().enumerate() {
        backend.dispatch(index, vec![item], tx.clone());
    }
    drop(tx);

    let mut tally = Tally::new(plan.progress, total);
    let mut earliest = EarliestFailure::new(total);
    let mut settled = Vec::with_capacity(total);
    for (index, outcome) in Completions::new(rx, 0, total, plan.timeout) {
        tally.settle(index, outcome.is_ok());
        match (plan.strategy, outcome) {
            (ErrorStrategy::Raise, Err(failure)) => earliest.failed(failure),
            (ErrorStrategy::Skip, Err(failure)) => {
                debug!(index, kind = failure.kind(), "Skipping failed item");
            }
            (ErrorStrategy::Raise, outcome) => {
                earliest.succeeded(index);
                settled.push((index, outcome));
            }
            (_, outcome) => settled.push((index, outcome)),
        }
        if let Some(failure) = earliest.decided() {
            return Err(failure);
        }
    }

    Ok(Ordered::new(restore_order(settled), plan.strategy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Job, SharedPool};
    use crate::core::CollectingProgress;
    use pretty_assertions::assert_eq;

    #[derive(Debug, thiserror::Error)]
    #[error("failed on {0}")]
    struct Boom(i32);

    fn pool() -> SharedPool<i32, i32> {
        let job = Job::local(|x: i32| if x == 3 { Err(Boom(x)) } else { Ok(x * 2) });
        SharedPool::new(4, job.invoke()).unwrap()
    }

    fn plan(strategy: ErrorStrategy, progress: Option<&dyn ProgressSink>) -> Plan<'_> {
        Plan {
            strategy,
            chunk_size: 1,
            timeout: None,
            progress,
        }
    }

    #[test]
    fn test_skip_drops_failures() {
        let ordered = execute(&pool(), vec![1, 2, 3, 4], &plan(ErrorStrategy::Skip, None)).unwrap();
        assert_eq!(ordered.into_values(), vec![2, 4, 8]);
    }

    #[test]
    fn test_collect_keeps_positions() {
        let outcomes = execute(&pool(), vec![1, 2, 3, 4], &plan(ErrorStrategy::Collect, None))
            .unwrap()
            .into_outcomes();

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].as_ref().unwrap(), &2);
        assert_eq!(outcomes[1].as_ref().unwrap(), &4);
        assert_eq!(outcomes[2].as_ref().unwrap_err().index(), 2);
        assert_eq!(outcomes[3].as_ref().unwrap(), &8);
    }

    #[test]
    fn test_raise_on_both_paths() {
        let progress = CollectingProgress::new();
        for progress in [None, Some(&progress as &dyn ProgressSink)] {
            let failure = execute(&pool(), vec![1, 2, 3, 4], &plan(ErrorStrategy::Raise, progress))
                .unwrap_err();
            assert_eq!(failure.downcast_ref::<Boom>().map(|b| b.0), Some(3));
        }
    }

    #[test]
    fn test_raise_reports_lowest_position_on_both_paths() {
        let job = Job::local(|delay: u64| {
            std::thread::sleep(Duration::from_millis(delay));
            Err::<u64, _>(Boom(i32::try_from(delay).unwrap_or(i32::MAX)))
        });
        let progress = CollectingProgress::new();
        for progress in [None, Some(&progress as &dyn ProgressSink)] {
            let pool = SharedPool::new(2, job.invoke()).unwrap();
            let failure = execute(&pool, vec![150, 0], &plan(ErrorStrategy::Raise, progress))
                .unwrap_err();
            assert_eq!(failure.index(), 0);
            assert_eq!(failure.downcast_ref::<Boom>().map(|b| b.0), Some(150));
        }
    }

    #[test]
    fn test_progress_once_per_item() {
        let progress = CollectingProgress::new();
        execute(
            &pool(),
            (0..10).collect(),
            &plan(ErrorStrategy::Collect, Some(&progress)),
        )
        .unwrap();

        let seen = progress.seen();
        assert_eq!(seen.len(), 10);
        let mut indices: Vec<_> = seen.iter().map(|p| p.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert_eq!(
            seen.iter().map(|p| p.completed).collect::<Vec<_>>(),
            (1..=10).collect::<Vec<_>>()
        );
        assert_eq!(seen.iter().filter(|p| !p.succeeded).count(), 1);
    }
}
