//! Lazy, immutable pipelines over the engine.
//!
//! A [`Pipeline`] records steps without running them. Only the terminals
//! ([`collect`](Pipeline::collect), [`reduce`](Pipeline::reduce),
//! [`count`](Pipeline::count), [`first`](Pipeline::first)) execute, walking
//! the steps in order and fully materializing each one before the next.
//! When a step produces nothing the remaining steps are skipped.
//!
//! Every builder method returns a new pipeline and leaves the receiver
//! untouched; two pipelines may share a prefix and diverge.
//!
//! ```rust,ignore
//! let evens = parlane::pipeline(0..10)
//!     .map(|x: i32| Ok::<_, Infallible>(x * x))
//!     .filter(|x: &i32| Ok::<_, Infallible>(x % 2 == 0))
//!     .workers(4);
//! assert_eq!(evens.collect()?, vec![0, 4, 16, 36, 64]);
//! ```

mod step;

pub use step::StepKind;

use crate::backend::WorkerCommand;
use crate::config::{BackendKind, Config, ErrorStrategy};
use crate::core::Outcome;
use crate::engine::Engine;
use crate::errors::{ConfigError, ParlaneError};
use crate::worker::RemoteTask;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use step::{into_batches, Node, Source, Stage};
use tracing::{debug, debug_span};

/// Builds a pipeline over `source`.
pub fn pipeline<T, I>(source: I) -> Pipeline<T>
where
    I: IntoIterator<Item = T>,
    T: Clone + Send + Sync + 'static,
{
    Pipeline::new(source)
}

/// An immutable chain of steps over a source sequence.
pub struct Pipeline<T> {
    node: Arc<dyn Node<T>>,
    engine: Engine,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            engine: self.engine.clone(),
        }
    }
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a pipeline with the default configuration.
    pub fn new(source: impl IntoIterator<Item = T>) -> Self {
        Self {
            node: Arc::new(Source::new(source.into_iter().collect())),
            engine: Engine::default(),
        }
    }
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    /// Appends a map step, run with the pipeline's error strategy.
    #[must_use]
    pub fn map<U, E, F>(&self, f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        E: Into<anyhow::Error>,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.then(StepKind::Map, move |engine, items| {
            let f = Arc::clone(&f);
            Ok(engine.map(move |item| f(item), items)?.into_values())
        })
    }

    /// Appends a step applying the remote task `K`.
    #[must_use]
    pub fn map_remote<K>(&self) -> Pipeline<K::Output>
    where
        K: RemoteTask<Input = T>,
    {
        self.then(StepKind::MapRemote(K::NAME), |engine, items| {
            Ok(engine.map_remote::<K>(items)?.into_values())
        })
    }

    /// Appends a filter step. A predicate failure always aborts.
    #[must_use]
    pub fn filter<E, F>(&self, predicate: F) -> Self
    where
        E: Into<anyhow::Error>,
        F: Fn(&T) -> Result<bool, E> + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.then(StepKind::Filter, move |engine, items| {
            let predicate = Arc::clone(&predicate);
            engine.filter(move |item: &T| predicate(item), items)
        })
    }

    /// Appends a step mapping each item to a sequence and concatenating the
    /// sequences in order.
    #[must_use]
    pub fn flat_map<U, I, E, F>(&self, f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        E: Into<anyhow::Error>,
        F: Fn(T) -> Result<I, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.then(StepKind::FlatMap, move |engine, items| {
            let f = Arc::clone(&f);
            let nested = engine
                .map(
                    move |item| f(item).map(|out| out.into_iter().collect::<Vec<U>>()),
                    items,
                )?
                .into_values();
            Ok(nested.into_iter().flatten().collect())
        })
    }

    /// Appends a step grouping items into contiguous batches of `size`.
    pub fn batch(&self, size: usize) -> Result<Pipeline<Vec<T>>, ConfigError> {
        if size == 0 {
            return Err(ConfigError::BatchSize { value: size });
        }
        Ok(self.then(StepKind::Batch(size), move |_, items| {
            Ok(into_batches(items, size))
        }))
    }

    /// Appends a map step that keeps every item's outcome, as if the step
    /// ran under `collect`.
    #[must_use]
    pub fn map_outcomes<U, E, F>(&self, f: F) -> Pipeline<Outcome<U>>
    where
        U: Send + 'static,
        E: Into<anyhow::Error>,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.then(StepKind::MapOutcomes, move |engine, items| {
            let f = Arc::clone(&f);
            Ok(engine
                .with_error_strategy(ErrorStrategy::Collect)
                .map(move |item| f(item), items)?
                .into_outcomes())
        })
    }

    /// Sets the worker count; `0` means automatic.
    #[must_use]
    pub fn workers(&self, workers: usize) -> Self {
        self.reconfigure(self.engine.config().with_workers(Some(workers)))
    }

    /// Sets the backend.
    #[must_use]
    pub fn backend(&self, backend: BackendKind) -> Self {
        self.reconfigure(self.engine.config().with_backend(backend))
    }

    /// Sets the per-task timeout.
    pub fn timeout(&self, timeout: Duration) -> Result<Self, ConfigError> {
        let config = self.engine.config().to_builder().timeout(timeout).build()?;
        Ok(self.reconfigure(config))
    }

    /// Sets the error strategy for map steps. `collect` is rejected; use
    /// [`map_outcomes`](Self::map_outcomes) instead.
    pub fn on_error(&self, strategy: ErrorStrategy) -> Result<Self, ConfigError> {
        reject_collect(strategy)?;
        Ok(self.reconfigure(self.engine.config().with_error_strategy(strategy)))
    }

    /// Replaces the whole configuration.
    pub fn with_config(&self, config: Config) -> Result<Self, ConfigError> {
        reject_collect(config.error_strategy())?;
        Ok(self.reconfigure(config))
    }

    /// Runs the steps on `engine`, which also carries the probe and worker
    /// command.
    pub fn with_engine(&self, engine: Engine) -> Result<Self, ConfigError> {
        reject_collect(engine.config().error_strategy())?;
        Ok(Self {
            node: Arc::clone(&self.node),
            engine,
        })
    }

    /// Sets the program started for isolated-memory workers.
    #[must_use]
    pub fn with_worker_command(&self, command: WorkerCommand) -> Self {
        Self {
            node: Arc::clone(&self.node),
            engine: self.engine.clone().with_worker_command(command),
        }
    }

    /// The configuration every step runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        self.engine.config()
    }

    /// The recorded steps, oldest first.
    #[must_use]
    pub fn steps(&self) -> Vec<StepKind> {
        let mut steps = Vec::new();
        self.node.steps(&mut steps);
        steps
    }

    /// Runs every step and returns the result.
    pub fn collect(&self) -> Result<Vec<T>, ParlaneError> {
        let steps = self.steps();
        let span = debug_span!("parlane.pipeline", steps = steps.len());
        let _guard = span.enter();

        let items = self.node.run(&self.engine)?;
        debug!(results = items.len(), "Pipeline finished");
        Ok(items)
    }

    /// Runs every step and passes the result to `aggregator`.
    pub fn reduce<A, F>(&self, aggregator: F) -> Result<A, ParlaneError>
    where
        F: FnOnce(Vec<T>) -> A,
    {
        self.collect().map(aggregator)
    }

    /// Runs every step and returns the number of results.
    pub fn count(&self) -> Result<usize, ParlaneError> {
        self.reduce(|items| items.len())
    }

    /// Runs every step and returns the first result, if any.
    pub fn first(&self) -> Result<Option<T>, ParlaneError> {
        self.reduce(|items| items.into_iter().next())
    }

    fn then<U, F>(&self, kind: StepKind, apply: F) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(&Engine, Vec<T>) -> Result<Vec<U>, ParlaneError> + Send + Sync + 'static,
    {
        let stage = Stage::new(Arc::clone(&self.node), kind, Box::new(apply));
        Pipeline {
            node: Arc::new(stage),
            engine: self.engine.clone(),
        }
    }

    fn reconfigure(&self, config: Config) -> Self {
        Self {
            node: Arc::clone(&self.node),
            engine: self.engine.clone().with_config(config),
        }
    }
}

fn reject_collect(strategy: ErrorStrategy) -> Result<(), ConfigError> {
    if strategy == ErrorStrategy::Collect {
        return Err(ConfigError::PipelineCollect);
    }
    Ok(())
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps = Vec::new();
        self.node.steps(&mut steps);
        f.write_str("Pipeline(")?;
        for step in &steps {
            write!(f, "{step}, ")?;
        }
        write!(f, "pending={} steps)", steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackendError;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("bad item {0}")]
    struct BadItem(i32);

    fn square(x: i32) -> Result<i32, Infallible> {
        Ok(x * x)
    }

    fn shared<T: Send + 'static>(p: &Pipeline<T>) -> Pipeline<T> {
        p.backend(BackendKind::SharedMemory).workers(3)
    }

    #[test]
    fn test_collect_source() {
        assert_eq!(pipeline(vec![3, 1, 2]).collect().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_map_then_filter() {
        let p = shared(&pipeline(0..10))
            .map(square)
            .filter(|x: &i32| Ok::<_, Infallible>(x % 2 == 0));
        assert_eq!(p.collect().unwrap(), vec![0, 4, 16, 36, 64]);
    }

    #[test]
    fn test_immutable_and_rerunnable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let p1 = shared(&pipeline(1..=4));
        let p2 = p1.map(move |x: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(x * 10)
        });
        let p3 = p2.filter(|x: &i32| Ok::<_, Infallible>(*x > 20));

        assert!(p1.steps().is_empty());
        assert_eq!(p2.steps(), vec![StepKind::Map]);
        assert_eq!(p3.steps(), vec![StepKind::Map, StepKind::Filter]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(p1.collect().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(p2.collect().unwrap(), vec![10, 20, 30, 40]);
        assert_eq!(p2.collect().unwrap(), vec![10, 20, 30, 40]);
        assert_eq!(p3.collect().unwrap(), vec![30, 40]);
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_settings_do_not_touch_receiver() {
        let p1 = pipeline(vec![1]);
        let p2 = p1.workers(2).on_error(ErrorStrategy::Skip).unwrap();
        assert_eq!(p1.config().workers(), None);
        assert_eq!(p1.config().error_strategy(), ErrorStrategy::Raise);
        assert_eq!(p2.config().workers(), Some(2));
        assert_eq!(p2.config().error_strategy(), ErrorStrategy::Skip);
        assert_eq!(p2.workers(0).config().workers(), None);
    }

    #[test]
    fn test_batch() {
        let batches = pipeline(0..5).batch(2).unwrap().collect().unwrap();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);

        let groups = pipeline(0..7).batch(3).unwrap().count().unwrap();
        assert_eq!(groups, 3);
    }

    #[test]
    fn test_batch_zero_rejected_at_construction() {
        assert_eq!(
            pipeline(0..5).batch(0).unwrap_err(),
            ConfigError::BatchSize { value: 0 }
        );
    }

    #[test]
    fn test_flat_map_keeps_outer_and_inner_order() {
        let p = shared(&pipeline(1..=3))
            .flat_map(|n: i32| Ok::<_, Infallible>((0..n).map(move |i| n * 10 + i)));
        assert_eq!(p.collect().unwrap(), vec![10, 20, 21, 30, 31, 32]);
    }

    #[test]
    fn test_batch_then_map() {
        let sums = shared(&pipeline(1..=5))
            .batch(2)
            .unwrap()
            .map(|batch: Vec<i32>| Ok::<_, Infallible>(batch.iter().sum::<i32>()));
        assert_eq!(sums.collect().unwrap(), vec![3, 7, 5]);
    }

    #[test]
    fn test_empty_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let p = shared(&pipeline(0..5))
            .filter(|_: &i32| Ok::<_, Infallible>(false))
            .map(move |x: i32| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(x)
            })
            .batch(2)
            .unwrap();
        assert!(p.collect().unwrap().is_empty());
        assert_eq!(p.first().unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_source_skips_isolated_closures() {
        let p = pipeline(Vec::<i32>::new())
            .backend(BackendKind::IsolatedMemory)
            .map(square);
        assert!(p.collect().unwrap().is_empty());
    }

    #[test]
    fn test_terminals() {
        let p = shared(&pipeline(1..=4)).map(square);
        assert_eq!(p.reduce(|xs| xs.iter().sum::<i32>()).unwrap(), 30);
        assert_eq!(
            p.reduce(|xs| xs.into_iter().collect::<BTreeSet<_>>()).unwrap(),
            BTreeSet::from([1, 4, 9, 16])
        );
        assert_eq!(p.count().unwrap(), 4);
        assert_eq!(p.first().unwrap(), Some(1));
    }

    #[test]
    fn test_on_error_skip() {
        let p = shared(&pipeline(vec![1, 2, 3, 4]))
            .on_error(ErrorStrategy::Skip)
            .unwrap()
            .map(|x: i32| if x == 3 { Err(BadItem(x)) } else { Ok(x * 2) });
        assert_eq!(p.collect().unwrap(), vec![2, 4, 8]);
    }

    #[test]
    fn test_raise_surfaces_failure() {
        let p = shared(&pipeline(vec![1, 2, 3, 4]))
            .map(|x: i32| if x == 3 { Err(BadItem(x)) } else { Ok(x) });
        let failure = p.collect().unwrap_err().into_task_failure().unwrap();
        assert_eq!(failure.index(), 2);
        assert_eq!(failure.downcast_ref::<BadItem>().map(|b| b.0), Some(3));
    }

    #[test]
    fn test_collect_strategy_rejected() {
        let p = pipeline(vec![1]);
        assert_eq!(
            p.on_error(ErrorStrategy::Collect).unwrap_err(),
            ConfigError::PipelineCollect
        );

        let config = Config::builder()
            .error_strategy(ErrorStrategy::Collect)
            .build()
            .unwrap();
        assert!(p.with_config(config.clone()).is_err());
        assert!(p.with_engine(Engine::new(config)).is_err());
    }

    #[test]
    fn test_map_outcomes() {
        let outcomes = shared(&pipeline(vec![1, 2, 3]))
            .map_outcomes(|x: i32| if x == 2 { Err(BadItem(x)) } else { Ok(x) })
            .collect()
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].as_ref().ok(), Some(&1));
        assert_eq!(outcomes[1].as_ref().unwrap_err().index(), 1);
        assert_eq!(outcomes[2].as_ref().ok(), Some(&3));
    }

    #[test]
    fn test_map_remote_in_shared_memory() {
        struct Negate;

        impl RemoteTask for Negate {
            const NAME: &'static str = "negate";
            type Input = i64;
            type Output = i64;
            type Error = Infallible;

            fn call(input: i64) -> Result<i64, Infallible> {
                Ok(-input)
            }
        }

        let p = shared(&pipeline(vec![1_i64, 2, 3])).map_remote::<Negate>();
        assert_eq!(p.steps(), vec![StepKind::MapRemote("negate")]);
        assert_eq!(p.collect().unwrap(), vec![-1, -2, -3]);
    }

    #[test]
    fn test_closure_on_isolated_backend_fails_at_terminal() {
        let p = pipeline(vec![1, 2])
            .backend(BackendKind::IsolatedMemory)
            .map(square);
        assert!(matches!(
            p.collect(),
            Err(ParlaneError::Backend(BackendError::NotTransferable))
        ));
    }

    #[test]
    fn test_timeout() {
        let p = pipeline(vec![1]).timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(p.config().timeout(), Some(Duration::from_secs(2)));
        assert!(pipeline(vec![1]).timeout(Duration::ZERO).is_err());
    }

    #[test]
    fn test_debug() {
        let p = pipeline(0..3)
            .map(square)
            .filter(|_: &i32| Ok::<_, Infallible>(true));
        assert_eq!(format!("{p:?}"), "Pipeline(map, filter, pending=2 steps)");
        assert_eq!(format!("{:?}", pipeline(0..3)), "Pipeline(pending=0 steps)");
    }
}
