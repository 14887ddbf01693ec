//! The ordered parallel execution engine.
//!
//! Every entry point takes a function, an ordered input and a [`Config`],
//! runs the function over the input on one backend, and returns results in
//! input order:
//!
//! - [`map`]: one output per input, shaped by the error strategy
//! - [`filter`]: inputs whose predicate holds; predicate failures always abort
//! - [`for_each`]: side effects only
//! - [`starmap`]: like `map`, with each input spread into the arguments
//!
//! Empty input returns immediately without creating a backend.

mod resolve;
mod strategy;
mod unpack;


pub use resolve::{
    chunk_size, cooperative_limit, host_cpus, resolve_workers, resolve_workers_with, MAX_WORKERS,
};
pub use unpack::{Kwargs, Unpack};

use crate::backend::{create_backend, Job, WorkerCommand};
use crate::config::{BackendKind, Config, ErrorStrategy};
use crate::core::Ordered;
use crate::detection::{BackendProbe, HostProbe};
use crate::errors::{BackendError, ParlaneError};
use crate::worker::RemoteTask;
use std::sync::Arc;
use std::time::Instant;
use strategy::Plan;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

/// Runs functions over items according to a [`Config`].
#[derive(Clone)]
pub struct Engine {
    config: Config,
    probe: Arc<dyn BackendProbe>,
    worker_command: Option<WorkerCommand>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    /// Creates an engine using the host probe and the current executable as
    /// worker program.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            probe: Arc::new(HostProbe),
            worker_command: None,
        }
    }

    /// Replaces the probe consulted for `auto`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn BackendProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Sets the program started for isolated-memory workers.
    #[must_use]
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Replaces the configuration, keeping the probe and worker command.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a copy with a different error strategy.
    #[must_use]
    pub fn with_error_strategy(&self, strategy: ErrorStrategy) -> Self {
        Self {
            config: self.config.with_error_strategy(strategy),
            ..self.clone()
        }
    }

    /// Applies `f` to every item.
    ///
    /// Under `raise` the first failure is returned as
    /// [`ParlaneError::Task`]; under `skip` failed items are left out; under
    /// `collect` every item has an entry.
    pub fn map<T, R, E, F>(&self, f: F, items: impl IntoIterator<Item = T>) -> Result<Ordered<R>, ParlaneError>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Into<anyhow::Error>,
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    {
        self.run(Job::local(f), items.into_iter().collect())
    }

    /// Keeps the items for which `predicate` returns true, in input order.
    ///
    /// A predicate failure aborts the call whatever the configured strategy.
    pub fn filter<T, E, F>(&self, predicate: F, items: impl IntoIterator<Item = T>) -> Result<Vec<T>, ParlaneError>
    where
        T: Send + 'static,
        E: Into<anyhow::Error>,
        F: Fn(&T) -> Result<bool, E> + Send + Sync + 'static,
    {
        let job = Job::local(move |item: T| predicate(&item).map(|keep| (item, keep)));
        let kept = self
            .run_as(job, items.into_iter().collect(), ErrorStrategy::Raise)?
            .into_values()
            .into_iter()
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect();
        Ok(kept)
    }

    /// Calls `f` on every item for its side effects.
    ///
    /// Return values are discarded. Under `collect` the result still shows
    /// which items failed.
    pub fn for_each<T, R, E, F>(&self, f: F, items: impl IntoIterator<Item = T>) -> Result<Ordered<()>, ParlaneError>
    where
        T: Send + 'static,
        E: Into<anyhow::Error>,
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    {
        self.run(Job::local(move |item: T| f(item).map(drop)), items.into_iter().collect())
    }

    /// Like [`map`](Self::map), with each item spread into `f`'s arguments.
    ///
    /// Items are tuples (`f(a, b)`) or [`Kwargs`] (`f(kwargs)`).
    pub fn starmap<A, R, E, F>(&self, f: F, items: impl IntoIterator<Item = A>) -> Result<Ordered<R>, ParlaneError>
    where
        A: Unpack<F, Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Into<anyhow::Error>,
        F: Send + Sync + 'static,
    {
        self.run(Job::local(move |args: A| args.unpack_into(&f)), items.into_iter().collect())
    }

    /// Applies the remote task `K` to every item. Runs on either backend.
    pub fn map_remote<K>(&self, items: impl IntoIterator<Item = K::Input>) -> Result<Ordered<K::Output>, ParlaneError>
    where
        K: RemoteTask,
    {
        self.run(Job::remote::<K>(), items.into_iter().collect())
    }

    /// Keeps the items for which the remote predicate `K` returns true.
    pub fn filter_remote<K>(&self, items: impl IntoIterator<Item = K::Input>) -> Result<Vec<K::Input>, ParlaneError>
    where
        K: RemoteTask<Output = bool>,
        K::Input: Clone,
    {
        let items: Vec<K::Input> = items.into_iter().collect();
        let mask = self
            .run_as(Job::remote::<K>(), items.clone(), ErrorStrategy::Raise)?
            .into_values();
        Ok(items
            .into_iter()
            .zip(mask)
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect())
    }

    /// Runs the remote task `K` on every item for its side effects.
    pub fn for_each_remote<K>(&self, items: impl IntoIterator<Item = K::Input>) -> Result<Ordered<()>, ParlaneError>
    where
        K: RemoteTask,
    {
        let outcomes = self
            .run(Job::remote::<K>(), items.into_iter().collect())?
            .into_iter()
            .map(|outcome| outcome.map(drop))
            .collect();
        Ok(Ordered::new(outcomes, self.config.error_strategy()))
    }

    /// Runs a prepared job with the configured strategy.
    pub fn run<T, R>(&self, job: Job<T, R>, items: Vec<T>) -> Result<Ordered<R>, ParlaneError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        self.run_as(job, items, self.config.error_strategy())
    }

    fn run_as<T, R>(&self, job: Job<T, R>, items: Vec<T>, strategy: ErrorStrategy) -> Result<Ordered<R>, ParlaneError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        if items.is_empty() {
            return Ok(Ordered::empty(strategy));
        }

        let kind = self.resolve_kind(&job)?;
        let n_items = items.len();
        let workers = resolve_workers(self.config.workers(), kind, n_items, host_cpus());
        let chunk = self
            .config
            .chunk_size()
            .unwrap_or_else(|| chunk_size(n_items, workers));

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "parlane.run",
            %run_id,
            backend = %kind,
            workers,
            items = n_items,
            strategy = %strategy,
        );
        let _guard = span.enter();
        let started = Instant::now();

        let timeout = self.config.timeout();
        let mut backend =
            create_backend(kind, workers, job, self.worker_command.as_ref(), timeout)?;
        let plan = Plan {
            strategy,
            chunk_size: chunk,
            timeout,
            progress: self.config.progress(),
        };
        let result = strategy::execute(backend.as_ref(), items, &plan);
        backend.shutdown();

        match result {
            Ok(ordered) => {
                debug!(
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    results = ordered.len(),
                    "Run finished"
                );
                Ok(ordered)
            }
            Err(failure) => {
                warn!(index = failure.index(), kind = failure.kind(), "Run aborted: {}", failure);
                Err(failure.into())
            }
        }
    }

    fn resolve_kind<T, R>(&self, job: &Job<T, R>) -> Result<BackendKind, BackendError>
    where
        T: 'static,
        R: 'static,
    {
        match self.config.backend() {
            BackendKind::Auto if job.is_transferable() => Ok(self.probe.recommended_backend()),
            BackendKind::Auto => Ok(BackendKind::SharedMemory),
            BackendKind::IsolatedMemory if !job.is_transferable() => Err(BackendError::NotTransferable),
            concrete => Ok(concrete),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("worker_command", &self.worker_command)
            .finish_non_exhaustive()
    }
}

/// Applies `f` to every item. See [`Engine::map`].
pub fn map<T, R, E, F>(f: F, items: impl IntoIterator<Item = T>, config: &Config) -> Result<Ordered<R>, ParlaneError>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Into<anyhow::Error>,
    F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
{
    Engine::new(config.clone()).map(f, items)
}

/// Keeps items whose predicate holds. See [`Engine::filter`].
pub fn filter<T, E, F>(predicate: F, items: impl IntoIterator<Item = T>, config: &Config) -> Result<Vec<T>, ParlaneError>
where
    T: Send + 'static,
    E: Into<anyhow::Error>,
    F: Fn(&T) -> Result<bool, E> + Send + Sync + 'static,
{
    Engine::new(config.clone()).filter(predicate, items)
}

/// Calls `f` on every item. See [`Engine::for_each`].
pub fn for_each<T, R, E, F>(f: F, items: impl IntoIterator<Item = T>, config: &Config) -> Result<Ordered<()>, ParlaneError>
where
    T: Send + 'static,
    E: Into<anyhow::Error>,
    F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
{
    Engine::new(config.clone()).for_each(f, items)
}

/// Applies `f` with each item spread into its arguments. See
/// [`Engine::starmap`].
pub fn starmap<A, R, E, F>(f: F, items: impl IntoIterator<Item = A>, config: &Config) -> Result<Ordered<R>, ParlaneError>
where
    A: Unpack<F, Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Into<anyhow::Error>,
    F: Send + Sync + 'static,
{
    Engine::new(config.clone()).starmap(f, items)
}
