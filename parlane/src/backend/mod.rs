//! Worker pools.
//!
//! A [`Backend`] is a pool of workers that runs a [`Job`] over items and
//! reports each item's outcome through an event channel. Two pools exist:
//!
//! - [`SharedPool`]: OS threads in this process
//! - [`IsolatedPool`]: child processes speaking the [`wire`] protocol
//!
//! Pools are exclusively owned by one engine invocation and shut down on
//! every exit path.

mod completion;
mod isolated;
mod job;
mod shared;
pub mod wire;

pub use completion::{Completions, Event, EventSender};
pub use isolated::{IsolatedPool, WorkerCommand};
pub use job::{Invoke, Job, RemoteSpec};
pub use shared::SharedPool;

use crate::config::BackendKind;
use crate::core::{EarliestFailure, Outcome};
use crate::detection::{BackendProbe, HostProbe};
use crate::errors::{BackendError, TaskFailure};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tracing::debug;

/// A pool of workers.
pub trait Backend<T, R>: Send {
    /// The concrete kind of this pool.
    fn kind(&self) -> BackendKind;

    /// Number of workers.
    fn workers(&self) -> usize;

    /// Queues `items`, occupying positions `start..start + items.len()`, as
    /// one chunk. Every position is eventually reported on `events` unless
    /// the receiver goes away first.
    fn dispatch(&self, start: usize, items: Vec<T>, events: EventSender<R>);

    /// Stops the pool. Queued work is cancelled; see the pool docs for work
    /// already running. Idempotent.
    fn shutdown(&mut self);

    /// Submits one item and returns a handle to its result.
    fn submit(&self, index: usize, item: T) -> TaskHandle<R> {
        let (tx, rx) = mpsc::channel();
        self.dispatch(index, vec![item], tx);
        TaskHandle { index, rx }
    }

    /// Runs every item in chunks and returns results in input order.
    ///
    /// On failure, returns the failure at the lowest position as soon as
    /// every earlier position has settled. Items still queued are left to
    /// [`shutdown`](Self::shutdown).
    fn map(
        &self,
        items: Vec<T>,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<R>, TaskFailure> {
        let total = items.len();
        let chunk_size = chunk_size.max(1);
        let (tx, rx) = mpsc::channel();

        let mut items = items.into_iter();
        let mut start = 0;
        while start < total {
            let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
            let len = chunk.len();
            self.dispatch(start, chunk, tx.clone());
            start += len;
        }
        drop(tx);

        let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut earliest = EarliestFailure::new(total);
        for (index, outcome) in Completions::new(rx, 0, total, timeout) {
            match outcome {
                Ok(value) => {
                    slots[index] = Some(value);
                    earliest.succeeded(index);
                }
                Err(failure) => earliest.failed(failure),
            }
            if let Some(failure) = earliest.decided() {
                return Err(failure);
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// A pending result for one submitted item.
#[derive(Debug)]
pub struct TaskHandle<R> {
    index: usize,
    rx: Receiver<Event<R>>,
}

impl<R> TaskHandle<R> {
    /// Position the item was submitted at.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Blocks until the item settles. The timeout counts from when a worker
    /// starts the item.
    pub fn wait(self, timeout: Option<Duration>) -> Outcome<R> {
        let index = self.index;
        Completions::new(self.rx, index, 1, timeout)
            .next()
            .map_or_else(
                || Err(TaskFailure::worker_lost(index, "no result reported")),
                |(_, outcome)| outcome,
            )
    }
}

/// Creates a pool of the given kind.
///
/// `Auto` asks the host probe. Closure jobs cannot go to an isolated-memory
/// pool. `command` is the worker program for isolated pools; `None` means the
/// current executable. Isolated pools kill a worker whose chunk runs past
/// `timeout`.
pub fn create_backend<T, R>(
    kind: BackendKind,
    workers: usize,
    job: Job<T, R>,
    command: Option<&WorkerCommand>,
    timeout: Option<Duration>,
) -> Result<Box<dyn Backend<T, R>>, BackendError>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let kind = match kind {
        BackendKind::Auto => HostProbe.recommended_backend(),
        concrete => concrete,
    };
    let workers = workers.max(1);
    debug!(backend = %kind, workers, "Creating backend");

    match kind {
        BackendKind::IsolatedMemory => {
            let spec = job.remote_spec().ok_or(BackendError::NotTransferable)?;
            let command = match command {
                Some(command) => command.clone(),
                None => WorkerCommand::current_exe()?,
            };
            Ok(Box::new(IsolatedPool::new(workers, spec, command, timeout)?))
        }
        _ => Ok(Box::new(SharedPool::new(workers, job.invoke())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_shared_backend() {
        let job = Job::local(|x: i32| Ok::<_, std::io::Error>(x * x));
        let mut backend = create_backend(BackendKind::SharedMemory, 3, job, None, None).unwrap();
        assert_eq!(backend.kind(), BackendKind::SharedMemory);
        assert_eq!(backend.workers(), 3);

        let squares = backend.map((0..20).collect(), 4, None).unwrap();
        assert_eq!(squares, (0..20).map(|x| x * x).collect::<Vec<_>>());
        backend.shutdown();
    }

    #[test]
    fn test_closure_not_transferable() {
        let job = Job::local(|x: i32| Ok::<_, std::io::Error>(x));
        let err = create_backend(BackendKind::IsolatedMemory, 2, job, None, None)
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::NotTransferable));
    }

    #[test]
    fn test_unknown_kind_name() {
        let err = "invalid".parse::<BackendKind>().unwrap_err();
        assert!(err.to_string().contains("Unknown backend type"));
    }

    #[test]
    fn test_submit_and_wait() {
        let job = Job::local(|s: String| Ok::<_, std::io::Error>(s.len()));
        let mut backend = create_backend(BackendKind::SharedMemory, 1, job, None, None).unwrap();

        let handle = backend.submit(4, "four".to_string());
        assert_eq!(handle.index(), 4);
        assert_eq!(handle.wait(None).unwrap(), 4);
        backend.shutdown();
    }

    #[test]
    fn test_map_returns_first_failure() {
        #[derive(Debug, thiserror::Error)]
        #[error("three")]
        struct Three;

        let job = Job::local(|x: i32| if x == 3 { Err(Three) } else { Ok(x) });
        let mut backend = create_backend(BackendKind::SharedMemory, 2, job, None, None).unwrap();

        let failure = backend.map(vec![1, 2, 3, 4], 1, None).unwrap_err();
        assert_eq!(failure.index(), 2);
        assert!(failure.downcast_ref::<Three>().is_some());
        backend.shutdown();
    }

    #[test]
    fn test_map_reports_lowest_failing_position() {
        #[derive(Debug, thiserror::Error)]
        #[error("failed on {0}")]
        struct Failed(u64);

        let job = Job::local(|delay: u64| {
            std::thread::sleep(Duration::from_millis(delay));
            Err::<u64, _>(Failed(delay))
        });
        let mut backend = create_backend(BackendKind::SharedMemory, 2, job, None, None).unwrap();

        let failure = backend.map(vec![150, 0], 1, None).unwrap_err();
        assert_eq!(failure.index(), 0);
        assert_eq!(failure.downcast_ref::<Failed>().map(|f| f.0), Some(150));
        backend.shutdown();
    }
}
