//! Shared-memory pool: OS threads pulling items from one queue.

use super::{Backend, Event, EventSender, Invoke};
use crate::cancellation::CancellationToken;
use crate::config::BackendKind;
use crate::errors::{BackendError, TaskFailure};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, warn};

struct Message<T, R> {
    index: usize,
    item: T,
    events: EventSender<R>,
}

/// A fixed set of threads sharing the caller's memory.
///
/// Every item is its own queue entry, so chunk sizes are ignored. On
/// shutdown, queued items settle as [`TaskFailure::Cancelled`] without
/// running; items already running finish before `shutdown` returns.
pub struct SharedPool<T, R> {
    workers: usize,
    sender: Option<Sender<Message<T, R>>>,
    threads: Vec<JoinHandle<()>>,
    token: Arc<CancellationToken>,
}

impl<T, R> SharedPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Starts `workers` threads running `invoke`.
    pub fn new(workers: usize, invoke: Invoke<T, R>) -> Result<Self, BackendError> {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Message<T, R>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let token = Arc::new(CancellationToken::new());

        let mut pool = Self {
            workers,
            sender: Some(sender),
            threads: Vec::with_capacity(workers),
            token,
        };

        for id in 0..workers {
            let receiver = Arc::clone(&receiver);
            let token = Arc::clone(&pool.token);
            let invoke = Arc::clone(&invoke);
            let spawned = std::thread::Builder::new()
                .name(format!("parlane-worker-{id}"))
                .spawn(move || work(&receiver, &token, &invoke));
            match spawned {
                Ok(handle) => pool.threads.push(handle),
                Err(e) => {
                    pool.stop("spawn failed");
                    return Err(BackendError::spawn(format!("worker thread {id}"), e));
                }
            }
        }

        debug!(workers, "Shared pool started");
        Ok(pool)
    }
}

fn work<T, R>(
    receiver: &Mutex<Receiver<Message<T, R>>>,
    token: &CancellationToken,
    invoke: &Invoke<T, R>,
) {
    loop {
        // The guard is released before the item runs.
        let message = receiver.lock().recv();
        let Ok(Message { index, item, events }) = message else {
            break;
        };

        if token.is_cancelled() {
            let _ = events.send(Event::Settled {
                index,
                outcome: Err(TaskFailure::cancelled(index)),
            });
            continue;
        }

        let _ = events.send(Event::Started {
            start: index,
            len: 1,
            at: Instant::now(),
        });
        let outcome = catch_unwind(AssertUnwindSafe(|| invoke(index, item)))
            .unwrap_or_else(|payload| Err(TaskFailure::panicked(index, payload.as_ref())));
        let _ = events.send(Event::Settled { index, outcome });
    }
}

impl<T, R> Backend<T, R> for SharedPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::SharedMemory
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn dispatch(&self, start: usize, items: Vec<T>, events: EventSender<R>) {
        for (offset, item) in items.into_iter().enumerate() {
            let index = start + offset;
            let message = Message {
                index,
                item,
                events: events.clone(),
            };
            let queued = match &self.sender {
                Some(sender) => sender.send(message).is_ok(),
                None => false,
            };
            if !queued {
                let _ = events.send(Event::Settled {
                    index,
                    outcome: Err(TaskFailure::cancelled(index)),
                });
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop("pool shutdown");
    }
}

impl<T, R> SharedPool<T, R> {
    fn stop(&mut self, reason: &str) {
        if self.sender.is_none() && self.threads.is_empty() {
            return;
        }
        self.token.cancel(reason);
        self.sender.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread exited abnormally");
            }
        }
        debug!(workers = self.workers, reason, "Shared pool stopped");
    }
}

impl<T, R> Drop for SharedPool<T, R> {
    fn drop(&mut self) {
        self.stop("pool dropped");
    }
}
