//! Completion tracking for dispatched tasks.

use crate::core::Outcome;
use crate::errors::TaskFailure;
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::warn;

/// Progress report sent by a worker to the dispatcher.
#[derive(Debug)]
pub enum Event<R> {
    /// A worker began executing `len` items starting at position `start`.
    Started {
        /// First position of the chunk.
        start: usize,
        /// Number of items in the chunk.
        len: usize,
        /// When execution began.
        at: Instant,
    },
    /// One item settled.
    Settled {
        /// Position of the item.
        index: usize,
        /// The item's outcome.
        outcome: Outcome<R>,
    },
}

/// Channel end handed to a backend for one dispatch.
pub type EventSender<R> = Sender<Event<R>>;

/// Iterates over settled items in completion order.
///
/// Yields exactly one `(position, outcome)` for each position in
/// `base..base + total`:
/// - items whose chunk has been running longer than the timeout settle as
///   [`TaskFailure::TimedOut`];
/// - if every sender is dropped before an item settles, it settles as
///   [`TaskFailure::WorkerLost`];
/// - late reports for an already settled item are ignored.
pub struct Completions<R> {
    rx: Receiver<Event<R>>,
    base: usize,
    timeout: Option<Duration>,
    settled: Vec<bool>,
    remaining: usize,
    deadlines: Vec<(Instant, usize, usize)>,
    ready: VecDeque<(usize, Outcome<R>)>,
}

impl<R> Completions<R> {
    /// Tracks `total` items starting at position `base`.
    #[must_use]
    pub fn new(rx: Receiver<Event<R>>, base: usize, total: usize, timeout: Option<Duration>) -> Self {
        Self {
            rx,
            base,
            timeout,
            settled: vec![false; total],
            remaining: total,
            deadlines: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Number of items not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining + self.ready.len()
    }

    fn mark(&mut self, index: usize) -> bool {
        let Some(slot) = index
            .checked_sub(self.base)
            .and_then(|offset| self.settled.get_mut(offset))
        else {
            return false;
        };
        if *slot {
            return false;
        }
        *slot = true;
        self.remaining -= 1;
        true
    }

    fn expire(&mut self, now: Instant) {
        let Some(timeout) = self.timeout else {
            return;
        };
        let (expired, alive): (Vec<_>, Vec<_>) = self
            .deadlines
            .drain(..)
            .partition(|(deadline, _, _)| *deadline <= now);
        self.deadlines = alive;

        for (_, start, len) in expired {
            for index in start..start + len {
                if self.mark(index) {
                    warn!(index, ?timeout, "Task timed out");
                    self.ready
                        .push_back((index, Err(TaskFailure::timed_out(index, timeout))));
                }
            }
        }
    }

    fn abandon_all(&mut self, reason: &str) {
        let lost: Vec<usize> = self
            .settled
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(offset, _)| self.base + offset)
            .collect();
        for index in lost {
            if self.mark(index) {
                self.ready
                    .push_back((index, Err(TaskFailure::worker_lost(index, reason))));
            }
        }
    }
}

impl<R> Iterator for Completions<R> {
    type Item = (usize, Outcome<R>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(done) = self.ready.pop_front() {
                return Some(done);
            }
            if self.remaining == 0 {
                return None;
            }

            let next_deadline = self.deadlines.iter().map(|(d, _, _)| *d).min();
            let event = match next_deadline {
                Some(deadline) => self
                    .rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match event {
                Ok(Event::Started { start, len, at }) => {
                    if let Some(deadline) = self.timeout.and_then(|t| at.checked_add(t)) {
                        self.deadlines.push((deadline, start, len));
                    }
                }
                Ok(Event::Settled { index, outcome }) => {
                    if self.mark(index) {
                        return Some((index, outcome));
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.expire(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => {
                    self.expire(Instant::now());
                    self.abandon_all("worker pool closed before the task settled");
                }
            }
        }
    }
}
