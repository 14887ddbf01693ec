//! Per-item progress notifications.
//!
//! Rendering is left to the caller; parlane only promises that a sink sees
//! exactly one [`Progress`] per settled item.

use parking_lot::RwLock;
use std::sync::Arc;

/// One settled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Position of the item in the input.
    pub index: usize,
    /// Items settled so far, this one included.
    pub completed: usize,
    /// Total number of items in the invocation.
    pub total: usize,
    /// Whether the item produced a value.
    pub succeeded: bool,
}

impl Progress {
    /// Fraction of items settled, between 0 and 1.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }

    /// Returns true once every item has settled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

/// Trait for receivers of progress notifications.
pub trait ProgressSink: Send + Sync {
    /// Called once per settled item, in completion order.
    fn on_item(&self, progress: &Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn on_item(&self, progress: &Progress) {
        self(progress);
    }
}

/// Shared handle to a progress sink.
pub type ProgressHook = Arc<dyn ProgressSink>;

/// A sink that discards all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgress;

impl ProgressSink for NoOpProgress {
    fn on_item(&self, _progress: &Progress) {}
}

/// A sink that records every notification, for tests.
#[derive(Debug, Default)]
pub struct CollectingProgress {
    seen: RwLock<Vec<Progress>>,
}

impl CollectingProgress {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded notifications.
    #[must_use]
    pub fn seen(&self) -> Vec<Progress> {
        self.seen.read().clone()
    }

    /// Returns the number of recorded notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }
}

impl ProgressSink for CollectingProgress {
    fn on_item(&self, progress: &Progress) {
        self.seen.write().push(*progress);
    }
}

/// Counts settled items and forwards them to an optional sink.
pub(crate) struct Tally<'a> {
    sink: Option<&'a dyn ProgressSink>,
    completed: usize,
    total: usize,
}

impl<'a> Tally<'a> {
    pub(crate) fn new(sink: Option<&'a dyn ProgressSink>, total: usize) -> Self {
        Self {
            sink,
            completed: 0,
            total,
        }
    }

    pub(crate) fn settle(&mut self, index: usize, succeeded: bool) {
        self.completed += 1;
        if let Some(sink) = self.sink {
            sink.on_item(&Progress {
                index,
                completed: self.completed,
                total: self.total,
                succeeded,
            });
        }
    }
}
