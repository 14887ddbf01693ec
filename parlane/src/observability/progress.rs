use crate::core::{Progress, ProgressSink};
use tracing::{debug, error, info, trace, warn, Level};

/// A progress sink that logs every settled item using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingProgress {
    level: Level,
}

impl Default for LoggingProgress {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgress {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }
}

impl ProgressSink for LoggingProgress {
    fn on_item(&self, p: &Progress) {
        match self.level {
            Level::TRACE => trace!(
                index = p.index,
                completed = p.completed,
                total = p.total,
                succeeded = p.succeeded,
                "Item settled"
            ),
            Level::DEBUG => debug!(
                index = p.index,
                completed = p.completed,
                total = p.total,
                succeeded = p.succeeded,
                "Item settled"
            ),
            Level::INFO => info!(
                index = p.index,
                completed = p.completed,
                total = p.total,
                succeeded = p.succeeded,
                "Item settled"
            ),
            Level::WARN => warn!(
                index = p.index,
                completed = p.completed,
                total = p.total,
                succeeded = p.succeeded,
                "Item settled"
            ),
            _ => error!(
                index = p.index,
                completed = p.completed,
                total = p.total,
                succeeded = p.succeeded,
                "Item settled"
            ),
        }
    }
}
