//! Error types for parlane.
//!
//! Three layers of failure exist and they never mix:
//!
//! - [`ConfigError`] and [`BackendError`] are raised synchronously, before any
//!   item is dispatched.
//! - [`TaskFailure`] describes why a single item did not produce a value. It is
//!   only ever surfaced through the configured error strategy.
//! - [`ParlaneError`] is what entry points return.

use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;

/// The main error type for parlane operations.
#[derive(Debug, Error)]
pub enum ParlaneError {
    /// Invalid configuration value.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker pool could not be created.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A task failed under the `raise` strategy.
    #[error(transparent)]
    Task(#[from] TaskFailure),
}

impl ParlaneError {
    /// Returns the task failure, if this error is one.
    #[must_use]
    pub fn as_task_failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Task(failure) => Some(failure),
            _ => None,
        }
    }

    /// Consumes the error and returns the task failure, if this error is one.
    pub fn into_task_failure(self) -> Result<TaskFailure, Self> {
        match self {
            Self::Task(failure) => Ok(failure),
            other => Err(other),
        }
    }
}

/// Error raised when a configuration value is invalid.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Worker count below one.
    #[error("workers must be >= 1, got {value}")]
    Workers {
        /// The rejected value.
        value: i64,
    },

    /// Timeout that is zero, negative, not a number or too large for a
    /// [`Duration`](std::time::Duration).
    #[error("timeout must be > 0 and within range, got {value}")]
    Timeout {
        /// The rejected value in seconds.
        value: f64,
    },

    /// Chunk size below one.
    #[error("chunk_size must be >= 1, got {value}")]
    ChunkSize {
        /// The rejected value.
        value: i64,
    },

    /// Pipeline batch size below one.
    #[error("batch size must be >= 1, got {value}")]
    BatchSize {
        /// The rejected value.
        value: usize,
    },

    /// Unrecognized error strategy name.
    #[error("unknown error strategy: {name:?} (expected raise, skip or collect)")]
    UnknownStrategy {
        /// The rejected name.
        name: String,
    },

    /// A pipeline was configured with a strategy it cannot honor.
    #[error("pipelines cannot use the collect strategy; use map_outcomes for per-item results")]
    PipelineCollect,

    /// A configuration source could not be parsed.
    #[error("invalid configuration for {key}: {reason}")]
    Parse {
        /// The configuration key or source.
        key: String,
        /// Why parsing failed.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a parse error.
    #[must_use]
    pub fn parse(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when a backend cannot be created.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Unrecognized backend name.
    #[error("Unknown backend type: {name:?}")]
    UnknownKind {
        /// The rejected name.
        name: String,
    },

    /// A closure was routed to an isolated-memory pool.
    #[error("closures cannot be sent to isolated-memory workers; implement RemoteTask instead")]
    NotTransferable,

    /// The worker program could not be located.
    #[error("cannot locate worker program: {reason}")]
    WorkerProgram {
        /// Why lookup failed.
        reason: String,
    },

    /// A worker thread or process failed to start.
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        /// What was being spawned.
        what: String,
        /// The underlying IO error.
        source: std::io::Error,
    },
}

impl BackendError {
    /// Creates an unknown-kind error.
    #[must_use]
    pub fn unknown_kind(name: impl Into<String>) -> Self {
        Self::UnknownKind { name: name.into() }
    }

    /// Creates a spawn error.
    #[must_use]
    pub fn spawn(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            what: what.into(),
            source,
        }
    }
}

/// A keyword argument could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    /// The argument is absent.
    #[error("missing keyword argument {name:?}")]
    Missing {
        /// Argument name.
        name: String,
    },

    /// The argument has the wrong shape.
    #[error("invalid keyword argument {name:?}: {reason}")]
    Invalid {
        /// Argument name.
        name: String,
        /// Why decoding failed.
        reason: String,
    },
}

/// Why a single item did not produce a value.
///
/// Equality and hashing look only at [`kind`](Self::kind) and
/// [`message`](Self::message), never at the position or the identity of the
/// wrapped error, so two failures raised the same way compare equal.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// The function returned an error.
    #[error("task {index} failed: {cause}")]
    Failed {
        /// Position of the item in the input.
        index: usize,
        /// Type name of the original error.
        kind: String,
        /// The original error.
        cause: anyhow::Error,
    },

    /// The task did not settle within the per-task timeout.
    #[error("task {index} timed out after {timeout:?}")]
    TimedOut {
        /// Position of the item in the input.
        index: usize,
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The function panicked.
    #[error("task {index} panicked: {message}")]
    Panicked {
        /// Position of the item in the input.
        index: usize,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// The worker running the task went away before reporting.
    #[error("task {index} lost its worker: {reason}")]
    WorkerLost {
        /// Position of the item in the input.
        index: usize,
        /// What happened to the worker.
        reason: String,
    },

    /// The task was cancelled before it started.
    #[error("task {index} was cancelled")]
    Cancelled {
        /// Position of the item in the input.
        index: usize,
    },
}

impl TaskFailure {
    /// Wraps an error returned by the function for the item at `index`.
    pub fn failed<E>(index: usize, error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Failed {
            index,
            kind: std::any::type_name::<E>().to_string(),
            cause: error.into(),
        }
    }

    /// Creates a timeout failure.
    #[must_use]
    pub fn timed_out(index: usize, timeout: Duration) -> Self {
        Self::TimedOut { index, timeout }
    }

    /// Creates a panic failure from a panic payload.
    #[must_use]
    pub fn panicked(index: usize, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { index, message }
    }

    /// Creates a lost-worker failure.
    #[must_use]
    pub fn worker_lost(index: usize, reason: impl Into<String>) -> Self {
        Self::WorkerLost {
            index,
            reason: reason.into(),
        }
    }

    /// Creates a cancellation failure.
    #[must_use]
    pub fn cancelled(index: usize) -> Self {
        Self::Cancelled { index }
    }

    /// Rebuilds a failure reported by a worker process.
    ///
    /// The original error value cannot cross the process boundary, so the
    /// cause is a [`RemoteError`] carrying the reported kind and message.
    #[must_use]
    pub fn remote(index: usize, kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        if kind == "panic" {
            return Self::Panicked { index, message };
        }
        Self::Failed {
            index,
            kind: kind.clone(),
            cause: anyhow::Error::new(RemoteError { kind, message }),
        }
    }

    /// Position of the failing item in the input.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Failed { index, .. }
            | Self::TimedOut { index, .. }
            | Self::Panicked { index, .. }
            | Self::WorkerLost { index, .. }
            | Self::Cancelled { index } => *index,
        }
    }

    /// Moves the failure to another position.
    #[must_use]
    pub fn at(mut self, position: usize) -> Self {
        match &mut self {
            Self::Failed { index, .. }
            | Self::TimedOut { index, .. }
            | Self::Panicked { index, .. }
            | Self::WorkerLost { index, .. }
            | Self::Cancelled { index } => *index = position,
        }
        self
    }

    /// The failure kind: the original error's type name for `Failed`, a fixed
    /// label otherwise.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Failed { kind, .. } => kind,
            Self::TimedOut { .. } => "timeout",
            Self::Panicked { .. } => "panic",
            Self::WorkerLost { .. } => "worker_lost",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// The failure message, without the position.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Failed { cause, .. } => cause.to_string(),
            Self::TimedOut { timeout, .. } => format!("timed out after {timeout:?}"),
            Self::Panicked { message, .. } | Self::WorkerLost { reason: message, .. } => {
                message.clone()
            }
            Self::Cancelled { .. } => "cancelled".to_string(),
        }
    }

    /// Returns true for a timeout failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Borrows the original error if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed { cause, .. } => cause.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns the original error for `Failed`, or the failure itself wrapped
    /// in an [`anyhow::Error`] otherwise.
    #[must_use]
    pub fn into_cause(self) -> anyhow::Error {
        match self {
            Self::Failed { cause, .. } => cause,
            other => anyhow::Error::new(other),
        }
    }
}

/// An error raised inside a worker process, as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Type name of the error in the worker.
    pub kind: String,
    /// The error message.
    pub message: String,
}

impl PartialEq for TaskFailure {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.message() == other.message()
    }
}

impl Eq for TaskFailure {}

impl Hash for TaskFailure {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.message().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Error, PartialEq)]
    #[error("bad input {0}")]
    struct BadInput(i32);

    #[derive(Debug, Error)]
    #[error("bad input {0}")]
    struct OtherError(i32);

    #[test]
    fn test_failed_keeps_original_error() {
        let failure = TaskFailure::failed(3, BadInput(3));

        assert_eq!(failure.index(), 3);
        assert_eq!(failure.downcast_ref::<BadInput>(), Some(&BadInput(3)));
        assert!(failure.kind().ends_with("BadInput"));

        let cause = failure.into_cause();
        assert_eq!(cause.downcast::<BadInput>().ok(), Some(BadInput(3)));
    }

    #[test]
    fn test_equality_ignores_index_and_identity() {
        assert_eq!(
            TaskFailure::failed(0, BadInput(1)),
            TaskFailure::failed(9, BadInput(1))
        );
        assert_ne!(
            TaskFailure::failed(0, BadInput(1)),
            TaskFailure::failed(0, BadInput(2))
        );
        // Same message, different kind.
        assert_ne!(
            TaskFailure::failed(0, BadInput(1)),
            TaskFailure::failed(0, OtherError(1))
        );
    }

    #[test]
    fn test_hash_matches_equality() {
        let set: HashSet<TaskFailure> = [
            TaskFailure::failed(0, BadInput(1)),
            TaskFailure::failed(1, BadInput(1)),
            TaskFailure::failed(2, BadInput(2)),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remote_failure() {
        let failure = TaskFailure::remote(4, "my_crate::BadInput", "bad input 4");
        assert_eq!(failure.kind(), "my_crate::BadInput");
        assert_eq!(failure.message(), "bad input 4");
        assert_eq!(
            failure.downcast_ref::<RemoteError>().map(|e| e.kind.as_str()),
            Some("my_crate::BadInput")
        );

        let failure = TaskFailure::remote(4, "panic", "boom");
        assert!(matches!(failure, TaskFailure::Panicked { index: 4, .. }));
    }

    #[test]
    fn test_panic_payloads() {
        let failure = TaskFailure::panicked(1, &"boom");
        assert_eq!(failure.message(), "boom");

        let failure = TaskFailure::panicked(1, &String::from("owned boom"));
        assert_eq!(failure.message(), "owned boom");

        let failure = TaskFailure::panicked(1, &42_u8);
        assert_eq!(failure.kind(), "panic");
    }

    #[test]
    fn test_timeout_failure() {
        let failure = TaskFailure::timed_out(4, Duration::from_millis(50));
        assert!(failure.is_timeout());
        assert!(failure.to_string().contains("task 4 timed out"));
        assert!(failure.downcast_ref::<BadInput>().is_none());
    }

    #[test]
    fn test_at_moves_position() {
        let failure = TaskFailure::cancelled(0).at(7);
        assert_eq!(failure.index(), 7);
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::Workers { value: -1 }.to_string(),
            "workers must be >= 1, got -1"
        );
        assert_eq!(
            ConfigError::Timeout { value: 0.0 }.to_string(),
            "timeout must be > 0 and within range, got 0"
        );
        assert_eq!(
            ConfigError::ChunkSize { value: 0 }.to_string(),
            "chunk_size must be >= 1, got 0"
        );
    }

    #[test]
    fn test_parlane_error_conversions() {
        let err: ParlaneError = TaskFailure::cancelled(2).into();
        assert_eq!(err.as_task_failure().map(TaskFailure::index), Some(2));

        let err: ParlaneError = BackendError::unknown_kind("gpu").into();
        assert!(err.as_task_failure().is_none());
        assert!(err.to_string().contains("Unknown backend type"));
        assert!(err.into_task_failure().is_err());
    }
}
