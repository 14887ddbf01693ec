//! Validated, immutable execution configuration.
//!
//! A [`Config`] is built once and never changes. Every invalid value is
//! rejected by [`ConfigBuilder::build`], so nothing downstream re-validates.

mod kinds;

pub use kinds::{BackendKind, ErrorStrategy};

use crate::core::{ProgressHook, ProgressSink};
use crate::errors::{ConfigError, ParlaneError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the worker count.
pub const ENV_WORKERS: &str = "PARLANE_WORKERS";
/// Environment variable holding the backend kind.
pub const ENV_BACKEND: &str = "PARLANE_BACKEND";
/// Environment variable holding the per-task timeout in seconds.
pub const ENV_TIMEOUT: &str = "PARLANE_TIMEOUT";
/// Environment variable holding the chunk size.
pub const ENV_CHUNK_SIZE: &str = "PARLANE_CHUNK_SIZE";
/// Environment variable holding the error strategy.
pub const ENV_ON_ERROR: &str = "PARLANE_ON_ERROR";

/// Execution configuration consumed by the engine.
#[derive(Clone, Default)]
pub struct Config {
    workers: Option<usize>,
    backend: BackendKind,
    timeout: Option<Duration>,
    chunk_size: Option<usize>,
    error_strategy: ErrorStrategy,
    progress: Option<ProgressHook>,
}

impl Config {
    /// Starts a builder with default values.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Returns a builder seeded with this configuration.
    #[must_use]
    pub fn to_builder(&self) -> ConfigBuilder {
        ConfigBuilder {
            workers: self.workers.map(|w| i64::try_from(w).unwrap_or(i64::MAX)),
            backend: self.backend,
            timeout: self.timeout.map(TimeoutSetting::Exact),
            chunk_size: self.chunk_size.map(|c| i64::try_from(c).unwrap_or(i64::MAX)),
            error_strategy: self.error_strategy,
            progress: self.progress.clone(),
        }
    }

    /// Explicit worker count, `None` for automatic sizing.
    #[must_use]
    pub fn workers(&self) -> Option<usize> {
        self.workers
    }

    /// Requested backend kind.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Per-task timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Explicit chunk size, `None` for the heuristic.
    #[must_use]
    pub fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    /// Error strategy.
    #[must_use]
    pub fn error_strategy(&self) -> ErrorStrategy {
        self.error_strategy
    }

    /// Progress sink, if any.
    #[must_use]
    pub fn progress(&self) -> Option<&dyn ProgressSink> {
        self.progress.as_deref()
    }

    /// Returns a copy with a different error strategy.
    #[must_use]
    pub fn with_error_strategy(&self, error_strategy: ErrorStrategy) -> Self {
        Self {
            error_strategy,
            ..self.clone()
        }
    }

    /// Returns a copy with a different worker count; `None` or zero means
    /// automatic.
    #[must_use]
    pub fn with_workers(&self, workers: Option<usize>) -> Self {
        Self {
            workers: workers.filter(|&w| w > 0),
            ..self.clone()
        }
    }

    /// Returns a copy with a different backend.
    #[must_use]
    pub fn with_backend(&self, backend: BackendKind) -> Self {
        Self {
            backend,
            ..self.clone()
        }
    }

    /// Parses a JSON document shaped like [`ConfigFile`].
    pub fn from_json_str(json: &str) -> Result<Self, ParlaneError> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| ConfigError::parse("json", e.to_string()))?;
        file.into_config()
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ParlaneError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::parse(path.display().to_string(), e.to_string()))?;
        Self::from_json_str(&raw)
    }

    /// Reads the `PARLANE_*` environment variables.
    pub fn from_env() -> Result<Self, ParlaneError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration values through `lookup`, keyed by the `PARLANE_*`
    /// variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ParlaneError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut file = ConfigFile::default();
        if let Some(raw) = lookup(ENV_WORKERS) {
            file.workers = Some(parse_number(ENV_WORKERS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_BACKEND) {
            file.backend = raw;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            file.timeout_seconds = Some(parse_number(ENV_TIMEOUT, &raw)?);
        }
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            file.chunk_size = Some(parse_number(ENV_CHUNK_SIZE, &raw)?);
        }
        if let Some(raw) = lookup(ENV_ON_ERROR) {
            file.on_error = raw;
        }
        file.into_config()
    }
}

fn parse_number<N>(key: &str, raw: &str) -> Result<N, ConfigError>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: N::Err| ConfigError::parse(key, format!("{raw:?}: {e}")))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("workers", &self.workers)
            .field("backend", &self.backend)
            .field("timeout", &self.timeout)
            .field("chunk_size", &self.chunk_size)
            .field("error_strategy", &self.error_strategy)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Builder for [`Config`].
///
/// Values are stored as given and checked by [`build`](Self::build).
#[derive(Clone, Default)]
pub struct ConfigBuilder {
    workers: Option<i64>,
    backend: BackendKind,
    timeout: Option<TimeoutSetting>,
    chunk_size: Option<i64>,
    error_strategy: ErrorStrategy,
    progress: Option<ProgressHook>,
}

/// A timeout as it was given to the builder.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TimeoutSetting {
    Exact(Duration),
    Seconds(f64),
}

impl TimeoutSetting {
    fn resolve(self) -> Result<Duration, ConfigError> {
        match self {
            Self::Exact(duration) if !duration.is_zero() => Ok(duration),
            Self::Exact(_) => Err(ConfigError::Timeout { value: 0.0 }),
            Self::Seconds(value) if value.is_finite() && value > 0.0 => {
                Duration::try_from_secs_f64(value).map_err(|_| ConfigError::Timeout { value })
            }
            Self::Seconds(value) => Err(ConfigError::Timeout { value }),
        }
    }
}

impl ConfigBuilder {
    /// Sets the worker count (or gate capacity for the cooperative model).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(i64::try_from(workers).unwrap_or(i64::MAX));
        self
    }

    /// Returns to automatic worker sizing.
    #[must_use]
    pub fn auto_workers(mut self) -> Self {
        self.workers = None;
        self
    }

    /// Sets the backend kind.
    #[must_use]
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the per-task timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(TimeoutSetting::Exact(timeout));
        self
    }

    /// Sets the per-task timeout in seconds.
    #[must_use]
    pub fn timeout_secs(mut self, seconds: f64) -> Self {
        self.timeout = Some(TimeoutSetting::Seconds(seconds));
        self
    }

    /// Sets the chunk size used by isolated-memory pools.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(i64::try_from(chunk_size).unwrap_or(i64::MAX));
        self
    }

    /// Sets the error strategy.
    #[must_use]
    pub fn error_strategy(mut self, error_strategy: ErrorStrategy) -> Self {
        self.error_strategy = error_strategy;
        self
    }

    /// Attaches a progress sink.
    #[must_use]
    pub fn progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Some(Arc::new(sink));
        self
    }

    /// Attaches a shared progress sink.
    #[must_use]
    pub fn progress_hook(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    /// Validates the values and builds the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        let workers = match self.workers {
            None => None,
            Some(w) if w >= 1 => Some(usize::try_from(w).unwrap_or(usize::MAX)),
            Some(w) => return Err(ConfigError::Workers { value: w }),
        };

        let timeout = self.timeout.map(TimeoutSetting::resolve).transpose()?;

        let chunk_size = match self.chunk_size {
            None => None,
            Some(c) if c >= 1 => Some(usize::try_from(c).unwrap_or(usize::MAX)),
            Some(c) => return Err(ConfigError::ChunkSize { value: c }),
        };

        Ok(Config {
            workers,
            backend: self.backend,
            timeout,
            chunk_size,
            error_strategy: self.error_strategy,
            progress: self.progress,
        })
    }
}

impl std::fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("workers", &self.workers)
            .field("backend", &self.backend)
            .field("timeout", &self.timeout)
            .field("chunk_size", &self.chunk_size)
            .field("error_strategy", &self.error_strategy)
            .finish_non_exhaustive()
    }
}

/// Serialized configuration, as read from JSON or the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Worker count; absent or zero means automatic.
    #[serde(default)]
    pub workers: Option<i64>,
    /// Backend name.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Per-task timeout in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// Chunk size for isolated-memory pools.
    #[serde(default)]
    pub chunk_size: Option<i64>,
    /// Error strategy name.
    #[serde(default = "default_on_error")]
    pub on_error: String,
}

fn default_backend() -> String {
    "auto".to_string()
}

fn default_on_error() -> String {
    "raise".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            workers: None,
            backend: default_backend(),
            timeout_seconds: None,
            chunk_size: None,
            on_error: default_on_error(),
        }
    }
}

impl ConfigFile {
    /// Validates the values into a [`Config`].
    pub fn into_config(self) -> Result<Config, ParlaneError> {
        let backend: BackendKind = self.backend.parse()?;
        let error_strategy: ErrorStrategy = self.on_error.parse()?;

        let builder = ConfigBuilder {
            // Zero keeps the automatic default, as in the serialized form.
            workers: self.workers.filter(|w| *w != 0),
            backend,
            timeout: self.timeout_seconds.map(TimeoutSetting::Seconds),
            chunk_size: self.chunk_size,
            error_strategy,
            progress: None,
        };
        Ok(builder.build()?)
    }
}
