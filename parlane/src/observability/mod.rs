//! Observability utilities.

mod progress;
mod subscriber;

pub use progress::LoggingProgress;
pub use subscriber::{init_tracing, LogFormat, LOG_ENV};
