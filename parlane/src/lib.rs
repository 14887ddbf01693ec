//! # Parlane
//!
//! Ordered parallel `map`, `filter`, `for_each` and `starmap`, plus lazy
//! pipelines built on top of them.
//!
//! Parlane provides:
//!
//! - **Order preservation**: results come back in input order whatever order
//!   workers finish in
//! - **Three execution models**: a shared-memory thread pool, isolated worker
//!   processes, and cooperative async tasks behind a concurrency gate
//! - **Error strategies**: `raise` the first failure, `skip` failed items, or
//!   `collect` a tagged outcome per item
//! - **Pipelines**: immutable step chains that run only when a terminal is
//!   called
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use parlane::prelude::*;
//!
//! let config = Config::builder().workers(4).build()?;
//! let squares = parlane::map(|x: u64| Ok::<_, Infallible>(x * x), 0..20, &config)?;
//! assert_eq!(squares.into_values()[19], 361);
//!
//! let evens = parlane::pipeline(0..10)
//!     .map(|x: i32| Ok::<_, Infallible>(x + 1))
//!     .filter(|x: &i32| Ok::<_, Infallible>(x % 2 == 0))
//!     .collect()?;
//! ```
//!
//! Work that must run in worker processes is written as a
//! [`worker::RemoteTask`]; the program's `main` calls
//! [`worker::serve_if_worker`] before anything else.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod cooperative;
pub mod core;
pub mod detection;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod worker;

pub use crate::config::{BackendKind, Config, ErrorStrategy};
pub use crate::core::{Ordered, Outcome};
pub use crate::engine::{filter, for_each, map, starmap, Engine, Kwargs};
pub use crate::errors::{ParlaneError, TaskFailure};
pub use crate::pipeline::{pipeline, Pipeline};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{BackendKind, Config, ConfigBuilder, ErrorStrategy};
    pub use crate::core::{
        CollectingProgress, NoOpProgress, Ordered, Outcome, Progress, ProgressSink,
    };
    pub use crate::detection::{recommended_backend, BackendProbe};
    pub use crate::engine::{Engine, Kwargs};
    pub use crate::errors::{
        ArgumentError, BackendError, ConfigError, ParlaneError, TaskFailure,
    };
    pub use crate::observability::{init_tracing, LogFormat, LoggingProgress};
    pub use crate::pipeline::{pipeline, Pipeline, StepKind};
    pub use crate::worker::{serve_if_worker, RemoteTask, TaskRegistry};
    pub use std::convert::Infallible;
}
