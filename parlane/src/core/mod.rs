//! Core value types shared by every execution model.
//!
//! This module provides:
//! - Tagged per-item outcomes and the ordered result set
//! - Progress notifications and sinks

mod outcome;
mod progress;

pub use outcome::{Ordered, Outcome};
pub use progress::{
    CollectingProgress, NoOpProgress, Progress, ProgressHook, ProgressSink,
};

pub(crate) use outcome::{restore_order, EarliestFailure};
pub(crate) use progress::Tally;
