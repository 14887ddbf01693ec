//! Cancellation for worker pools.
//!
//! A pool owns one [`CancellationToken`] and shares it with its workers.
//! Shutting the pool down cancels the token, so queued items settle as
//! cancelled instead of running.

mod token;

pub use token::{CancelHook, CancellationToken};
