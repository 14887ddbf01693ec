//! Host capability probe used to resolve [`BackendKind::Auto`].
//!
//! Native threads run in parallel without any interpreter-level lock, so the
//! host recommendation is shared memory unless the operator pins a backend
//! through `PARLANE_BACKEND`. The answer is computed once per process.

use crate::config::{BackendKind, ENV_BACKEND};
use std::sync::OnceLock;
use tracing::debug;

/// Recommends a concrete backend for `auto`.
#[cfg_attr(test, mockall::automock)]
pub trait BackendProbe: Send + Sync {
    /// Returns [`BackendKind::SharedMemory`] or [`BackendKind::IsolatedMemory`].
    fn recommended_backend(&self) -> BackendKind;
}

/// The process-wide probe. Cached after the first call.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

static RECOMMENDED: OnceLock<BackendKind> = OnceLock::new();

impl BackendProbe for HostProbe {
    fn recommended_backend(&self) -> BackendKind {
        *RECOMMENDED.get_or_init(|| {
            let pinned = std::env::var(ENV_BACKEND).ok();
            let kind = probe(pinned.as_deref());
            debug!(backend = %kind, pinned = ?pinned, "Resolved host backend");
            kind
        })
    }
}

/// Returns the cached host recommendation.
pub fn recommended_backend() -> BackendKind {
    HostProbe.recommended_backend()
}

fn probe(pinned: Option<&str>) -> BackendKind {
    match pinned.and_then(|raw| raw.parse::<BackendKind>().ok()) {
        Some(BackendKind::IsolatedMemory) => BackendKind::IsolatedMemory,
        _ => BackendKind::SharedMemory,
    }
}
