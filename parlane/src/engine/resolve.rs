//! Worker count and chunk size heuristics.

use crate::config::BackendKind;
use crate::detection::{BackendProbe, HostProbe};

/// Upper bound for automatically chosen worker counts.
pub const MAX_WORKERS: usize = 32;

/// Logical CPUs on this host.
#[must_use]
pub fn host_cpus() -> usize {
    num_cpus::get().max(1)
}

/// Chooses a worker count.
///
/// An explicit request wins. Otherwise shared memory gets
/// `min(32, cpus + 4)` since blocked threads leave cores idle, isolated
/// memory gets `min(32, cpus)`, and neither gets more workers than items.
/// `Auto` consults the host probe.
#[must_use]
pub fn resolve_workers(
    requested: Option<usize>,
    kind: BackendKind,
    n_items: usize,
    cpus: usize,
) -> usize {
    resolve_workers_with(requested, kind, n_items, cpus, &HostProbe)
}

/// [`resolve_workers`] with an explicit probe for `Auto`.
#[must_use]
pub fn resolve_workers_with(
    requested: Option<usize>,
    kind: BackendKind,
    n_items: usize,
    cpus: usize,
    probe: &dyn BackendProbe,
) -> usize {
    if let Some(workers) = requested {
        return workers.max(1);
    }

    let kind = match kind {
        BackendKind::Auto => probe.recommended_backend(),
        concrete => concrete,
    };
    let default = match kind {
        BackendKind::IsolatedMemory => MAX_WORKERS.min(cpus),
        BackendKind::SharedMemory | BackendKind::Auto => MAX_WORKERS.min(cpus + 4),
    };
    default.min(n_items.max(1)).max(1)
}

/// Concurrency limit for cooperative runs: explicit, or one slot per item up
/// to 32.
#[must_use]
pub fn cooperative_limit(requested: Option<usize>, n_items: usize) -> usize {
    requested.map_or_else(|| MAX_WORKERS.min(n_items.max(1)), |w| w.max(1))
}

/// Items per chunk: about four chunks per worker, at least one item.
#[must_use]
pub fn chunk_size(n_items: usize, workers: usize) -> usize {
    if n_items == 0 {
        return 1;
    }
    n_items.div_ceil(workers.max(1) * 4).max(1)
}
