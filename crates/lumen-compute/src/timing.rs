//! Flush-and-time brackets around device operations

use crate::backend::{BackendResult, ComputeBackend};
use lumen_profiler::{lock, SharedProfiler};
use tracing::warn;

/// Timer names for one operation, outermost first
#[derive(Debug, Clone)]
pub(crate) struct ProfileScope {
    names: Vec<String>,
}

impl ProfileScope {
    pub(crate) fn single(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    /// `<family>_ALL` around `<family>_<item>`
    pub(crate) fn family(family: &str, item: &str) -> Self {
        Self {
            names: vec![format!("{}_ALL", family), format!("{}_{}", family, item)],
        }
    }
}

/// Run `op` between matching start/stop calls for every name in `scope`.
///
/// Timers are stopped whatever the outcome so a failed operation does not
/// leave a timer running.
pub(crate) fn profiled<T, E>(
    profiler: &SharedProfiler,
    scope: &ProfileScope,
    op: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    {
        let mut profiler = lock(profiler);
        for name in &scope.names {
            profiler.start(name.as_str());
        }
    }

    let result = op();

    let mut profiler = lock(profiler);
    for name in scope.names.iter().rev() {
        profiler.stop(name.as_str());
    }
    result
}

/// Drain the queue, then run and time `op`, then drain again so the
/// measurement covers device execution rather than enqueue latency.
pub(crate) fn device_op<T>(
    backend: &mut dyn ComputeBackend,
    profiler: &SharedProfiler,
    scope: &ProfileScope,
    op: impl FnOnce(&mut dyn ComputeBackend) -> BackendResult<T>,
) -> BackendResult<T> {
    sync(backend);
    profiled(profiler, scope, || {
        let result = op(&mut *backend);
        sync(backend);
        result
    })
}

/// Flush and finish the queue. Failures are logged; the next device call reports them.
pub(crate) fn sync(backend: &mut dyn ComputeBackend) {
    if let Err(e) = backend.flush().and_then(|_| backend.finish()) {
        warn!("Queue synchronization failed: {}", e);
    }
}
