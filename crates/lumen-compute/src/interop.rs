//! Acquire/release brackets for objects shared with the renderer
//!
//! A shared texture belongs to the graphics side until it is acquired, and
//! must be handed back before the renderer uses it again. Compute work on a
//! shared object is only legal between the two calls.

use crate::backend::{BackendError, ComputeBackend, MemHandle, Status};
use crate::resource::ResourceTable;
use crate::timing::{self, ProfileScope};
use crate::{ComputeError, Result};
use lumen_profiler::SharedProfiler;
use tracing::debug;

/// Serializes compute access to shared objects
pub struct InteropGate {
    profiler: SharedProfiler,
}

impl InteropGate {
    pub fn new(profiler: SharedProfiler) -> Self {
        Self { profiler }
    }

    /// Take a shared object from the graphics side
    pub fn acquire(&self, backend: &mut dyn ComputeBackend, resources: &ResourceTable, name: &str) -> Result<()> {
        let handle = shared_handle(resources, name).map_err(|source| ComputeError::InteropAcquire {
            name: name.to_string(),
            source,
        })?;

        timing::device_op(backend, &self.profiler, &ProfileScope::family("interop_acquire", name), |b| {
            b.acquire_shared(handle)
        })
        .map_err(|source| ComputeError::InteropAcquire {
            name: name.to_string(),
            source,
        })?;
        debug!("Acquired '{}'", name);
        Ok(())
    }

    /// Return a shared object to the graphics side
    pub fn release(&self, backend: &mut dyn ComputeBackend, resources: &ResourceTable, name: &str) -> Result<()> {
        let handle = shared_handle(resources, name).map_err(|source| ComputeError::InteropRelease {
            name: name.to_string(),
            source,
        })?;

        timing::device_op(backend, &self.profiler, &ProfileScope::family("interop_release", name), |b| {
            b.release_shared(handle)
        })
        .map_err(|source| ComputeError::InteropRelease {
            name: name.to_string(),
            source,
        })?;
        debug!("Released '{}' to graphics", name);
        Ok(())
    }
}

fn shared_handle(resources: &ResourceTable, name: &str) -> std::result::Result<MemHandle, BackendError> {
    match resources.get(name) {
        Ok(resource) if resource.is_shared() => Ok(resource.handle()),
        Ok(_) => Err(BackendError::new(
            Status::INVALID_GL_OBJECT,
            format!("'{}' is not a shared graphics object", name),
        )),
        Err(_) => Err(BackendError::new(
            Status::INVALID_GL_OBJECT,
            format!("no shared object named '{}'", name),
        )),
    }
}
