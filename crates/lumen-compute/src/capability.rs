//! Optional device features, discovered by round-trip probes

use crate::backend::{BackendResult, ComputeBackend, MemFlags, MemHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Features detected on the selected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    /// Device-side fill of a buffer with a repeated pattern
    pub atomic_fill: bool,
}

fn default_elements() -> usize {
    16
}

fn default_value() -> f32 {
    123.0
}

/// Scratch buffer used by the probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Floats in the scratch buffer
    #[serde(default = "default_elements")]
    pub elements: usize,
    /// Fill value compared on readback
    #[serde(default = "default_value")]
    pub value: f32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            elements: default_elements(),
            value: default_value(),
        }
    }
}

/// Probe the current context.
///
/// Allocates a scratch buffer, fills it, reads it back and compares every
/// element. The scratch buffer is freed whatever the outcome.
pub fn probe(backend: &mut dyn ComputeBackend, config: &ProbeConfig) -> Capabilities {
    let atomic_fill = probe_fill(backend, config);
    info!("Capability probe: atomic fill: {}", if atomic_fill { "yes" } else { "no" });
    Capabilities { atomic_fill }
}

fn probe_fill(backend: &mut dyn ComputeBackend, config: &ProbeConfig) -> bool {
    let elements = config.elements.max(1);
    let scratch = match backend.create_buffer(MemFlags::READ_WRITE, elements * 4, None) {
        Ok(handle) => handle,
        Err(e) => {
            debug!("Fill probe could not allocate scratch buffer: {}", e);
            return false;
        }
    };

    let outcome = fill_roundtrip(backend, scratch, elements, config.value);
    if let Err(e) = backend.release_mem(scratch) {
        warn!("Unable to release fill probe buffer: {}", e);
    }

    match outcome {
        Ok(matches) => matches,
        Err(e) => {
            debug!("Fill probe failed: {}", e);
            false
        }
    }
}

fn fill_roundtrip(backend: &mut dyn ComputeBackend, scratch: MemHandle, elements: usize, value: f32) -> BackendResult<bool> {
    backend.fill_buffer(scratch, &value.to_ne_bytes(), elements * 4)?;
    backend.finish()?;

    let mut readback = vec![0.0f32; elements];
    backend.read_buffer(scratch, true, bytemuck::cast_slice_mut(&mut readback))?;
    Ok(readback.iter().all(|&v| v == value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostBackendConfig};
    use crate::device::{DeviceClass, DeviceRegistry};
    use lumen_profiler::Profiler;

    fn ready(config: HostBackendConfig) -> HostBackend {
        let mut backend = HostBackend::with_config(config);
        let mut registry = DeviceRegistry::new(Profiler::shared());
        registry.scan(&mut backend).unwrap();
        registry
            .select(&mut backend, DeviceClass::GeneralPurpose, 0, false)
            .unwrap();
        backend
    }

    #[test]
    fn test_probe_is_idempotent() {
        let mut backend = ready(HostBackendConfig::default());
        let config = ProbeConfig::default();

        let first = probe(&mut backend, &config);
        let second = probe(&mut backend, &config);
        assert!(first.atomic_fill);
        assert_eq!(first, second);
        assert_eq!(backend.live_mem_objects(), 0);
    }

    #[test]
    fn test_probe_without_fill_support() {
        let mut backend = ready(HostBackendConfig::default().with_atomic_fill(false));

        assert!(!probe(&mut backend, &ProbeConfig::default()).atomic_fill);
        assert_eq!(backend.live_mem_objects(), 0);
    }

    #[test]
    fn test_probe_when_scratch_allocation_fails() {
        let mut backend = ready(HostBackendConfig::default().with_max_alloc(8));

        assert!(!probe(&mut backend, &ProbeConfig::default()).atomic_fill);
        assert_eq!(backend.live_mem_objects(), 0);
    }
}
