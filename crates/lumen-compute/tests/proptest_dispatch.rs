//! Property-based tests for launch shapes and buffer management.
//!
//! These tests verify that:
//! - Tiled item counts always cover the requested total
//! - Best shapes never exceed kernel or device limits
//! - Both fill paths produce identical buffers
//! - Reallocating a name never leaks device objects
//!
//! Run with: cargo test --test proptest_dispatch

use proptest::prelude::*;

use lumen_compute::dispatch::tiled_counts;
use lumen_compute::{
    ComputeManager, DeviceClass, DeviceSelection, HostBackend, HostBackendConfig, HostDeviceConfig, HostKernel,
    ManagerConfig, ProgramCacheConfig,
};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn manager(dir: &Path, backend: HostBackend) -> ComputeManager {
    let config = ManagerConfig {
        cache: ProgramCacheConfig {
            kernel_path: dir.to_path_buf(),
            ..ProgramCacheConfig::default()
        },
        device: DeviceSelection {
            class: DeviceClass::Accelerator,
            index: 0,
            interop: false,
        },
        ..ManagerConfig::default()
    };
    let mut manager = ComputeManager::new(backend, config).unwrap();
    manager.initialize().unwrap();
    manager
}

fn accelerator(compute_units: u32, max_workgroup_size: usize) -> HostBackendConfig {
    HostBackendConfig::default().with_device(HostDeviceConfig::accelerator(
        "Prop Accelerator",
        compute_units,
        max_workgroup_size,
    ))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    /// Property: tiled counts cover every item with no whole spare group.
    #[test]
    fn prop_tiled_counts_cover_total(
        total in 0usize..1_000_000,
        workgroups in 1usize..128,
        workgroup_size in 1usize..1024,
    ) {
        let counts = tiled_counts(total, workgroups, workgroup_size);

        prop_assert!(counts.per_group * workgroups >= total);
        prop_assert!(counts.per_workitem * workgroup_size >= counts.per_group);
        if total > 0 {
            prop_assert!((counts.per_group - 1) * workgroups < total);
        }
    }

    /// Property: the best shape is the device optimum clamped to the kernel limit.
    #[test]
    fn prop_best_shape_respects_limits(
        compute_units in 1u32..32,
        device_max in 1usize..512,
        kernel_max in 1usize..512,
    ) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("k.cl"), "__kernel void probe_kernel() { }").unwrap();

        let mut backend = HostBackend::with_config(accelerator(compute_units, device_max));
        backend.register_kernel(
            "probe_kernel",
            HostKernel::new(0, |_| Ok(())).with_max_workgroup_size(kernel_max),
        );
        let mut manager = manager(dir.path(), backend);
        manager.register_kernel("k.cl", "probe_kernel", "k").unwrap();
        manager.load_kernels().unwrap();

        let kernel = manager.kernel("k").unwrap();
        let best = kernel.best();
        prop_assert_eq!(best.workgroups, compute_units as usize);
        prop_assert_eq!(best.workgroup_size, device_max.min(kernel_max));
        prop_assert!(best.workgroup_size <= kernel.limits().max_workgroup_size);
        prop_assert_eq!(kernel.selected(), best);

        manager.launch_optimum("k").unwrap();
    }

    /// Property: the device fill and the fill kernel leave the same contents.
    #[test]
    fn prop_fill_paths_agree(
        len in 1usize..300,
        fill_fraction in 0.0f64..=1.0,
        value in -1000.0f32..1000.0,
    ) {
        let count = ((len as f64 * fill_fraction) as usize).min(len);
        let mut results = Vec::new();

        for atomic_fill in [true, false] {
            let dir = tempdir().unwrap();
            let backend = HostBackend::with_config(accelerator(4, 64).with_atomic_fill(atomic_fill));
            let mut manager = manager(dir.path(), backend);
            prop_assert_eq!(manager.capabilities().map(|c| c.atomic_fill), Some(atomic_fill));

            manager.register_fill_kernel().unwrap();
            manager.load_kernels().unwrap();
            manager.allocate_buffer_rw("buf", len * 4, None).unwrap();
            manager.fill_float("buf", value, count).unwrap();
            results.push(manager.read_floats("buf", len).unwrap());
        }

        prop_assert_eq!(&results[0], &results[1]);
        prop_assert!(results[0][..count].iter().all(|&v| v == value));
        prop_assert!(results[0][count..].iter().all(|&v| v == 0.0));
    }

    /// Property: repeated allocation under one name keeps one live object.
    #[test]
    fn prop_reallocation_does_not_leak(
        sizes in prop::collection::vec(1usize..4096, 1..12),
    ) {
        let dir = tempdir().unwrap();
        let mut manager = manager(dir.path(), HostBackend::with_config(accelerator(2, 32)));

        for &size in &sizes {
            manager.allocate_buffer_rw("scratch", size, None).unwrap();
            prop_assert_eq!(manager.backend().live_mem_objects(), 1);
        }
        prop_assert_eq!(manager.resource("scratch").unwrap().size(), sizes.last().copied());
    }
}
