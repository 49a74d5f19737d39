//! End-to-end tests of the compute manager on the host backend.
//!
//! Each test drives a full session: device selection, program loading from a
//! temporary kernel directory, named buffers and launches.

use lumen_compute::{
    ComputeError, ComputeManager, DeviceClass, DeviceSelection, HostBackend, HostBackendConfig, HostDeviceConfig,
    HostKernel, LaunchShape, ManagerConfig, MemFlags, ProgramCacheConfig, Status,
};
use lumen_profiler::lock;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const GEOMETRY: &str = r#"
__kernel void scale(__global float *data, const float factor) {
    data[get_global_id(0)] *= factor;
}

__kernel void tiles(__global float *out, const uint per_group, const uint per_item) {
}
"#;

/// Multiplies `data[id]` by `factor` for every global id inside the buffer.
fn scale_kernel() -> HostKernel {
    HostKernel::new(2, |ctx| {
        let factor = ctx.scalar::<f32>(1)?;
        let ids: Vec<[usize; 2]> = ctx.global_ids().collect();
        let data = ctx.floats_mut(0)?;
        for [x, _] in ids {
            if let Some(v) = data.get_mut(x) {
                *v *= factor;
            }
        }
        Ok(())
    })
}

/// Records its tile counts and launch range in `out[0..4]`.
fn tiles_kernel() -> HostKernel {
    HostKernel::new(3, |ctx| {
        let per_group = ctx.scalar::<u32>(1)? as f32;
        let per_item = ctx.scalar::<u32>(2)? as f32;
        let global = ctx.range().total_items() as f32;
        let local = ctx.range().local[0] as f32;
        ctx.floats_mut(0)?[..4].copy_from_slice(&[per_group, per_item, global, local]);
        Ok(())
    })
}

fn accelerator_backend(config: HostBackendConfig) -> HostBackend {
    let mut backend =
        HostBackend::with_config(config.with_device(HostDeviceConfig::accelerator("Test Accelerator", 4, 64)));
    backend.register_kernel("scale", scale_kernel());
    backend.register_kernel("tiles", tiles_kernel());
    backend
}

fn config_in(dir: &Path, recompile: bool) -> ManagerConfig {
    let mut config = ManagerConfig {
        cache: ProgramCacheConfig {
            kernel_path: dir.to_path_buf(),
            ..ProgramCacheConfig::default()
        },
        device: DeviceSelection {
            class: DeviceClass::Accelerator,
            index: 0,
            interop: true,
        },
        ..ManagerConfig::default()
    };
    config.cache.build.recompile = recompile;
    config
}

fn session(dir: &Path, backend: HostBackendConfig) -> ComputeManager {
    fs::write(dir.join("geometry.cl"), GEOMETRY).unwrap();
    let mut manager = ComputeManager::new(accelerator_backend(backend), config_in(dir, true)).unwrap();
    manager.initialize().unwrap();
    manager.register_kernel("geometry.cl", "scale", "scale").unwrap();
    manager.register_fill_kernel().unwrap();
    manager
}

#[test]
fn test_full_session() {
    let dir = tempdir().unwrap();
    let mut manager = session(dir.path(), HostBackendConfig::default());
    assert_eq!(manager.load_kernels().unwrap(), 2);

    let kernel = manager.kernel("scale").unwrap();
    assert_eq!(kernel.best(), LaunchShape::new(4, 64));

    let data: Vec<f32> = (0..256).map(|i| i as f32).collect();
    manager
        .allocate_buffer_rw("data", 256 * 4, Some(bytemuck::cast_slice(&data)))
        .unwrap();
    manager.set_arg_buffer("scale", 0, "data").unwrap();
    manager.set_arg_value("scale", 1, 2.0f32).unwrap();
    manager.launch_optimum("scale").unwrap();

    let result = manager.read_floats("data", 256).unwrap();
    assert_eq!(result[0], 0.0);
    assert_eq!(result[255], 510.0);

    let profiler = lock(manager.profiler());
    assert_eq!(profiler.stats("kernel_scale").unwrap().count, 1);
    assert_eq!(profiler.stats("kernel_ALL").unwrap().count, 1);
    assert_eq!(profiler.usage_errors(), 0);
}

#[test]
fn test_selected_shape_drives_launch() {
    let dir = tempdir().unwrap();
    let mut manager = session(dir.path(), HostBackendConfig::default());
    manager.load_kernels().unwrap();

    manager.allocate_buffer_rw("data", 256 * 4, None).unwrap();
    manager.fill_float("data", 1.0, 256).unwrap();
    manager.set_arg_buffer("scale", 0, "data").unwrap();
    manager.set_arg_value("scale", 1, 3.0f32).unwrap();

    manager.set_selected_shape("scale", 1, 16).unwrap();
    assert_eq!(manager.selected_workgroups("scale").unwrap(), 1);
    manager.launch_selected("scale").unwrap();

    let result = manager.read_floats("data", 256).unwrap();
    assert!(result[..16].iter().all(|&v| v == 3.0));
    assert!(result[16..].iter().all(|&v| v == 1.0));

    let err = manager.set_selected_shape("scale", 1, 128).unwrap_err();
    assert!(matches!(err, ComputeError::InvalidLaunchShape { max: 64, .. }));
}

#[test]
fn test_retuned_optimum_drives_later_launches() {
    let dir = tempdir().unwrap();
    let mut manager = session(dir.path(), HostBackendConfig::default());
    manager.register_kernel("geometry.cl", "tiles", "tiles").unwrap();
    manager.load_kernels().unwrap();
    assert_eq!(manager.kernel("tiles").unwrap().best(), LaunchShape::new(4, 64));

    manager.set_optimum_workgroups(8).unwrap();
    manager.set_optimum_workgroup_size(32).unwrap();
    manager.allocate_buffer_rw("out", 4 * 4, None).unwrap();
    manager.set_arg_buffer("tiles", 0, "out").unwrap();

    let counts = manager.launch_optimum_tiled("tiles", 1000, 1, 2).unwrap();
    assert_eq!((counts.per_group, counts.per_workitem), (125, 4));
    assert_eq!(manager.read_floats("out", 4).unwrap(), vec![125.0, 4.0, 256.0, 32.0]);

    manager.launch("tiles", 3, None).unwrap();
    assert_eq!(manager.read_floats("out", 4).unwrap(), vec![125.0, 4.0, 96.0, 32.0]);
}

#[test]
fn test_fill_uses_kernel_without_atomic_fill() {
    let dir = tempdir().unwrap();
    let mut manager = session(dir.path(), HostBackendConfig::default().with_atomic_fill(false));
    assert_eq!(manager.capabilities().map(|c| c.atomic_fill), Some(false));

    manager.allocate_buffer_rw("lights", 100 * 4, None).unwrap();
    let err = manager.fill_float("lights", 7.5, 100).unwrap_err();
    assert!(matches!(err, ComputeError::FillUnavailable { .. }));

    manager.load_kernels().unwrap();
    manager.fill_float("lights", 7.5, 100).unwrap();
    assert!(manager
        .read_floats("lights", 100)
        .unwrap()
        .iter()
        .all(|&v| v == 7.5));

    let profiler = lock(manager.profiler());
    assert_eq!(profiler.stats("buffer_fill_lights").unwrap().count, 1);
    assert_eq!(profiler.stats("kernel_buffers_fill_float").unwrap().count, 1);
}

#[test]
fn test_reallocation_keeps_one_object() {
    let dir = tempdir().unwrap();
    let mut manager = session(dir.path(), HostBackendConfig::default());

    manager.allocate_buffer_rw("scratch", 64, None).unwrap();
    manager.allocate_buffer_rw("scratch", 128, None).unwrap();
    manager
        .allocate_image_3d("volume", [4, 4, 4], MemFlags::READ_ONLY, None)
        .unwrap();

    assert_eq!(manager.resource("scratch").unwrap().size(), Some(128));
    assert_eq!(manager.backend().live_mem_objects(), 2);
    assert_eq!(manager.release_all(), 2);
    assert_eq!(manager.backend().live_mem_objects(), 0);
    assert!(matches!(
        manager.resource("scratch").unwrap_err(),
        ComputeError::ResourceNotFound(_)
    ));
}

#[test]
fn test_released_buffer_fails_next_launch() {
    let dir = tempdir().unwrap();
    let mut manager = session(dir.path(), HostBackendConfig::default());
    manager.load_kernels().unwrap();

    manager.allocate_buffer_rw("data", 64, None).unwrap();
    manager.set_arg_buffer("scale", 0, "data").unwrap();
    manager.set_arg_value("scale", 1, 2.0f32).unwrap();
    manager.release("data").unwrap();

    let err = manager.launch_optimum("scale").unwrap_err();
    assert!(matches!(err, ComputeError::ArgumentBind { slot: 0, .. }));
    assert_eq!(err.status(), Some(Status::INVALID_MEM_OBJECT));
}

#[test]
fn test_cached_binary_survives_missing_source() {
    let dir = tempdir().unwrap();
    {
        let mut manager = session(dir.path(), HostBackendConfig::default());
        manager.load_kernels().unwrap();
    }
    assert!(dir.path().join("geometry.cl.bin").exists());
    fs::remove_file(dir.path().join("geometry.cl")).unwrap();

    let mut manager = ComputeManager::new(
        accelerator_backend(HostBackendConfig::default()),
        config_in(dir.path(), false),
    )
    .unwrap();
    manager.initialize().unwrap();
    manager.register_kernel("geometry.cl", "scale", "scale").unwrap();
    assert_eq!(manager.load_kernels().unwrap(), 1);
    assert_eq!(manager.kernel("scale").unwrap().best(), LaunchShape::new(4, 64));
}

#[test]
fn test_recompile_needs_source() {
    let dir = tempdir().unwrap();
    let mut manager = ComputeManager::new(
        accelerator_backend(HostBackendConfig::default()),
        config_in(dir.path(), false),
    )
    .unwrap();
    manager.initialize().unwrap();
    manager.set_recompile(true);
    manager.register_kernel("missing.cl", "scale", "scale").unwrap();

    let err = manager.load_kernels().unwrap_err();
    assert!(matches!(err, ComputeError::SourceOpen { .. }));
}

#[test]
fn test_build_failure_carries_log() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("broken.cl"), "__kernel void broken() {\n#error missing semicolon\n}").unwrap();

    let mut manager = session(dir.path(), HostBackendConfig::default());
    manager.register_kernel("broken.cl", "broken", "broken").unwrap();

    let err = manager.load_kernels().unwrap_err();
    assert!(matches!(err, ComputeError::Build { .. }));
    assert!(err.build_log().unwrap().contains("missing semicolon"));
}

#[test]
fn test_interop_bracket() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
    let backend = accelerator_backend(HostBackendConfig::default());
    let textures = backend.textures();
    let texture = textures.create(2, 1);

    let mut manager = ComputeManager::new(backend, config_in(dir.path(), true)).unwrap();
    manager.initialize().unwrap();
    assert!(manager.interop_enabled());
    manager
        .allocate_shared_texture_2d("shadow", MemFlags::READ_WRITE, texture)
        .unwrap();

    manager
        .with_acquired(&["shadow"], |m| {
            assert!(textures.is_held_by_compute(texture));
            m.write_image_3d("shadow", true, [2, 1, 1], &[0.5, 1.5])
        })
        .unwrap();
    assert!(!textures.is_held_by_compute(texture));
    assert_eq!(textures.download(texture).unwrap(), vec![0.5, 1.5]);

    // The texture goes back to the renderer even when the body fails.
    let err = manager
        .with_acquired(&["shadow"], |m| m.copy("shadow", "absent", 4))
        .unwrap_err();
    assert!(matches!(err, ComputeError::ResourceNotFound(_)));
    assert!(!textures.is_held_by_compute(texture));
}

#[test]
fn test_shared_texture_without_interop() {
    let dir = tempdir().unwrap();
    let backend = accelerator_backend(HostBackendConfig::default().with_interop(false));
    let texture = backend.textures().create(1, 1);

    let mut manager = ComputeManager::new(backend, config_in(dir.path(), true)).unwrap();
    manager.initialize().unwrap();
    assert!(!manager.interop_enabled());

    manager.allocate_buffer_rw("shadow", 4, None).unwrap();
    let err = manager
        .allocate_shared_texture_2d("shadow", MemFlags::READ_WRITE, texture)
        .unwrap_err();
    assert!(matches!(err, ComputeError::InteropUnavailable { .. }));
    assert_eq!(manager.resource("shadow").unwrap().size(), Some(4));
}

#[test]
fn test_json_config_drives_initialize() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
    let path = dir.path().join("lumen.json");
    let json = format!(
        r#"{{
            "kernel_path": {:?},
            "device": {{ "class": "accelerator" }},
            "programs": [ {{ "file": "geometry.cl", "entry": "scale", "id": "scale" }} ]
        }}"#,
        dir.path().display().to_string()
    );
    fs::write(&path, json).unwrap();

    let config = ManagerConfig::from_json_file(&path).unwrap();
    let mut manager = ComputeManager::new(accelerator_backend(HostBackendConfig::default()), config).unwrap();
    assert_eq!(manager.initialize().unwrap().name(), "Test Accelerator");
    assert_eq!(manager.load_kernels().unwrap(), 1);
    assert_eq!(manager.kernel_tree().file_of("scale"), Some("geometry.cl"));
}
