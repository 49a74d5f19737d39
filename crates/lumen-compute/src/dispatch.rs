//! Kernel argument binding and launch policies
//!
//! Buffer arguments are recorded by name. Before every launch the names are
//! resolved again, so a kernel bound to a buffer that has since been
//! reallocated launches against the new object, never the released one.

use crate::backend::{BackendError, ComputeBackend, KernelArg, NdRange, Status};
use crate::device::Device;
use crate::program::{Kernel, ProgramCache};
use crate::resource::ResourceTable;
use crate::timing::{self, ProfileScope};
use crate::{ComputeError, Result};
use lumen_profiler::SharedProfiler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Workgroup count and size of a 1-D launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchShape {
    pub workgroups: usize,
    pub workgroup_size: usize,
}

impl LaunchShape {
    pub fn new(workgroups: usize, workgroup_size: usize) -> Self {
        Self {
            workgroups,
            workgroup_size,
        }
    }

    /// Device optimum shape with the size clamped to a kernel's limit
    pub fn optimum(device: &Device, max_workgroup_size: usize) -> Self {
        Self::new(
            device.optimum_workgroups(),
            device.optimum_workgroup_size().min(max_workgroup_size).max(1),
        )
    }

    /// Total work items, `None` if the product overflows
    pub fn total_items(&self) -> Option<usize> {
        self.workgroups.checked_mul(self.workgroup_size)
    }

    fn range(&self, id: &str) -> Result<NdRange> {
        let total = self.total_items().ok_or_else(|| ComputeError::Launch {
            kernel: id.to_string(),
            source: BackendError::new(Status::INVALID_GLOBAL_WORK_SIZE, format!("launch shape {} overflows", self)),
        })?;
        Ok(NdRange::linear(total, self.workgroup_size))
    }
}

impl fmt::Display for LaunchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.workgroups, self.workgroup_size)
    }
}

/// Per-invocation slice sizes for a tiled launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCounts {
    /// Items handled by each workgroup
    pub per_group: usize,
    /// Items handled by each work item
    pub per_workitem: usize,
}

/// Split `total` items over `workgroups` groups of `workgroup_size` items,
/// rounding up at both levels so every item is covered.
pub fn tiled_counts(total: usize, workgroups: usize, workgroup_size: usize) -> TileCounts {
    let per_group = total.div_ceil(workgroups.max(1));
    TileCounts {
        per_group,
        per_workitem: per_group.div_ceil(workgroup_size.max(1)),
    }
}

/// Everything a launch touches
pub struct DispatchContext<'a> {
    pub backend: &'a mut dyn ComputeBackend,
    pub programs: &'a ProgramCache,
    pub resources: &'a ResourceTable,
    pub device: &'a Device,
}

/// Binds arguments and launches kernels
pub struct KernelDispatcher {
    buffer_args: BTreeMap<String, BTreeMap<u32, String>>,
    profiler: SharedProfiler,
}

impl KernelDispatcher {
    pub fn new(profiler: SharedProfiler) -> Self {
        Self {
            buffer_args: BTreeMap::new(),
            profiler,
        }
    }

    /// Bind raw argument bytes to a slot
    pub fn set_arg(&mut self, ctx: &mut DispatchContext<'_>, id: &str, slot: u32, bytes: &[u8]) -> Result<()> {
        let kernel = ctx.programs.kernel(id)?;
        ctx.backend
            .set_kernel_arg(kernel.handle(), slot, KernelArg::Bytes(bytes))
            .map_err(|source| bind_error(id, slot, source))?;

        if let Some(slots) = self.buffer_args.get_mut(id) {
            slots.remove(&slot);
        }
        Ok(())
    }

    /// Bind a plain value to a slot
    pub fn set_arg_value<T: bytemuck::Pod>(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        id: &str,
        slot: u32,
        value: T,
    ) -> Result<()> {
        self.set_arg(ctx, id, slot, bytemuck::bytes_of(&value))
    }

    /// Bind a named buffer or image to a slot
    pub fn set_arg_buffer(&mut self, ctx: &mut DispatchContext<'_>, id: &str, slot: u32, name: &str) -> Result<()> {
        let kernel = ctx.programs.kernel(id)?;
        bind_buffer(ctx, kernel, slot, name)?;

        self.buffer_args
            .entry(id.to_string())
            .or_default()
            .insert(slot, name.to_string());
        Ok(())
    }

    /// Buffer names bound to a kernel, by slot
    pub fn buffer_bindings(&self, id: &str) -> Vec<(u32, &str)> {
        self.buffer_args
            .get(id)
            .map(|slots| slots.iter().map(|(s, n)| (*s, n.as_str())).collect())
            .unwrap_or_default()
    }

    /// Launch `workgroups` groups of `workgroup_size` items (device optimum size if `None`)
    pub fn launch(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        id: &str,
        workgroups: usize,
        workgroup_size: Option<usize>,
    ) -> Result<()> {
        let size = workgroup_size.unwrap_or_else(|| ctx.device.optimum_workgroup_size());
        let kernel = ctx.programs.kernel(id)?;
        self.enqueue(ctx, kernel, LaunchShape::new(workgroups, size).range(id)?)
    }

    /// Launch with the kernel's selected shape
    pub fn launch_selected(&mut self, ctx: &mut DispatchContext<'_>, id: &str) -> Result<()> {
        let kernel = ctx.programs.kernel(id)?;
        self.enqueue(ctx, kernel, kernel.selected().range(id)?)
    }

    /// Launch with the kernel's best shape
    pub fn launch_optimum(&mut self, ctx: &mut DispatchContext<'_>, id: &str) -> Result<()> {
        let kernel = ctx.programs.kernel(id)?;
        self.enqueue(ctx, kernel, kernel.best().range(id)?)
    }

    /// Launch with the current device optimum shape, first writing the
    /// per-group and per-work-item item counts for `total` items as `u32`
    /// arguments.
    ///
    /// The optimum is read from the device at launch time, so retuning it
    /// after the kernel was loaded takes effect here.
    pub fn launch_optimum_tiled(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        id: &str,
        total: usize,
        per_group_slot: u32,
        per_workitem_slot: u32,
    ) -> Result<TileCounts> {
        let max = ctx.programs.kernel(id)?.limits().max_workgroup_size;
        let shape = LaunchShape::optimum(ctx.device, max);
        let counts = tiled_counts(total, shape.workgroups, shape.workgroup_size);

        let per_group = u32_arg(id, per_group_slot, counts.per_group)?;
        let per_workitem = u32_arg(id, per_workitem_slot, counts.per_workitem)?;
        self.set_arg_value(ctx, id, per_group_slot, per_group)?;
        self.set_arg_value(ctx, id, per_workitem_slot, per_workitem)?;

        let kernel = ctx.programs.kernel(id)?;
        self.enqueue(ctx, kernel, shape.range(id)?)?;
        Ok(counts)
    }

    /// Explicit 2-D launch; the global size must be a multiple of the local size
    pub fn launch_2d(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        id: &str,
        global: [usize; 2],
        local: [usize; 2],
    ) -> Result<()> {
        let kernel = ctx.programs.kernel(id)?;
        self.enqueue(ctx, kernel, NdRange::planar(global, local))
    }

    fn enqueue(&self, ctx: &mut DispatchContext<'_>, kernel: &Kernel, range: NdRange) -> Result<()> {
        if let Some(slots) = self.buffer_args.get(kernel.id()) {
            for (&slot, name) in slots {
                bind_buffer(ctx, kernel, slot, name)?;
            }
        }

        let handle = kernel.handle();
        timing::device_op(
            &mut *ctx.backend,
            &self.profiler,
            &ProfileScope::family("kernel", kernel.id()),
            |b| b.enqueue_kernel(handle, &range),
        )
        .map_err(|source| ComputeError::Launch {
            kernel: kernel.id().to_string(),
            source,
        })?;

        debug!(
            "Ran kernel '{}' global {:?} local {:?}",
            kernel.id(),
            &range.global[..range.dims],
            &range.local[..range.dims]
        );
        Ok(())
    }
}

fn bind_buffer(ctx: &mut DispatchContext<'_>, kernel: &Kernel, slot: u32, name: &str) -> Result<()> {
    let handle = ctx.resources.handle(name).map_err(|_| {
        bind_error(
            kernel.id(),
            slot,
            BackendError::new(Status::INVALID_MEM_OBJECT, format!("no buffer named '{}'", name)),
        )
    })?;
    ctx.backend
        .set_kernel_arg(kernel.handle(), slot, KernelArg::Mem(handle))
        .map_err(|source| bind_error(kernel.id(), slot, source))
}

fn u32_arg(id: &str, slot: u32, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        bind_error(
            id,
            slot,
            BackendError::new(Status::INVALID_ARG_VALUE, format!("{} does not fit a u32 argument", value)),
        )
    })
}

fn bind_error(kernel: &str, slot: u32, source: BackendError) -> ComputeError {
    ComputeError::ArgumentBind {
        kernel: kernel.to_string(),
        slot,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostBackendConfig, HostDeviceConfig, HostKernel};
    use crate::device::{DeviceClass, DeviceRegistry};
    use crate::program::ProgramCacheConfig;
    use lumen_profiler::Profiler;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    const SOURCE: &str = r#"
        __kernel void scale(__global const float *src, __global float *dst) { }
        __kernel void tiles(__global float *out, const uint per_group, const uint per_item) { }
    "#;

    struct Fixture {
        _dir: TempDir,
        backend: HostBackend,
        registry: DeviceRegistry,
        programs: ProgramCache,
        resources: ResourceTable,
        dispatcher: KernelDispatcher,
        profiler: SharedProfiler,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("math.cl"), SOURCE).unwrap();

            let config = HostBackendConfig::default().with_device(HostDeviceConfig::accelerator("Test Accelerator", 16, 16));
            let mut backend = HostBackend::with_config(config);
            backend.register_kernel(
                "scale",
                HostKernel::new(2, |ctx| {
                    ctx.with_floats(0, 1, |src, dst| {
                        for (d, s) in dst.iter_mut().zip(src) {
                            *d = s * 2.0;
                        }
                    })
                }),
            );
            backend.register_kernel(
                "tiles",
                HostKernel::new(3, |ctx| {
                    let per_group = ctx.scalar::<u32>(1)? as f32;
                    let per_item = ctx.scalar::<u32>(2)? as f32;
                    let items = ctx.range().total_items() as f32;
                    let out = ctx.floats_mut(0)?;
                    out[..3].copy_from_slice(&[per_group, per_item, items]);
                    Ok(())
                }),
            );

            let profiler = Profiler::shared();
            let mut registry = DeviceRegistry::new(profiler.clone());
            registry.scan(&mut backend).unwrap();
            let device = registry
                .select(&mut backend, DeviceClass::Accelerator, 0, false)
                .unwrap();

            let mut programs = ProgramCache::new(
                ProgramCacheConfig {
                    kernel_path: dir.path().to_path_buf(),
                    ..ProgramCacheConfig::default()
                },
                profiler.clone(),
            );
            programs.register("math.cl", "scale", "scale").unwrap();
            programs.register("math.cl", "tiles", "tiles").unwrap();
            programs.load_all(&mut backend, device).unwrap();

            Self {
                _dir: dir,
                backend,
                registry,
                programs,
                resources: ResourceTable::new(profiler.clone()),
                dispatcher: KernelDispatcher::new(profiler.clone()),
                profiler,
            }
        }

        fn alloc(&mut self, name: &str, data: &[f32]) {
            self.resources
                .allocate_buffer_rw(&mut self.backend, name, data.len() * 4, Some(bytemuck::cast_slice(data)))
                .unwrap();
        }

        fn read(&mut self, name: &str, count: usize) -> Vec<f32> {
            self.resources
                .read_floats(&mut self.backend, name, count)
                .unwrap()
        }

        fn run<T>(&mut self, f: impl FnOnce(&mut KernelDispatcher, &mut DispatchContext<'_>) -> T) -> T {
            let mut ctx = DispatchContext {
                backend: &mut self.backend,
                programs: &self.programs,
                resources: &self.resources,
                device: self.registry.selected_device().unwrap(),
            };
            f(&mut self.dispatcher, &mut ctx)
        }
    }

    #[test]
    fn test_tiled_counts() {
        assert_eq!(
            tiled_counts(1000, 16, 16),
            TileCounts {
                per_group: 63,
                per_workitem: 4
            }
        );
        assert_eq!(tiled_counts(0, 16, 16).per_workitem, 0);
        assert_eq!(tiled_counts(5, 0, 0).per_group, 5);
    }

    #[test]
    fn test_launch_with_bound_buffers() {
        let mut fx = Fixture::new();
        fx.alloc("src", &[1.0, 2.0, 3.0]);
        fx.alloc("dst", &[0.0; 3]);

        fx.run(|d, ctx| {
            d.set_arg_buffer(ctx, "scale", 0, "src")?;
            d.set_arg_buffer(ctx, "scale", 1, "dst")?;
            d.launch(ctx, "scale", 1, Some(4))
        })
        .unwrap();
        assert_eq!(fx.read("dst", 3), vec![2.0, 4.0, 6.0]);

        let profiler = lumen_profiler::lock(&fx.profiler);
        assert_eq!(profiler.stats("kernel_ALL").unwrap().count, 1);
        assert_eq!(profiler.stats("kernel_scale").unwrap().count, 1);
    }

    #[test]
    fn test_reallocated_buffer_is_rebound() {
        let mut fx = Fixture::new();
        fx.alloc("src", &[1.0, 2.0]);
        fx.alloc("dst", &[0.0; 2]);
        fx.run(|d, ctx| {
            d.set_arg_buffer(ctx, "scale", 0, "src")?;
            d.set_arg_buffer(ctx, "scale", 1, "dst")
        })
        .unwrap();

        fx.alloc("src", &[5.0, 6.0]);
        fx.run(|d, ctx| d.launch_optimum(ctx, "scale")).unwrap();

        assert_eq!(fx.read("dst", 2), vec![10.0, 12.0]);
        assert_eq!(fx.backend.live_mem_objects(), 2);
    }

    #[test]
    fn test_released_buffer_fails_bind() {
        let mut fx = Fixture::new();
        fx.alloc("src", &[1.0]);
        fx.alloc("dst", &[0.0]);
        fx.run(|d, ctx| {
            d.set_arg_buffer(ctx, "scale", 0, "src")?;
            d.set_arg_buffer(ctx, "scale", 1, "dst")
        })
        .unwrap();
        fx.resources.release(&mut fx.backend, "src").unwrap();

        let err = fx.run(|d, ctx| d.launch_selected(ctx, "scale")).unwrap_err();
        assert!(matches!(err, ComputeError::ArgumentBind { slot: 0, .. }));

        let err = fx
            .run(|d, ctx| d.set_arg_buffer(ctx, "scale", 0, "nothing"))
            .unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_MEM_OBJECT));
    }

    #[test]
    fn test_tiled_launch_writes_counts() {
        let mut fx = Fixture::new();
        fx.alloc("out", &[0.0; 3]);

        let counts = fx
            .run(|d, ctx| {
                d.set_arg_buffer(ctx, "tiles", 0, "out")?;
                d.launch_optimum_tiled(ctx, "tiles", 1000, 1, 2)
            })
            .unwrap();

        assert_eq!(counts.per_group, 63);
        assert_eq!(counts.per_workitem, 4);
        assert_eq!(fx.read("out", 3), vec![63.0, 4.0, 256.0]);
    }

    #[test]
    fn test_tiled_launch_follows_retuned_optimum() {
        let mut fx = Fixture::new();
        fx.alloc("out", &[0.0; 3]);
        fx.registry.set_optimum_workgroups(8).unwrap();
        fx.registry.set_optimum_workgroup_size(8).unwrap();

        let counts = fx
            .run(|d, ctx| {
                d.set_arg_buffer(ctx, "tiles", 0, "out")?;
                d.launch_optimum_tiled(ctx, "tiles", 1000, 1, 2)
            })
            .unwrap();

        assert_eq!(counts, TileCounts { per_group: 125, per_workitem: 16 });
        assert_eq!(fx.read("out", 3), vec![125.0, 16.0, 64.0]);
        // The best shape stays as loaded.
        assert_eq!(fx.programs.kernel("tiles").unwrap().best(), LaunchShape::new(16, 16));
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        let mut fx = Fixture::new();
        assert_eq!(LaunchShape::new(usize::MAX, 2).total_items(), None);

        let err = fx
            .run(|d, ctx| d.launch(ctx, "scale", usize::MAX, Some(2)))
            .unwrap_err();
        assert!(matches!(err, ComputeError::Launch { ref kernel, .. } if kernel == "scale"));
        assert_eq!(err.status(), Some(Status::INVALID_GLOBAL_WORK_SIZE));
    }

    #[test]
    fn test_launch_errors_name_kernel() {
        let mut fx = Fixture::new();
        fx.alloc("out", &[0.0; 3]);
        fx.run(|d, ctx| {
            d.set_arg_buffer(ctx, "tiles", 0, "out")?;
            d.set_arg_value(ctx, "tiles", 1, 1u32)?;
            d.set_arg_value(ctx, "tiles", 2, 1u32)
        })
        .unwrap();

        let err = fx.run(|d, ctx| d.launch(ctx, "tiles", 2, Some(32))).unwrap_err();
        assert!(matches!(err, ComputeError::Launch { ref kernel, .. } if kernel == "tiles"));
        assert_eq!(err.status(), Some(Status::INVALID_WORK_GROUP_SIZE));

        let err = fx.run(|d, ctx| d.launch_2d(ctx, "tiles", [10, 10], [4, 4])).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_WORK_GROUP_SIZE));
        fx.run(|d, ctx| d.launch_2d(ctx, "tiles", [8, 8], [4, 4])).unwrap();

        let err = fx.run(|d, ctx| d.launch_optimum(ctx, "missing")).unwrap_err();
        assert!(matches!(err, ComputeError::KernelNotFound(_)));

        let err = fx
            .run(|d, ctx| d.set_arg_value(ctx, "tiles", 9, 0u32))
            .unwrap_err();
        assert!(matches!(err, ComputeError::ArgumentBind { slot: 9, .. }));
    }

    #[test]
    fn test_raw_arg_replaces_buffer_binding() {
        let mut fx = Fixture::new();
        fx.alloc("out", &[0.0; 3]);
        fx.run(|d, ctx| {
            d.set_arg_buffer(ctx, "tiles", 0, "out")?;
            d.set_arg_buffer(ctx, "tiles", 1, "out")?;
            d.set_arg_value(ctx, "tiles", 1, 7u32)
        })
        .unwrap();

        assert_eq!(fx.dispatcher.buffer_bindings("tiles"), vec![(0, "out")]);
    }
}
