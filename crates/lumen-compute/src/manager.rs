//! The compute manager facade
//!
//! `ComputeManager` owns the backend and every component, and exposes the
//! name-keyed operations callers use. Device operations take `&mut self`;
//! the manager is driven from one thread. The profiler is shared and may be
//! read from elsewhere.

use crate::backend::{BackendError, ComputeBackend, MemFlags, Status};
use crate::capability::{self, Capabilities};
use crate::config::ManagerConfig;
use crate::device::{Device, DeviceClass, DeviceRegistry};
use crate::dispatch::{DispatchContext, KernelDispatcher, TileCounts};
use crate::interop::InteropGate;
use crate::program::{Kernel, KernelInfo, KernelTree, ProgramCache, FILL_KERNEL_ENTRY, FILL_KERNEL_FILE};
use crate::resource::{Resource, ResourceTable};
use crate::timing::{self, ProfileScope};
use crate::{ComputeError, Result};
use lumen_profiler::{lock, Profiler, SharedProfiler};
use tracing::{debug, info, warn};

/// Device resource manager
pub struct ComputeManager {
    backend: Box<dyn ComputeBackend>,
    config: ManagerConfig,
    profiler: SharedProfiler,
    devices: DeviceRegistry,
    programs: ProgramCache,
    resources: ResourceTable,
    dispatcher: KernelDispatcher,
    interop: InteropGate,
    capabilities: Option<Capabilities>,
}

impl ComputeManager {
    /// Create a manager with its own profiler
    pub fn new(backend: impl ComputeBackend + 'static, config: ManagerConfig) -> Result<Self> {
        Self::with_profiler(backend, config, Profiler::shared())
    }

    /// Create a manager reporting into an existing profiler
    pub fn with_profiler(
        backend: impl ComputeBackend + 'static,
        config: ManagerConfig,
        profiler: SharedProfiler,
    ) -> Result<Self> {
        let mut programs = ProgramCache::new(config.cache.clone(), profiler.clone());
        for registration in &config.programs {
            programs.register(&registration.file, &registration.entry, &registration.id)?;
        }

        info!("Compute manager using '{}' backend", backend.name());
        Ok(Self {
            backend: Box::new(backend),
            devices: DeviceRegistry::new(profiler.clone()),
            resources: ResourceTable::new(profiler.clone()),
            dispatcher: KernelDispatcher::new(profiler.clone()),
            interop: InteropGate::new(profiler.clone()),
            programs,
            profiler,
            config,
            capabilities: None,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn profiler(&self) -> &SharedProfiler {
        &self.profiler
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    // ── Devices ─────────────────────────────────────────────────────────

    /// Enumerate devices
    pub fn scan(&mut self) -> Result<()> {
        self.devices.scan(self.backend.as_mut())
    }

    /// Devices of one class
    pub fn devices(&self, class: DeviceClass) -> &[Device] {
        self.devices.devices(class)
    }

    /// Log and return devices of one class
    pub fn list_devices(&self, class: DeviceClass) -> &[Device] {
        self.devices.log_devices(class);
        self.devices.devices(class)
    }

    /// Select a device, create its context and queue, then probe capabilities
    pub fn select_device(&mut self, class: DeviceClass, index: usize, interop: bool) -> Result<&Device> {
        self.devices.select(self.backend.as_mut(), class, index, interop)?;
        self.capabilities = Some(capability::probe(self.backend.as_mut(), &self.config.probe));
        self.devices.require("select_device")
    }

    /// Scan and select the configured device
    pub fn initialize(&mut self) -> Result<&Device> {
        self.scan()?;
        let selection = self.config.device;
        self.select_device(selection.class, selection.index, selection.interop)
    }

    pub fn is_initialized(&self) -> bool {
        self.devices.is_initialized()
    }

    pub fn selected_device(&self) -> Option<&Device> {
        self.devices.selected_device()
    }

    /// Whether shared textures can be created
    pub fn interop_enabled(&self) -> bool {
        self.devices.interop_enabled()
    }

    /// Probed features; `None` before device selection
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
    }

    /// Run the capability probe again
    pub fn probe_capabilities(&mut self) -> Result<Capabilities> {
        self.devices.require("probe_capabilities")?;
        let capabilities = capability::probe(self.backend.as_mut(), &self.config.probe);
        self.capabilities = Some(capabilities);
        Ok(capabilities)
    }

    pub fn set_optimum_workgroups(&mut self, workgroups: usize) -> Result<()> {
        self.devices.set_optimum_workgroups(workgroups)
    }

    pub fn set_optimum_workgroup_size(&mut self, size: usize) -> Result<()> {
        self.devices.set_optimum_workgroup_size(size)
    }

    /// Flush queued work. Failures are logged.
    pub fn flush(&mut self) {
        if let Err(e) = self.backend.flush() {
            warn!("Queue flush failed: {}", e);
        }
    }

    /// Flush and wait for queued work. Failures are logged.
    pub fn finish(&mut self) {
        timing::sync(self.backend.as_mut());
    }

    // ── Programs ────────────────────────────────────────────────────────

    /// Register an entry point of a source file under a logical id
    pub fn register_kernel(&mut self, file: &str, entry: &str, id: &str) -> Result<()> {
        self.programs.register(file, entry, id)
    }

    /// Register the fill fallback kernel under the configured id, once
    pub fn register_fill_kernel(&mut self) -> Result<()> {
        let id = self.config.fill_kernel.clone();
        if self.programs.tree().contains(&id) {
            return Ok(());
        }
        self.programs.register(FILL_KERNEL_FILE, FILL_KERNEL_ENTRY, id)
    }

    /// Build registered programs and create their kernels
    pub fn load_kernels(&mut self) -> Result<usize> {
        let device = self.devices.require("load_kernels")?;
        let created = self.programs.load_all(self.backend.as_mut(), device)?;
        info!("Loaded {} kernel(s)", created);
        Ok(created)
    }

    /// Switch between forced recompilation and cached binaries
    pub fn set_recompile(&mut self, recompile: bool) {
        self.programs.build_config_mut().recompile = recompile;
    }

    pub fn kernel(&self, id: &str) -> Result<&Kernel> {
        self.programs.kernel(id)
    }

    pub fn kernel_tree(&self) -> &KernelTree {
        self.programs.tree()
    }

    pub fn kernel_info(&self) -> Vec<KernelInfo> {
        self.programs.kernel_info()
    }

    pub fn log_kernel_info(&self) {
        self.programs.log_kernel_info()
    }

    pub fn log_kernel_tree(&self) {
        self.programs.log_kernel_tree()
    }

    pub fn selected_workgroups(&self, id: &str) -> Result<usize> {
        self.programs.selected_workgroups(id)
    }

    pub fn set_selected_shape(&mut self, id: &str, workgroups: usize, workgroup_size: usize) -> Result<()> {
        self.programs.set_selected_shape(id, workgroups, workgroup_size)
    }

    // ── Memory ──────────────────────────────────────────────────────────

    pub fn allocate_buffer(&mut self, name: &str, flags: MemFlags, size: usize, init: Option<&[u8]>) -> Result<()> {
        self.devices.require("allocate_buffer")?;
        self.resources
            .allocate_buffer(self.backend.as_mut(), name, flags, size, init)
    }

    /// Read-write buffer, initialised from `init` when given
    pub fn allocate_buffer_rw(&mut self, name: &str, size: usize, init: Option<&[u8]>) -> Result<()> {
        self.devices.require("allocate_buffer_rw")?;
        self.resources
            .allocate_buffer_rw(self.backend.as_mut(), name, size, init)
    }

    pub fn allocate_shared_texture_2d(&mut self, name: &str, flags: MemFlags, texture: u32) -> Result<()> {
        self.devices.require("allocate_shared_texture_2d")?;
        let interop = self.devices.interop_enabled();
        self.resources
            .allocate_shared_texture_2d(self.backend.as_mut(), name, flags, texture, interop)
    }

    pub fn allocate_image_3d(
        &mut self,
        name: &str,
        dims: [usize; 3],
        flags: MemFlags,
        init: Option<&[f32]>,
    ) -> Result<()> {
        self.devices.require("allocate_image_3d")?;
        self.resources
            .allocate_image_3d(self.backend.as_mut(), name, dims, flags, init)
    }

    pub fn release(&mut self, name: &str) -> Result<()> {
        self.resources.release(self.backend.as_mut(), name)
    }

    /// Free every named object; returns how many were released
    pub fn release_all(&mut self) -> usize {
        self.resources.release_all(self.backend.as_mut())
    }

    pub fn resource(&self, name: &str) -> Result<&Resource> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = (&str, &Resource)> {
        self.resources.iter()
    }

    pub fn write(&mut self, name: &str, blocking: bool, data: &[u8]) -> Result<()> {
        self.resources.write(self.backend.as_mut(), name, blocking, data)
    }

    pub fn read(&mut self, name: &str, blocking: bool, out: &mut [u8]) -> Result<()> {
        self.resources.read(self.backend.as_mut(), name, blocking, out)
    }

    pub fn write_floats(&mut self, name: &str, blocking: bool, data: &[f32]) -> Result<()> {
        self.resources
            .write_floats(self.backend.as_mut(), name, blocking, data)
    }

    pub fn read_floats(&mut self, name: &str, count: usize) -> Result<Vec<f32>> {
        self.resources.read_floats(self.backend.as_mut(), name, count)
    }

    pub fn copy(&mut self, src: &str, dst: &str, size: usize) -> Result<()> {
        self.resources.copy(self.backend.as_mut(), src, dst, size)
    }

    pub fn copy_image(&mut self, src: &str, dst: &str, dims: [usize; 3]) -> Result<()> {
        self.resources.copy_image(self.backend.as_mut(), src, dst, dims)
    }

    pub fn write_image_3d(&mut self, name: &str, blocking: bool, dims: [usize; 3], data: &[f32]) -> Result<()> {
        self.resources
            .write_image_3d(self.backend.as_mut(), name, blocking, dims, data)
    }

    /// Set the first `count` floats of a buffer to `value`.
    ///
    /// Uses the device fill command when the probe found it working,
    /// otherwise the fill kernel under its best shape.
    pub fn fill_float(&mut self, name: &str, value: f32, count: usize) -> Result<()> {
        self.devices.require("fill_float")?;
        if self.capabilities.map(|c| c.atomic_fill).unwrap_or(false) {
            return self
                .resources
                .fill_direct(self.backend.as_mut(), name, value, count);
        }

        let kernel = self.config.fill_kernel.clone();
        if !self.programs.is_loaded(&kernel) {
            return Err(ComputeError::FillUnavailable {
                name: name.to_string(),
                kernel,
            });
        }
        let count = u32::try_from(count).map_err(|_| ComputeError::ArgumentBind {
            kernel: kernel.clone(),
            slot: 1,
            source: BackendError::new(Status::INVALID_ARG_VALUE, format!("{} floats exceed a u32 count", count)),
        })?;

        debug!("Filling '{}' with kernel '{}'", name, kernel);
        let profiler = self.profiler.clone();
        timing::profiled(&profiler, &ProfileScope::family("buffer_fill", name), || {
            let (dispatcher, mut ctx) = self.dispatch("fill_float")?;
            dispatcher.set_arg_buffer(&mut ctx, &kernel, 0, name)?;
            dispatcher.set_arg_value(&mut ctx, &kernel, 1, count)?;
            dispatcher.set_arg_value(&mut ctx, &kernel, 2, value)?;
            dispatcher.launch_optimum(&mut ctx, &kernel)
        })
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn dispatch(&mut self, operation: &'static str) -> Result<(&mut KernelDispatcher, DispatchContext<'_>)> {
        let device = self.devices.require(operation)?;
        Ok((
            &mut self.dispatcher,
            DispatchContext {
                backend: self.backend.as_mut(),
                programs: &self.programs,
                resources: &self.resources,
                device,
            },
        ))
    }

    /// Bind raw argument bytes
    pub fn set_arg(&mut self, id: &str, slot: u32, bytes: &[u8]) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("set_arg")?;
        dispatcher.set_arg(&mut ctx, id, slot, bytes)
    }

    /// Bind a plain value
    pub fn set_arg_value<T: bytemuck::Pod>(&mut self, id: &str, slot: u32, value: T) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("set_arg_value")?;
        dispatcher.set_arg_value(&mut ctx, id, slot, value)
    }

    /// Bind a named buffer, image or shared texture
    pub fn set_arg_buffer(&mut self, id: &str, slot: u32, name: &str) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("set_arg_buffer")?;
        dispatcher.set_arg_buffer(&mut ctx, id, slot, name)
    }

    /// Launch with an explicit count; size defaults to the device optimum
    pub fn launch(&mut self, id: &str, workgroups: usize, workgroup_size: Option<usize>) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("launch")?;
        dispatcher.launch(&mut ctx, id, workgroups, workgroup_size)
    }

    pub fn launch_selected(&mut self, id: &str) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("launch_selected")?;
        dispatcher.launch_selected(&mut ctx, id)
    }

    pub fn launch_optimum(&mut self, id: &str) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("launch_optimum")?;
        dispatcher.launch_optimum(&mut ctx, id)
    }

    pub fn launch_optimum_tiled(
        &mut self,
        id: &str,
        total: usize,
        per_group_slot: u32,
        per_workitem_slot: u32,
    ) -> Result<TileCounts> {
        let (dispatcher, mut ctx) = self.dispatch("launch_optimum_tiled")?;
        dispatcher.launch_optimum_tiled(&mut ctx, id, total, per_group_slot, per_workitem_slot)
    }

    pub fn launch_2d(&mut self, id: &str, global: [usize; 2], local: [usize; 2]) -> Result<()> {
        let (dispatcher, mut ctx) = self.dispatch("launch_2d")?;
        dispatcher.launch_2d(&mut ctx, id, global, local)
    }

    // ── Interop ─────────────────────────────────────────────────────────

    /// Take a shared texture from the renderer
    pub fn acquire(&mut self, name: &str) -> Result<()> {
        self.interop
            .acquire(self.backend.as_mut(), &self.resources, name)
    }

    /// Hand a shared texture back to the renderer
    pub fn release_shared(&mut self, name: &str) -> Result<()> {
        self.interop
            .release(self.backend.as_mut(), &self.resources, name)
    }

    /// Run `f` with every named shared texture acquired.
    ///
    /// Textures are released in reverse order even when `f` fails. The first
    /// error wins.
    pub fn with_acquired<T>(&mut self, names: &[&str], f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut acquired = Vec::with_capacity(names.len());
        for &name in names {
            if let Err(e) = self.acquire(name) {
                let _ = self.release_each(&acquired);
                return Err(e);
            }
            acquired.push(name);
        }

        let result = f(self);
        let released = self.release_each(&acquired);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }

    fn release_each(&mut self, names: &[&str]) -> Result<()> {
        let mut first = Ok(());
        for name in names.iter().rev() {
            if let Err(e) = self.release_shared(name) {
                warn!("{}", e);
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    // ── Profiling ───────────────────────────────────────────────────────

    /// Log every due timer; returns how many were printed
    pub fn print_profile(&self, force: bool) -> usize {
        lock(&self.profiler).print_all(force)
    }

    /// Timing report as text
    pub fn profile_report(&self, force: bool) -> String {
        lock(&self.profiler).report(force)
    }
}
