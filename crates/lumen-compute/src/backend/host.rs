//! Software compute device
//!
//! `HostBackend` behaves like a driver whose devices live in host memory.
//! Program "compilation" validates the source and records its `__kernel`
//! entry points; the executable body of each entry point is a Rust closure
//! registered with [`HostBackend::register_kernel`]. Device binaries are
//! small JSON documents, so the program cache can round-trip them exactly
//! like real driver binaries.
//!
//! Graphics textures are simulated by [`GraphicsTextures`], a handle shared
//! with whoever plays the renderer. A texture aliased into compute must be
//! acquired before any compute access and released before the renderer may
//! touch it again; both sides enforce this.

use super::{
    BackendError, BackendResult, ComputeBackend, DeviceDesc, KernelArg, KernelHandle,
    KernelLimits, MemAccess, MemFlags, MemHandle, NdRange, PlatformDesc, ProgramHandle, Status,
};
use crate::device::DeviceClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Format tag written into every host binary
pub const HOST_BINARY_FORMAT: &str = "lumen-host-binary";

/// Entry point of the built-in float fill kernel
pub const FILL_FLOAT_ENTRY: &str = crate::program::FILL_KERNEL_ENTRY;

/// A simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDeviceConfig {
    /// Device name
    pub name: String,
    /// Vendor string
    pub vendor: String,
    /// Device class
    pub class: DeviceClass,
    /// Compute units
    pub compute_units: u32,
    /// Largest workgroup
    pub max_workgroup_size: usize,
    /// Preferred workgroup granularity
    pub preferred_multiple: usize,
}

impl HostDeviceConfig {
    /// A CPU-like device
    pub fn general_purpose(name: impl Into<String>, compute_units: u32) -> Self {
        Self {
            name: name.into(),
            vendor: "Lumen".into(),
            class: DeviceClass::GeneralPurpose,
            compute_units,
            max_workgroup_size: 8192,
            preferred_multiple: 1,
        }
    }

    /// A GPU-like device
    pub fn accelerator(name: impl Into<String>, compute_units: u32, max_workgroup_size: usize) -> Self {
        Self {
            name: name.into(),
            vendor: "Lumen".into(),
            class: DeviceClass::Accelerator,
            compute_units,
            max_workgroup_size,
            preferred_multiple: 32.min(max_workgroup_size.max(1)),
        }
    }

    /// Override the vendor string
    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }
}

/// A simulated platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlatformConfig {
    /// Platform name
    pub name: String,
    /// Platform vendor
    pub vendor: String,
    /// Devices in enumeration order
    pub devices: Vec<HostDeviceConfig>,
}

/// Host backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBackendConfig {
    /// Platforms in enumeration order
    pub platforms: Vec<HostPlatformConfig>,
    /// Whether `fill_buffer` is supported
    pub atomic_fill: bool,
    /// Whether devices can alias graphics textures
    pub interop: bool,
    /// Largest single allocation (bytes)
    pub max_alloc_bytes: usize,
    /// Devices a built program targets (binaries returned per program)
    pub program_devices: usize,
    /// Make context creation fail
    pub fail_context: bool,
    /// Make queue creation fail
    pub fail_queue: bool,
}

impl Default for HostBackendConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            platforms: vec![HostPlatformConfig {
                name: "Lumen Host Platform".into(),
                vendor: "Lumen".into(),
                devices: vec![HostDeviceConfig::general_purpose("Host CPU", cores)],
            }],
            atomic_fill: true,
            interop: true,
            max_alloc_bytes: 1 << 30,
            program_devices: 1,
            fail_context: false,
            fail_queue: false,
        }
    }
}

impl HostBackendConfig {
    /// A configuration that enumerates no platforms
    pub fn without_platforms() -> Self {
        Self {
            platforms: Vec::new(),
            ..Self::default()
        }
    }

    /// Append a device to the first platform
    pub fn with_device(mut self, device: HostDeviceConfig) -> Self {
        match self.platforms.first_mut() {
            Some(platform) => platform.devices.push(device),
            None => self.platforms.push(HostPlatformConfig {
                name: "Lumen Host Platform".into(),
                vendor: "Lumen".into(),
                devices: vec![device],
            }),
        }
        self
    }

    /// Append a platform
    pub fn with_platform(mut self, platform: HostPlatformConfig) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Toggle atomic fill support
    pub fn with_atomic_fill(mut self, enabled: bool) -> Self {
        self.atomic_fill = enabled;
        self
    }

    /// Toggle graphics interop support
    pub fn with_interop(mut self, enabled: bool) -> Self {
        self.interop = enabled;
        self
    }

    /// Cap single allocations
    pub fn with_max_alloc(mut self, bytes: usize) -> Self {
        self.max_alloc_bytes = bytes;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graphics side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Texture {
    width: usize,
    height: usize,
    texels: Vec<f32>,
    held_by_compute: bool,
}

#[derive(Debug, Default)]
struct TextureStore {
    next_id: u32,
    textures: HashMap<u32, Texture>,
}

/// Single-channel float 2-D textures owned by the renderer
#[derive(Debug, Clone, Default)]
pub struct GraphicsTextures {
    inner: Arc<Mutex<TextureStore>>,
}

impl GraphicsTextures {
    /// Create an empty texture set
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, TextureStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a zeroed texture and return its id (ids start at 1)
    pub fn create(&self, width: usize, height: usize) -> u32 {
        let mut store = self.store();
        store.next_id += 1;
        let id = store.next_id;
        store.textures.insert(
            id,
            Texture {
                width,
                height,
                texels: vec![0.0; width * height],
                held_by_compute: false,
            },
        );
        id
    }

    /// Renderer-side upload. Fails while compute holds the texture.
    pub fn upload(&self, id: u32, texels: &[f32]) -> Result<(), String> {
        let mut store = self.store();
        let texture = store
            .textures
            .get_mut(&id)
            .ok_or_else(|| format!("unknown texture {}", id))?;
        if texture.held_by_compute {
            return Err(format!("texture {} is acquired by compute", id));
        }
        if texels.len() != texture.texels.len() {
            return Err(format!(
                "texture {} holds {} texels, got {}",
                id,
                texture.texels.len(),
                texels.len()
            ));
        }
        texture.texels.copy_from_slice(texels);
        Ok(())
    }

    /// Renderer-side readback. Fails while compute holds the texture.
    pub fn download(&self, id: u32) -> Result<Vec<f32>, String> {
        let store = self.store();
        let texture = store
            .textures
            .get(&id)
            .ok_or_else(|| format!("unknown texture {}", id))?;
        if texture.held_by_compute {
            return Err(format!("texture {} is acquired by compute", id));
        }
        Ok(texture.texels.clone())
    }

    /// Texture dimensions
    pub fn dims(&self, id: u32) -> Option<(usize, usize)> {
        self.store().textures.get(&id).map(|t| (t.width, t.height))
    }

    /// Whether compute currently holds the texture
    pub fn is_held_by_compute(&self, id: u32) -> bool {
        self.store()
            .textures
            .get(&id)
            .map(|t| t.held_by_compute)
            .unwrap_or(false)
    }

    fn take_for_compute(&self, id: u32) -> BackendResult<Vec<f32>> {
        let mut store = self.store();
        let texture = store
            .textures
            .get_mut(&id)
            .ok_or_else(|| BackendError::new(Status::INVALID_GL_OBJECT, format!("texture {} no longer exists", id)))?;
        texture.held_by_compute = true;
        Ok(texture.texels.clone())
    }

    fn return_from_compute(&self, id: u32, texels: &[f32]) {
        if let Some(texture) = self.store().textures.get_mut(&id) {
            let n = texture.texels.len().min(texels.len());
            texture.texels[..n].copy_from_slice(&texels[..n]);
            texture.held_by_compute = false;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel bodies
// ─────────────────────────────────────────────────────────────────────────────

/// Executable body of a host kernel
pub type HostKernelFn = dyn Fn(&mut KernelContext<'_>) -> Result<(), String> + Send + Sync;

/// A kernel implementation registered for an entry point
#[derive(Clone)]
pub struct HostKernel {
    arity: u32,
    body: Arc<HostKernelFn>,
    max_workgroup_size: Option<usize>,
    local_mem_bytes: u64,
    private_mem_bytes: u64,
}

impl HostKernel {
    /// A kernel taking `arity` arguments
    pub fn new<F>(arity: u32, body: F) -> Self
    where
        F: Fn(&mut KernelContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            arity,
            body: Arc::new(body),
            max_workgroup_size: None,
            local_mem_bytes: 0,
            private_mem_bytes: 0,
        }
    }

    /// Limit the workgroup size below the device maximum
    pub fn with_max_workgroup_size(mut self, size: usize) -> Self {
        self.max_workgroup_size = Some(size);
        self
    }

    /// Report a memory footprint
    pub fn with_memory(mut self, local_bytes: u64, private_bytes: u64) -> Self {
        self.local_mem_bytes = local_bytes;
        self.private_mem_bytes = private_bytes;
        self
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("arity", &self.arity)
            .field("max_workgroup_size", &self.max_workgroup_size)
            .finish_non_exhaustive()
    }
}

/// The built-in `buffers_fill_float(buffer, count, value)` body
pub fn fill_float_kernel() -> HostKernel {
    HostKernel::new(3, |ctx| {
        let count = ctx.scalar::<u32>(1)? as usize;
        let value = ctx.scalar::<f32>(2)?;
        let stride = ctx.range().total_items();
        let data = ctx.floats_mut(0)?;
        if count > data.len() {
            return Err(format!("count {} exceeds buffer of {} floats", count, data.len()));
        }

        for item in 0..stride {
            let mut i = item;
            while i < count {
                data[i] = value;
                i += stride;
            }
        }
        Ok(())
    })
}

#[derive(Debug, Clone)]
enum BoundArg {
    Mem(MemHandle),
    Bytes(Vec<u8>),
}

/// Arguments and geometry visible to a running host kernel
pub struct KernelContext<'a> {
    range: NdRange,
    args: &'a [BoundArg],
    memory: &'a mut HashMap<MemHandle, MemObject>,
}

impl<'a> KernelContext<'a> {
    /// Launch geometry
    pub fn range(&self) -> &NdRange {
        &self.range
    }

    /// Global ids in launch order, x fastest
    pub fn global_ids(&self) -> impl Iterator<Item = [usize; 2]> {
        let [gx, gy] = self.range.global;
        (0..gy).flat_map(move |y| (0..gx).map(move |x| [x, y]))
    }

    /// Read a scalar argument
    pub fn scalar<T: bytemuck::Pod>(&self, slot: u32) -> Result<T, String> {
        match self.args.get(slot as usize) {
            Some(BoundArg::Bytes(bytes)) => bytemuck::try_pod_read_unaligned(bytes)
                .map_err(|e| format!("argument {}: {}", slot, e)),
            Some(BoundArg::Mem(_)) => Err(format!("argument {} is a memory object", slot)),
            None => Err(format!("argument {} is not set", slot)),
        }
    }

    /// Float view of a memory argument
    pub fn floats(&self, slot: u32) -> Result<&[f32], String> {
        let handle = self.mem_arg(slot)?;
        self.memory
            .get(&handle)
            .map(MemObject::floats)
            .ok_or_else(|| format!("argument {} refers to a released object", slot))
    }

    /// Mutable float view of a memory argument
    pub fn floats_mut(&mut self, slot: u32) -> Result<&mut [f32], String> {
        self.writable(slot).map(MemObject::floats_mut)
    }

    /// Mutable byte view of a memory argument
    pub fn bytes_mut(&mut self, slot: u32) -> Result<&mut [u8], String> {
        self.writable(slot).map(MemObject::bytes_mut)
    }

    /// Read one memory argument while writing another
    pub fn with_floats<R>(
        &mut self,
        src: u32,
        dst: u32,
        f: impl FnOnce(&[f32], &mut [f32]) -> R,
    ) -> Result<R, String> {
        let src_handle = self.mem_arg(src)?;
        let dst_handle = self.mem_arg(dst)?;
        if src_handle == dst_handle {
            return Err(format!("arguments {} and {} alias the same object", src, dst));
        }

        self.writable(dst)?;
        let mut target = self
            .memory
            .remove(&dst_handle)
            .ok_or_else(|| format!("argument {} refers to a released object", dst))?;
        let result = match self.memory.get(&src_handle) {
            Some(source) => Ok(f(source.floats(), target.floats_mut())),
            None => Err(format!("argument {} refers to a released object", src)),
        };
        self.memory.insert(dst_handle, target);
        result
    }

    fn writable(&mut self, slot: u32) -> Result<&mut MemObject, String> {
        let handle = self.mem_arg(slot)?;
        let object = self
            .memory
            .get_mut(&handle)
            .ok_or_else(|| format!("argument {} refers to a released object", slot))?;
        if object.flags.access == MemAccess::ReadOnly {
            return Err(format!("argument {} is read-only", slot));
        }
        Ok(object)
    }

    fn mem_arg(&self, slot: u32) -> Result<MemHandle, String> {
        match self.args.get(slot as usize) {
            Some(BoundArg::Mem(handle)) => Ok(*handle),
            Some(BoundArg::Bytes(_)) => Err(format!("argument {} is not a memory object", slot)),
            None => Err(format!("argument {} is not set", slot)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemKind {
    Buffer,
    Image3d([usize; 3]),
    SharedTexture { texture: u32, width: usize, height: usize },
}

impl MemKind {
    fn image_dims(&self) -> Option<[usize; 3]> {
        match *self {
            MemKind::Buffer => None,
            MemKind::Image3d(dims) => Some(dims),
            MemKind::SharedTexture { width, height, .. } => Some([width, height, 1]),
        }
    }
}

/// A memory object; storage is word aligned so float views are free
#[derive(Debug)]
struct MemObject {
    kind: MemKind,
    flags: MemFlags,
    len: usize,
    words: Vec<u32>,
    acquired: bool,
}

impl MemObject {
    fn zeroed(kind: MemKind, flags: MemFlags, len: usize) -> Self {
        Self {
            kind,
            flags,
            len,
            words: vec![0; len.div_ceil(4)],
            acquired: false,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..len]
    }

    fn floats(&self) -> &[f32] {
        &bytemuck::cast_slice::<u32, f32>(&self.words)[..self.len / 4]
    }

    fn floats_mut(&mut self) -> &mut [f32] {
        let n = self.len / 4;
        &mut bytemuck::cast_slice_mut::<u32, f32>(&mut self.words)[..n]
    }

    fn check_usable(&self) -> BackendResult<()> {
        if matches!(self.kind, MemKind::SharedTexture { .. }) && !self.acquired {
            return Err(BackendError::new(
                Status::INVALID_OPERATION,
                "shared texture used outside an acquire/release bracket",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct HostBinary {
    format: String,
    device: String,
    options: String,
    entry_points: Vec<String>,
}

#[derive(Debug)]
enum ProgramOrigin {
    Source(String),
    Binary(HostBinary),
}

#[derive(Debug)]
struct HostProgram {
    origin: ProgramOrigin,
    built: Option<HostBinary>,
}

#[derive(Debug)]
struct KernelInstance {
    entry: String,
    implementation: HostKernel,
    args: Vec<Option<BoundArg>>,
}

#[derive(Debug)]
struct HostContext {
    device: DeviceDesc,
    preferred_multiple: usize,
    interop: bool,
}

/// Software compute backend
pub struct HostBackend {
    config: HostBackendConfig,
    textures: GraphicsTextures,
    implementations: HashMap<String, HostKernel>,
    context: Option<HostContext>,
    queue: bool,
    next_handle: u64,
    memory: HashMap<MemHandle, MemObject>,
    programs: HashMap<ProgramHandle, HostProgram>,
    kernels: HashMap<KernelHandle, KernelInstance>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// Backend with one general-purpose device
    pub fn new() -> Self {
        Self::with_config(HostBackendConfig::default())
    }

    /// Backend with an explicit device layout
    pub fn with_config(config: HostBackendConfig) -> Self {
        let mut implementations = HashMap::new();
        implementations.insert(FILL_FLOAT_ENTRY.to_string(), fill_float_kernel());

        Self {
            config,
            textures: GraphicsTextures::new(),
            implementations,
            context: None,
            queue: false,
            next_handle: 0,
            memory: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
        }
    }

    /// Register the executable body of an entry point
    pub fn register_kernel(&mut self, entry: impl Into<String>, kernel: HostKernel) {
        self.implementations.insert(entry.into(), kernel);
    }

    /// Renderer-side texture handle
    pub fn textures(&self) -> GraphicsTextures {
        self.textures.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &HostBackendConfig {
        &self.config
    }

    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn context(&self) -> BackendResult<&HostContext> {
        self.context
            .as_ref()
            .ok_or_else(|| BackendError::new(Status::INVALID_CONTEXT, "no context has been created"))
    }

    fn mem(&self, mem: MemHandle) -> BackendResult<&MemObject> {
        self.memory
            .get(&mem)
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", mem.0)))
    }

    fn mem_mut(&mut self, mem: MemHandle) -> BackendResult<&mut MemObject> {
        self.memory
            .get_mut(&mem)
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", mem.0)))
    }

    fn buffer(&self, mem: MemHandle) -> BackendResult<&MemObject> {
        let object = self.mem(mem)?;
        if object.kind != MemKind::Buffer {
            return Err(BackendError::new(
                Status::INVALID_MEM_OBJECT,
                format!("memory object {} is not a buffer", mem.0),
            ));
        }
        Ok(object)
    }

    fn image(&self, mem: MemHandle) -> BackendResult<([usize; 3], &MemObject)> {
        let object = self.mem(mem)?;
        let dims = object.kind.image_dims().ok_or_else(|| {
            BackendError::new(Status::INVALID_MEM_OBJECT, format!("memory object {} is not an image", mem.0))
        })?;
        object.check_usable()?;
        Ok((dims, object))
    }

    fn insert_mem(&mut self, object: MemObject) -> MemHandle {
        let handle = MemHandle(self.next());
        self.memory.insert(handle, object);
        handle
    }

    fn initial_contents<'d>(flags: MemFlags, size: usize, init: Option<&'d [u8]>) -> BackendResult<Option<&'d [u8]>> {
        match (flags.copy_host, init) {
            (true, Some(data)) if data.len() >= size => Ok(Some(&data[..size])),
            (true, Some(data)) => Err(BackendError::new(
                Status::INVALID_HOST_PTR,
                format!("host data holds {} bytes, object needs {}", data.len(), size),
            )),
            (true, None) => Err(BackendError::new(Status::INVALID_HOST_PTR, "copy-host requested without host data")),
            (false, Some(_)) => Err(BackendError::new(Status::INVALID_HOST_PTR, "host data given without copy-host flag")),
            (false, None) => Ok(None),
        }
    }

    fn check_alloc(&self, size: usize) -> BackendResult<()> {
        self.context()?;
        if size > self.config.max_alloc_bytes {
            return Err(BackendError::new(
                Status::MEM_OBJECT_ALLOCATION_FAILURE,
                format!("{} bytes exceeds the {} byte allocation limit", size, self.config.max_alloc_bytes),
            ));
        }
        Ok(())
    }

    fn check_region(dims: [usize; 3], region: [usize; 3]) -> BackendResult<()> {
        if region.iter().any(|&r| r == 0) || region.iter().zip(dims.iter()).any(|(r, d)| r > d) {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("region {:?} does not fit image {:?}", region, dims),
            ));
        }
        Ok(())
    }

    fn compile(&self, source: &str, options: &str) -> BackendResult<(HostBinary, String)> {
        let device = self.context()?.device.name.clone();
        let mut log = format!("host compiler for '{}', options '{}'\n", device, options);

        validate_options(options)?;

        for line in source.lines() {
            if let Some(message) = line.trim_start().strip_prefix("#error") {
                log.push_str(&format!("error: {}\n", message.trim()));
                return Err(BackendError::new(Status::BUILD_PROGRAM_FAILURE, "build failed").with_log(log));
            }
        }

        let open = source.matches('{').count();
        let close = source.matches('}').count();
        if open != close {
            log.push_str(&format!("error: unbalanced braces ({} open, {} close)\n", open, close));
            return Err(BackendError::new(Status::BUILD_PROGRAM_FAILURE, "build failed").with_log(log));
        }

        let entry_points = entry_points(source);
        log.push_str(&format!("found {} kernel(s): {}\n", entry_points.len(), entry_points.join(", ")));

        Ok((
            HostBinary {
                format: HOST_BINARY_FORMAT.into(),
                device,
                options: options.into(),
                entry_points,
            },
            log,
        ))
    }
}

/// Find `__kernel void name(` entry points
fn entry_points(source: &str) -> Vec<String> {
    let tokens: Vec<&str> = source
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect();

    let mut entries = Vec::new();
    for window in tokens.windows(3) {
        if (window[0] == "__kernel" || window[0] == "kernel") && window[1] == "void" {
            let name = window[2].to_string();
            if !entries.contains(&name) {
                entries.push(name);
            }
        }
    }
    entries
}

/// Every token must be a flag; `-I` and `-D` take a value, attached or next.
fn validate_options(options: &str) -> BackendResult<()> {
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        if !token.starts_with('-') {
            return Err(BackendError::new(
                Status::INVALID_BUILD_OPTIONS,
                format!("unexpected build option '{}'", token),
            ));
        }
        if (token == "-I" || token == "-D") && tokens.next().is_none() {
            return Err(BackendError::new(
                Status::INVALID_BUILD_OPTIONS,
                format!("build option '{}' needs a value", token),
            ));
        }
    }
    Ok(())
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&mut self) -> BackendResult<Vec<PlatformDesc>> {
        Ok(self
            .config
            .platforms
            .iter()
            .enumerate()
            .map(|(index, p)| PlatformDesc {
                index,
                name: p.name.clone(),
                vendor: p.vendor.clone(),
            })
            .collect())
    }

    fn devices(&mut self, platform: &PlatformDesc, class: DeviceClass) -> BackendResult<Vec<DeviceDesc>> {
        let config = self.config.platforms.get(platform.index).ok_or_else(|| {
            BackendError::new(Status::INVALID_PLATFORM, format!("unknown platform {}", platform.index))
        })?;

        Ok(config
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.class == class)
            .map(|(ordinal, d)| DeviceDesc {
                platform: platform.index,
                platform_name: config.name.clone(),
                ordinal,
                name: d.name.clone(),
                vendor: d.vendor.clone(),
                class: d.class,
                compute_units: d.compute_units,
                max_workgroup_size: d.max_workgroup_size,
            })
            .collect())
    }

    fn create_context(&mut self, device: &DeviceDesc, interop: bool) -> BackendResult<()> {
        if self.config.fail_context {
            return Err(BackendError::new(Status::OUT_OF_RESOURCES, "context creation refused"));
        }

        let config = self
            .config
            .platforms
            .get(device.platform)
            .and_then(|p| p.devices.get(device.ordinal))
            .filter(|d| d.name == device.name)
            .ok_or_else(|| BackendError::new(Status::INVALID_DEVICE, format!("unknown device '{}'", device.name)))?;

        self.context = Some(HostContext {
            device: device.clone(),
            preferred_multiple: config.preferred_multiple.max(1),
            interop: interop && self.config.interop,
        });
        self.queue = false;
        Ok(())
    }

    fn create_queue(&mut self) -> BackendResult<()> {
        self.context()?;
        if self.config.fail_queue {
            return Err(BackendError::new(Status::OUT_OF_RESOURCES, "queue creation refused"));
        }
        self.queue = true;
        Ok(())
    }

    fn interop_active(&self) -> bool {
        self.context.as_ref().map(|c| c.interop).unwrap_or(false)
    }

    fn flush(&mut self) -> BackendResult<()> {
        if !self.queue {
            return Err(BackendError::new(Status::INVALID_COMMAND_QUEUE, "no command queue"));
        }
        Ok(())
    }

    fn finish(&mut self) -> BackendResult<()> {
        self.flush()
    }

    fn program_from_source(&mut self, source: &str) -> BackendResult<ProgramHandle> {
        self.context()?;
        if source.trim().is_empty() {
            return Err(BackendError::new(Status::INVALID_VALUE, "empty program source"));
        }
        let handle = ProgramHandle(self.next());
        self.programs.insert(
            handle,
            HostProgram {
                origin: ProgramOrigin::Source(source.to_string()),
                built: None,
            },
        );
        Ok(handle)
    }

    fn program_from_binary(&mut self, binary: &[u8]) -> BackendResult<ProgramHandle> {
        self.context()?;
        let parsed: HostBinary = serde_json::from_slice(binary)
            .map_err(|e| BackendError::new(Status::INVALID_BINARY, format!("malformed binary: {}", e)))?;
        if parsed.format != HOST_BINARY_FORMAT {
            return Err(BackendError::new(
                Status::INVALID_BINARY,
                format!("unsupported binary format '{}'", parsed.format),
            ));
        }

        let handle = ProgramHandle(self.next());
        self.programs.insert(
            handle,
            HostProgram {
                origin: ProgramOrigin::Binary(parsed),
                built: None,
            },
        );
        Ok(handle)
    }

    fn build_program(&mut self, program: ProgramHandle, options: &str) -> BackendResult<String> {
        let device = self.context()?.device.name.clone();
        let entry = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::new(Status::INVALID_PROGRAM, format!("unknown program {}", program.0)))?;

        let (built, log) = match &entry.origin {
            ProgramOrigin::Source(source) => self.compile(source, options)?,
            ProgramOrigin::Binary(binary) => {
                if binary.device != device {
                    let log = format!("binary targets '{}', context device is '{}'\n", binary.device, device);
                    return Err(BackendError::new(Status::BUILD_PROGRAM_FAILURE, "binary built for another device")
                        .with_log(log));
                }
                let log = format!("loaded {} kernel(s) from binary\n", binary.entry_points.len());
                (binary.clone(), log)
            }
        };

        if let Some(entry) = self.programs.get_mut(&program) {
            entry.built = Some(built);
        }
        Ok(log)
    }

    fn program_binaries(&mut self, program: ProgramHandle) -> BackendResult<Vec<Vec<u8>>> {
        let built = self
            .programs
            .get(&program)
            .and_then(|p| p.built.as_ref())
            .ok_or_else(|| BackendError::new(Status::INVALID_PROGRAM, format!("program {} is not built", program.0)))?;

        let binary = serde_json::to_vec(built)
            .map_err(|e| BackendError::new(Status::OUT_OF_RESOURCES, format!("unable to encode binary: {}", e)))?;
        Ok(vec![binary; self.config.program_devices])
    }

    fn create_kernel(&mut self, program: ProgramHandle, entry: &str) -> BackendResult<KernelHandle> {
        let built = self
            .programs
            .get(&program)
            .and_then(|p| p.built.as_ref())
            .ok_or_else(|| BackendError::new(Status::INVALID_PROGRAM, format!("program {} is not built", program.0)))?;

        if !built.entry_points.iter().any(|e| e == entry) {
            return Err(BackendError::new(
                Status::INVALID_KERNEL_NAME,
                format!("program has no kernel '{}'", entry),
            ));
        }
        let implementation = self.implementations.get(entry).cloned().ok_or_else(|| {
            BackendError::new(Status::INVALID_KERNEL_NAME, format!("no host implementation for '{}'", entry))
        })?;

        let handle = KernelHandle(self.next());
        self.kernels.insert(
            handle,
            KernelInstance {
                entry: entry.to_string(),
                args: vec![None; implementation.arity as usize],
                implementation,
            },
        );
        Ok(handle)
    }

    fn kernel_limits(&mut self, kernel: KernelHandle) -> BackendResult<KernelLimits> {
        let context = self.context()?;
        let instance = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;

        let device_max = context.device.max_workgroup_size.max(1);
        let max = instance
            .implementation
            .max_workgroup_size
            .map(|m| m.clamp(1, device_max))
            .unwrap_or(device_max);

        Ok(KernelLimits {
            max_workgroup_size: max,
            preferred_multiple: context.preferred_multiple.min(max),
            local_mem_bytes: instance.implementation.local_mem_bytes,
            private_mem_bytes: instance.implementation.private_mem_bytes,
        })
    }

    fn set_kernel_arg(&mut self, kernel: KernelHandle, slot: u32, arg: KernelArg<'_>) -> BackendResult<()> {
        let bound = match arg {
            KernelArg::Mem(handle) => {
                self.mem(handle)?;
                BoundArg::Mem(handle)
            }
            KernelArg::Bytes(bytes) if bytes.is_empty() => {
                return Err(BackendError::new(Status::INVALID_ARG_SIZE, "empty scalar argument"));
            }
            KernelArg::Bytes(bytes) => BoundArg::Bytes(bytes.to_vec()),
        };

        let instance = self
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;
        let arity = instance.args.len();
        if slot as usize >= arity {
            return Err(BackendError::new(
                Status::INVALID_ARG_INDEX,
                format!("kernel '{}' takes {} arguments", instance.entry, arity),
            ));
        }
        instance.args[slot as usize] = Some(bound);
        Ok(())
    }

    fn enqueue_kernel(&mut self, kernel: KernelHandle, range: &NdRange) -> BackendResult<()> {
        self.flush()?;
        let limits = self.kernel_limits(kernel)?;
        let instance = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;

        if range.dims == 0 || range.dims > 2 {
            return Err(BackendError::new(Status::INVALID_WORK_DIMENSION, format!("{} dimensions", range.dims)));
        }
        if range.global.iter().any(|&g| g == 0) {
            return Err(BackendError::new(Status::INVALID_GLOBAL_WORK_SIZE, "empty global range"));
        }
        if range.local.iter().any(|&l| l == 0) || range.group_items() > limits.max_workgroup_size {
            return Err(BackendError::new(
                Status::INVALID_WORK_GROUP_SIZE,
                format!(
                    "workgroup {:?} exceeds kernel limit {}",
                    &range.local[..range.dims],
                    limits.max_workgroup_size
                ),
            ));
        }
        if range.global.iter().zip(range.local.iter()).any(|(g, l)| g % l != 0) {
            return Err(BackendError::new(
                Status::INVALID_WORK_GROUP_SIZE,
                format!(
                    "global {:?} is not a multiple of local {:?}",
                    &range.global[..range.dims],
                    &range.local[..range.dims]
                ),
            ));
        }

        let entry = instance.entry.clone();
        let body = Arc::clone(&instance.implementation.body);
        let args = instance
            .args
            .iter()
            .enumerate()
            .map(|(slot, arg)| {
                arg.clone().ok_or_else(|| {
                    BackendError::new(Status::INVALID_KERNEL_ARGS, format!("argument {} of '{}' is not set", slot, entry))
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        for arg in &args {
            if let BoundArg::Mem(handle) = arg {
                self.mem(*handle)?.check_usable()?;
            }
        }

        let mut ctx = KernelContext {
            range: *range,
            args: &args,
            memory: &mut self.memory,
        };
        body(&mut ctx).map_err(|message| {
            BackendError::new(Status::KERNEL_EXECUTION_FAILED, format!("kernel '{}' failed: {}", entry, message))
        })
    }

    fn create_buffer(&mut self, flags: MemFlags, size: usize, init: Option<&[u8]>) -> BackendResult<MemHandle> {
        if size == 0 {
            return Err(BackendError::new(Status::INVALID_BUFFER_SIZE, "zero-sized buffer"));
        }
        self.check_alloc(size)?;
        let contents = Self::initial_contents(flags, size, init)?;

        let mut object = MemObject::zeroed(MemKind::Buffer, flags, size);
        if let Some(data) = contents {
            object.bytes_mut().copy_from_slice(data);
        }
        Ok(self.insert_mem(object))
    }

    fn create_shared_texture_2d(&mut self, flags: MemFlags, texture: u32) -> BackendResult<MemHandle> {
        if !self.context()?.interop {
            return Err(BackendError::new(
                Status::INVALID_OPERATION,
                "context was created without graphics interop",
            ));
        }
        let (width, height) = self
            .textures
            .dims(texture)
            .ok_or_else(|| BackendError::new(Status::INVALID_GL_OBJECT, format!("unknown texture {}", texture)))?;

        let object = MemObject::zeroed(
            MemKind::SharedTexture { texture, width, height },
            flags,
            width * height * 4,
        );
        Ok(self.insert_mem(object))
    }

    fn create_image_3d(&mut self, flags: MemFlags, dims: [usize; 3], init: Option<&[u8]>) -> BackendResult<MemHandle> {
        if dims.iter().any(|&d| d == 0) {
            return Err(BackendError::new(Status::INVALID_IMAGE_SIZE, format!("image dimensions {:?}", dims)));
        }
        let size = dims.iter().product::<usize>() * 4;
        self.check_alloc(size)?;
        let contents = Self::initial_contents(flags, size, init)?;

        let mut object = MemObject::zeroed(MemKind::Image3d(dims), flags, size);
        if let Some(data) = contents {
            object.bytes_mut().copy_from_slice(data);
        }
        Ok(self.insert_mem(object))
    }

    fn release_mem(&mut self, mem: MemHandle) -> BackendResult<()> {
        let object = self
            .memory
            .remove(&mem)
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", mem.0)))?;

        if let MemKind::SharedTexture { texture, .. } = object.kind {
            if object.acquired {
                self.textures.return_from_compute(texture, object.floats());
            }
        }
        Ok(())
    }

    fn write_buffer(&mut self, mem: MemHandle, _blocking: bool, data: &[u8]) -> BackendResult<()> {
        self.flush()?;
        let object = self.buffer(mem)?;
        if data.len() > object.len {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("write of {} bytes into {} byte buffer", data.len(), object.len),
            ));
        }
        self.mem_mut(mem)?.bytes_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, mem: MemHandle, _blocking: bool, out: &mut [u8]) -> BackendResult<()> {
        self.flush()?;
        let object = self.buffer(mem)?;
        if out.len() > object.len {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("read of {} bytes from {} byte buffer", out.len(), object.len),
            ));
        }
        out.copy_from_slice(&object.bytes()[..out.len()]);
        Ok(())
    }

    fn copy_buffer(&mut self, src: MemHandle, dst: MemHandle, size: usize) -> BackendResult<()> {
        self.flush()?;
        let source = self.buffer(src)?;
        let target_len = self.buffer(dst)?.len;
        if size > source.len || size > target_len {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("copy of {} bytes exceeds buffer size", size),
            ));
        }
        if src == dst {
            return Ok(());
        }

        let staged = source.bytes()[..size].to_vec();
        self.mem_mut(dst)?.bytes_mut()[..size].copy_from_slice(&staged);
        Ok(())
    }

    fn copy_image(&mut self, src: MemHandle, dst: MemHandle, region: [usize; 3]) -> BackendResult<()> {
        self.flush()?;
        let (src_dims, source) = self.image(src)?;
        Self::check_region(src_dims, region)?;
        let staged = source.floats().to_vec();

        let (dst_dims, _) = self.image(dst)?;
        Self::check_region(dst_dims, region)?;

        let target = self.mem_mut(dst)?.floats_mut();
        for z in 0..region[2] {
            for y in 0..region[1] {
                let s = (z * src_dims[1] + y) * src_dims[0];
                let d = (z * dst_dims[1] + y) * dst_dims[0];
                target[d..d + region[0]].copy_from_slice(&staged[s..s + region[0]]);
            }
        }
        Ok(())
    }

    fn write_image(&mut self, mem: MemHandle, _blocking: bool, region: [usize; 3], data: &[u8]) -> BackendResult<()> {
        self.flush()?;
        let (dims, _) = self.image(mem)?;
        Self::check_region(dims, region)?;
        let expected = region.iter().product::<usize>() * 4;
        if data.len() != expected {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("image write needs {} bytes, got {}", expected, data.len()),
            ));
        }

        let row = region[0] * 4;
        let target = self.mem_mut(mem)?.bytes_mut();
        for z in 0..region[2] {
            for y in 0..region[1] {
                let s = (z * region[1] + y) * row;
                let d = ((z * dims[1] + y) * dims[0]) * 4;
                target[d..d + row].copy_from_slice(&data[s..s + row]);
            }
        }
        Ok(())
    }

    fn fill_buffer(&mut self, mem: MemHandle, pattern: &[u8], size: usize) -> BackendResult<()> {
        self.flush()?;
        if !self.config.atomic_fill {
            return Err(BackendError::new(Status::INVALID_OPERATION, "device does not support buffer fill"));
        }
        let object = self.buffer(mem)?;
        if pattern.is_empty() || size % pattern.len() != 0 || size > object.len {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("fill of {} bytes with {} byte pattern into {} bytes", size, pattern.len(), object.len),
            ));
        }

        for chunk in self.mem_mut(mem)?.bytes_mut()[..size].chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
    }

    fn acquire_shared(&mut self, mem: MemHandle) -> BackendResult<()> {
        self.flush()?;
        let object = self.mem(mem)?;
        let MemKind::SharedTexture { texture, .. } = object.kind else {
            return Err(BackendError::new(Status::INVALID_GL_OBJECT, "not a shared graphics object"));
        };
        if object.acquired {
            return Err(BackendError::new(Status::INVALID_OPERATION, "shared object is already acquired"));
        }

        let texels = self.textures.take_for_compute(texture)?;
        let object = self.mem_mut(mem)?;
        let n = texels.len().min(object.floats().len());
        object.floats_mut()[..n].copy_from_slice(&texels[..n]);
        object.acquired = true;
        Ok(())
    }

    fn release_shared(&mut self, mem: MemHandle) -> BackendResult<()> {
        self.flush()?;
        let object = self.mem(mem)?;
        let MemKind::SharedTexture { texture, .. } = object.kind else {
            return Err(BackendError::new(Status::INVALID_GL_OBJECT, "not a shared graphics object"));
        };
        if !object.acquired {
            return Err(BackendError::new(Status::INVALID_OPERATION, "shared object is not acquired"));
        }

        self.textures.return_from_compute(texture, object.floats());
        self.mem_mut(mem)?.acquired = false;
        Ok(())
    }

    fn live_mem_objects(&self) -> usize {
        self.memory.len()
    }
}
