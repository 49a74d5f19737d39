//! NVIDIA backend on the CUDA driver API
//!
//! Programs are CUDA C compiled with NVRTC; the device binary is the PTX
//! text, so cached binaries stay portable across driver versions on the same
//! architecture. Every entry point is loaded as its own module.
//!
//! Graphics interop is not available: shared texture creation reports
//! `INVALID_OPERATION`, which the manager surfaces as interop unavailable.
//! 3-D images are stored as tightly packed linear buffers.

use super::{
    BackendError, BackendResult, ComputeBackend, DeviceDesc, KernelArg, KernelHandle, KernelLimits, MemFlags,
    MemHandle, NdRange, PlatformDesc, ProgramHandle, Status,
};
use crate::device::DeviceClass;
use cudarc::driver::{
    result, sys, CudaDevice, CudaFunction, CudaSlice, DevicePtr, DriverError, LaunchAsync, LaunchConfig,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions, Ptx};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use tracing::{debug, warn};

const PLATFORM_NAME: &str = "NVIDIA CUDA";
const PLATFORM_VENDOR: &str = "NVIDIA Corporation";

fn driver_error(e: DriverError, what: &str) -> BackendError {
    let status = match e.0 {
        sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY => Status::MEM_OBJECT_ALLOCATION_FAILURE,
        sys::CUresult::CUDA_ERROR_INVALID_VALUE => Status::INVALID_VALUE,
        sys::CUresult::CUDA_ERROR_NOT_FOUND => Status::INVALID_KERNEL_NAME,
        sys::CUresult::CUDA_ERROR_INVALID_PTX => Status::INVALID_BINARY,
        code => Status(-10_000 - code as i32),
    };
    BackendError::new(status, format!("{}: {:?}", what, e))
}

fn attribute(device: &CudaDevice, attr: sys::CUdevice_attribute) -> BackendResult<usize> {
    device
        .attribute(attr)
        .map(|v| v.max(0) as usize)
        .map_err(|e| driver_error(e, "device attribute query"))
}

/// Largest block size in `step` decrements from `device_max` that `fits`.
fn largest_launchable(
    device_max: usize,
    step: usize,
    mut fits: impl FnMut(usize) -> BackendResult<bool>,
) -> BackendResult<usize> {
    let step = step.max(1);
    let mut size = device_max;
    while size > 0 {
        if fits(size)? {
            return Ok(size);
        }
        size = if size % step == 0 { size - step } else { size - size % step };
    }
    Err(BackendError::new(
        Status::OUT_OF_RESOURCES,
        "kernel cannot launch a single block on this device",
    ))
}

struct CudaMem {
    data: CudaSlice<u8>,
    dims: Option<[usize; 3]>,
}

enum CudaProgram {
    Source(String),
    Built(Ptx),
}

enum ArgValue {
    Mem(MemHandle),
    Bytes(Vec<u8>),
}

struct CudaKernel {
    func: CudaFunction,
    args: Vec<Option<ArgValue>>,
}

/// Backend driving NVIDIA devices through cudarc
#[derive(Default)]
pub struct CudaBackend {
    device: Option<Arc<CudaDevice>>,
    queue: bool,
    mems: HashMap<u64, CudaMem>,
    programs: HashMap<u64, CudaProgram>,
    kernels: HashMap<u64, CudaKernel>,
    entry_names: HashMap<String, &'static str>,
    next_handle: u64,
}

// SAFETY: the backend is only driven through `&mut self` from one thread at a
// time. CUDA handles held here are context-bound, not thread-bound, and the
// device's primary context is made current by cudarc before each call.
unsafe impl Send for CudaBackend {}

impl CudaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// cudarc keys loaded functions by `&'static str`; each distinct entry
    /// point name is leaked once and reused across rebuilds.
    fn entry_name(&mut self, entry: &str) -> &'static str {
        if let Some(&name) = self.entry_names.get(entry) {
            return name;
        }
        let name: &'static str = Box::leak(entry.to_string().into_boxed_str());
        self.entry_names.insert(entry.to_string(), name);
        name
    }

    fn device(&self) -> BackendResult<&Arc<CudaDevice>> {
        self.device
            .as_ref()
            .ok_or_else(|| BackendError::new(Status::INVALID_CONTEXT, "no context"))
    }

    fn mem(&self, mem: MemHandle) -> BackendResult<&CudaMem> {
        self.mems
            .get(&mem.0)
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", mem.0)))
    }

    fn mem_mut(&mut self, mem: MemHandle) -> BackendResult<&mut CudaMem> {
        self.mems
            .get_mut(&mem.0)
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", mem.0)))
    }

    fn alloc(&mut self, size: usize, init: Option<&[u8]>, dims: Option<[usize; 3]>) -> BackendResult<MemHandle> {
        let device = self.device()?.clone();
        let mut data = device
            .alloc_zeros::<u8>(size.max(1))
            .map_err(|e| driver_error(e, "allocation"))?;
        if let Some(init) = init {
            if init.len() > size {
                return Err(BackendError::new(
                    Status::INVALID_HOST_PTR,
                    format!("{} bytes of host data for a {} byte object", init.len(), size),
                ));
            }
            device
                .htod_sync_copy_into(init, &mut data.slice_mut(0..init.len()))
                .map_err(|e| driver_error(e, "initial upload"))?;
        }

        let handle = self.next();
        self.mems.insert(handle, CudaMem { data, dims });
        Ok(MemHandle(handle))
    }

    fn download(&self, mem: MemHandle, len: usize) -> BackendResult<Vec<u8>> {
        let device = self.device()?;
        let object = self.mem(mem)?;
        let mut host = vec![0u8; len];
        device
            .dtoh_sync_copy_into(&object.data.slice(0..len), &mut host)
            .map_err(|e| driver_error(e, "download"))?;
        Ok(host)
    }

    fn upload(&mut self, mem: MemHandle, data: &[u8]) -> BackendResult<()> {
        let device = self.device()?.clone();
        let object = self.mem_mut(mem)?;
        if data.len() > object.data.len() {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("{} bytes into a {} byte object", data.len(), object.data.len()),
            ));
        }
        device
            .htod_sync_copy_into(data, &mut object.data.slice_mut(0..data.len()))
            .map_err(|e| driver_error(e, "upload"))
    }

    fn image_dims(&self, mem: MemHandle) -> BackendResult<[usize; 3]> {
        self.mem(mem)?
            .dims
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, "memory object is not an image"))
    }
}

/// NVRTC wants `--include-path=dir` where OpenCL takes `-I dir`
fn nvrtc_options(options: &str) -> CompileOptions {
    let mut include_paths = Vec::new();
    let mut rest = Vec::new();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-I" => include_paths.extend(tokens.next().map(str::to_string)),
            t if t.starts_with("-I") => include_paths.push(t[2..].to_string()),
            t => rest.push(t.to_string()),
        }
    }
    CompileOptions {
        include_paths,
        options: rest,
        ..Default::default()
    }
}

/// Copy an origin-anchored region between tightly packed float images
fn copy_region(src: &[u8], src_dims: [usize; 3], dst: &mut [u8], dst_dims: [usize; 3], region: [usize; 3]) {
    let row = region[0] * 4;
    for z in 0..region[2] {
        for y in 0..region[1] {
            let s = ((z * src_dims[1] + y) * src_dims[0]) * 4;
            let d = ((z * dst_dims[1] + y) * dst_dims[0]) * 4;
            dst[d..d + row].copy_from_slice(&src[s..s + row]);
        }
    }
}

fn region_fits(region: [usize; 3], dims: [usize; 3]) -> bool {
    region.iter().zip(dims.iter()).all(|(r, d)| r <= d)
}

impl ComputeBackend for CudaBackend {
    fn name(&self) -> &str {
        "cuda"
    }

    fn platforms(&mut self) -> BackendResult<Vec<PlatformDesc>> {
        if let Err(e) = result::init() {
            debug!("CUDA driver unavailable: {:?}", e);
            return Ok(Vec::new());
        }
        Ok(vec![PlatformDesc {
            index: 0,
            name: PLATFORM_NAME.into(),
            vendor: PLATFORM_VENDOR.into(),
        }])
    }

    fn devices(&mut self, platform: &PlatformDesc, class: DeviceClass) -> BackendResult<Vec<DeviceDesc>> {
        if platform.index != 0 {
            return Err(BackendError::new(Status::INVALID_PLATFORM, format!("unknown platform {}", platform.index)));
        }
        if class != DeviceClass::Accelerator {
            return Ok(Vec::new());
        }

        let count = result::device::get_count().map_err(|e| driver_error(e, "device count"))?;
        let mut devices = Vec::with_capacity(count.max(0) as usize);
        for ordinal in 0..count.max(0) as usize {
            let device = CudaDevice::new(ordinal).map_err(|e| driver_error(e, "device open"))?;
            devices.push(DeviceDesc {
                platform: 0,
                platform_name: PLATFORM_NAME.into(),
                ordinal,
                name: device.name().map_err(|e| driver_error(e, "device name"))?,
                vendor: PLATFORM_VENDOR.into(),
                class,
                compute_units: attribute(&device, sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?
                    as u32,
                max_workgroup_size: attribute(
                    &device,
                    sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                )?,
            });
        }
        Ok(devices)
    }

    fn create_context(&mut self, device: &DeviceDesc, interop: bool) -> BackendResult<()> {
        if interop {
            warn!("Graphics interop is not available on the CUDA backend");
        }
        let handle = CudaDevice::new(device.ordinal).map_err(|e| driver_error(e, "context creation"))?;
        self.device = Some(handle);
        Ok(())
    }

    fn create_queue(&mut self) -> BackendResult<()> {
        self.device()?;
        self.queue = true;
        Ok(())
    }

    fn interop_active(&self) -> bool {
        false
    }

    fn flush(&mut self) -> BackendResult<()> {
        if !self.queue {
            return Err(BackendError::new(Status::INVALID_COMMAND_QUEUE, "no command queue"));
        }
        Ok(())
    }

    fn finish(&mut self) -> BackendResult<()> {
        self.flush()?;
        self.device()?
            .synchronize()
            .map_err(|e| driver_error(e, "synchronize"))
    }

    fn program_from_source(&mut self, source: &str) -> BackendResult<ProgramHandle> {
        self.device()?;
        let handle = self.next();
        self.programs.insert(handle, CudaProgram::Source(source.to_string()));
        Ok(ProgramHandle(handle))
    }

    fn program_from_binary(&mut self, binary: &[u8]) -> BackendResult<ProgramHandle> {
        self.device()?;
        let text = std::str::from_utf8(binary)
            .map_err(|_| BackendError::new(Status::INVALID_BINARY, "PTX binary is not UTF-8"))?;
        if !text.contains(".entry") {
            return Err(BackendError::new(Status::INVALID_BINARY, "binary holds no PTX entry points"));
        }
        let handle = self.next();
        self.programs
            .insert(handle, CudaProgram::Built(Ptx::from_src(text.to_string())));
        Ok(ProgramHandle(handle))
    }

    fn build_program(&mut self, program: ProgramHandle, options: &str) -> BackendResult<String> {
        let entry = self
            .programs
            .get_mut(&program.0)
            .ok_or_else(|| BackendError::new(Status::INVALID_PROGRAM, format!("unknown program {}", program.0)))?;

        let source = match entry {
            CudaProgram::Built(_) => return Ok(String::new()),
            CudaProgram::Source(source) => source.clone(),
        };
        match compile_ptx_with_opts(&source, nvrtc_options(options)) {
            Ok(ptx) => {
                *entry = CudaProgram::Built(ptx);
                Ok(String::new())
            }
            Err(e) => {
                let log = format!("{:?}", e);
                Err(BackendError::new(Status::BUILD_PROGRAM_FAILURE, "NVRTC compilation failed").with_log(log))
            }
        }
    }

    fn program_binaries(&mut self, program: ProgramHandle) -> BackendResult<Vec<Vec<u8>>> {
        match self.programs.get(&program.0) {
            Some(CudaProgram::Built(ptx)) => Ok(vec![ptx.to_src().into_bytes()]),
            Some(CudaProgram::Source(_)) => Err(BackendError::new(Status::INVALID_PROGRAM, "program is not built")),
            None => Err(BackendError::new(Status::INVALID_PROGRAM, format!("unknown program {}", program.0))),
        }
    }

    fn create_kernel(&mut self, program: ProgramHandle, entry: &str) -> BackendResult<KernelHandle> {
        let device = self.device()?.clone();
        let ptx = match self.programs.get(&program.0) {
            Some(CudaProgram::Built(ptx)) => Ptx::from_src(ptx.to_src()),
            _ => return Err(BackendError::new(Status::INVALID_PROGRAM, "program is not built")),
        };

        let handle = self.next();
        let module = format!("lumen_{}_{}", program.0, handle);
        let entry = self.entry_name(entry);
        device
            .load_ptx(ptx, &module, &[entry])
            .map_err(|e| driver_error(e, "module load"))?;
        let func = device
            .get_func(&module, entry)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL_NAME, format!("no entry point '{}'", entry)))?;

        self.kernels.insert(handle, CudaKernel { func, args: Vec::new() });
        Ok(KernelHandle(handle))
    }

    fn kernel_limits(&mut self, kernel: KernelHandle) -> BackendResult<KernelLimits> {
        let instance = self
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;
        let device = self.device()?;
        let device_max = attribute(device, sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?;
        let warp = attribute(device, sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE)?;

        // Register and shared memory use can keep a function below the
        // device limit; a block size is launchable while one block fits.
        let max_workgroup_size = largest_launchable(device_max, warp, |size| {
            instance
                .func
                .occupancy_max_active_blocks_per_multiprocessor(size as u32, 0, None)
                .map(|blocks| blocks > 0)
                .map_err(|e| driver_error(e, "occupancy query"))
        })?;

        Ok(KernelLimits {
            max_workgroup_size,
            preferred_multiple: warp,
            local_mem_bytes: 0,
            private_mem_bytes: 0,
        })
    }

    fn set_kernel_arg(&mut self, kernel: KernelHandle, slot: u32, arg: KernelArg<'_>) -> BackendResult<()> {
        let value = match arg {
            KernelArg::Mem(mem) => {
                self.mem(mem)?;
                ArgValue::Mem(mem)
            }
            KernelArg::Bytes(bytes) => ArgValue::Bytes(bytes.to_vec()),
        };
        let instance = self
            .kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;

        let slot = slot as usize;
        if instance.args.len() <= slot {
            instance.args.resize_with(slot + 1, || None);
        }
        instance.args[slot] = Some(value);
        Ok(())
    }

    fn enqueue_kernel(&mut self, kernel: KernelHandle, range: &NdRange) -> BackendResult<()> {
        self.flush()?;
        if range.dims == 0 || range.dims > 2 {
            return Err(BackendError::new(Status::INVALID_WORK_DIMENSION, format!("{} dimensions", range.dims)));
        }
        for d in 0..2 {
            if range.local[d] == 0 || range.global[d] % range.local[d] != 0 {
                return Err(BackendError::new(
                    Status::INVALID_WORK_GROUP_SIZE,
                    format!("global {:?} is not a multiple of local {:?}", range.global, range.local),
                ));
            }
        }

        let instance = self
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| BackendError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;

        // Parameter storage must stay put while the pointer array is in use.
        let mut pointers: Vec<u64> = Vec::with_capacity(instance.args.len());
        let mut bytes: Vec<&[u8]> = Vec::with_capacity(instance.args.len());
        for (slot, arg) in instance.args.iter().enumerate() {
            match arg {
                Some(ArgValue::Mem(mem)) => {
                    let object = self.mems.get(&mem.0).ok_or_else(|| {
                        BackendError::new(Status::INVALID_MEM_OBJECT, format!("argument {} was released", slot))
                    })?;
                    pointers.push(*object.data.device_ptr());
                    bytes.push(&[]);
                }
                Some(ArgValue::Bytes(b)) => {
                    pointers.push(0);
                    bytes.push(b);
                }
                None => {
                    return Err(BackendError::new(Status::INVALID_KERNEL_ARGS, format!("argument {} is not set", slot)))
                }
            }
        }
        let mut params: Vec<*mut c_void> = instance
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| match arg {
                Some(ArgValue::Mem(_)) => &mut pointers[i] as *mut u64 as *mut c_void,
                _ => bytes[i].as_ptr() as *mut c_void,
            })
            .collect();

        let groups = range.groups();
        let config = LaunchConfig {
            grid_dim: (groups[0] as u32, groups[1] as u32, 1),
            block_dim: (range.local[0] as u32, range.local[1] as u32, 1),
            shared_mem_bytes: 0,
        };
        // SAFETY: every parameter slot was bound and points at storage that
        // outlives the launch call; the driver copies parameters at enqueue.
        unsafe { instance.func.clone().launch(config, &mut params[..]) }.map_err(|e| driver_error(e, "launch"))
    }

    fn create_buffer(&mut self, flags: MemFlags, size: usize, init: Option<&[u8]>) -> BackendResult<MemHandle> {
        if size == 0 {
            return Err(BackendError::new(Status::INVALID_BUFFER_SIZE, "zero-sized buffer"));
        }
        if flags.copy_host && init.is_none() {
            return Err(BackendError::new(Status::INVALID_HOST_PTR, "copy-host without host data"));
        }
        self.alloc(size, init, None)
    }

    fn create_shared_texture_2d(&mut self, _flags: MemFlags, texture: u32) -> BackendResult<MemHandle> {
        Err(BackendError::new(
            Status::INVALID_OPERATION,
            format!("cannot share texture {}: no graphics interop", texture),
        ))
    }

    fn create_image_3d(&mut self, _flags: MemFlags, dims: [usize; 3], init: Option<&[u8]>) -> BackendResult<MemHandle> {
        let size = dims.iter().product::<usize>() * 4;
        if size == 0 {
            return Err(BackendError::new(Status::INVALID_IMAGE_SIZE, format!("image dims {:?}", dims)));
        }
        self.alloc(size, init, Some(dims))
    }

    fn release_mem(&mut self, mem: MemHandle) -> BackendResult<()> {
        self.mems
            .remove(&mem.0)
            .map(drop)
            .ok_or_else(|| BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", mem.0)))
    }

    fn write_buffer(&mut self, mem: MemHandle, _blocking: bool, data: &[u8]) -> BackendResult<()> {
        self.flush()?;
        self.upload(mem, data)
    }

    fn read_buffer(&mut self, mem: MemHandle, _blocking: bool, out: &mut [u8]) -> BackendResult<()> {
        self.flush()?;
        let len = self.mem(mem)?.data.len();
        if out.len() > len {
            return Err(BackendError::new(Status::INVALID_VALUE, format!("{} bytes from a {} byte object", out.len(), len)));
        }
        let host = self.download(mem, out.len())?;
        out.copy_from_slice(&host);
        Ok(())
    }

    fn copy_buffer(&mut self, src: MemHandle, dst: MemHandle, size: usize) -> BackendResult<()> {
        self.flush()?;
        let device = self.device()?.clone();
        if size > self.mem(src)?.data.len() || size > self.mem(dst)?.data.len() {
            return Err(BackendError::new(Status::INVALID_VALUE, format!("copy of {} bytes exceeds an object", size)));
        }
        if src == dst {
            return Ok(());
        }

        let mut target = self.mems.remove(&dst.0).ok_or_else(|| {
            BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", dst.0))
        })?;
        let result = match self.mems.get(&src.0) {
            Some(source) => device
                .dtod_copy(&source.data.slice(0..size), &mut target.data.slice_mut(0..size))
                .map_err(|e| driver_error(e, "device copy")),
            None => Err(BackendError::new(Status::INVALID_MEM_OBJECT, format!("unknown memory object {}", src.0))),
        };
        self.mems.insert(dst.0, target);
        result
    }

    fn copy_image(&mut self, src: MemHandle, dst: MemHandle, region: [usize; 3]) -> BackendResult<()> {
        self.flush()?;
        let src_dims = self.image_dims(src)?;
        let dst_dims = self.image_dims(dst)?;
        if !region_fits(region, src_dims) || !region_fits(region, dst_dims) {
            return Err(BackendError::new(Status::INVALID_VALUE, format!("region {:?} exceeds an image", region)));
        }

        let source = self.download(src, self.mem(src)?.data.len())?;
        let mut target = self.download(dst, self.mem(dst)?.data.len())?;
        copy_region(&source, src_dims, &mut target, dst_dims, region);
        self.upload(dst, &target)
    }

    fn write_image(&mut self, mem: MemHandle, _blocking: bool, region: [usize; 3], data: &[u8]) -> BackendResult<()> {
        self.flush()?;
        let dims = self.image_dims(mem)?;
        if !region_fits(region, dims) || data.len() != region.iter().product::<usize>() * 4 {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("{} bytes for region {:?} of image {:?}", data.len(), region, dims),
            ));
        }

        let mut target = self.download(mem, self.mem(mem)?.data.len())?;
        copy_region(data, region, &mut target, dims, region);
        self.upload(mem, &target)
    }

    fn fill_buffer(&mut self, mem: MemHandle, pattern: &[u8], size: usize) -> BackendResult<()> {
        self.flush()?;
        let len = self.mem(mem)?.data.len();
        if pattern.is_empty() || size % pattern.len() != 0 || size > len {
            return Err(BackendError::new(
                Status::INVALID_VALUE,
                format!("fill of {} bytes with {} byte pattern into {} bytes", size, pattern.len(), len),
            ));
        }
        let expanded = pattern.repeat(size / pattern.len());
        self.upload(mem, &expanded)
    }

    fn acquire_shared(&mut self, mem: MemHandle) -> BackendResult<()> {
        self.mem(mem)?;
        Err(BackendError::new(Status::INVALID_GL_OBJECT, "not a shared graphics object"))
    }

    fn release_shared(&mut self, mem: MemHandle) -> BackendResult<()> {
        self.mem(mem)?;
        Err(BackendError::new(Status::INVALID_GL_OBJECT, "not a shared graphics object"))
    }

    fn live_mem_objects(&self) -> usize {
        self.mems.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvrtc_options() {
        let options = nvrtc_options("-I ./kernels/ -I/opt/inc --use_fast_math");
        assert_eq!(options.include_paths, vec!["./kernels/", "/opt/inc"]);
        assert_eq!(options.options, vec!["--use_fast_math"]);
    }

    #[test]
    fn test_copy_region_is_origin_anchored() {
        let src: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let mut dst = vec![0.0f32; 8];
        copy_region(
            bytemuck::cast_slice(&src),
            [2, 2, 2],
            bytemuck::cast_slice_mut(&mut dst),
            [2, 2, 2],
            [1, 2, 1],
        );
        assert_eq!(dst, vec![0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_largest_launchable_steps_by_warp() {
        let mut tried = Vec::new();
        let size = largest_launchable(1024, 32, |size| {
            tried.push(size);
            Ok(size <= 384)
        })
        .unwrap();
        assert_eq!(size, 384);
        assert!(tried.iter().all(|s| s % 32 == 0));

        assert_eq!(largest_launchable(100, 32, |size| Ok(size <= 64)).unwrap(), 64);
        assert_eq!(largest_launchable(1024, 32, |_| Ok(true)).unwrap(), 1024);

        let err = largest_launchable(64, 32, |_| Ok(false)).unwrap_err();
        assert_eq!(err.status, Status::OUT_OF_RESOURCES);
    }

    #[test]
    fn test_entry_names_are_interned() {
        let mut backend = CudaBackend::new();
        let first = backend.entry_name("drawFloor");
        let again = backend.entry_name("drawFloor");
        let other = backend.entry_name("traceShadow");

        assert!(std::ptr::eq(first, again));
        assert_eq!(other, "traceShadow");
        assert_eq!(backend.entry_names.len(), 2);
    }
}
