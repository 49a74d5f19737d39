//! Device backend seam
//!
//! Everything the manager needs from a compute driver goes through
//! [`ComputeBackend`]. Handles are opaque integers owned by the backend; the
//! manager never holds a raw device object, only names mapped to handles.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ComputeManager                       │
//! │  DeviceRegistry  ProgramCache  ResourceTable  Dispatcher │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ &mut dyn ComputeBackend
//!              ┌──────────────┴──────────────┐
//!              │                             │
//!       ┌──────┴──────┐               ┌──────┴──────┐
//!       │ HostBackend │               │ CudaBackend │
//!       │  (software) │               │  (cudarc)   │
//!       └─────────────┘               └─────────────┘
//! ```

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::device::DeviceClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device status code as reported by the driver. Negative values are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const DEVICE_NOT_FOUND: Status = Status(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Status = Status(-4);
    pub const OUT_OF_RESOURCES: Status = Status(-5);
    pub const BUILD_PROGRAM_FAILURE: Status = Status(-11);
    pub const INVALID_VALUE: Status = Status(-30);
    pub const INVALID_PLATFORM: Status = Status(-32);
    pub const INVALID_DEVICE: Status = Status(-33);
    pub const INVALID_CONTEXT: Status = Status(-34);
    pub const INVALID_COMMAND_QUEUE: Status = Status(-36);
    pub const INVALID_HOST_PTR: Status = Status(-37);
    pub const INVALID_MEM_OBJECT: Status = Status(-38);
    pub const INVALID_IMAGE_SIZE: Status = Status(-40);
    pub const INVALID_BINARY: Status = Status(-42);
    pub const INVALID_BUILD_OPTIONS: Status = Status(-43);
    pub const INVALID_PROGRAM: Status = Status(-44);
    pub const INVALID_KERNEL_NAME: Status = Status(-46);
    pub const INVALID_KERNEL: Status = Status(-48);
    pub const INVALID_ARG_INDEX: Status = Status(-49);
    pub const INVALID_ARG_VALUE: Status = Status(-50);
    pub const INVALID_ARG_SIZE: Status = Status(-51);
    pub const INVALID_KERNEL_ARGS: Status = Status(-52);
    pub const INVALID_WORK_DIMENSION: Status = Status(-53);
    pub const INVALID_WORK_GROUP_SIZE: Status = Status(-54);
    pub const INVALID_OPERATION: Status = Status(-59);
    pub const INVALID_GL_OBJECT: Status = Status(-60);
    pub const INVALID_BUFFER_SIZE: Status = Status(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Status = Status(-63);
    pub const PLATFORM_NOT_FOUND: Status = Status(-1001);
    /// A kernel body reported a failure while executing
    pub const KERNEL_EXECUTION_FAILED: Status = Status(-9001);

    /// Symbolic name for well-known codes
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Status::SUCCESS => "SUCCESS",
            Status::DEVICE_NOT_FOUND => "DEVICE_NOT_FOUND",
            Status::MEM_OBJECT_ALLOCATION_FAILURE => "MEM_OBJECT_ALLOCATION_FAILURE",
            Status::OUT_OF_RESOURCES => "OUT_OF_RESOURCES",
            Status::BUILD_PROGRAM_FAILURE => "BUILD_PROGRAM_FAILURE",
            Status::INVALID_VALUE => "INVALID_VALUE",
            Status::INVALID_PLATFORM => "INVALID_PLATFORM",
            Status::INVALID_DEVICE => "INVALID_DEVICE",
            Status::INVALID_CONTEXT => "INVALID_CONTEXT",
            Status::INVALID_COMMAND_QUEUE => "INVALID_COMMAND_QUEUE",
            Status::INVALID_HOST_PTR => "INVALID_HOST_PTR",
            Status::INVALID_MEM_OBJECT => "INVALID_MEM_OBJECT",
            Status::INVALID_IMAGE_SIZE => "INVALID_IMAGE_SIZE",
            Status::INVALID_BINARY => "INVALID_BINARY",
            Status::INVALID_BUILD_OPTIONS => "INVALID_BUILD_OPTIONS",
            Status::INVALID_PROGRAM => "INVALID_PROGRAM",
            Status::INVALID_KERNEL_NAME => "INVALID_KERNEL_NAME",
            Status::INVALID_KERNEL => "INVALID_KERNEL",
            Status::INVALID_ARG_INDEX => "INVALID_ARG_INDEX",
            Status::INVALID_ARG_VALUE => "INVALID_ARG_VALUE",
            Status::INVALID_ARG_SIZE => "INVALID_ARG_SIZE",
            Status::INVALID_KERNEL_ARGS => "INVALID_KERNEL_ARGS",
            Status::INVALID_WORK_DIMENSION => "INVALID_WORK_DIMENSION",
            Status::INVALID_WORK_GROUP_SIZE => "INVALID_WORK_GROUP_SIZE",
            Status::INVALID_OPERATION => "INVALID_OPERATION",
            Status::INVALID_GL_OBJECT => "INVALID_GL_OBJECT",
            Status::INVALID_BUFFER_SIZE => "INVALID_BUFFER_SIZE",
            Status::INVALID_GLOBAL_WORK_SIZE => "INVALID_GLOBAL_WORK_SIZE",
            Status::PLATFORM_NOT_FOUND => "PLATFORM_NOT_FOUND",
            Status::KERNEL_EXECUTION_FAILED => "KERNEL_EXECUTION_FAILED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} {}", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Failure reported by a backend call
#[derive(Debug, Clone, Error)]
#[error("{message} (status {status})")]
pub struct BackendError {
    /// Driver status code
    pub status: Status,
    /// Human readable description
    pub message: String,
    /// Compiler output, for build failures
    pub log: Option<String>,
}

impl BackendError {
    /// Create an error without a build log
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            log: None,
        }
    }

    /// Attach a build log
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Result type for backend calls
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A driver platform (vendor installation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDesc {
    /// Backend-local platform index
    pub index: usize,
    /// Platform name
    pub name: String,
    /// Platform vendor
    pub vendor: String,
}

/// A device as reported by the driver, before any tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDesc {
    /// Owning platform index
    pub platform: usize,
    /// Owning platform name
    pub platform_name: String,
    /// Backend-local device ordinal
    pub ordinal: usize,
    /// Device name
    pub name: String,
    /// Device vendor
    pub vendor: String,
    /// Device class
    pub class: DeviceClass,
    /// Parallel compute units
    pub compute_units: u32,
    /// Largest workgroup the device accepts
    pub max_workgroup_size: usize,
}

/// Opaque memory object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(pub u64);

/// Opaque program handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u64);

/// Opaque kernel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle(pub u64);

/// Device-side access mode of a memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemAccess {
    /// Kernels only read
    ReadOnly,
    /// Kernels only write
    WriteOnly,
    /// Kernels read and write
    ReadWrite,
}

/// Memory object creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemFlags {
    /// Device access mode
    pub access: MemAccess,
    /// Initialize from host data at creation
    pub copy_host: bool,
}

impl MemFlags {
    pub const READ_ONLY: MemFlags = MemFlags::new(MemAccess::ReadOnly);
    pub const WRITE_ONLY: MemFlags = MemFlags::new(MemAccess::WriteOnly);
    pub const READ_WRITE: MemFlags = MemFlags::new(MemAccess::ReadWrite);

    /// Flags for `access` without host initialization
    pub const fn new(access: MemAccess) -> Self {
        Self {
            access,
            copy_host: false,
        }
    }

    /// Same access, initialized from host data
    pub const fn copy_host(mut self) -> Self {
        self.copy_host = true;
        self
    }

    /// Decode the classic bit layout: read = 1, write = 2, copy-host = 4.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let access = match bits & 0b11 {
            1 => MemAccess::ReadOnly,
            2 => MemAccess::WriteOnly,
            3 => MemAccess::ReadWrite,
            _ => return None,
        };
        Some(Self {
            access,
            copy_host: bits & 0b100 != 0,
        })
    }

    /// Encode to the classic bit layout
    pub fn bits(&self) -> u32 {
        let access = match self.access {
            MemAccess::ReadOnly => 1,
            MemAccess::WriteOnly => 2,
            MemAccess::ReadWrite => 3,
        };
        access | if self.copy_host { 4 } else { 0 }
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        MemFlags::READ_WRITE
    }
}

/// Per-kernel limits queried after kernel creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelLimits {
    /// Largest workgroup this kernel can launch with
    pub max_workgroup_size: usize,
    /// Preferred workgroup size granularity
    pub preferred_multiple: usize,
    /// Local memory footprint (bytes)
    pub local_mem_bytes: u64,
    /// Private memory footprint per work item (bytes)
    pub private_mem_bytes: u64,
}

/// A kernel argument value
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// A memory object
    Mem(MemHandle),
    /// Raw scalar bytes
    Bytes(&'a [u8]),
}

/// Launch geometry, one or two dimensional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    /// Number of used dimensions (1 or 2)
    pub dims: usize,
    /// Global work size per dimension
    pub global: [usize; 2],
    /// Local (workgroup) size per dimension
    pub local: [usize; 2],
}

impl NdRange {
    /// One-dimensional range
    pub fn linear(global: usize, local: usize) -> Self {
        Self {
            dims: 1,
            global: [global, 1],
            local: [local, 1],
        }
    }

    /// Two-dimensional range
    pub fn planar(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            dims: 2,
            global,
            local,
        }
    }

    /// Total work items
    pub fn total_items(&self) -> usize {
        self.global[0] * self.global[1]
    }

    /// Work items per workgroup
    pub fn group_items(&self) -> usize {
        self.local[0] * self.local[1]
    }

    /// Workgroups per dimension (ceiling division)
    pub fn groups(&self) -> [usize; 2] {
        [
            self.global[0].div_ceil(self.local[0].max(1)),
            self.global[1].div_ceil(self.local[1].max(1)),
        ]
    }
}

/// Driver operations used by the manager.
///
/// Calls are issued from a single thread in program order. Backends may
/// complete enqueued work lazily; `finish` must not return before all of it
/// has completed.
pub trait ComputeBackend: Send {
    /// Short backend identifier, part of the binary cache fingerprint
    fn name(&self) -> &str;

    /// Enumerate platforms
    fn platforms(&mut self) -> BackendResult<Vec<PlatformDesc>>;

    /// Enumerate a platform's devices of one class. A class with no devices is empty, not an error.
    fn devices(&mut self, platform: &PlatformDesc, class: DeviceClass) -> BackendResult<Vec<DeviceDesc>>;

    /// Create the execution context, with graphics interop if requested
    fn create_context(&mut self, device: &DeviceDesc, interop: bool) -> BackendResult<()>;

    /// Create the command queue on the current context
    fn create_queue(&mut self) -> BackendResult<()>;

    /// Whether the current context can alias graphics textures
    fn interop_active(&self) -> bool;

    /// Submit queued work
    fn flush(&mut self) -> BackendResult<()>;

    /// Block until queued work completes
    fn finish(&mut self) -> BackendResult<()>;

    /// Create a program object from source text
    fn program_from_source(&mut self, source: &str) -> BackendResult<ProgramHandle>;

    /// Create a program object from a device binary
    fn program_from_binary(&mut self, binary: &[u8]) -> BackendResult<ProgramHandle>;

    /// Build a program for the selected device. Returns the build log.
    fn build_program(&mut self, program: ProgramHandle, options: &str) -> BackendResult<String>;

    /// Device binaries of a built program, one per device it targets
    fn program_binaries(&mut self, program: ProgramHandle) -> BackendResult<Vec<Vec<u8>>>;

    /// Create a kernel for an entry point of a built program
    fn create_kernel(&mut self, program: ProgramHandle, entry: &str) -> BackendResult<KernelHandle>;

    /// Query launch limits and memory footprint of a kernel
    fn kernel_limits(&mut self, kernel: KernelHandle) -> BackendResult<KernelLimits>;

    /// Bind one argument slot
    fn set_kernel_arg(&mut self, kernel: KernelHandle, slot: u32, arg: KernelArg<'_>) -> BackendResult<()>;

    /// Enqueue a kernel launch
    fn enqueue_kernel(&mut self, kernel: KernelHandle, range: &NdRange) -> BackendResult<()>;

    /// Create a linear buffer
    fn create_buffer(&mut self, flags: MemFlags, size: usize, init: Option<&[u8]>) -> BackendResult<MemHandle>;

    /// Alias an existing 2-D graphics texture
    fn create_shared_texture_2d(&mut self, flags: MemFlags, texture: u32) -> BackendResult<MemHandle>;

    /// Create a single-channel float 3-D image
    fn create_image_3d(&mut self, flags: MemFlags, dims: [usize; 3], init: Option<&[u8]>) -> BackendResult<MemHandle>;

    /// Free a memory object
    fn release_mem(&mut self, mem: MemHandle) -> BackendResult<()>;

    /// Host to device copy at offset 0
    fn write_buffer(&mut self, mem: MemHandle, blocking: bool, data: &[u8]) -> BackendResult<()>;

    /// Device to host copy from offset 0
    fn read_buffer(&mut self, mem: MemHandle, blocking: bool, out: &mut [u8]) -> BackendResult<()>;

    /// Device to device copy of `size` bytes
    fn copy_buffer(&mut self, src: MemHandle, dst: MemHandle, size: usize) -> BackendResult<()>;

    /// Copy an image region anchored at the origin
    fn copy_image(&mut self, src: MemHandle, dst: MemHandle, region: [usize; 3]) -> BackendResult<()>;

    /// Write an image region anchored at the origin; rows are tightly packed
    fn write_image(&mut self, mem: MemHandle, blocking: bool, region: [usize; 3], data: &[u8]) -> BackendResult<()>;

    /// Fill `size` bytes with a repeating pattern
    fn fill_buffer(&mut self, mem: MemHandle, pattern: &[u8], size: usize) -> BackendResult<()>;

    /// Take a shared object from the graphics side
    fn acquire_shared(&mut self, mem: MemHandle) -> BackendResult<()>;

    /// Return a shared object to the graphics side
    fn release_shared(&mut self, mem: MemHandle) -> BackendResult<()>;

    /// Number of memory objects currently alive
    fn live_mem_objects(&self) -> usize;
}
