//! Compute device resource manager
//!
//! Selects a compute device, builds and caches kernel programs, owns named
//! device memory objects and dispatches kernels with per-kernel tuned launch
//! shapes. Textures shared with a renderer are bracketed by explicit
//! acquire/release calls.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        ComputeManager                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  scan ──> DeviceRegistry ──> select ──> capability probe       │
//! │                                  │                             │
//! │                                  ↓                             │
//! │  register ──> ProgramCache ──> load_all (source or .bin)       │
//! │                                  │                             │
//! │  allocate ──> ResourceTable      │  best / selected shapes     │
//! │                    │             ↓                             │
//! │                    └──────> KernelDispatcher ──> launch        │
//! │                                                                │
//! │  InteropGate: acquire ── compute on shared textures ── release │
//! │                                                                │
//! │  every device call: flush ── timer start ── op ── timer stop   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use lumen_compute::{ComputeManager, DeviceClass, HostBackend, ManagerConfig};
//!
//! let mut config = ManagerConfig::default();
//! config.device.class = DeviceClass::GeneralPurpose;
//!
//! let mut manager = ComputeManager::new(HostBackend::new(), config).unwrap();
//! manager.initialize().unwrap();
//!
//! manager.allocate_buffer_rw("weights", 64 * 4, None).unwrap();
//! manager.fill_float("weights", 0.5, 64).unwrap();
//! assert_eq!(manager.read_floats("weights", 2).unwrap(), vec![0.5, 0.5]);
//! ```

pub mod backend;
pub mod capability;
pub mod config;
pub mod device;
pub mod dispatch;
mod error;
pub mod interop;
mod manager;
pub mod program;
pub mod resource;
pub(crate) mod timing;

pub use backend::host::{
    GraphicsTextures, HostBackend, HostBackendConfig, HostDeviceConfig, HostKernel, HostPlatformConfig,
    KernelContext,
};
#[cfg(feature = "cuda")]
pub use backend::cuda::CudaBackend;
pub use backend::{BackendError, ComputeBackend, MemAccess, MemFlags, Status};
pub use capability::{Capabilities, ProbeConfig};
pub use config::{DeviceSelection, ManagerConfig};
pub use device::{Device, DeviceClass, DeviceRegistry};
pub use dispatch::{LaunchShape, TileCounts};
pub use error::{ComputeError, Result};
pub use manager::ComputeManager;
pub use program::{BuildConfig, Kernel, KernelInfo, KernelRegistration, KernelTree, ProgramCacheConfig};
pub use resource::{Resource, ResourceKind};
