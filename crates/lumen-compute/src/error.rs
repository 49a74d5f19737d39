//! Error types for device management operations.

use crate::backend::{BackendError, Status};
use crate::device::DeviceClass;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for device management operations.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Errors surfaced by the compute manager.
///
/// No variant is retried internally. Each one names the entity that failed
/// and, where a driver call was involved, carries its [`BackendError`].
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Platform or device enumeration failed.
    #[error("device enumeration failed: {0}")]
    DeviceEnumeration(#[source] BackendError),

    /// Requested device index is out of range for its class.
    #[error("{class} device with index {index} does not exist ({count} available)")]
    InvalidDeviceIndex {
        class: DeviceClass,
        index: usize,
        count: usize,
    },

    /// Device selection was attempted a second time.
    #[error("device '{device}' is already selected")]
    AlreadyInitialized { device: String },

    /// Execution context creation failed.
    #[error("unable to create context on device '{device}': {source}")]
    ContextCreation {
        device: String,
        #[source]
        source: BackendError,
    },

    /// Command queue creation failed.
    #[error("unable to create command queue on device '{device}': {source}")]
    QueueCreation {
        device: String,
        #[source]
        source: BackendError,
    },

    /// Program source could not be opened.
    #[error("unable to open program source '{path}': {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Program object could not be created from source.
    #[error("unable to create program from source '{path}': {source}")]
    SourceCompile {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    /// Program build failed; `log` holds the full compiler output.
    #[error("unable to build program '{path}': {source}\n{log}")]
    Build {
        path: PathBuf,
        log: String,
        #[source]
        source: BackendError,
    },

    /// Program object could not be created from a cached binary.
    #[error("unable to load program binary '{path}': {source}")]
    BinaryLoad {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    /// Kernel creation or limit query failed.
    #[error("unable to create kernel '{kernel}' (entry '{entry}'): {source}")]
    KernelCreation {
        kernel: String,
        entry: String,
        #[source]
        source: BackendError,
    },

    /// Logical kernel id registered twice.
    #[error("kernel id '{0}' is already registered")]
    DuplicateKernel(String),

    /// No kernel loaded under this id.
    #[error("kernel '{0}' is not loaded")]
    KernelNotFound(String),

    /// Binding an argument failed.
    #[error("unable to set argument {slot} for kernel '{kernel}': {source}")]
    ArgumentBind {
        kernel: String,
        slot: u32,
        #[source]
        source: BackendError,
    },

    /// Memory object creation failed.
    #[error("unable to allocate '{name}': {source}")]
    Allocation {
        name: String,
        #[source]
        source: BackendError,
    },

    /// Graphics interop was not enabled on the context or is not supported by the device.
    #[error("unable to share graphics texture as '{name}': interop unavailable: {source}")]
    InteropUnavailable {
        name: String,
        #[source]
        source: BackendError,
    },

    /// Freeing a memory object failed.
    #[error("unable to deallocate '{name}': {source}")]
    Deallocation {
        name: String,
        #[source]
        source: BackendError,
    },

    /// No memory object registered under this name.
    #[error("no buffer or image named '{0}'")]
    ResourceNotFound(String),

    /// A host/device or device/device transfer failed.
    #[error("unable to {op} '{src}' to '{dst}': {source}")]
    Transfer {
        op: &'static str,
        src: String,
        dst: String,
        #[source]
        source: BackendError,
    },

    /// Neither an atomic fill nor the fill kernel is available.
    #[error("unable to fill '{name}': atomic fill unsupported and kernel '{kernel}' not loaded")]
    FillUnavailable { name: String, kernel: String },

    /// Kernel launch failed.
    #[error("unable to run kernel '{kernel}': {source}")]
    Launch {
        kernel: String,
        #[source]
        source: BackendError,
    },

    /// Requested launch shape violates the kernel's limits.
    #[error("invalid launch shape {workgroups}x{workgroup_size} for kernel '{kernel}' (max workgroup size {max})")]
    InvalidLaunchShape {
        kernel: String,
        workgroups: usize,
        workgroup_size: usize,
        max: usize,
    },

    /// Acquiring a shared object for compute failed.
    #[error("unable to acquire shared object '{name}': {source}")]
    InteropAcquire {
        name: String,
        #[source]
        source: BackendError,
    },

    /// Returning a shared object to the graphics side failed.
    #[error("unable to release shared object '{name}': {source}")]
    InteropRelease {
        name: String,
        #[source]
        source: BackendError,
    },

    /// Operation requires a selected device.
    #[error("{operation} requires an initialized device")]
    UninitializedDevice { operation: &'static str },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComputeError {
    /// Driver status code, if a driver call produced this error.
    pub fn status(&self) -> Option<Status> {
        self.backend_error().map(|e| e.status)
    }

    /// Full build log for build failures.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            ComputeError::Build { log, .. } => Some(log),
            _ => self.backend_error().and_then(|e| e.log.as_deref()),
        }
    }

    /// Check if the failure came from the device driver.
    pub fn is_device_error(&self) -> bool {
        self.backend_error().is_some()
    }

    fn backend_error(&self) -> Option<&BackendError> {
        match self {
            ComputeError::DeviceEnumeration(source)
            | ComputeError::ContextCreation { source, .. }
            | ComputeError::QueueCreation { source, .. }
            | ComputeError::SourceCompile { source, .. }
            | ComputeError::Build { source, .. }
            | ComputeError::BinaryLoad { source, .. }
            | ComputeError::KernelCreation { source, .. }
            | ComputeError::ArgumentBind { source, .. }
            | ComputeError::Allocation { source, .. }
            | ComputeError::InteropUnavailable { source, .. }
            | ComputeError::Deallocation { source, .. }
            | ComputeError::Transfer { source, .. }
            | ComputeError::Launch { source, .. }
            | ComputeError::InteropAcquire { source, .. }
            | ComputeError::InteropRelease { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_entity_and_status() {
        let err = ComputeError::Launch {
            kernel: "drawFloor".into(),
            source: BackendError::new(Status::INVALID_WORK_GROUP_SIZE, "local size exceeds kernel limit"),
        };
        let msg = err.to_string();

        assert!(msg.contains("drawFloor"));
        assert!(msg.contains("-54"));
        assert_eq!(err.status(), Some(Status::INVALID_WORK_GROUP_SIZE));
        assert!(err.is_device_error());
    }

    #[test]
    fn test_build_log_is_carried() {
        let err = ComputeError::Build {
            path: PathBuf::from("kernels/geometry.cl"),
            log: "error: expected ';'".into(),
            source: BackendError::new(Status::BUILD_PROGRAM_FAILURE, "build failed"),
        };

        assert_eq!(err.build_log(), Some("error: expected ';'"));
        assert!(err.to_string().contains("expected ';'"));
    }

    #[test]
    fn test_invalid_index_message() {
        let err = ComputeError::InvalidDeviceIndex {
            class: DeviceClass::Accelerator,
            index: 2,
            count: 2,
        };

        assert_eq!(err.to_string(), "accelerator device with index 2 does not exist (2 available)");
        assert!(!err.is_device_error());
        assert_eq!(err.status(), None);
    }
}
