//! Manager configuration

use crate::capability::ProbeConfig;
use crate::device::DeviceClass;
use crate::program::{KernelRegistration, ProgramCacheConfig, FILL_KERNEL_ENTRY};
use crate::{ComputeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_class() -> DeviceClass {
    DeviceClass::Accelerator
}

/// Which device to select at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    /// Device class to pick from
    #[serde(default = "default_class")]
    pub class: DeviceClass,
    /// Index within that class
    #[serde(default)]
    pub index: usize,
    /// Create the context with graphics interop
    #[serde(default)]
    pub interop: bool,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self {
            class: default_class(),
            index: 0,
            interop: false,
        }
    }
}

fn default_fill_kernel() -> String {
    FILL_KERNEL_ENTRY.into()
}

/// Manager configuration
///
/// Every field has a default, so an empty JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Program locations and build policy
    #[serde(flatten)]
    pub cache: ProgramCacheConfig,
    /// Device picked by `initialize`
    #[serde(default)]
    pub device: DeviceSelection,
    /// Capability probe scratch buffer
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Logical id of the fill fallback kernel
    #[serde(default = "default_fill_kernel")]
    pub fill_kernel: String,
    /// Registrations applied when the manager is created
    #[serde(default)]
    pub programs: Vec<KernelRegistration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache: ProgramCacheConfig::default(),
            device: DeviceSelection::default(),
            probe: ProbeConfig::default(),
            fill_kernel: default_fill_kernel(),
            programs: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ComputeError::Config(e.to_string()))
    }

    /// Load a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| ComputeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json).map_err(|e| match e {
            ComputeError::Config(msg) => ComputeError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Pretty JSON, as written by `lumen config`
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ComputeError::Config(e.to_string()))
    }
}
