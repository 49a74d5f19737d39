//! Device discovery and selection
//!
//! A scan partitions every device of every platform into two ordered lists,
//! general-purpose and accelerator. Each device receives a default launch
//! shape: one workgroup per compute unit, with a single work item per group
//! on general-purpose devices and the widest workgroup on accelerators.
//! Exactly one device is selected for the lifetime of the registry.

use crate::backend::{ComputeBackend, DeviceDesc};
use crate::timing::{self, ProfileScope};
use crate::{ComputeError, Result};
use lumen_profiler::SharedProfiler;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

/// Device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// CPU-like devices: few wide cores
    GeneralPurpose,
    /// GPU-like devices: many narrow lanes
    Accelerator,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::GeneralPurpose => write!(f, "general-purpose"),
            DeviceClass::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// An enumerated device with its tunable default launch shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    desc: DeviceDesc,
    optimum_workgroups: usize,
    optimum_workgroup_size: usize,
}

impl Device {
    /// Apply the default launch-shape policy to a driver description
    pub fn from_desc(desc: DeviceDesc) -> Self {
        let optimum_workgroups = desc.compute_units.max(1) as usize;
        let optimum_workgroup_size = match desc.class {
            DeviceClass::GeneralPurpose => 1,
            DeviceClass::Accelerator => desc.max_workgroup_size.max(1),
        };

        Self {
            desc,
            optimum_workgroups,
            optimum_workgroup_size,
        }
    }

    /// Driver description
    pub fn desc(&self) -> &DeviceDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn vendor(&self) -> &str {
        &self.desc.vendor
    }

    pub fn platform(&self) -> &str {
        &self.desc.platform_name
    }

    pub fn class(&self) -> DeviceClass {
        self.desc.class
    }

    pub fn compute_units(&self) -> u32 {
        self.desc.compute_units
    }

    pub fn max_workgroup_size(&self) -> usize {
        self.desc.max_workgroup_size
    }

    /// Default number of workgroups per launch
    pub fn optimum_workgroups(&self) -> usize {
        self.optimum_workgroups
    }

    /// Default work items per workgroup
    pub fn optimum_workgroup_size(&self) -> usize {
        self.optimum_workgroup_size
    }

    /// Stable identity of this device for binary cache validation
    pub fn fingerprint(&self, backend: &str) -> u64 {
        let identity = format!(
            "{}\0{}\0{}\0{}\0{}",
            backend, self.desc.platform_name, self.desc.name, self.desc.vendor, self.desc.class
        );
        xxh3_64(identity.as_bytes())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] ({} CUs, max workgroup {}, optimum {}x{})",
            self.desc.name,
            self.desc.vendor,
            self.desc.compute_units,
            self.desc.max_workgroup_size,
            self.optimum_workgroups,
            self.optimum_workgroup_size
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Selection {
    class: DeviceClass,
    index: usize,
    interop: bool,
}

/// Enumerated devices and the one selected for this process
pub struct DeviceRegistry {
    general: Vec<Device>,
    accelerators: Vec<Device>,
    selection: Option<Selection>,
    profiler: SharedProfiler,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new(profiler: SharedProfiler) -> Self {
        Self {
            general: Vec::new(),
            accelerators: Vec::new(),
            selection: None,
            profiler,
        }
    }

    /// Enumerate all devices of all platforms.
    ///
    /// Replaces any previous scan. Fails if there are no platforms or any
    /// enumeration call errors; on failure the previous lists are kept.
    pub fn scan(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        if let Some(device) = self.selected_device() {
            return Err(ComputeError::AlreadyInitialized {
                device: device.name().to_string(),
            });
        }

        let platforms = backend.platforms().map_err(ComputeError::DeviceEnumeration)?;
        if platforms.is_empty() {
            return Err(ComputeError::DeviceEnumeration(crate::backend::BackendError::new(
                crate::backend::Status::PLATFORM_NOT_FOUND,
                "no compute platforms found",
            )));
        }

        let mut general = Vec::new();
        let mut accelerators = Vec::new();
        for class in [DeviceClass::GeneralPurpose, DeviceClass::Accelerator] {
            for platform in &platforms {
                let found = backend
                    .devices(platform, class)
                    .map_err(ComputeError::DeviceEnumeration)?;
                debug!("Platform '{}': {} {} device(s)", platform.name, found.len(), class);

                let target = match class {
                    DeviceClass::GeneralPurpose => &mut general,
                    DeviceClass::Accelerator => &mut accelerators,
                };
                target.extend(found.into_iter().map(Device::from_desc));
            }
        }

        info!(
            "Found {} platform(s): {} general-purpose, {} accelerator device(s)",
            platforms.len(),
            general.len(),
            accelerators.len()
        );

        self.general = general;
        self.accelerators = accelerators;
        Ok(())
    }

    /// Devices of one class in enumeration order
    pub fn devices(&self, class: DeviceClass) -> &[Device] {
        match class {
            DeviceClass::GeneralPurpose => &self.general,
            DeviceClass::Accelerator => &self.accelerators,
        }
    }

    /// Log every device of one class
    pub fn log_devices(&self, class: DeviceClass) {
        let devices = self.devices(class);
        info!("There are {} {} device(s):", devices.len(), class);
        for (i, device) in devices.iter().enumerate() {
            info!("  Device {}: {}", i, device.name());
            info!("    - Platform:               {}", device.platform());
            info!("    - Vendor:                 {}", device.vendor());
            info!("    - Compute units:          {}", device.compute_units());
            info!("    - Max workgroup size:     {}", device.max_workgroup_size());
            info!("    - Optimum workgroups:     {}", device.optimum_workgroups());
            info!("    - Optimum workgroup size: {}", device.optimum_workgroup_size());
        }
    }

    /// Select a device and create its context and command queue.
    ///
    /// The index is validated before anything else, so an out-of-range index
    /// leaves the registry exactly as it was. Selection happens once.
    pub fn select(
        &mut self,
        backend: &mut dyn ComputeBackend,
        class: DeviceClass,
        index: usize,
        interop: bool,
    ) -> Result<&Device> {
        let count = self.devices(class).len();
        if index >= count {
            return Err(ComputeError::InvalidDeviceIndex { class, index, count });
        }
        if let Some(device) = self.selected_device() {
            return Err(ComputeError::AlreadyInitialized {
                device: device.name().to_string(),
            });
        }

        let desc = self.devices(class)[index].desc.clone();

        timing::profiled(&self.profiler, &ProfileScope::single("context_create"), || {
            backend.create_context(&desc, interop)
        })
        .map_err(|source| ComputeError::ContextCreation {
            device: desc.name.clone(),
            source,
        })?;

        timing::profiled(&self.profiler, &ProfileScope::single("queue_create"), || {
            backend.create_queue()
        })
        .map_err(|source| ComputeError::QueueCreation {
            device: desc.name.clone(),
            source,
        })?;

        let interop = interop && backend.interop_active();
        self.selection = Some(Selection { class, index, interop });

        info!(
            "Selected {} device {}: {} (interop: {})",
            class,
            index,
            desc.name,
            if interop { "on" } else { "off" }
        );

        self.selected_device()
            .ok_or(ComputeError::UninitializedDevice { operation: "select" })
    }

    /// Whether a device has been selected
    pub fn is_initialized(&self) -> bool {
        self.selection.is_some()
    }

    /// Whether the context was created with working graphics interop
    pub fn interop_enabled(&self) -> bool {
        self.selection.map(|s| s.interop).unwrap_or(false)
    }

    /// Class and index of the selected device
    pub fn selected_index(&self) -> Option<(DeviceClass, usize)> {
        self.selection.map(|s| (s.class, s.index))
    }

    /// The selected device, if any
    pub fn selected_device(&self) -> Option<&Device> {
        let s = self.selection?;
        self.devices(s.class).get(s.index)
    }

    /// The selected device, or an error naming the operation that needed it
    pub fn require(&self, operation: &'static str) -> Result<&Device> {
        self.selected_device()
            .ok_or(ComputeError::UninitializedDevice { operation })
    }

    /// Override the selected device's default workgroup count
    pub fn set_optimum_workgroups(&mut self, workgroups: usize) -> Result<()> {
        let device = self.selected_mut("set_optimum_workgroups")?;
        device.optimum_workgroups = workgroups.max(1);
        Ok(())
    }

    /// Override the selected device's default workgroup size, clamped to its maximum
    pub fn set_optimum_workgroup_size(&mut self, size: usize) -> Result<()> {
        let device = self.selected_mut("set_optimum_workgroup_size")?;
        device.optimum_workgroup_size = size.clamp(1, device.desc.max_workgroup_size.max(1));
        Ok(())
    }

    fn selected_mut(&mut self, operation: &'static str) -> Result<&mut Device> {
        let s = self
            .selection
            .ok_or(ComputeError::UninitializedDevice { operation })?;
        let devices = match s.class {
            DeviceClass::GeneralPurpose => &mut self.general,
            DeviceClass::Accelerator => &mut self.accelerators,
        };
        devices
            .get_mut(s.index)
            .ok_or(ComputeError::UninitializedDevice { operation })
    }
}
