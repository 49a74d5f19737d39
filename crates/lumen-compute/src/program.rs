//! Program registration, compilation and the device binary cache
//!
//! Registrations form a tree keyed by source file, kept in insertion order:
//! the order files are listed is the order they are built, and the order of
//! entry points within a file is the order their kernels are created.
//!
//! A compiled program is persisted next to its source as
//! `<source><suffix>`. The file is a small container:
//!
//! ```text
//! ┌──────────┬─────────┬──────────────────┬────────────────────┐
//! │ LUMENBIN │ version │ fingerprint (LE) │ device binary ...  │
//! │ 8 bytes  │ u32 LE  │ u64              │                    │
//! └──────────┴─────────┴──────────────────┴────────────────────┘
//! ```
//!
//! The fingerprint covers the backend, the device identity and the build
//! options. A container whose fingerprint does not match the current device
//! is stale and the program is rebuilt from source.

use crate::backend::{ComputeBackend, KernelHandle, KernelLimits, ProgramHandle};
use crate::device::Device;
use crate::dispatch::LaunchShape;
use crate::timing::{self, ProfileScope};
use crate::{ComputeError, Result};
use lumen_profiler::SharedProfiler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Source file of the built-in fill kernel, relative to the kernel path
pub const FILL_KERNEL_FILE: &str = "buffers/fill.cl";

/// Entry point of the built-in fill kernel: `(buffer, uint count, float value)`
pub const FILL_KERNEL_ENTRY: &str = "buffers_fill_float";

/// Sources used when the file is absent from the kernel path
const BUILTIN_SOURCES: &[(&str, &str)] = &[(FILL_KERNEL_FILE, include_str!("../kernels/buffers/fill.cl"))];

const BINARY_MAGIC: &[u8; 8] = b"LUMENBIN";
const BINARY_VERSION: u32 = 1;
const BINARY_HEADER_LEN: usize = 8 + 4 + 8;

/// One entry point of a registered program file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRegistration {
    /// Source file, relative to the kernel path
    pub file: String,
    /// Entry point name inside the source
    pub entry: String,
    /// Logical kernel id used by callers
    pub id: String,
}

/// An (entry point, logical id) pair within a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelEntry {
    pub entry: String,
    pub id: String,
}

/// Registered programs: file -> ordered entry points, in insertion order
#[derive(Debug, Clone, Default)]
pub struct KernelTree {
    files: Vec<(String, Vec<KernelEntry>)>,
}

impl KernelTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point. Logical ids are unique across all files.
    pub fn register(&mut self, file: impl Into<String>, entry: impl Into<String>, id: impl Into<String>) -> Result<()> {
        let (file, entry, id) = (file.into(), entry.into(), id.into());
        if self.contains(&id) {
            return Err(ComputeError::DuplicateKernel(id));
        }

        let entry = KernelEntry { entry, id };
        match self.files.iter_mut().find(|(f, _)| *f == file) {
            Some((_, entries)) => entries.push(entry),
            None => self.files.push((file, vec![entry])),
        }
        Ok(())
    }

    /// Whether a logical id is registered
    pub fn contains(&self, id: &str) -> bool {
        self.files
            .iter()
            .any(|(_, entries)| entries.iter().any(|e| e.id == id))
    }

    /// Source file that defines a logical id
    pub fn file_of(&self, id: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(_, entries)| entries.iter().any(|e| e.id == id))
            .map(|(file, _)| file.as_str())
    }

    /// Files and their entry points, in registration order
    pub fn files(&self) -> impl Iterator<Item = (&str, &[KernelEntry])> {
        self.files.iter().map(|(f, e)| (f.as_str(), e.as_slice()))
    }

    /// Number of registered kernels
    pub fn len(&self) -> usize {
        self.files.iter().map(|(_, e)| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn default_recompile() -> bool {
    true
}

/// Compiler argument policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Always build from source, ignoring cached binaries
    #[serde(default = "default_recompile")]
    pub recompile: bool,
    /// Arguments passed to every build
    #[serde(default)]
    pub build_args: String,
    /// Extra arguments keyed by a vendor-name substring (case-insensitive)
    #[serde(default)]
    pub vendor_args: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            recompile: default_recompile(),
            build_args: String::new(),
            vendor_args: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    /// Compose the option string: include path, baseline, then vendor matches
    pub fn options(&self, include_dir: &str, vendor: &str) -> String {
        let vendor = vendor.to_lowercase();
        let mut options = format!("-I {}", include_dir);

        let extra = std::iter::once(self.build_args.as_str()).chain(
            self.vendor_args
                .iter()
                .filter(|(key, _)| vendor.contains(&key.to_lowercase()))
                .map(|(_, args)| args.as_str()),
        );
        for args in extra.map(str::trim).filter(|a| !a.is_empty()) {
            options.push(' ');
            options.push_str(args);
        }
        options
    }
}

fn default_kernel_path() -> PathBuf {
    PathBuf::from("./kernels/")
}

fn default_binary_suffix() -> String {
    ".bin".into()
}

fn default_max_source_bytes() -> usize {
    1_000_000
}

/// Where programs live and how they are built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCacheConfig {
    /// Root of registered source files; also the include path
    #[serde(default = "default_kernel_path")]
    pub kernel_path: PathBuf,
    /// Appended to a source path to name its binary
    #[serde(default = "default_binary_suffix")]
    pub binary_suffix: String,
    /// Longest source read; the rest is dropped with a warning
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    /// Compiler argument policy
    #[serde(default)]
    pub build: BuildConfig,
}

impl Default for ProgramCacheConfig {
    fn default() -> Self {
        Self {
            kernel_path: default_kernel_path(),
            binary_suffix: default_binary_suffix(),
            max_source_bytes: default_max_source_bytes(),
            build: BuildConfig::default(),
        }
    }
}

/// A loaded kernel and its launch shapes
#[derive(Debug, Clone)]
pub struct Kernel {
    id: String,
    entry: String,
    file: String,
    handle: KernelHandle,
    limits: KernelLimits,
    best: LaunchShape,
    selected: LaunchShape,
}

impl Kernel {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub(crate) fn handle(&self) -> KernelHandle {
        self.handle
    }

    /// Limits reported by the device for this kernel
    pub fn limits(&self) -> &KernelLimits {
        &self.limits
    }

    /// Device-optimum shape fixed at load time
    pub fn best(&self) -> LaunchShape {
        self.best
    }

    /// Current selected shape
    pub fn selected(&self) -> LaunchShape {
        self.selected
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> KernelInfo {
        KernelInfo {
            id: self.id.clone(),
            entry: self.entry.clone(),
            file: self.file.clone(),
            best: self.best,
            selected: self.selected,
            max_workgroup_size: self.limits.max_workgroup_size,
            preferred_multiple: self.limits.preferred_multiple,
            local_mem_bytes: self.limits.local_mem_bytes,
            private_mem_bytes: self.limits.private_mem_bytes,
        }
    }
}

/// Launch-shape and memory report for one kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelInfo {
    pub id: String,
    pub entry: String,
    pub file: String,
    pub best: LaunchShape,
    pub selected: LaunchShape,
    pub max_workgroup_size: usize,
    pub preferred_multiple: usize,
    pub local_mem_bytes: u64,
    pub private_mem_bytes: u64,
}

/// Builds registered programs and owns the resulting kernels
pub struct ProgramCache {
    config: ProgramCacheConfig,
    tree: KernelTree,
    programs: BTreeMap<String, ProgramHandle>,
    kernels: BTreeMap<String, Kernel>,
    profiler: SharedProfiler,
}

impl ProgramCache {
    pub fn new(config: ProgramCacheConfig, profiler: SharedProfiler) -> Self {
        Self {
            config,
            tree: KernelTree::new(),
            programs: BTreeMap::new(),
            kernels: BTreeMap::new(),
            profiler,
        }
    }

    pub fn config(&self) -> &ProgramCacheConfig {
        &self.config
    }

    /// Build policy, adjustable between load passes
    pub fn build_config_mut(&mut self) -> &mut BuildConfig {
        &mut self.config.build
    }

    /// Register an entry point of a source file under a logical id
    pub fn register(&mut self, file: impl Into<String>, entry: impl Into<String>, id: impl Into<String>) -> Result<()> {
        self.tree.register(file, entry, id)
    }

    /// Read-only view of the registrations
    pub fn tree(&self) -> &KernelTree {
        &self.tree
    }

    /// Build every registered program and create its kernels.
    ///
    /// Programs and kernels already loaded are kept, so registering more
    /// entry points and calling this again only loads the new ones. Returns
    /// the number of kernels created.
    pub fn load_all(&mut self, backend: &mut dyn ComputeBackend, device: &Device) -> Result<usize> {
        let mut created = 0;
        let files: Vec<(String, Vec<KernelEntry>)> = self
            .tree
            .files()
            .map(|(file, entries)| (file.to_string(), entries.to_vec()))
            .collect();

        for (file, entries) in files {
            let pending: Vec<KernelEntry> = entries
                .into_iter()
                .filter(|e| !self.kernels.contains_key(&e.id))
                .collect();
            if pending.is_empty() {
                continue;
            }

            let program = match self.programs.get(&file) {
                Some(&program) => program,
                None => {
                    let program = self.load_program(backend, device, &file)?;
                    self.programs.insert(file.clone(), program);
                    program
                }
            };

            for entry in pending {
                self.create_kernel(backend, device, &file, program, entry)?;
                created += 1;
            }
        }
        Ok(created)
    }

    fn load_program(&self, backend: &mut dyn ComputeBackend, device: &Device, file: &str) -> Result<ProgramHandle> {
        let started = Instant::now();
        let scope = ProfileScope::single(format!("program_load_{}", file));
        let program = timing::profiled(&self.profiler, &scope, || self.compile_or_load(backend, device, file))?;

        info!(
            "Loaded program '{}' in {:.2} ms",
            file,
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(program)
    }

    fn compile_or_load(&self, backend: &mut dyn ComputeBackend, device: &Device, file: &str) -> Result<ProgramHandle> {
        let source_path = self.config.kernel_path.join(file);
        let binary_path = binary_path(&source_path, &self.config.binary_suffix);
        let options = self
            .config
            .build
            .options(&self.config.kernel_path.to_string_lossy(), device.vendor());
        let fingerprint = xxh3_64_with_seed(options.as_bytes(), device.fingerprint(backend.name()));

        if !self.config.build.recompile && binary_path.exists() {
            match fs::read(&binary_path) {
                Ok(data) => match unpack_binary(&data, fingerprint) {
                    Some(binary) => return self.load_binary(backend, &binary_path, binary, &options),
                    None => info!(
                        "Cached binary '{}' does not match device '{}', rebuilding",
                        binary_path.display(),
                        device.name()
                    ),
                },
                Err(e) => info!("Cached binary '{}' unreadable ({}), rebuilding", binary_path.display(), e),
            }
        }

        self.compile_source(backend, file, &source_path, &binary_path, &options, fingerprint)
    }

    fn load_binary(
        &self,
        backend: &mut dyn ComputeBackend,
        path: &Path,
        binary: &[u8],
        options: &str,
    ) -> Result<ProgramHandle> {
        debug!("Loading binary '{}' ({} bytes)", path.display(), binary.len());
        let program = backend
            .program_from_binary(binary)
            .map_err(|source| ComputeError::BinaryLoad {
                path: path.to_path_buf(),
                source,
            })?;

        let log = backend
            .build_program(program, options)
            .map_err(|source| ComputeError::Build {
                path: path.to_path_buf(),
                log: source.log.clone().unwrap_or_default(),
                source,
            })?;
        log_build(path, &log);
        Ok(program)
    }

    fn compile_source(
        &self,
        backend: &mut dyn ComputeBackend,
        file: &str,
        source_path: &Path,
        binary_path: &Path,
        options: &str,
        fingerprint: u64,
    ) -> Result<ProgramHandle> {
        let source = self.read_source(file, source_path)?;
        debug!("Compiling '{}' with options '{}'", source_path.display(), options);

        let program = backend
            .program_from_source(&source)
            .map_err(|source| ComputeError::SourceCompile {
                path: source_path.to_path_buf(),
                source,
            })?;
        let log = backend
            .build_program(program, options)
            .map_err(|source| ComputeError::Build {
                path: source_path.to_path_buf(),
                log: source.log.clone().unwrap_or_default(),
                source,
            })?;
        log_build(source_path, &log);

        match backend.program_binaries(program) {
            Ok(binaries) if binaries.len() == 1 => {
                if let Err(e) = write_binary(binary_path, fingerprint, &binaries[0]) {
                    warn!("Unable to cache binary '{}': {}", binary_path.display(), e);
                } else {
                    debug!("Cached binary '{}' ({} bytes)", binary_path.display(), binaries[0].len());
                }
            }
            Ok(binaries) => debug!(
                "Not caching '{}': program targets {} devices",
                source_path.display(),
                binaries.len()
            ),
            Err(e) => warn!("Unable to query binary of '{}': {}", source_path.display(), e),
        }
        Ok(program)
    }

    fn read_source(&self, file: &str, path: &Path) -> Result<String> {
        let handle = match fs::File::open(path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some((_, source)) = BUILTIN_SOURCES.iter().find(|(name, _)| *name == file) {
                    debug!("Using built-in source for '{}'", file);
                    return Ok(source.to_string());
                }
                return Err(ComputeError::SourceOpen {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            Err(source) => {
                return Err(ComputeError::SourceOpen {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let limit = self.config.max_source_bytes;
        let mut data = Vec::new();
        handle
            .take(limit as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|source| ComputeError::SourceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        if data.len() > limit {
            warn!(
                "Source '{}' exceeds {} bytes and was truncated",
                path.display(),
                limit
            );
            data.truncate(limit);
        }
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn create_kernel(
        &mut self,
        backend: &mut dyn ComputeBackend,
        device: &Device,
        file: &str,
        program: ProgramHandle,
        entry: KernelEntry,
    ) -> Result<()> {
        let creation_error = |source| ComputeError::KernelCreation {
            kernel: entry.id.clone(),
            entry: entry.entry.clone(),
            source,
        };
        let handle = backend.create_kernel(program, &entry.entry).map_err(creation_error)?;
        let limits = backend.kernel_limits(handle).map_err(creation_error)?;

        let best = LaunchShape::optimum(device, limits.max_workgroup_size);
        debug!(
            "Kernel '{}' ({}): max workgroup {}, best {}",
            entry.id, entry.entry, limits.max_workgroup_size, best
        );

        self.kernels.insert(
            entry.id.clone(),
            Kernel {
                id: entry.id,
                entry: entry.entry,
                file: file.to_string(),
                handle,
                limits,
                best,
                selected: best,
            },
        );
        Ok(())
    }

    /// Loaded kernel by logical id
    pub fn kernel(&self, id: &str) -> Result<&Kernel> {
        self.kernels
            .get(id)
            .ok_or_else(|| ComputeError::KernelNotFound(id.to_string()))
    }

    /// Whether a kernel has been loaded
    pub fn is_loaded(&self, id: &str) -> bool {
        self.kernels.contains_key(id)
    }

    /// All loaded kernels by id
    pub fn kernels(&self) -> impl Iterator<Item = &Kernel> {
        self.kernels.values()
    }

    /// Selected workgroup count of a kernel, for display
    pub fn selected_workgroups(&self, id: &str) -> Result<usize> {
        self.kernel(id).map(|k| k.selected.workgroups)
    }

    /// Override the selected shape of a kernel
    pub fn set_selected_shape(&mut self, id: &str, workgroups: usize, workgroup_size: usize) -> Result<()> {
        let kernel = self
            .kernels
            .get_mut(id)
            .ok_or_else(|| ComputeError::KernelNotFound(id.to_string()))?;

        let max = kernel.limits.max_workgroup_size;
        if workgroups == 0 || workgroup_size == 0 || workgroup_size > max {
            return Err(ComputeError::InvalidLaunchShape {
                kernel: id.to_string(),
                workgroups,
                workgroup_size,
                max,
            });
        }
        kernel.selected = LaunchShape::new(workgroups, workgroup_size);
        Ok(())
    }

    /// Reports for loaded kernels in registration order
    pub fn kernel_info(&self) -> Vec<KernelInfo> {
        self.tree
            .files()
            .flat_map(|(_, entries)| entries.iter())
            .filter_map(|e| self.kernels.get(&e.id))
            .map(Kernel::info)
            .collect()
    }

    /// Log launch shapes and memory use of every loaded kernel
    pub fn log_kernel_info(&self) {
        for info in self.kernel_info() {
            info!("Kernel '{}' ({} in {}):", info.id, info.entry, info.file);
            info!("  - Best shape:          {}", info.best);
            info!("  - Selected shape:      {}", info.selected);
            info!("  - Max workgroup size:  {}", info.max_workgroup_size);
            info!("  - Preferred multiple:  {}", info.preferred_multiple);
            info!("  - Private memory:      {} bytes", info.private_mem_bytes);
            info!("  - Local memory:        {} bytes", info.local_mem_bytes);
        }
    }

    /// Log the registration tree
    pub fn log_kernel_tree(&self) {
        for (file, entries) in self.tree.files() {
            info!("{}", file);
            for entry in entries {
                let state = if self.is_loaded(&entry.id) { "loaded" } else { "pending" };
                info!("  {} -> {} ({})", entry.entry, entry.id, state);
            }
        }
    }
}

fn log_build(path: &Path, log: &str) {
    if !log.trim().is_empty() {
        debug!("Build log for '{}':\n{}", path.display(), log.trim_end());
    }
}

/// `<source><suffix>`
pub fn binary_path(source: &Path, suffix: &str) -> PathBuf {
    let mut path = source.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

pub(crate) fn pack_binary(fingerprint: u64, binary: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(BINARY_HEADER_LEN + binary.len());
    data.extend_from_slice(BINARY_MAGIC);
    data.extend_from_slice(&BINARY_VERSION.to_le_bytes());
    data.extend_from_slice(&fingerprint.to_le_bytes());
    data.extend_from_slice(binary);
    data
}

/// The device binary, if `data` is a current container for `fingerprint`
pub(crate) fn unpack_binary(data: &[u8], fingerprint: u64) -> Option<&[u8]> {
    if data.len() < BINARY_HEADER_LEN || &data[..8] != BINARY_MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(data[8..12].try_into().ok()?);
    let stored = u64::from_le_bytes(data[12..20].try_into().ok()?);
    (version == BINARY_VERSION && stored == fingerprint).then(|| &data[BINARY_HEADER_LEN..])
}

fn write_binary(path: &Path, fingerprint: u64, binary: &[u8]) -> io::Result<()> {
    let tmp = binary_path(path, ".tmp");
    fs::write(&tmp, pack_binary(fingerprint, binary))?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostBackendConfig, HostDeviceConfig, HostKernel};
    use crate::device::{DeviceClass, DeviceRegistry};
    use lumen_profiler::Profiler;
    use tempfile::tempdir;

    const GEOMETRY: &str = r#"
        __kernel void scale(__global const float *src, __global float *dst) { }
        __kernel void offset(__global float *dst, const float by) { }
    "#;

    fn setup(config: HostBackendConfig) -> (HostBackend, Device) {
        let mut backend = HostBackend::with_config(config);
        backend.register_kernel("scale", HostKernel::new(2, |_| Ok(())).with_max_workgroup_size(16));
        backend.register_kernel("offset", HostKernel::new(2, |_| Ok(())).with_memory(256, 8));

        let mut registry = DeviceRegistry::new(Profiler::shared());
        registry.scan(&mut backend).unwrap();
        let device = registry
            .select(&mut backend, DeviceClass::Accelerator, 0, false)
            .unwrap()
            .clone();
        (backend, device)
    }

    fn accelerator() -> HostBackendConfig {
        HostBackendConfig::default()
            .with_device(HostDeviceConfig::accelerator("Test Accelerator", 4, 64).with_vendor("Acme Graphics"))
    }

    fn cache_in(dir: &Path, recompile: bool) -> ProgramCache {
        let config = ProgramCacheConfig {
            kernel_path: dir.to_path_buf(),
            build: BuildConfig {
                recompile,
                ..BuildConfig::default()
            },
            ..ProgramCacheConfig::default()
        };
        ProgramCache::new(config, Profiler::shared())
    }

    #[test]
    fn test_tree_keeps_insertion_order() {
        let mut tree = KernelTree::new();
        tree.register("b.cl", "second", "k2").unwrap();
        tree.register("a.cl", "first", "k1").unwrap();
        tree.register("b.cl", "third", "k3").unwrap();

        let files: Vec<_> = tree.files().map(|(f, e)| (f, e.len())).collect();
        assert_eq!(files, vec![("b.cl", 2), ("a.cl", 1)]);
        assert_eq!(tree.file_of("k3"), Some("b.cl"));
        assert_eq!(tree.len(), 3);

        let err = tree.register("c.cl", "other", "k1").unwrap_err();
        assert!(matches!(err, ComputeError::DuplicateKernel(id) if id == "k1"));
    }

    #[test]
    fn test_build_options_vendor_match() {
        let mut build = BuildConfig {
            build_args: "-D LIGHTS=4".into(),
            ..BuildConfig::default()
        };
        build.vendor_args.insert("nvidia".into(), "-cl-nv-verbose".into());
        build.vendor_args.insert("acme".into(), "-cl-fast-relaxed-math".into());

        assert_eq!(
            build.options("./kernels/", "ACME Graphics"),
            "-I ./kernels/ -D LIGHTS=4 -cl-fast-relaxed-math"
        );
        assert_eq!(build.options("k", "Intel"), "-I k -D LIGHTS=4");
    }

    #[test]
    fn test_container_rejects_stale_fingerprint() {
        let packed = pack_binary(42, b"payload");
        assert_eq!(unpack_binary(&packed, 42), Some(&b"payload"[..]));
        assert_eq!(unpack_binary(&packed, 43), None);
        assert_eq!(unpack_binary(b"payload", 42), None);
    }

    #[test]
    fn test_load_clamps_best_shape() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        let (mut backend, device) = setup(accelerator());

        let mut cache = cache_in(dir.path(), true);
        cache.register("geometry.cl", "scale", "scale").unwrap();
        cache.register("geometry.cl", "offset", "offset").unwrap();
        assert_eq!(cache.load_all(&mut backend, &device).unwrap(), 2);

        let scale = cache.kernel("scale").unwrap();
        assert_eq!(scale.best(), LaunchShape::new(4, 16));
        assert_eq!(scale.selected(), scale.best());
        let offset = cache.kernel("offset").unwrap();
        assert_eq!(offset.best(), LaunchShape::new(4, 64));
        assert_eq!(offset.limits().local_mem_bytes, 256);

        assert!(dir.path().join("geometry.cl.bin").exists());
        assert_eq!(cache.load_all(&mut backend, &device).unwrap(), 0);
    }

    #[test]
    fn test_cached_binary_roundtrip() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("geometry.cl");
        fs::write(&source, GEOMETRY).unwrap();

        let (mut backend, device) = setup(accelerator());
        let mut compiled = cache_in(dir.path(), true);
        compiled.register("geometry.cl", "scale", "scale").unwrap();
        compiled.load_all(&mut backend, &device).unwrap();

        // The binary must be used: the source is gone.
        fs::remove_file(&source).unwrap();
        let (mut backend, device) = setup(accelerator());
        let mut cached = cache_in(dir.path(), false);
        cached.register("geometry.cl", "scale", "scale").unwrap();
        cached.load_all(&mut backend, &device).unwrap();

        assert_eq!(cached.kernel_info(), compiled.kernel_info());
    }

    #[test]
    fn test_stale_binary_is_rebuilt() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        fs::write(dir.path().join("geometry.cl.bin"), pack_binary(7, b"{}")).unwrap();

        let (mut backend, device) = setup(accelerator());
        let mut cache = cache_in(dir.path(), false);
        cache.register("geometry.cl", "scale", "scale").unwrap();
        cache.load_all(&mut backend, &device).unwrap();

        let data = fs::read(dir.path().join("geometry.cl.bin")).unwrap();
        assert_ne!(&data[12..20], &7u64.to_le_bytes());
    }

    #[test]
    fn test_current_but_corrupt_binary_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        let (mut backend, device) = setup(accelerator());

        let mut cache = cache_in(dir.path(), true);
        cache.register("geometry.cl", "scale", "scale").unwrap();
        cache.load_all(&mut backend, &device).unwrap();

        let path = dir.path().join("geometry.cl.bin");
        let mut data = fs::read(&path).unwrap();
        data.truncate(BINARY_HEADER_LEN + 3);
        fs::write(&path, data).unwrap();

        let mut cache = cache_in(dir.path(), false);
        cache.register("geometry.cl", "scale", "scale").unwrap();
        let err = cache.load_all(&mut backend, &device).unwrap_err();
        assert!(matches!(err, ComputeError::BinaryLoad { .. }));
    }

    #[test]
    fn test_multi_device_program_is_not_cached() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        let mut config = accelerator();
        config.program_devices = 2;
        let (mut backend, device) = setup(config);

        let mut cache = cache_in(dir.path(), true);
        cache.register("geometry.cl", "scale", "scale").unwrap();
        cache.load_all(&mut backend, &device).unwrap();
        assert!(!dir.path().join("geometry.cl.bin").exists());
    }

    #[test]
    fn test_build_failure_carries_log() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.cl"), "__kernel void scale( {").unwrap();
        let (mut backend, device) = setup(accelerator());

        let mut cache = cache_in(dir.path(), true);
        cache.register("broken.cl", "scale", "scale").unwrap();
        let err = cache.load_all(&mut backend, &device).unwrap_err();

        assert!(matches!(err, ComputeError::Build { .. }));
        assert!(err.build_log().unwrap().contains("unbalanced braces"));
    }

    #[test]
    fn test_missing_source_and_entry() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        let (mut backend, device) = setup(accelerator());

        let mut cache = cache_in(dir.path(), true);
        cache.register("absent.cl", "scale", "scale").unwrap();
        assert!(matches!(
            cache.load_all(&mut backend, &device).unwrap_err(),
            ComputeError::SourceOpen { .. }
        ));

        let mut cache = cache_in(dir.path(), true);
        cache.register("geometry.cl", "shade", "shade").unwrap();
        assert!(matches!(
            cache.load_all(&mut backend, &device).unwrap_err(),
            ComputeError::KernelCreation { kernel, .. } if kernel == "shade"
        ));
    }

    #[test]
    fn test_builtin_fill_source() {
        let dir = tempdir().unwrap();
        let (mut backend, device) = setup(accelerator());

        let mut cache = cache_in(dir.path(), true);
        cache
            .register(FILL_KERNEL_FILE, FILL_KERNEL_ENTRY, "fill")
            .unwrap();
        cache.load_all(&mut backend, &device).unwrap();
        assert!(cache.is_loaded("fill"));
    }

    #[test]
    fn test_source_truncation() {
        let dir = tempdir().unwrap();
        let padded = format!("{}{}", GEOMETRY, "/* padding */".repeat(100));
        fs::write(dir.path().join("geometry.cl"), &padded).unwrap();

        let mut cache = cache_in(dir.path(), true);
        cache.config.max_source_bytes = GEOMETRY.len();
        let source = cache
            .read_source("geometry.cl", &dir.path().join("geometry.cl"))
            .unwrap();
        assert_eq!(source, GEOMETRY);
    }

    #[test]
    fn test_selected_shape_override() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        let (mut backend, device) = setup(accelerator());

        let mut cache = cache_in(dir.path(), true);
        cache.register("geometry.cl", "scale", "scale").unwrap();
        cache.load_all(&mut backend, &device).unwrap();

        cache.set_selected_shape("scale", 32, 8).unwrap();
        assert_eq!(cache.selected_workgroups("scale").unwrap(), 32);
        assert_eq!(cache.kernel("scale").unwrap().best(), LaunchShape::new(4, 16));

        assert!(matches!(
            cache.set_selected_shape("scale", 1, 17).unwrap_err(),
            ComputeError::InvalidLaunchShape { max: 16, .. }
        ));
        assert!(matches!(
            cache.selected_workgroups("missing").unwrap_err(),
            ComputeError::KernelNotFound(_)
        ));
    }

    #[test]
    fn test_program_load_is_profiled() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("geometry.cl"), GEOMETRY).unwrap();
        let (mut backend, device) = setup(accelerator());

        let profiler = Profiler::shared();
        let mut cache = ProgramCache::new(
            ProgramCacheConfig {
                kernel_path: dir.path().to_path_buf(),
                ..ProgramCacheConfig::default()
            },
            profiler.clone(),
        );
        cache.register("geometry.cl", "scale", "scale").unwrap();
        cache.load_all(&mut backend, &device).unwrap();

        let profiler = lumen_profiler::lock(&profiler);
        assert_eq!(profiler.stats("program_load_geometry.cl").unwrap().count, 1);
    }
}
