//! Named device memory objects
//!
//! Callers never hold device handles. Every buffer, image and shared texture
//! is addressed by a caller-chosen name; allocating under a name that is
//! already taken releases the previous object first, so a name maps to at
//! most one live handle.

use crate::backend::{BackendError, ComputeBackend, MemFlags, MemHandle, Status};
use crate::timing::{self, ProfileScope};
use crate::{ComputeError, Result};
use lumen_profiler::SharedProfiler;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What a named memory object is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Linear buffer
    Buffer { size: usize },
    /// Alias of a graphics texture; access needs an interop bracket
    SharedTexture2d { texture: u32 },
    /// Single-channel float 3-D image
    Image3d { dims: [usize; 3] },
}

/// A named memory object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    kind: ResourceKind,
    flags: MemFlags,
    handle: MemHandle,
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Size in bytes, where known
    pub fn size(&self) -> Option<usize> {
        match self.kind {
            ResourceKind::Buffer { size } => Some(size),
            ResourceKind::Image3d { dims } => Some(dims.iter().product::<usize>() * 4),
            ResourceKind::SharedTexture2d { .. } => None,
        }
    }

    /// Whether this aliases a graphics texture
    pub fn is_shared(&self) -> bool {
        matches!(self.kind, ResourceKind::SharedTexture2d { .. })
    }

    pub(crate) fn handle(&self) -> MemHandle {
        self.handle
    }
}

/// Name -> memory object table
pub struct ResourceTable {
    entries: BTreeMap<String, Resource>,
    profiler: SharedProfiler,
}

impl ResourceTable {
    pub fn new(profiler: SharedProfiler) -> Self {
        Self {
            entries: BTreeMap::new(),
            profiler,
        }
    }

    /// Allocate a buffer, replacing any object of the same name
    pub fn allocate_buffer(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> Result<()> {
        self.release_existing(backend, name)?;

        let handle = backend
            .create_buffer(flags, size, init)
            .map_err(|source| ComputeError::Allocation {
                name: name.to_string(),
                source,
            })?;
        debug!("Allocated buffer '{}' ({} bytes)", name, size);

        self.insert(name, ResourceKind::Buffer { size }, flags, handle);
        Ok(())
    }

    /// Read-write buffer, initialised from `init` when given
    pub fn allocate_buffer_rw(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        size: usize,
        init: Option<&[u8]>,
    ) -> Result<()> {
        let flags = match init {
            Some(_) => MemFlags::READ_WRITE.copy_host(),
            None => MemFlags::READ_WRITE,
        };
        self.allocate_buffer(backend, name, flags, size, init)
    }

    /// Alias a graphics texture.
    ///
    /// Fails with [`ComputeError::InteropUnavailable`] when the context has no
    /// interop; in that case any existing object under `name` is left alone.
    pub fn allocate_shared_texture_2d(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        flags: MemFlags,
        texture: u32,
        interop_enabled: bool,
    ) -> Result<()> {
        if !interop_enabled {
            return Err(ComputeError::InteropUnavailable {
                name: name.to_string(),
                source: BackendError::new(Status::INVALID_OPERATION, "context was created without graphics interop"),
            });
        }
        self.release_existing(backend, name)?;

        let handle = backend
            .create_shared_texture_2d(flags, texture)
            .map_err(|source| match source.status {
                Status::INVALID_OPERATION => ComputeError::InteropUnavailable {
                    name: name.to_string(),
                    source,
                },
                _ => ComputeError::Allocation {
                    name: name.to_string(),
                    source,
                },
            })?;
        debug!("Shared texture {} as '{}'", texture, name);

        self.insert(name, ResourceKind::SharedTexture2d { texture }, flags, handle);
        Ok(())
    }

    /// Allocate a single-channel float 3-D image, replacing any object of the same name
    pub fn allocate_image_3d(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        dims: [usize; 3],
        flags: MemFlags,
        init: Option<&[f32]>,
    ) -> Result<()> {
        self.release_existing(backend, name)?;

        let handle = backend
            .create_image_3d(flags, dims, init.map(bytemuck::cast_slice::<f32, u8>))
            .map_err(|source| ComputeError::Allocation {
                name: name.to_string(),
                source,
            })?;
        debug!("Allocated image '{}' {}x{}x{}", name, dims[0], dims[1], dims[2]);

        self.insert(name, ResourceKind::Image3d { dims }, flags, handle);
        Ok(())
    }

    /// Free a named object
    pub fn release(&mut self, backend: &mut dyn ComputeBackend, name: &str) -> Result<()> {
        let handle = self.handle(name)?;
        timing::sync(backend);
        backend
            .release_mem(handle)
            .map_err(|source| ComputeError::Deallocation {
                name: name.to_string(),
                source,
            })?;

        self.entries.remove(name);
        debug!("Released '{}'", name);
        Ok(())
    }

    /// Free every object. Failures are logged and the remaining objects still released.
    pub fn release_all(&mut self, backend: &mut dyn ComputeBackend) -> usize {
        timing::sync(backend);
        let mut released = 0;
        for (name, resource) in std::mem::take(&mut self.entries) {
            match backend.release_mem(resource.handle) {
                Ok(()) => released += 1,
                Err(e) => warn!("Unable to release '{}': {}", name, e),
            }
        }
        released
    }

    fn release_existing(&mut self, backend: &mut dyn ComputeBackend, name: &str) -> Result<()> {
        if self.entries.contains_key(name) {
            self.release(backend, name)?;
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, kind: ResourceKind, flags: MemFlags, handle: MemHandle) {
        self.entries
            .insert(name.to_string(), Resource { kind, flags, handle });
    }

    /// Named object
    pub fn get(&self, name: &str) -> Result<&Resource> {
        self.entries
            .get(name)
            .ok_or_else(|| ComputeError::ResourceNotFound(name.to_string()))
    }

    pub(crate) fn handle(&self, name: &str) -> Result<MemHandle> {
        self.get(name).map(Resource::handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Objects in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Resource)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Host to device copy into the start of a buffer
    pub fn write(&mut self, backend: &mut dyn ComputeBackend, name: &str, blocking: bool, data: &[u8]) -> Result<()> {
        let handle = self.handle(name)?;
        timing::device_op(backend, &self.profiler, &ProfileScope::family("buffer_write", name), |b| {
            b.write_buffer(handle, blocking, data)
        })
        .map_err(|source| transfer_error("write", "host", name, source))?;

        debug!("Wrote {} bytes to '{}'", data.len(), name);
        Ok(())
    }

    /// Device to host copy from the start of a buffer
    pub fn read(&mut self, backend: &mut dyn ComputeBackend, name: &str, blocking: bool, out: &mut [u8]) -> Result<()> {
        let handle = self.handle(name)?;
        let len = out.len();
        timing::device_op(backend, &self.profiler, &ProfileScope::family("buffer_read", name), |b| {
            b.read_buffer(handle, blocking, out)
        })
        .map_err(|source| transfer_error("read", name, "host", source))?;

        debug!("Read {} bytes from '{}'", len, name);
        Ok(())
    }

    /// Write floats into the start of a buffer
    pub fn write_floats(&mut self, backend: &mut dyn ComputeBackend, name: &str, blocking: bool, data: &[f32]) -> Result<()> {
        self.write(backend, name, blocking, bytemuck::cast_slice(data))
    }

    /// Read the first `count` floats of a buffer
    pub fn read_floats(&mut self, backend: &mut dyn ComputeBackend, name: &str, count: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; count];
        self.read(backend, name, true, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Device to device buffer copy of `size` bytes
    pub fn copy(&mut self, backend: &mut dyn ComputeBackend, src: &str, dst: &str, size: usize) -> Result<()> {
        let (from, to) = (self.handle(src)?, self.handle(dst)?);
        timing::device_op(backend, &self.profiler, &ProfileScope::family("buffer_copy", src), |b| {
            b.copy_buffer(from, to, size)
        })
        .map_err(|source| transfer_error("copy", src, dst, source))?;

        debug!("Copied {} bytes '{}' -> '{}'", size, src, dst);
        Ok(())
    }

    /// Copy an image region anchored at the origin
    pub fn copy_image(&mut self, backend: &mut dyn ComputeBackend, src: &str, dst: &str, dims: [usize; 3]) -> Result<()> {
        let (from, to) = (self.handle(src)?, self.handle(dst)?);
        timing::device_op(backend, &self.profiler, &ProfileScope::family("image_copy", src), |b| {
            b.copy_image(from, to, dims)
        })
        .map_err(|source| transfer_error("copy image", src, dst, source))?;

        debug!("Copied image region {:?} '{}' -> '{}'", dims, src, dst);
        Ok(())
    }

    /// Write a region of a 3-D image (or shared texture) anchored at the origin
    pub fn write_image_3d(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        blocking: bool,
        dims: [usize; 3],
        data: &[f32],
    ) -> Result<()> {
        let handle = self.handle(name)?;
        timing::device_op(backend, &self.profiler, &ProfileScope::family("image_write", name), |b| {
            b.write_image(handle, blocking, dims, bytemuck::cast_slice(data))
        })
        .map_err(|source| transfer_error("write image", "host", name, source))?;

        debug!("Wrote image region {:?} to '{}'", dims, name);
        Ok(())
    }

    /// Fill the first `count` floats with `value` using the device fill command
    pub fn fill_direct(&mut self, backend: &mut dyn ComputeBackend, name: &str, value: f32, count: usize) -> Result<()> {
        let handle = self.handle(name)?;
        let size = count.checked_mul(std::mem::size_of::<f32>()).ok_or_else(|| {
            transfer_error(
                "fill",
                "host",
                name,
                BackendError::new(Status::INVALID_BUFFER_SIZE, format!("{} floats overflow the fill size", count)),
            )
        })?;
        timing::device_op(backend, &self.profiler, &ProfileScope::family("buffer_fill", name), |b| {
            b.fill_buffer(handle, &value.to_ne_bytes(), size)
        })
        .map_err(|source| transfer_error("fill", "host", name, source))
    }
}

fn transfer_error(op: &'static str, src: &str, dst: &str, source: BackendError) -> ComputeError {
    ComputeError::Transfer {
        op,
        src: src.to_string(),
        dst: dst.to_string(),
        source,
    }
}
