//! GPU-side objects and the render-thread upload seam.
//!
//! The engine never talks to a graphics API itself. A [`GpuUploader`]
//! supplied by the renderer turns prepared payloads into backend objects
//! (Metal buffers, Vulkan images, ...) wrapped in an opaque [`GpuHandle`].
//! Both calls happen on the render thread only.

use std::any::Any;
use std::fmt;

use crate::{PrepareError, PreparedPayload, ResourceKey};

/// Opaque GPU object plus what it costs.
pub struct GpuHandle {
    handle: Box<dyn Any + Send>,
    gpu_memory: usize,
    ram_memory: usize,
}

impl GpuHandle {
    pub fn new<T: Any + Send>(handle: T, gpu_memory: usize, ram_memory: usize) -> Self {
        Self {
            handle: Box::new(handle),
            gpu_memory,
            ram_memory,
        }
    }

    /// Estimated VRAM held by the object.
    pub fn gpu_memory(&self) -> usize {
        self.gpu_memory
    }

    /// CPU-side memory the backend keeps alongside the object.
    pub fn ram_memory(&self) -> usize {
        self.ram_memory
    }

    /// Returns `None` if the type doesn't match.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }

    pub fn into_inner<T: Any>(self) -> Option<Box<T>> {
        self.handle.downcast::<T>().ok()
    }
}

impl fmt::Debug for GpuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuHandle")
            .field("gpu_memory", &self.gpu_memory)
            .field("ram_memory", &self.ram_memory)
            .finish_non_exhaustive()
    }
}

/// Render-thread capability that creates and destroys GPU objects.
pub trait GpuUploader {
    fn upload(
        &mut self,
        key: &ResourceKey,
        payload: PreparedPayload,
    ) -> Result<GpuHandle, PrepareError>;

    fn destroy(&mut self, handle: GpuHandle);
}

/// Uploader for runs without a graphics context.
///
/// Keeps nothing but bookkeeping: each handle records the key and claims
/// the payload's size as GPU memory.
#[derive(Debug, Default)]
pub struct HeadlessUploader {
    uploads: u64,
    destroyed: u64,
    live_gpu_memory: usize,
}

impl HeadlessUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }

    /// Handles created and not yet destroyed.
    pub fn live_handles(&self) -> u64 {
        self.uploads - self.destroyed
    }

    pub fn live_gpu_memory(&self) -> usize {
        self.live_gpu_memory
    }
}

impl GpuUploader for HeadlessUploader {
    fn upload(
        &mut self,
        key: &ResourceKey,
        payload: PreparedPayload,
    ) -> Result<GpuHandle, PrepareError> {
        let gpu_memory = payload.footprint();
        self.uploads += 1;
        self.live_gpu_memory += gpu_memory;
        Ok(GpuHandle::new(key.clone(), gpu_memory, 0))
    }

    fn destroy(&mut self, handle: GpuHandle) {
        self.destroyed += 1;
        self.live_gpu_memory = self.live_gpu_memory.saturating_sub(handle.gpu_memory());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapstream_cache::ByteBuffer;

    #[test]
    fn test_handle_downcast() {
        let handle = GpuHandle::new(42u32, 1024, 16);
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));
        assert!(handle.downcast_ref::<String>().is_none());
        assert_eq!(handle.gpu_memory(), 1024);
        assert_eq!(handle.ram_memory(), 16);
        assert_eq!(*handle.into_inner::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_headless_bookkeeping() {
        let mut gpu = HeadlessUploader::new();
        let key = ResourceKey::from("mesh/1");
        let handle = gpu
            .upload(&key, PreparedPayload::Mesh(ByteBuffer::from(vec![0u8; 100])))
            .unwrap();

        assert_eq!(handle.gpu_memory(), 100);
        assert_eq!(handle.downcast_ref::<ResourceKey>(), Some(&key));
        assert_eq!(gpu.live_handles(), 1);
        assert_eq!(gpu.live_gpu_memory(), 100);

        gpu.destroy(handle);
        assert_eq!(gpu.live_handles(), 0);
        assert_eq!(gpu.live_gpu_memory(), 0);
    }
}
