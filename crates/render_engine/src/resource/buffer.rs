//! GPU buffer resource
//!
//! Buffers are created through the [`crate::resource::ResourcePool`] and
//! reclaimed through the device's deferred-destroy queue when the last
//! strong reference drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use vk_mem::Alloc;
use bitflags::bitflags;
use parking_lot::Mutex;

use crate::device::DeviceCore;
use crate::error::{GfxResult, GraphicsError};
use crate::resource::{desc_hash, MemoryLocation, ResourceId, ResourceType};

bitflags! {
    /// Buffer usage at the runtime level; translated to Vulkan usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Source of transfer commands
        const TRANSFER_SRC = 1 << 0;
        /// Destination of transfer commands
        const TRANSFER_DST = 1 << 1;
        /// Vertex stream input
        const VERTEX = 1 << 2;
        /// Index stream input
        const INDEX = 1 << 3;
        /// Uniform/constant data
        const UNIFORM = 1 << 4;
        /// Shader-writable storage
        const STORAGE = 1 << 5;
        /// Indirect draw/dispatch arguments
        const INDIRECT = 1 << 6;
    }
}

/// Creation parameters of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Usage flags
    pub usage: BufferUsage,
    /// Memory placement
    pub memory: MemoryLocation,
}

impl BufferDesc {
    /// Device-local buffer with the given usage
    pub fn device_only(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            memory: MemoryLocation::DeviceOnly,
        }
    }

    /// Host-visible upload buffer
    pub fn host_write(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            memory: MemoryLocation::HostWrite,
        }
    }

    /// 64-bit key for the frame-graph resource pool
    pub fn hash64(&self) -> u64 {
        desc_hash(self)
    }

    pub(crate) fn to_vk_usage(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.usage.contains(BufferUsage::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.usage.contains(BufferUsage::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.usage.contains(BufferUsage::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.usage.contains(BufferUsage::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.usage.contains(BufferUsage::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.usage.contains(BufferUsage::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.usage.contains(BufferUsage::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }
}

/// Buffer resource with VMA-backed memory
pub struct Buffer {
    core: Arc<DeviceCore>,
    name: String,
    id: ResourceId,
    desc: BufferDesc,
    native: vk::Buffer,
    allocation: Mutex<Option<vk_mem::Allocation>>,
    mapped: AtomicBool,
    immediate_destroy: AtomicBool,
}

impl Buffer {
    pub(crate) fn new(core: Arc<DeviceCore>, name: &str, desc: BufferDesc) -> GfxResult<Arc<Self>> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let allocation_info = match desc.memory {
            MemoryLocation::DeviceOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryLocation::HostWrite => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            MemoryLocation::HostRead => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        };

        let (native, allocation) = unsafe {
            core.allocator()
                .create_buffer(&buffer_info, &allocation_info)
                .map_err(|_| GraphicsError::OutOfMemory { requested: desc.size })?
        };

        let id = core.register_resource(name, ResourceType::Buffer);
        log::debug!("created buffer {name:?} ({} bytes, id {})", desc.size, id.raw());

        Ok(Arc::new(Self {
            core,
            name: name.to_string(),
            id,
            desc,
            native,
            allocation: Mutex::new(Some(allocation)),
            mapped: AtomicBool::new(false),
            immediate_destroy: AtomicBool::new(false),
        }))
    }

    /// Get the native buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.native
    }

    /// Buffer description
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry ID
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Skip the deferred-destroy delay for this buffer. Only valid when its
    /// lifetime is already protected by a fence the caller waits on.
    pub fn set_immediate_destroy(&self) {
        self.immediate_destroy.store(true, Ordering::Relaxed);
    }

    /// Copy `data` into the buffer at `offset`. The buffer must be
    /// host-visible.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> GfxResult<()> {
        if self.desc.memory == MemoryLocation::DeviceOnly {
            return Err(GraphicsError::InvalidOperation {
                reason: format!("buffer {:?} is not host-visible", self.name),
            });
        }
        if offset + data.len() as u64 > self.desc.size {
            return Err(GraphicsError::InvalidOperation {
                reason: format!("write past the end of buffer {:?}", self.name),
            });
        }

        let mut guard = self.allocation.lock();
        let allocation = guard.as_mut().expect("buffer allocation already taken");
        unsafe {
            let ptr = self
                .core
                .allocator()
                .map_memory(allocation)
                .map_err(GraphicsError::Api)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
            self.core.allocator().unmap_memory(allocation);
        }
        Ok(())
    }

    /// Map the buffer and keep it mapped for the rest of its lifetime.
    /// Used by the async copy queue's staging ring.
    pub(crate) fn map_persistent(&self) -> GfxResult<*mut u8> {
        let mut guard = self.allocation.lock();
        let allocation = guard.as_mut().expect("buffer allocation already taken");
        let ptr = unsafe {
            self.core
                .allocator()
                .map_memory(allocation)
                .map_err(GraphicsError::Api)?
        };
        self.mapped.store(true, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Release a persistent mapping established by [`Self::map_persistent`]
    pub(crate) fn unmap_persistent(&self) {
        if self.mapped.swap(false, Ordering::Relaxed) {
            let mut guard = self.allocation.lock();
            if let Some(allocation) = guard.as_mut() {
                unsafe { self.core.allocator().unmap_memory(allocation) };
            }
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.unmap_persistent();

        let native = self.native;
        let allocation = self.allocation.lock().take();
        let immediate = self.immediate_destroy.load(Ordering::Relaxed);

        self.core.unregister_resource(
            self.id,
            immediate,
            Box::new(move |core: &DeviceCore| {
                if let Some(mut allocation) = allocation {
                    unsafe { core.allocator().destroy_buffer(native, &mut allocation) };
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_translation_covers_all_flags() {
        let desc = BufferDesc::device_only(64, BufferUsage::all());
        let vk_usage = desc.to_vk_usage();
        assert!(vk_usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(vk_usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(vk_usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
    }

    #[test]
    fn test_desc_hash_distinguishes_descs() {
        let a = BufferDesc::device_only(256, BufferUsage::VERTEX);
        let b = BufferDesc::device_only(256, BufferUsage::INDEX);
        let c = BufferDesc::host_write(256, BufferUsage::VERTEX);
        assert_ne!(a.hash64(), b.hash64());
        assert_ne!(a.hash64(), c.hash64());
        assert_eq!(a.hash64(), BufferDesc::device_only(256, BufferUsage::VERTEX).hash64());
    }
}
