//! Frame graph resource pool
//!
//! Physical transient resources are recycled across frames through a
//! desc-hash map: at frame begin everything used last frame becomes
//! available again, and entries that stay unused for several consecutive
//! frames are evicted (their `Arc` drop routes them into the deferred
//! destroy queue).

use std::sync::Arc;

use crate::error::GfxResult;
use crate::resource::{
    Buffer, BufferDesc, ImageDesc, ImageUsage, RenderTarget, ResourcePool, Texture,
};

/// Frames an entry may stay unused before eviction
pub const EVICT_AFTER_FRAMES: u64 = 8;

/// Physical backing of a transient frame-graph resource
#[derive(Clone)]
pub enum TransientResource {
    /// Shader-read texture
    Texture(Arc<Texture>),
    /// Attachment-capable image
    RenderTarget(Arc<RenderTarget>),
    /// Buffer
    Buffer(Arc<Buffer>),
}

impl TransientResource {
    /// Image description when the resource is an image
    pub fn image_desc(&self) -> Option<&ImageDesc> {
        match self {
            TransientResource::Texture(texture) => Some(texture.desc()),
            TransientResource::RenderTarget(target) => Some(target.desc()),
            TransientResource::Buffer(_) => None,
        }
    }

    /// Native image handle when the resource is an image
    pub fn native_image(&self) -> Option<ash::vk::Image> {
        match self {
            TransientResource::Texture(texture) => Some(texture.image().native()),
            TransientResource::RenderTarget(target) => Some(target.image().native()),
            TransientResource::Buffer(_) => None,
        }
    }

    /// Native buffer handle when the resource is a buffer
    pub fn native_buffer(&self) -> Option<ash::vk::Buffer> {
        match self {
            TransientResource::Buffer(buffer) => Some(buffer.handle()),
            _ => None,
        }
    }
}

/// Creates physical resources on pool misses
pub trait TransientResourceFactory: Send {
    /// Create an image resource (render target when attachment usage is
    /// requested, texture otherwise)
    fn create_image(&self, name: &str, desc: &ImageDesc) -> GfxResult<TransientResource>;
    /// Create a buffer resource
    fn create_buffer(&self, name: &str, desc: &BufferDesc) -> GfxResult<TransientResource>;
}

impl TransientResourceFactory for ResourcePool {
    fn create_image(&self, name: &str, desc: &ImageDesc) -> GfxResult<TransientResource> {
        let is_attachment = desc
            .usage
            .intersects(ImageUsage::COLOR_TARGET | ImageUsage::DEPTH_STENCIL_TARGET);
        if is_attachment {
            Ok(TransientResource::RenderTarget(
                self.create_render_target(name, *desc)?,
            ))
        } else {
            Ok(TransientResource::Texture(self.create_texture(name, *desc)?))
        }
    }

    fn create_buffer(&self, name: &str, desc: &BufferDesc) -> GfxResult<TransientResource> {
        Ok(TransientResource::Buffer(ResourcePool::create_buffer(
            self, name, *desc,
        )?))
    }
}

impl TransientResourceFactory for Arc<ResourcePool> {
    fn create_image(&self, name: &str, desc: &ImageDesc) -> GfxResult<TransientResource> {
        self.as_ref().create_image(name, desc)
    }

    fn create_buffer(&self, name: &str, desc: &BufferDesc) -> GfxResult<TransientResource> {
        TransientResourceFactory::create_buffer(self.as_ref(), name, desc)
    }
}

struct PoolEntry<R> {
    desc_hash: u64,
    resource: R,
    last_used_frame: u64,
}

/// Generic recycle map: `desc hash -> resources`, advanced once per frame.
/// Factored out of the typed pool so the reuse and eviction rules are
/// host-testable.
pub(crate) struct RecyclePool<R: Clone> {
    available: Vec<PoolEntry<R>>,
    in_frame: Vec<PoolEntry<R>>,
    frame_index: u64,
    evict_after: u64,
}

impl<R: Clone> RecyclePool<R> {
    pub fn new(evict_after: u64) -> Self {
        Self {
            available: Vec::new(),
            in_frame: Vec::new(),
            frame_index: 0,
            evict_after,
        }
    }

    /// Advance one frame: everything used last frame becomes reusable;
    /// entries unused for `evict_after` frames are dropped.
    pub fn reset(&mut self) {
        self.frame_index += 1;
        let frame_index = self.frame_index;
        let evict_after = self.evict_after;

        self.available.append(&mut self.in_frame);
        self.available
            .retain(|entry| frame_index.saturating_sub(entry.last_used_frame) <= evict_after);
    }

    /// Take a matching pooled resource or create one
    pub fn acquire(
        &mut self,
        desc_hash: u64,
        create: impl FnOnce() -> GfxResult<R>,
    ) -> GfxResult<R> {
        let resource = match self
            .available
            .iter()
            .position(|entry| entry.desc_hash == desc_hash)
        {
            Some(position) => self.available.swap_remove(position).resource,
            None => create()?,
        };

        self.in_frame.push(PoolEntry {
            desc_hash,
            resource: resource.clone(),
            last_used_frame: self.frame_index,
        });
        Ok(resource)
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }
}

/// The typed frame-graph resource pool
pub struct FrameGraphResourcePool {
    factory: Box<dyn TransientResourceFactory>,
    images: RecyclePool<TransientResource>,
    buffers: RecyclePool<TransientResource>,
}

impl FrameGraphResourcePool {
    /// Create the pool over a resource factory
    pub fn new(factory: Box<dyn TransientResourceFactory>) -> Self {
        Self {
            factory,
            images: RecyclePool::new(EVICT_AFTER_FRAMES),
            buffers: RecyclePool::new(EVICT_AFTER_FRAMES),
        }
    }

    /// Frame-begin reset
    pub fn reset(&mut self) {
        self.images.reset();
        self.buffers.reset();
    }

    /// Acquire a physical image matching `desc`
    pub fn acquire_image(&mut self, name: &str, desc: &ImageDesc) -> GfxResult<TransientResource> {
        let factory = &self.factory;
        self.images
            .acquire(desc.hash64(), || factory.create_image(name, desc))
    }

    /// Acquire a physical buffer matching `desc`
    pub fn acquire_buffer(&mut self, name: &str, desc: &BufferDesc) -> GfxResult<TransientResource> {
        let factory = &self.factory;
        self.buffers
            .acquire(desc.hash64(), || factory.create_buffer(name, desc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycles_previous_frame_resource() {
        let mut pool: RecyclePool<u32> = RecyclePool::new(8);
        let mut next_id = 0;
        let mut create = || {
            next_id += 1;
            Ok(next_id)
        };

        let first = pool.acquire(0xAA, &mut create).unwrap();
        pool.reset();
        let second = pool.acquire(0xAA, &mut create).unwrap();

        // Same desc hash across frames reuses the physical resource.
        assert_eq!(first, second);
        assert_eq!(next_id, 1);
    }

    #[test]
    fn test_distinct_descs_do_not_share() {
        let mut pool: RecyclePool<u32> = RecyclePool::new(8);
        let mut next_id = 0;
        let mut create = || {
            next_id += 1;
            Ok(next_id)
        };

        let a = pool.acquire(0xAA, &mut create).unwrap();
        let b = pool.acquire(0xBB, &mut create).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_same_frame_same_desc_allocates_twice() {
        // Two overlapping requests within one frame must not alias; the
        // graph handles non-overlapping aliasing itself.
        let mut pool: RecyclePool<u32> = RecyclePool::new(8);
        let mut next_id = 0;
        let mut create = || {
            next_id += 1;
            Ok(next_id)
        };

        let a = pool.acquire(0xAA, &mut create).unwrap();
        let b = pool.acquire(0xAA, &mut create).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_eviction_after_unused_frames() {
        let mut pool: RecyclePool<u32> = RecyclePool::new(2);
        let mut next_id = 0;
        let mut create = || {
            next_id += 1;
            Ok(next_id)
        };

        pool.acquire(0xAA, &mut create).unwrap();
        for _ in 0..4 {
            pool.reset();
        }
        assert_eq!(pool.available_count(), 0);

        // A new request after eviction creates a fresh resource.
        let fresh = pool.acquire(0xAA, &mut create).unwrap();
        assert_eq!(fresh, 2);
    }

    #[test]
    fn test_resource_stays_alive_while_used_every_frame() {
        let mut pool: RecyclePool<u32> = RecyclePool::new(2);
        let mut next_id = 0;

        for _ in 0..10 {
            let resource = pool
                .acquire(0xAA, || {
                    next_id += 1;
                    Ok(next_id)
                })
                .unwrap();
            assert_eq!(resource, 1);
            pool.reset();
        }
    }
}
