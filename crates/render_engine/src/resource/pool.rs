//! Resource pool
//!
//! Thin facade over the device's VMA allocator. Creates buffers, textures
//! and render targets; the distinction matters because the supported usage
//! flags differ and because only render targets may back transient
//! frame-graph attachments.

use std::sync::Arc;

use crate::device::DeviceCore;
use crate::error::GfxResult;
use crate::resource::{Buffer, BufferDesc, ImageDesc, ImageUsage, RenderTarget, Texture};

/// Factory for device resources
pub struct ResourcePool {
    core: Arc<DeviceCore>,
}

impl ResourcePool {
    /// Create a pool over the device's allocator
    pub fn new(core: Arc<DeviceCore>) -> Self {
        Self { core }
    }

    /// Create a buffer
    pub fn create_buffer(&self, name: &str, desc: BufferDesc) -> GfxResult<Arc<Buffer>> {
        Buffer::new(Arc::clone(&self.core), name, desc)
    }

    /// Create a shader-read (optionally UAV) texture
    pub fn create_texture(&self, name: &str, desc: ImageDesc) -> GfxResult<Arc<Texture>> {
        debug_assert!(
            !desc
                .usage
                .intersects(ImageUsage::COLOR_TARGET | ImageUsage::DEPTH_STENCIL_TARGET),
            "attachment usage requires a render target, not a texture"
        );
        Texture::new(Arc::clone(&self.core), name, desc)
    }

    /// Create a color or depth-stencil render target
    pub fn create_render_target(&self, name: &str, desc: ImageDesc) -> GfxResult<Arc<RenderTarget>> {
        debug_assert!(
            desc.usage
                .intersects(ImageUsage::COLOR_TARGET | ImageUsage::DEPTH_STENCIL_TARGET),
            "render target requires attachment usage"
        );
        debug_assert!(
            !desc.usage.contains(ImageUsage::SHADER_UAV)
                || desc.usage.contains(ImageUsage::COLOR_TARGET),
            "UAV usage is only supported on color render targets"
        );
        RenderTarget::new(Arc::clone(&self.core), name, desc)
    }

    /// Shared device core
    pub fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}
