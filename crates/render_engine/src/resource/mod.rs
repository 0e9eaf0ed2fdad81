//! GPU resource model
//!
//! Buffers, textures and render targets share a common identity scheme: a
//! 32-bit resource ID handed out by the device registry (ID 0 is reserved
//! invalid) plus a packed subresource key for per-mip/per-slice addressing.

pub mod buffer;
pub mod image;
pub mod pool;
pub mod sampler;

use std::hash::{Hash, Hasher};

pub use buffer::{Buffer, BufferDesc, BufferUsage};
pub use image::{
    Image, ImageDesc, ImageDimension, ImageUsage, RenderTarget, Texture, TextureSubresourceState,
};
pub use pool::ResourcePool;
pub use sampler::{AddressMode, CompareOp, Filter, MipFilter, SamplerState};

/// Stable 32-bit identifier assigned by the device resource registry.
///
/// ID 0 is reserved as the invalid sentinel. IDs are recycled only after the
/// owning slot's deferred disposer has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u32);

impl ResourceId {
    /// The reserved invalid ID
    pub const INVALID: ResourceId = ResourceId(0);

    /// True for any ID other than the invalid sentinel
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Raw 32-bit value
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Resource kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    /// Structured or raw buffer
    Buffer,
    /// Sampled / storage image
    Texture,
    /// Color or depth-stencil attachment image
    RenderTarget,
}

/// Image aspect selector for views and barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ImageAspect {
    /// Color aspect
    Color = 0,
    /// Depth aspect only
    Depth = 1,
    /// Stencil aspect only
    Stencil = 2,
    /// Combined depth + stencil
    DepthStencil = 3,
}

impl ImageAspect {
    /// Translate to Vulkan aspect flags
    pub fn to_vk(self) -> ash::vk::ImageAspectFlags {
        use ash::vk::ImageAspectFlags;
        match self {
            ImageAspect::Color => ImageAspectFlags::COLOR,
            ImageAspect::Depth => ImageAspectFlags::DEPTH,
            ImageAspect::Stencil => ImageAspectFlags::STENCIL,
            ImageAspect::DepthStencil => ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => ImageAspect::Color,
            1 => ImageAspect::Depth,
            2 => ImageAspect::Stencil,
            _ => ImageAspect::DepthStencil,
        }
    }
}

/// Subresource range of an image, packed into 32 bits.
///
/// Layout: aspect (2 bits) | mip slice (5) | mip count (5) | array slice (10)
/// | array count (10). The packed value keys the per-image view cache and the
/// bindless descriptor maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSubresource {
    /// Selected aspect
    pub aspect: ImageAspect,
    /// First mip level
    pub mip_slice: u32,
    /// Number of mip levels
    pub mip_count: u32,
    /// First array layer
    pub array_slice: u32,
    /// Number of array layers
    pub array_count: u32,
}

impl ImageSubresource {
    const MAX_MIPS: u32 = (1 << 5) - 1;
    const MAX_LAYERS: u32 = (1 << 10) - 1;

    /// Whole-resource range for an image with the given mip/layer counts
    pub fn whole(aspect: ImageAspect, mip_count: u32, array_count: u32) -> Self {
        Self {
            aspect,
            mip_slice: 0,
            mip_count,
            array_slice: 0,
            array_count,
        }
    }

    /// Single mip of a single layer
    pub fn single(aspect: ImageAspect, mip_slice: u32, array_slice: u32) -> Self {
        Self {
            aspect,
            mip_slice,
            mip_count: 1,
            array_slice,
            array_count: 1,
        }
    }

    /// Pack into the 32-bit cache key
    pub fn pack(self) -> u32 {
        debug_assert!(self.mip_slice <= Self::MAX_MIPS && self.mip_count <= Self::MAX_MIPS);
        debug_assert!(self.array_slice <= Self::MAX_LAYERS && self.array_count <= Self::MAX_LAYERS);

        (self.aspect as u32)
            | (self.mip_slice << 2)
            | (self.mip_count << 7)
            | (self.array_slice << 12)
            | (self.array_count << 22)
    }

    /// Reconstruct from a packed key
    pub fn unpack(packed: u32) -> Self {
        Self {
            aspect: ImageAspect::from_bits(packed & 0x3),
            mip_slice: (packed >> 2) & Self::MAX_MIPS,
            mip_count: (packed >> 7) & Self::MAX_MIPS,
            array_slice: (packed >> 12) & Self::MAX_LAYERS,
            array_count: (packed >> 22) & Self::MAX_LAYERS,
        }
    }

    /// Translate to a Vulkan subresource range
    pub fn to_vk_range(self) -> ash::vk::ImageSubresourceRange {
        ash::vk::ImageSubresourceRange {
            aspect_mask: self.aspect.to_vk(),
            base_mip_level: self.mip_slice,
            level_count: self.mip_count,
            base_array_layer: self.array_slice,
            layer_count: self.array_count,
        }
    }
}

/// Where a resource's memory lives and how the CPU may touch it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory, never mapped
    DeviceOnly,
    /// Host-visible, written sequentially by the CPU (staging, uniforms)
    HostWrite,
    /// Host-visible, read back by the CPU
    HostRead,
}

/// Hash an arbitrary `Hash` value into the 64-bit desc-hash domain used by
/// the frame-graph resource pool and the pipeline factory.
pub fn desc_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = fxhash::FxHasher64::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_id_is_zero() {
        assert!(!ResourceId::INVALID.is_valid());
        assert!(ResourceId(1).is_valid());
    }

    #[test]
    fn test_subresource_pack_roundtrip() {
        let subresource = ImageSubresource {
            aspect: ImageAspect::DepthStencil,
            mip_slice: 3,
            mip_count: 9,
            array_slice: 511,
            array_count: 12,
        };
        assert_eq!(ImageSubresource::unpack(subresource.pack()), subresource);
    }

    #[test]
    fn test_subresource_pack_is_unique_per_field() {
        let base = ImageSubresource::single(ImageAspect::Color, 0, 0);
        let mut keys = vec![base.pack()];
        keys.push(ImageSubresource::single(ImageAspect::Color, 1, 0).pack());
        keys.push(ImageSubresource::single(ImageAspect::Color, 0, 1).pack());
        keys.push(ImageSubresource::single(ImageAspect::Depth, 0, 0).pack());
        keys.push(ImageSubresource::whole(ImageAspect::Color, 1, 2).pack());
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_desc_hash_is_stable() {
        let a = ImageSubresource::single(ImageAspect::Color, 2, 4);
        assert_eq!(desc_hash(&a), desc_hash(&a));
        let b = ImageSubresource::single(ImageAspect::Color, 2, 5);
        assert_ne!(desc_hash(&a), desc_hash(&b));
    }
}
