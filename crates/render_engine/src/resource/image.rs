//! Image resources: textures and render targets
//!
//! Both kinds share the [`Image`] base: native image + allocation + a
//! whole-resource view created up front, plus a small cache of per-subresource
//! views keyed by the packed [`ImageSubresource`]. Textures and render
//! targets differ in their supported usage flags; render targets are the only
//! images that may back transient frame-graph attachments.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use ash::vk;
use vk_mem::Alloc;
use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::device::DeviceCore;
use crate::error::{GfxResult, GraphicsError};
use crate::resource::{desc_hash, ImageAspect, ImageSubresource, ResourceId, ResourceType};

bitflags! {
    /// Image usage at the runtime level
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Sampled in shaders
        const SHADER_READ = 1 << 0;
        /// Written as a storage image
        const SHADER_UAV = 1 << 1;
        /// Bound as a color attachment
        const COLOR_TARGET = 1 << 2;
        /// Bound as a depth-stencil attachment
        const DEPTH_STENCIL_TARGET = 1 << 3;
        /// Source of transfer commands
        const TRANSFER_SRC = 1 << 4;
        /// Destination of transfer commands
        const TRANSFER_DST = 1 << 5;
    }
}

/// Image dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageDimension {
    /// 1D image
    Dim1D,
    /// 2D image (the common case)
    Dim2D,
    /// 3D volume
    Dim3D,
}

/// Creation parameters of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels (1 unless 3D)
    pub depth: u32,
    /// Mip level count
    pub mip_levels: u32,
    /// Array layer count
    pub array_layers: u32,
    /// Texel format
    pub format: vk::Format,
    /// Dimensionality
    pub dimension: ImageDimension,
    /// Usage flags
    pub usage: ImageUsage,
}

impl ImageDesc {
    /// Shader-readable 2D texture
    pub fn texture_2d(width: u32, height: u32, format: vk::Format, mip_levels: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels,
            array_layers: 1,
            format,
            dimension: ImageDimension::Dim2D,
            usage: ImageUsage::SHADER_READ | ImageUsage::TRANSFER_DST,
        }
    }

    /// 2D color render target
    pub fn render_target_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format,
            dimension: ImageDimension::Dim2D,
            usage: ImageUsage::COLOR_TARGET | ImageUsage::SHADER_READ,
        }
    }

    /// 2D depth-stencil render target
    pub fn depth_target_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format,
            dimension: ImageDimension::Dim2D,
            usage: ImageUsage::DEPTH_STENCIL_TARGET,
        }
    }

    /// 64-bit key for the frame-graph resource pool
    pub fn hash64(&self) -> u64 {
        desc_hash(self)
    }

    /// Aspect implied by the format
    pub fn aspect(&self) -> ImageAspect {
        aspect_of_format(self.format)
    }

    /// Whole-resource subresource range
    pub fn whole_subresource(&self) -> ImageSubresource {
        ImageSubresource::whole(self.aspect(), self.mip_levels, self.array_layers)
    }

    pub(crate) fn to_vk_usage(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.usage.contains(ImageUsage::SHADER_READ) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.usage.contains(ImageUsage::SHADER_UAV) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.usage.contains(ImageUsage::COLOR_TARGET) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.usage.contains(ImageUsage::DEPTH_STENCIL_TARGET) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.usage.contains(ImageUsage::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.usage.contains(ImageUsage::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        flags
    }

    fn to_vk_image_type(self) -> vk::ImageType {
        match self.dimension {
            ImageDimension::Dim1D => vk::ImageType::TYPE_1D,
            ImageDimension::Dim2D => vk::ImageType::TYPE_2D,
            ImageDimension::Dim3D => vk::ImageType::TYPE_3D,
        }
    }
}

/// Aspect implied by a Vulkan format
pub fn aspect_of_format(format: vk::Format) -> ImageAspect {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            ImageAspect::Depth
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => ImageAspect::DepthStencil,
        vk::Format::S8_UINT => ImageAspect::Stencil,
        _ => ImageAspect::Color,
    }
}

struct ViewCacheEntry {
    key: u32,
    view: vk::ImageView,
}

/// Native handles collected from an image when it dies
pub(crate) struct ImageDisposeData {
    pub native: vk::Image,
    pub allocation: Option<vk_mem::Allocation>,
    pub views: Vec<vk::ImageView>,
}

/// Shared image state: native handle, allocation and cached views
pub struct Image {
    native: vk::Image,
    allocation: Mutex<Option<vk_mem::Allocation>>,
    whole_view: vk::ImageView,
    view_cache: Mutex<SmallVec<[ViewCacheEntry; 6]>>,
    desc: ImageDesc,
}

impl Image {
    /// Create an image with VMA-backed device memory and its whole-resource
    /// view
    fn create(core: &DeviceCore, desc: ImageDesc) -> GfxResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(desc.to_vk_image_type())
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (native, allocation) = unsafe {
            core.allocator()
                .create_image(&image_info, &allocation_info)
                .map_err(|_| GraphicsError::OutOfMemory {
                    requested: u64::from(desc.width) * u64::from(desc.height) * 4,
                })?
        };

        let whole_view = create_view(core.raw(), native, &desc, desc.whole_subresource())?;

        Ok(Self {
            native,
            allocation: Mutex::new(Some(allocation)),
            whole_view,
            view_cache: Mutex::new(SmallVec::new()),
            desc,
        })
    }

    /// Wrap an externally-owned image (swapchain); no allocation is held and
    /// the native image is not destroyed with this wrapper
    fn from_native(device: &ash::Device, desc: ImageDesc, native: vk::Image) -> GfxResult<Self> {
        let whole_view = create_view(device, native, &desc, desc.whole_subresource())?;
        Ok(Self {
            native,
            allocation: Mutex::new(None),
            whole_view,
            view_cache: Mutex::new(SmallVec::new()),
            desc,
        })
    }

    /// Get the native image handle
    pub fn native(&self) -> vk::Image {
        self.native
    }

    /// The view covering every subresource
    pub fn whole_view(&self) -> vk::ImageView {
        self.whole_view
    }

    /// Image description
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Fetch or lazily create the view for a subresource range.
    ///
    /// At most one live view exists per packed subresource key.
    pub fn subresource_view(
        &self,
        device: &ash::Device,
        subresource: ImageSubresource,
    ) -> GfxResult<vk::ImageView> {
        if subresource == self.desc.whole_subresource() {
            return Ok(self.whole_view);
        }

        let key = subresource.pack();
        let mut cache = self.view_cache.lock();
        if let Some(entry) = cache.iter().find(|entry| entry.key == key) {
            return Ok(entry.view);
        }

        let view = create_view(device, self.native, &self.desc, subresource)?;
        cache.push(ViewCacheEntry { key, view });
        Ok(view)
    }

    /// Move every native handle out for deferred destruction
    fn collect_dispose_data(&mut self, owns_native: bool) -> ImageDisposeData {
        let mut views = vec![self.whole_view];
        views.extend(self.view_cache.lock().drain(..).map(|entry| entry.view));
        ImageDisposeData {
            native: if owns_native { self.native } else { vk::Image::null() },
            allocation: self.allocation.lock().take(),
            views,
        }
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &ImageDesc,
    subresource: ImageSubresource,
) -> GfxResult<vk::ImageView> {
    let view_type = match desc.dimension {
        ImageDimension::Dim1D if desc.array_layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
        ImageDimension::Dim1D => vk::ImageViewType::TYPE_1D,
        ImageDimension::Dim2D if subresource.array_count > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
        ImageDimension::Dim2D => vk::ImageViewType::TYPE_2D,
        ImageDimension::Dim3D => vk::ImageViewType::TYPE_3D,
    };

    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(desc.format)
        .subresource_range(subresource.to_vk_range());

    unsafe {
        device
            .create_image_view(&create_info, None)
            .map_err(GraphicsError::Api)
    }
}

fn dispose_image(core: &DeviceCore, data: ImageDisposeData) {
    unsafe {
        for view in data.views {
            core.raw().destroy_image_view(view, None);
        }
        if let Some(mut allocation) = data.allocation {
            if data.native != vk::Image::null() {
                core.allocator().destroy_image(data.native, &mut allocation);
            }
        }
    }
}

/// Upload state of a texture subresource, tracked for async-copy
/// acquire-barrier synthesis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TextureSubresourceState {
    /// Never written
    Undefined = 0,
    /// Upload recorded, still owned by the transfer queue
    TransferDst = 1,
    /// Released to the graphics queue in shader-read layout
    ShaderRead = 2,
}

/// 2-bit-per-subresource state table; safe to update from the copy thread
/// while the main thread reads.
pub(crate) struct SubresourceStates {
    words: Vec<AtomicU8>,
    mip_count: u32,
}

impl SubresourceStates {
    const STATES_PER_WORD: u32 = 4;

    pub fn new(mip_count: u32, array_count: u32) -> Self {
        let subresource_count = mip_count * array_count;
        let word_count = subresource_count.div_ceil(Self::STATES_PER_WORD) as usize;
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicU8::new(0));
        Self { words, mip_count }
    }

    fn index(&self, mip: u32, layer: u32) -> (usize, u32) {
        let subresource = mip + layer * self.mip_count;
        (
            (subresource / Self::STATES_PER_WORD) as usize,
            (subresource % Self::STATES_PER_WORD) * 2,
        )
    }

    pub fn get(&self, mip: u32, layer: u32) -> TextureSubresourceState {
        let (word, shift) = self.index(mip, layer);
        match (self.words[word].load(Ordering::Acquire) >> shift) & 0x3 {
            0 => TextureSubresourceState::Undefined,
            1 => TextureSubresourceState::TransferDst,
            _ => TextureSubresourceState::ShaderRead,
        }
    }

    pub fn set(&self, mip: u32, layer: u32, state: TextureSubresourceState) {
        let (word, shift) = self.index(mip, layer);
        let mask = 0x3u8 << shift;
        let bits = (state as u8) << shift;
        let mut current = self.words[word].load(Ordering::Relaxed);
        loop {
            let next = (current & !mask) | bits;
            match self.words[word].compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Shader-readable texture (optionally UAV)
pub struct Texture {
    core: Arc<DeviceCore>,
    name: String,
    id: ResourceId,
    image: Image,
    upload_states: SubresourceStates,
    upload_sync: Mutex<Option<crate::sync::SyncPoint>>,
    immediate_destroy: AtomicBool,
}

impl Texture {
    pub(crate) fn new(core: Arc<DeviceCore>, name: &str, desc: ImageDesc) -> GfxResult<Arc<Self>> {
        let image = Image::create(&core, desc)?;
        let id = core.register_resource(name, ResourceType::Texture);
        log::debug!(
            "created texture {name:?} ({}x{}, {:?}, id {})",
            desc.width,
            desc.height,
            desc.format,
            id.raw()
        );

        Ok(Arc::new(Self {
            core,
            name: name.to_string(),
            id,
            image,
            upload_states: SubresourceStates::new(desc.mip_levels, desc.array_layers),
            upload_sync: Mutex::new(None),
            immediate_destroy: AtomicBool::new(false),
        }))
    }

    /// Shared image state
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Image description
    pub fn desc(&self) -> &ImageDesc {
        self.image.desc()
    }

    /// Registry ID
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch or create the view for a subresource
    pub fn subresource_view(&self, subresource: ImageSubresource) -> GfxResult<vk::ImageView> {
        self.image.subresource_view(self.core.raw(), subresource)
    }

    /// Upload state of a single subresource
    pub fn subresource_state(&self, mip: u32, layer: u32) -> TextureSubresourceState {
        self.upload_states.get(mip, layer)
    }

    /// Record the upload state of a single subresource
    pub fn set_subresource_state(&self, mip: u32, layer: u32, state: TextureSubresourceState) {
        self.upload_states.set(mip, layer, state);
    }

    /// Tag the texture with the copy-queue sync point protecting its newest
    /// upload. Set by the async copy worker.
    pub fn set_upload_sync(&self, sync: crate::sync::SyncPoint) {
        *self.upload_sync.lock() = Some(sync);
    }

    /// Take the pending upload sync point, if any. The first graphics-side
    /// consumer waits on it and records the acquire barrier.
    pub fn take_upload_sync(&self) -> Option<crate::sync::SyncPoint> {
        self.upload_sync.lock().take()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let data = self.image.collect_dispose_data(true);
        let immediate = self.immediate_destroy.load(Ordering::Relaxed);
        self.core
            .unregister_resource(self.id, immediate, Box::new(move |core| dispose_image(core, data)));
    }
}

/// Color or depth-stencil attachment image.
///
/// The only image kind accepted as a transient frame-graph attachment.
pub struct RenderTarget {
    core: Arc<DeviceCore>,
    name: String,
    id: ResourceId,
    image: Image,
    owns_native: bool,
    immediate_destroy: AtomicBool,
}

impl RenderTarget {
    pub(crate) fn new(core: Arc<DeviceCore>, name: &str, desc: ImageDesc) -> GfxResult<Arc<Self>> {
        let image = Image::create(&core, desc)?;
        let id = core.register_resource(name, ResourceType::RenderTarget);
        log::debug!(
            "created render target {name:?} ({}x{}, {:?}, id {})",
            desc.width,
            desc.height,
            desc.format,
            id.raw()
        );

        Ok(Arc::new(Self {
            core,
            name: name.to_string(),
            id,
            image,
            owns_native: true,
            immediate_destroy: AtomicBool::new(false),
        }))
    }

    /// Wrap a swapchain image. The swapchain owns the native image; only the
    /// views belong to this wrapper, and they die immediately on release
    /// because the viewport has already drained the queue by then.
    pub(crate) fn from_swapchain_image(
        core: Arc<DeviceCore>,
        name: &str,
        desc: ImageDesc,
        native: vk::Image,
    ) -> GfxResult<Arc<Self>> {
        let image = Image::from_native(core.raw(), desc, native)?;
        let id = core.register_resource(name, ResourceType::RenderTarget);

        Ok(Arc::new(Self {
            core,
            name: name.to_string(),
            id,
            image,
            owns_native: false,
            immediate_destroy: AtomicBool::new(true),
        }))
    }

    /// Shared image state
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Image description
    pub fn desc(&self) -> &ImageDesc {
        self.image.desc()
    }

    /// Registry ID
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch or create the view for a subresource
    pub fn subresource_view(&self, subresource: ImageSubresource) -> GfxResult<vk::ImageView> {
        self.image.subresource_view(self.core.raw(), subresource)
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        let data = self.image.collect_dispose_data(self.owns_native);
        let immediate = self.immediate_destroy.load(Ordering::Relaxed);
        self.core
            .unregister_resource(self.id, immediate, Box::new(move |core| dispose_image(core, data)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_of_format() {
        assert_eq!(aspect_of_format(vk::Format::R8G8B8A8_UNORM), ImageAspect::Color);
        assert_eq!(aspect_of_format(vk::Format::D32_SFLOAT), ImageAspect::Depth);
        assert_eq!(
            aspect_of_format(vk::Format::D24_UNORM_S8_UINT),
            ImageAspect::DepthStencil
        );
        assert_eq!(aspect_of_format(vk::Format::S8_UINT), ImageAspect::Stencil);
    }

    #[test]
    fn test_subresource_states_roundtrip() {
        let states = SubresourceStates::new(10, 6);
        assert_eq!(states.get(3, 2), TextureSubresourceState::Undefined);

        states.set(3, 2, TextureSubresourceState::TransferDst);
        states.set(9, 5, TextureSubresourceState::ShaderRead);

        assert_eq!(states.get(3, 2), TextureSubresourceState::TransferDst);
        assert_eq!(states.get(9, 5), TextureSubresourceState::ShaderRead);
        // Neighbors packed into the same byte stay untouched.
        assert_eq!(states.get(2, 2), TextureSubresourceState::Undefined);
        assert_eq!(states.get(4, 2), TextureSubresourceState::Undefined);
    }

    #[test]
    fn test_image_desc_hash_distinguishes() {
        let a = ImageDesc::texture_2d(512, 512, vk::Format::R8_UNORM, 1);
        let b = ImageDesc::texture_2d(512, 512, vk::Format::R8_UNORM, 2);
        let c = ImageDesc::render_target_2d(512, 512, vk::Format::R8_UNORM);
        assert_ne!(a.hash64(), b.hash64());
        assert_ne!(a.hash64(), c.hash64());
        assert_eq!(a.hash64(), ImageDesc::texture_2d(512, 512, vk::Format::R8_UNORM, 1).hash64());
    }
}
