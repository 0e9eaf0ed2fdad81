//! Bindless descriptor manager
//!
//! One giant descriptor set holds every texture SRV/UAV and sampler; shaders
//! address resources with plain 32-bit indices into its three bindings.
//! Pipelines bind exactly this one set layout plus root constants, so no
//! per-draw descriptor-set traffic exists.
//!
//! A small ring of set instances rotates per frame: `begin_frame` retires
//! the current set tagged with the graphics queue's next fence value and
//! allocates (or recycles) the next one. Indices handed out are stable for
//! the life of the set instance.

use std::sync::Arc;

use ash::vk;
use fxhash::FxHashMap;

use crate::config::BindlessConfig;
use crate::device::DeviceCore;
use crate::error::{GfxResult, GraphicsError};
use crate::resource::{ImageSubresource, RenderTarget, ResourceId, SamplerState, Texture};
use crate::sync::SyncPoint;

/// Binding slots of the bindless set layout
pub const BINDING_SAMPLED_IMAGES: u32 = 0;
/// Storage image binding slot
pub const BINDING_STORAGE_IMAGES: u32 = 1;
/// Sampler binding slot
pub const BINDING_SAMPLERS: u32 = 2;

const MAX_DESCRIPTOR_SETS: usize = 8;

/// Dense index allocator keyed by 64-bit resource keys.
///
/// Index 0 is the reserved null descriptor; allocation starts at 1 and
/// indices never move while the map lives.
pub(crate) struct BindlessIndexMap {
    indices: FxHashMap<u64, u32>,
    next_index: u32,
    capacity: u32,
}

impl BindlessIndexMap {
    pub fn new(capacity: u32) -> Self {
        Self {
            indices: FxHashMap::default(),
            next_index: 1,
            capacity,
        }
    }

    /// Look up `key`, allocating the next free index on miss.
    /// Returns `(index, inserted)`.
    pub fn get_or_insert(&mut self, key: u64) -> GfxResult<(u32, bool)> {
        if let Some(&index) = self.indices.get(&key) {
            return Ok((index, false));
        }
        if self.next_index >= self.capacity {
            return Err(GraphicsError::InvalidOperation {
                reason: format!("bindless binding exhausted ({} descriptors)", self.capacity),
            });
        }
        let index = self.next_index;
        self.next_index += 1;
        self.indices.insert(key, index);
        Ok((index, true))
    }

    pub fn clear(&mut self) {
        self.indices.clear();
        self.next_index = 1;
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }
}

struct RetiredSet {
    set: vk::DescriptorSet,
    protect: SyncPoint,
}

/// The bindless descriptor table
pub struct BindlessManager {
    core: Arc<DeviceCore>,
    limits: BindlessConfig,

    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    current_set: vk::DescriptorSet,
    free_sets: Vec<vk::DescriptorSet>,
    allocated_sets: usize,
    retired_sets: Vec<RetiredSet>,
    current_protect: Option<SyncPoint>,

    srv_map: BindlessIndexMap,
    uav_map: BindlessIndexMap,
    sampler_map: BindlessIndexMap,
    sampler_cache: FxHashMap<u32, vk::Sampler>,
}

impl BindlessManager {
    /// Create the layout, the pool and the first descriptor set
    pub fn new(core: Arc<DeviceCore>) -> GfxResult<Self> {
        let limits = core.bindless_limits.clone();
        let device = core.raw().clone();

        let binding_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
        let flags = [binding_flags; 3];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SAMPLED_IMAGES)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(limits.srvs)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_STORAGE_IMAGES)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(limits.uavs)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SAMPLERS)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(limits.samplers)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        ];

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(GraphicsError::Api)?
        };

        let max_sets = MAX_DESCRIPTOR_SETS as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: limits.srvs * max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: limits.uavs * max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: limits.samplers * max_sets,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(GraphicsError::Api)?
        };

        let mut manager = Self {
            core,
            srv_map: BindlessIndexMap::new(limits.srvs),
            uav_map: BindlessIndexMap::new(limits.uavs),
            sampler_map: BindlessIndexMap::new(limits.samplers),
            limits,
            layout,
            pool,
            current_set: vk::DescriptorSet::null(),
            free_sets: Vec::new(),
            allocated_sets: 0,
            retired_sets: Vec::new(),
            current_protect: None,
            sampler_cache: FxHashMap::default(),
        };

        manager.current_set = manager.obtain_set()?;
        manager.write_null_sampler()?;
        Ok(manager)
    }

    /// The bindless set layout, shared by every pipeline layout
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The descriptor set currently being populated
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.current_set
    }

    /// Retire the current set and start populating the next one.
    ///
    /// `protect` is the graphics queue's next signal point: the retired set
    /// may only be recycled once it has elapsed.
    pub fn begin_frame(&mut self, protect: SyncPoint) -> GfxResult<()> {
        if self.current_set != vk::DescriptorSet::null() {
            self.retired_sets.push(RetiredSet {
                set: self.current_set,
                protect: protect.clone(),
            });
        }

        // Recycle anything the GPU is provably done with.
        let mut index = 0;
        while index < self.retired_sets.len() {
            if self.retired_sets[index].protect.is_reached()? {
                let retired = self.retired_sets.swap_remove(index);
                self.free_sets.push(retired.set);
            } else {
                index += 1;
            }
        }

        self.current_set = self.obtain_set()?;
        self.current_protect = Some(protect);

        self.srv_map.clear();
        self.uav_map.clear();
        self.sampler_map.clear();
        self.write_null_sampler()?;
        Ok(())
    }

    /// Sync point that must elapse before the set used this frame is safe to
    /// recycle
    pub fn close_frame(&self) -> Option<SyncPoint> {
        self.current_protect.clone()
    }

    fn obtain_set(&mut self) -> GfxResult<vk::DescriptorSet> {
        if let Some(set) = self.free_sets.pop() {
            return Ok(set);
        }
        if self.allocated_sets < MAX_DESCRIPTOR_SETS {
            self.allocated_sets += 1;
            return self.allocate_set();
        }

        // Every set instance is in flight; block on the oldest retirement.
        let oldest = self.retired_sets.remove(0);
        oldest.protect.wait()?;
        Ok(oldest.set)
    }

    fn allocate_set(&self) -> GfxResult<vk::DescriptorSet> {
        let layouts = [self.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.core
                .raw()
                .allocate_descriptor_sets(&alloc_info)
                .map_err(GraphicsError::Api)?
        };
        Ok(sets[0])
    }

    /// Register a shader-resource view of a texture subresource.
    /// Returns the stable index into the sampled-image binding.
    pub fn register_srv(&mut self, texture: &Texture, subresource: ImageSubresource) -> GfxResult<u32> {
        let view = texture.subresource_view(subresource)?;
        self.register_image_internal(texture.id(), subresource, view, false)
    }

    /// Register a shader-resource view of a render target subresource
    pub fn register_render_target_srv(
        &mut self,
        render_target: &RenderTarget,
        subresource: ImageSubresource,
    ) -> GfxResult<u32> {
        let view = render_target.subresource_view(subresource)?;
        self.register_image_internal(render_target.id(), subresource, view, false)
    }

    /// Register an unordered-access view of a render target subresource.
    /// Returns the stable index into the storage-image binding.
    pub fn register_uav(
        &mut self,
        render_target: &RenderTarget,
        subresource: ImageSubresource,
    ) -> GfxResult<u32> {
        let view = render_target.subresource_view(subresource)?;
        self.register_image_internal(render_target.id(), subresource, view, true)
    }

    fn register_image_internal(
        &mut self,
        id: ResourceId,
        subresource: ImageSubresource,
        view: vk::ImageView,
        storage: bool,
    ) -> GfxResult<u32> {
        let key = (u64::from(id.raw()) << 32) | u64::from(subresource.pack());
        let map = if storage { &mut self.uav_map } else { &mut self.srv_map };
        let (index, inserted) = map.get_or_insert(key)?;
        if !inserted {
            return Ok(index);
        }

        let (binding, descriptor_type, layout) = if storage {
            (
                BINDING_STORAGE_IMAGES,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ImageLayout::GENERAL,
            )
        } else {
            (
                BINDING_SAMPLED_IMAGES,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        };

        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.current_set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(descriptor_type)
            .image_info(&image_info);

        unsafe {
            self.core.raw().update_descriptor_sets(&[write.build()], &[]);
        }
        Ok(index)
    }

    /// Register a sampler state. Returns the stable index into the sampler
    /// binding.
    pub fn register_sampler(&mut self, state: SamplerState) -> GfxResult<u32> {
        let packed = state.pack();
        let (index, inserted) = self.sampler_map.get_or_insert(u64::from(packed))?;
        if !inserted {
            return Ok(index);
        }

        let sampler = self.get_or_create_sampler(state)?;
        self.write_sampler(index, sampler)?;
        Ok(index)
    }

    fn get_or_create_sampler(&mut self, state: SamplerState) -> GfxResult<vk::Sampler> {
        let packed = state.pack();
        if let Some(&sampler) = self.sampler_cache.get(&packed) {
            return Ok(sampler);
        }
        let sampler = unsafe {
            self.core
                .raw()
                .create_sampler(&state.to_vk_create_info(), None)
                .map_err(GraphicsError::Api)?
        };
        self.sampler_cache.insert(packed, sampler);
        Ok(sampler)
    }

    /// Index 0 of the sampler binding always holds a default sampler so an
    /// all-zero handle blob samples deterministically.
    fn write_null_sampler(&mut self) -> GfxResult<()> {
        let sampler = self.get_or_create_sampler(SamplerState::default())?;
        self.write_sampler(0, sampler)
    }

    fn write_sampler(&self, index: u32, sampler: vk::Sampler) -> GfxResult<()> {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.current_set)
            .dst_binding(BINDING_SAMPLERS)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(&image_info);
        unsafe {
            self.core.raw().update_descriptor_sets(&[write.build()], &[]);
        }
        Ok(())
    }

    /// Configured binding capacities after device clamping
    pub fn limits(&self) -> &BindlessConfig {
        &self.limits
    }
}

impl Drop for BindlessManager {
    fn drop(&mut self) {
        // The owner drains the device before tearing subsystems down.
        unsafe {
            for (_, sampler) in self.sampler_cache.drain() {
                self.core.raw().destroy_sampler(sampler, None);
            }
            self.core.raw().destroy_descriptor_pool(self.pool, None);
            self.core.raw().destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_zero_is_reserved() {
        let mut map = BindlessIndexMap::new(16);
        let (index, inserted) = map.get_or_insert(0xABCD).unwrap();
        assert_eq!(index, 1);
        assert!(inserted);
    }

    #[test]
    fn test_indices_are_stable() {
        let mut map = BindlessIndexMap::new(16);
        let (a, _) = map.get_or_insert(1).unwrap();
        let (b, _) = map.get_or_insert(2).unwrap();
        let (c, _) = map.get_or_insert(3).unwrap();

        // Re-registration returns the same indices in any order.
        assert_eq!(map.get_or_insert(3).unwrap(), (c, false));
        assert_eq!(map.get_or_insert(1).unwrap(), (a, false));
        assert_eq!(map.get_or_insert(2).unwrap(), (b, false));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_capacity_exhaustion_errors() {
        let mut map = BindlessIndexMap::new(3);
        map.get_or_insert(1).unwrap();
        map.get_or_insert(2).unwrap();
        assert!(map.get_or_insert(3).is_err());
    }

    #[test]
    fn test_clear_resets_allocation() {
        let mut map = BindlessIndexMap::new(8);
        map.get_or_insert(10).unwrap();
        map.get_or_insert(20).unwrap();
        map.clear();
        assert_eq!(map.len(), 0);
        assert_eq!(map.get_or_insert(20).unwrap(), (1, true));
    }
}
