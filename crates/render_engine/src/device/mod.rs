//! Logical device, queue table and resource lifetime management
//!
//! The device owns the Vulkan instance/device pair, the VMA allocator, one
//! command pool per queue family, the resource registration table and the
//! deferred-destroy queue. Child objects (buffers, images, pipelines) hold an
//! `Arc<DeviceCore>` and route their native-handle destruction through the
//! deferred queue so no handle dies while an in-flight frame references it.

pub mod factory;
pub mod queue;
mod registry;

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::extensions::{ext, khr};
use ash::vk;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::config::{BindlessConfig, GraphicsConfig};
use crate::error::{GfxResult, GraphicsError};
use crate::resource::{ResourceId, ResourceType};

pub use factory::DeviceFactory;
pub use queue::GraphicsQueue;
use registry::{DisposeQueue, SharedRegistry};

/// Hardware queue selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics + compute capable queue; drives the present loop
    Graphics,
    /// Async compute queue (may alias the graphics family)
    Compute,
    /// Dedicated transfer queue (may alias the graphics family)
    Transfer,
}

/// Disposer closure executed by the deferred-destroy queue
pub(crate) type ResourceDisposer = Box<dyn FnOnce(&DeviceCore) + Send>;

struct QueueSlot {
    family_index: u32,
    queue: Arc<Mutex<vk::Queue>>,
}

/// Shared device state. One instance per selected adapter.
pub struct DeviceCore {
    entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    debug_utils: Option<ext::DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) raw: ash::Device,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    pub(crate) dynamic_rendering: khr::DynamicRendering,
    pub(crate) mesh_shader: Option<ext::MeshShader>,
    pub(crate) limits: vk::PhysicalDeviceLimits,
    pub(crate) bindless_limits: BindlessConfig,
    pub(crate) frames_in_flight: u32,

    graphics: QueueSlot,
    compute: QueueSlot,
    transfer: QueueSlot,
    command_pools: FxHashMap<u32, Mutex<vk::CommandPool>>,

    registry: SharedRegistry,
    dispose_queue: DisposeQueue<DeviceCore>,
}

impl DeviceCore {
    /// Get the raw ash device
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    /// Get the VMA allocator
    pub(crate) fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }

    /// Get the instance (surface and swapchain loaders are built from it)
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan entry point
    pub fn vk_entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Queue family index serving the given kind
    pub fn queue_family_index(&self, kind: QueueKind) -> u32 {
        self.queue_slot(kind).family_index
    }

    /// Shared handle to the native queue serving the given kind.
    ///
    /// Queue submission requires external synchronization; the mutex is the
    /// synchronization. Kinds that alias the same family share one mutex.
    pub fn queue(&self, kind: QueueKind) -> Arc<Mutex<vk::Queue>> {
        Arc::clone(&self.queue_slot(kind).queue)
    }

    fn queue_slot(&self, kind: QueueKind) -> &QueueSlot {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Compute => &self.compute,
            QueueKind::Transfer => &self.transfer,
        }
    }

    /// Allocate a primary command buffer from the pool of the given family
    pub(crate) fn allocate_command_buffer(&self, kind: QueueKind) -> GfxResult<vk::CommandBuffer> {
        let family = self.queue_family_index(kind);
        let pool = self
            .command_pools
            .get(&family)
            .expect("command pool missing for queue family");
        let pool = pool.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe {
            self.raw
                .allocate_command_buffers(&alloc_info)
                .map_err(GraphicsError::Api)?
        };
        Ok(buffers[0])
    }

    /// Register a resource; returns its stable ID (never 0)
    pub(crate) fn register_resource(&self, name: &str, resource_type: ResourceType) -> ResourceId {
        self.registry.register(name, resource_type)
    }

    /// Unregister a resource and schedule its native handles for
    /// destruction. `immediate` bypasses the N-frame delay for objects whose
    /// lifetime is already protected by a fence.
    pub(crate) fn unregister_resource(&self, id: ResourceId, immediate: bool, dispose: ResourceDisposer) {
        self.registry.unregister(id);
        if immediate {
            dispose(self);
            self.registry.release_id(id);
        } else {
            self.dispose_queue.enqueue(id, self.frames_in_flight + 1, dispose);
        }
    }

    /// Advance the deferred-destroy queue by one frame. Runs on the main
    /// thread from the present loop's `OnFrameEnd`.
    pub fn end_frame(&self) {
        for id in self.dispose_queue.tick(self) {
            self.registry.release_id(id);
        }
    }

    /// Destroy everything still queued, ignoring frame counters, then report
    /// leaked resources. Used by shutdown and fatal teardown.
    pub fn dispose_pending(&self) {
        for id in self.dispose_queue.flush_all(self) {
            self.registry.release_id(id);
        }

        let leaks = self.registry.live_resources();
        for name in &leaks {
            log::error!("Resource leak: {name}");
        }
        debug_assert!(leaks.is_empty(), "GPU resources leaked at device shutdown");
    }

    /// Block until every queue has retired all submitted work
    pub fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.raw.device_wait_idle().map_err(GraphicsError::Api) }
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
        }

        // Anything still queued must die before the allocator does.
        for id in self.dispose_queue.flush_all(self) {
            self.registry.release_id(id);
        }

        unsafe {
            for (_, pool) in self.command_pools.drain() {
                self.raw.destroy_command_pool(pool.into_inner(), None);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Owning handle to the logical device
pub struct Device {
    core: Arc<DeviceCore>,
}

impl Device {
    /// Create the logical device from a bootstrapped factory.
    ///
    /// Consumes the factory; instance teardown responsibility moves to the
    /// device core.
    pub fn new(factory: DeviceFactory, config: &GraphicsConfig) -> GfxResult<Self> {
        let adapter = factory.select_adapter()?;

        // Instance ownership transfers to DeviceCore; suppress the factory's
        // own teardown.
        let factory = ManuallyDrop::new(factory);
        let entry = factory.entry.clone();
        let instance = factory.instance.clone();
        let debug_utils = factory.debug_utils.clone();
        let debug_messenger = factory.debug_messenger;

        let unique_families: Vec<u32> = {
            let mut families = vec![
                adapter.graphics_family,
                adapter.compute_family,
                adapter.transfer_family,
            ];
            families.sort_unstable();
            families.dedup();
            families
        };

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extension_ptrs: Vec<*const i8> = factory::REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        if adapter.supports_mesh_shading {
            extension_ptrs.push(vk::ExtMeshShaderFn::name().as_ptr());
        }

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_update_unused_while_pending(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true);
        let mut dynamic_rendering_features =
            vk::PhysicalDeviceDynamicRenderingFeaturesKHR::builder().dynamic_rendering(true);
        let mut mesh_shader_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::builder()
            .mesh_shader(true)
            .task_shader(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut vulkan12_features)
            .push_next(&mut dynamic_rendering_features);
        if adapter.supports_mesh_shading {
            create_info = create_info.push_next(&mut mesh_shader_features);
        }

        let raw = unsafe {
            instance
                .create_device(adapter.physical_device, &create_info, None)
                .map_err(GraphicsError::Api)?
        };

        let allocator_info =
            vk_mem::AllocatorCreateInfo::new(&instance, &raw, adapter.physical_device);
        let allocator = vk_mem::Allocator::new(allocator_info).map_err(GraphicsError::Api)?;

        let mut queue_map: FxHashMap<u32, Arc<Mutex<vk::Queue>>> = FxHashMap::default();
        for &family in &unique_families {
            let queue = unsafe { raw.get_device_queue(family, 0) };
            queue_map.insert(family, Arc::new(Mutex::new(queue)));
        }
        let make_slot = |family: u32| QueueSlot {
            family_index: family,
            queue: Arc::clone(&queue_map[&family]),
        };

        let mut command_pools = FxHashMap::default();
        for &family in &unique_families {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(family);
            let pool = unsafe {
                raw.create_command_pool(&pool_info, None)
                    .map_err(GraphicsError::Api)?
            };
            command_pools.insert(family, Mutex::new(pool));
        }

        let dynamic_rendering = khr::DynamicRendering::new(&instance, &raw);
        let mesh_shader = adapter
            .supports_mesh_shading
            .then(|| ext::MeshShader::new(&instance, &raw));

        let limits = adapter.properties.limits;
        let bindless_limits = config.clamped_bindless(
            limits.max_descriptor_set_samplers,
            limits.max_descriptor_set_sampled_images,
            limits.max_descriptor_set_storage_images,
        );

        let core = DeviceCore {
            entry,
            instance,
            debug_utils,
            debug_messenger,
            physical_device: adapter.physical_device,
            raw,
            allocator: ManuallyDrop::new(allocator),
            dynamic_rendering,
            mesh_shader,
            limits,
            bindless_limits,
            frames_in_flight: config.viewport.frames_in_flight,
            graphics: make_slot(adapter.graphics_family),
            compute: make_slot(adapter.compute_family),
            transfer: make_slot(adapter.transfer_family),
            command_pools,
            registry: SharedRegistry::new(),
            dispose_queue: DisposeQueue::new(),
        };

        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Shared core handle used to construct child subsystems
    pub fn core(&self) -> Arc<DeviceCore> {
        Arc::clone(&self.core)
    }

    /// Per-frame tick: advance the deferred-destroy queue
    pub fn end_frame(&self) {
        self.core.end_frame();
    }

    /// Drain all queues and destroy everything pending. Resources still
    /// registered afterwards are leaks and reported as such.
    pub fn shutdown(&self) -> GfxResult<()> {
        self.core.wait_idle()?;
        self.core.dispose_pending();
        Ok(())
    }
}
