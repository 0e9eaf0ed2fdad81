//! GPU synchronization primitives
//!
//! Timeline fences are the canonical rendezvous across queues and between
//! CPU and GPU. Binary semaphores exist only because swapchain acquire and
//! present require them.

use std::sync::Arc;

use ash::vk;

use crate::error::{GfxResult, GraphicsError};

/// Timeline fence backed by a Vulkan timeline semaphore.
///
/// The 64-bit payload is monotonically increasing; `wait(v)` blocks until
/// the payload reaches `v`.
pub struct Fence {
    device: ash::Device,
    semaphore: vk::Semaphore,
}

impl Fence {
    /// Create a timeline fence with the given initial value
    pub fn new(device: ash::Device, initial_value: u64) -> GfxResult<Arc<Self>> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);

        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(GraphicsError::Api)?
        };

        Ok(Arc::new(Self { device, semaphore }))
    }

    /// Signal the fence from the CPU
    pub fn signal(&self, value: u64) -> GfxResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::builder()
            .semaphore(self.semaphore)
            .value(value);

        unsafe {
            self.device
                .signal_semaphore(&signal_info)
                .map_err(GraphicsError::Api)
        }
    }

    /// Block the calling thread until the payload reaches `value`
    pub fn wait(&self, value: u64) -> GfxResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe {
            self.device
                .wait_semaphores(&wait_info, u64::MAX)
                .map_err(GraphicsError::Api)
        }
    }

    /// Poll the current payload
    pub fn completed_value(&self) -> GfxResult<u64> {
        unsafe {
            self.device
                .get_semaphore_counter_value(self.semaphore)
                .map_err(GraphicsError::Api)
        }
    }

    /// Get the native semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// A single point on a fence timeline.
///
/// Cheap to clone; stored in queues and command buffers to express
/// cross-queue and CPU-GPU dependencies.
#[derive(Clone)]
pub struct SyncPoint {
    /// The fence this point belongs to
    pub fence: Arc<Fence>,
    /// Timeline value that marks the point
    pub value: u64,
}

impl SyncPoint {
    /// Create a sync point
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    /// True once the fence payload has reached this point
    pub fn is_reached(&self) -> GfxResult<bool> {
        Ok(self.fence.completed_value()? >= self.value)
    }

    /// Block until the fence payload reaches this point
    pub fn wait(&self) -> GfxResult<()> {
        self.fence.wait(self.value)
    }
}

/// Binary semaphore used for swapchain acquire/present only
pub struct BinarySemaphore {
    device: ash::Device,
    semaphore: vk::Semaphore,
}

impl BinarySemaphore {
    /// Create a new binary semaphore
    pub fn new(device: ash::Device) -> GfxResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(GraphicsError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the native semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
