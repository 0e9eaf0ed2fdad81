//! Command buffer recording and submission
//!
//! A command buffer owns its native primary buffer, the queue it submits to,
//! scratch lists of wait/signal sync points and binary semaphores, and a
//! barrier batcher. One recorder per buffer; command buffers are not
//! thread-safe and recording takes `&mut self` throughout.

pub mod barrier;

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::{DeviceCore, QueueKind};
use crate::error::{GfxResult, GraphicsError};
use crate::sync::SyncPoint;

pub use barrier::{BarrierBatcher, BufferAccess, BufferBarrier, ImageAccess, ImageBarrier};

/// Primary-level command buffer bound to one hardware queue.
///
/// A buffer is either *recording* or *submitted-in-flight*. Re-recording
/// requires a [`CommandBuffer::begin`], and the caller must ensure the
/// previous submission has retired (through its signal fence) first.
pub struct CommandBuffer {
    core: Arc<DeviceCore>,
    name: String,
    queue_kind: QueueKind,
    queue: Arc<Mutex<vk::Queue>>,
    native: vk::CommandBuffer,

    wait_fences: Vec<SyncPoint>,
    signal_fences: Vec<SyncPoint>,
    wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    signal_semaphores: Vec<vk::Semaphore>,

    barriers: BarrierBatcher,
    recording: bool,
}

impl CommandBuffer {
    /// Allocate a primary command buffer from the pool of `queue_kind`'s
    /// family
    pub fn new(core: Arc<DeviceCore>, name: &str, queue_kind: QueueKind) -> GfxResult<Self> {
        let native = core.allocate_command_buffer(queue_kind)?;
        let queue = core.queue(queue_kind);

        Ok(Self {
            core,
            name: name.to_string(),
            queue_kind,
            queue,
            native,
            wait_fences: Vec::new(),
            signal_fences: Vec::new(),
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            barriers: BarrierBatcher::new(),
            recording: false,
        })
    }

    /// Get the native command buffer handle
    pub fn native(&self) -> vk::CommandBuffer {
        self.native
    }

    /// Shared device core
    pub(crate) fn device_core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    /// Queue kind this buffer submits to
    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    /// Queue family index this buffer submits to
    pub fn queue_family_index(&self) -> u32 {
        self.core.queue_family_index(self.queue_kind)
    }

    /// Reset scratch state and start recording
    pub fn begin(&mut self) -> GfxResult<()> {
        if self.recording {
            return Err(GraphicsError::InvalidOperation {
                reason: format!("command buffer {:?} already recording", self.name),
            });
        }

        self.wait_fences.clear();
        self.signal_fences.clear();
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.core
                .raw()
                .begin_command_buffer(self.native, &begin_info)
                .map_err(GraphicsError::Api)?;
        }
        self.recording = true;
        Ok(())
    }

    /// Register a fence value this submission must wait for
    pub fn enqueue_fence_to_wait(&mut self, point: SyncPoint) {
        self.wait_fences.push(point);
    }

    /// Register a fence value this submission will signal
    pub fn enqueue_fence_to_signal(&mut self, point: SyncPoint) {
        self.signal_fences.push(point);
    }

    /// Register a binary semaphore to wait on (swapchain acquire)
    pub fn enqueue_semaphore_to_wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push((semaphore, stage));
    }

    /// Register a binary semaphore to signal (swapchain present)
    pub fn enqueue_semaphore_to_signal(&mut self, semaphore: vk::Semaphore) {
        self.signal_semaphores.push(semaphore);
    }

    /// Queue a buffer barrier into the batcher
    pub fn add_buffer_barrier(&mut self, barrier: BufferBarrier) {
        self.barriers.add_buffer_barrier(barrier);
    }

    /// Queue an image barrier into the batcher
    pub fn add_image_barrier(&mut self, barrier: ImageBarrier) {
        self.barriers.add_image_barrier(barrier);
    }

    /// Emit all batched barriers as one `vkCmdPipelineBarrier`
    pub fn flush_barriers(&mut self) {
        debug_assert!(self.recording);
        self.barriers.flush(self.core.raw(), self.native);
    }

    /// Record a buffer-to-buffer copy
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.core.raw().cmd_copy_buffer(self.native, src, dst, regions);
        }
    }

    /// Record a buffer-to-image copy
    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.core
                .raw()
                .cmd_copy_buffer_to_image(self.native, src, dst, layout, regions);
        }
    }

    /// Begin a dynamic rendering scope
    pub fn begin_rendering(&mut self, info: &vk::RenderingInfoKHR) {
        unsafe {
            self.core
                .dynamic_rendering
                .cmd_begin_rendering(self.native, info);
        }
    }

    /// End the current dynamic rendering scope
    pub fn end_rendering(&mut self) {
        unsafe {
            self.core.dynamic_rendering.cmd_end_rendering(self.native);
        }
    }

    /// Bind a graphics or compute pipeline
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.core.raw().cmd_bind_pipeline(self.native, bind_point, pipeline);
        }
    }

    /// Bind a descriptor set (the bindless set in practice)
    pub fn bind_descriptor_set(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.core.raw().cmd_bind_descriptor_sets(
                self.native,
                bind_point,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    /// Push root constants
    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe {
            self.core
                .raw()
                .cmd_push_constants(self.native, layout, stages, 0, data);
        }
    }

    /// Set viewport and scissor state
    pub fn set_viewport_scissor(&mut self, viewport: vk::Viewport, scissor: vk::Rect2D) {
        unsafe {
            self.core.raw().cmd_set_viewport(self.native, 0, &[viewport]);
            self.core.raw().cmd_set_scissor(self.native, 0, &[scissor]);
        }
    }

    /// Bind vertex streams
    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe {
            self.core
                .raw()
                .cmd_bind_vertex_buffers(self.native, first_binding, buffers, offsets);
        }
    }

    /// Bind an index stream
    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe {
            self.core
                .raw()
                .cmd_bind_index_buffer(self.native, buffer, offset, index_type);
        }
    }

    /// Record a non-indexed draw
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.core
                .raw()
                .cmd_draw(self.native, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    /// Record an indexed draw
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.core.raw().cmd_draw_indexed(
                self.native,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    /// Record a compute dispatch
    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        unsafe {
            self.core
                .raw()
                .cmd_dispatch(self.native, groups_x, groups_y, groups_z);
        }
    }

    /// Record a mesh-shading dispatch. No-op (with a log) when the device
    /// lacks the mesh-shader extension.
    pub fn draw_mesh_tasks(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        match &self.core.mesh_shader {
            Some(mesh_shader) => unsafe {
                mesh_shader.cmd_draw_mesh_tasks(self.native, groups_x, groups_y, groups_z);
            },
            None => {
                log::warn!("draw_mesh_tasks skipped: mesh shading not supported by the device");
            }
        }
    }

    /// Finish recording
    pub fn end(&mut self) -> GfxResult<()> {
        if !self.recording {
            return Err(GraphicsError::InvalidOperation {
                reason: format!("command buffer {:?} not recording", self.name),
            });
        }
        unsafe {
            self.core
                .raw()
                .end_command_buffer(self.native)
                .map_err(GraphicsError::Api)?;
        }
        self.recording = false;
        Ok(())
    }

    /// Submit with one `vkQueueSubmit` batch that waits for every pending
    /// fence/semaphore and signals every pending fence/semaphore.
    pub fn submit(&mut self) -> GfxResult<()> {
        if self.recording {
            self.end()?;
        }

        // Timeline and binary semaphores share the submit-info arrays; the
        // value entries of binary semaphores are ignored by the driver.
        let mut wait_semaphores: Vec<vk::Semaphore> = Vec::new();
        let mut wait_values: Vec<u64> = Vec::new();
        let mut wait_stages: Vec<vk::PipelineStageFlags> = Vec::new();
        for point in &self.wait_fences {
            wait_semaphores.push(point.fence.handle());
            wait_values.push(point.value);
            wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }
        for (semaphore, stage) in &self.wait_semaphores {
            wait_semaphores.push(*semaphore);
            wait_values.push(0);
            wait_stages.push(*stage);
        }

        let mut signal_semaphores: Vec<vk::Semaphore> = Vec::new();
        let mut signal_values: Vec<u64> = Vec::new();
        for point in &self.signal_fences {
            signal_semaphores.push(point.fence.handle());
            signal_values.push(point.value);
        }
        for semaphore in &self.signal_semaphores {
            signal_semaphores.push(*semaphore);
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let command_buffers = [self.native];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let queue = self.queue.lock();
        unsafe {
            self.core
                .raw()
                .queue_submit(*queue, &[submit_info.build()], vk::Fence::null())
                .map_err(GraphicsError::Api)?;
        }

        Ok(())
    }
}
