//! Graphics queue frame pacing
//!
//! The graphics queue owns one primary command buffer per in-flight frame
//! and a timeline fence whose value is the frame counter. Closing a frame
//! hands out the sync point other subsystems (bindless retirement, resource
//! reclamation) key their lifetimes on.

use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::device::{DeviceCore, QueueKind};
use crate::error::GfxResult;
use crate::sync::{Fence, SyncPoint};

/// Frame-paced wrapper over the hardware graphics queue
pub struct GraphicsQueue {
    core: Arc<DeviceCore>,
    fence: Arc<Fence>,
    frame_index: u64,
    command_buffers: Vec<CommandBuffer>,
}

impl GraphicsQueue {
    /// Create the queue wrapper with one command buffer per in-flight frame
    pub fn new(core: Arc<DeviceCore>) -> GfxResult<Self> {
        let fence = Fence::new(core.raw().clone(), 0)?;

        let frames = core.frames_in_flight as usize;
        let mut command_buffers = Vec::with_capacity(frames);
        for index in 0..frames {
            command_buffers.push(CommandBuffer::new(
                Arc::clone(&core),
                &format!("graphics_cmd_{index}"),
                QueueKind::Graphics,
            )?);
        }

        Ok(Self {
            core,
            fence,
            frame_index: 1,
            command_buffers,
        })
    }

    /// The frame fence; its completed value equals the newest retired frame
    pub fn fence(&self) -> Arc<Fence> {
        Arc::clone(&self.fence)
    }

    /// Value the next [`Self::close_frame`] will hand out
    pub fn next_signal_value(&self) -> u64 {
        self.frame_index
    }

    /// The command buffer recording the current frame
    pub fn current_command_buffer(&mut self) -> &mut CommandBuffer {
        let index = (self.frame_index % self.command_buffers.len() as u64) as usize;
        &mut self.command_buffers[index]
    }

    /// Block until the frame that used the current command buffer slot has
    /// retired. Must run before `begin` on that buffer.
    pub fn wait_for_previous_frame(&self) -> GfxResult<()> {
        let frames_in_flight = u64::from(self.core.frames_in_flight);
        if self.frame_index > frames_in_flight {
            self.fence.wait(self.frame_index - frames_in_flight)?;
        }
        Ok(())
    }

    /// Close the current frame: the returned sync point is signaled when
    /// every submission of this frame retires.
    pub fn close_frame(&mut self) -> SyncPoint {
        let point = SyncPoint::new(Arc::clone(&self.fence), self.frame_index);
        self.frame_index += 1;
        point
    }
}
