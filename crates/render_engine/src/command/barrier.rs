//! Resource access model and pipeline barrier batching
//!
//! Per-resource access is tracked as a small tagged enum; a static table
//! maps every (source, destination) pair to stage masks, access masks and an
//! image layout. Barriers recorded within one batch are deduplicated by desc
//! hash and emitted as a single `vkCmdPipelineBarrier`.

use ash::vk;
use smallvec::SmallVec;

use crate::resource::{desc_hash, ImageSubresource};

/// Access type of an image at a frame-graph-visible point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageAccess {
    /// Contents undefined (never written or safely discardable)
    Undefined,
    /// Transfer source
    TransferSrc,
    /// Transfer destination
    TransferDst,
    /// Sampled in any shader stage
    ShaderRead,
    /// Read/write storage image
    ShaderUav,
    /// Color attachment output
    ColorTarget,
    /// Depth-stencil attachment, writes enabled
    DepthWrite,
    /// Depth-stencil read (testing or sampling)
    DepthRead,
    /// Presentable to the swapchain
    Present,
}

impl ImageAccess {
    /// Whether this access writes the resource
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ImageAccess::TransferDst
                | ImageAccess::ShaderUav
                | ImageAccess::ColorTarget
                | ImageAccess::DepthWrite
        )
    }

    /// Stage mask, access mask and layout for this access type
    pub fn stage_access_layout(self) -> (vk::PipelineStageFlags, vk::AccessFlags, vk::ImageLayout) {
        match self {
            ImageAccess::Undefined => (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::ImageLayout::UNDEFINED,
            ),
            ImageAccess::TransferSrc => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_READ,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ),
            ImageAccess::TransferDst => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            ImageAccess::ShaderRead => (
                vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            ImageAccess::ShaderUav => (
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                vk::ImageLayout::GENERAL,
            ),
            ImageAccess::ColorTarget => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            ImageAccess::DepthWrite => (
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
            ImageAccess::DepthRead => (
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ),
            ImageAccess::Present => (
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        }
    }
}

/// Access type of a buffer at a frame-graph-visible point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    /// Contents undefined
    Undefined,
    /// Transfer source
    TransferSrc,
    /// Transfer destination
    TransferDst,
    /// Read in shaders (uniform or storage)
    ShaderRead,
    /// Read/write storage buffer
    ShaderUav,
    /// Vertex stream input
    VertexInput,
    /// Index stream input
    IndexInput,
    /// Indirect draw/dispatch arguments
    IndirectArgument,
}

impl BufferAccess {
    /// Whether this access writes the resource
    pub fn is_write(self) -> bool {
        matches!(self, BufferAccess::TransferDst | BufferAccess::ShaderUav)
    }

    /// Stage and access masks for this access type
    pub fn stage_access(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        match self {
            BufferAccess::Undefined => {
                (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
            }
            BufferAccess::TransferSrc => {
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
            }
            BufferAccess::TransferDst => {
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
            }
            BufferAccess::ShaderRead => (
                vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            BufferAccess::ShaderUav => (
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            ),
            BufferAccess::VertexInput => (
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            ),
            BufferAccess::IndexInput => {
                (vk::PipelineStageFlags::VERTEX_INPUT, vk::AccessFlags::INDEX_READ)
            }
            BufferAccess::IndirectArgument => (
                vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::AccessFlags::INDIRECT_COMMAND_READ,
            ),
        }
    }
}

/// Description of one buffer barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBarrier {
    /// Buffer to transition
    pub buffer: vk::Buffer,
    /// Access before the barrier
    pub src: BufferAccess,
    /// Access after the barrier
    pub dst: BufferAccess,
    /// Releasing queue family (`vk::QUEUE_FAMILY_IGNORED` for none)
    pub src_queue_family: u32,
    /// Acquiring queue family
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    /// Barrier without queue ownership transfer
    pub fn new(buffer: vk::Buffer, src: BufferAccess, dst: BufferAccess) -> Self {
        Self {
            buffer,
            src,
            dst,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Dedup key within a batch
    pub fn hash64(&self) -> u64 {
        desc_hash(self)
    }
}

/// Description of one image barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBarrier {
    /// Image to transition
    pub image: vk::Image,
    /// Access before the barrier
    pub src: ImageAccess,
    /// Access after the barrier
    pub dst: ImageAccess,
    /// Affected subresource range
    pub subresource: ImageSubresource,
    /// Releasing queue family (`vk::QUEUE_FAMILY_IGNORED` for none)
    pub src_queue_family: u32,
    /// Acquiring queue family
    pub dst_queue_family: u32,
}

impl ImageBarrier {
    /// Barrier without queue ownership transfer
    pub fn new(
        image: vk::Image,
        src: ImageAccess,
        dst: ImageAccess,
        subresource: ImageSubresource,
    ) -> Self {
        Self {
            image,
            src,
            dst,
            subresource,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Dedup key within a batch
    pub fn hash64(&self) -> u64 {
        desc_hash(self)
    }
}

/// Collects barriers recorded between flushes and emits them as one
/// `vkCmdPipelineBarrier`
#[derive(Default)]
pub struct BarrierBatcher {
    buffer_barriers: SmallVec<[(u64, BufferBarrier); 8]>,
    image_barriers: SmallVec<[(u64, ImageBarrier); 8]>,
}

impl BarrierBatcher {
    /// Create an empty batcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer barrier; identical descriptions within a batch fold
    /// into one
    pub fn add_buffer_barrier(&mut self, barrier: BufferBarrier) {
        let hash = barrier.hash64();
        if self.buffer_barriers.iter().any(|(h, _)| *h == hash) {
            return;
        }
        self.buffer_barriers.push((hash, barrier));
    }

    /// Append an image barrier; identical descriptions within a batch fold
    /// into one
    pub fn add_image_barrier(&mut self, barrier: ImageBarrier) {
        let hash = barrier.hash64();
        if self.image_barriers.iter().any(|(h, _)| *h == hash) {
            return;
        }
        self.image_barriers.push((hash, barrier));
    }

    /// Number of pending barriers
    pub fn pending_count(&self) -> usize {
        self.buffer_barriers.len() + self.image_barriers.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.buffer_barriers.is_empty() && self.image_barriers.is_empty()
    }

    /// Union of source/destination stage masks over the pending batch
    pub fn stage_masks(&self) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        for (_, barrier) in &self.buffer_barriers {
            src_stages |= barrier.src.stage_access().0;
            dst_stages |= barrier.dst.stage_access().0;
        }
        for (_, barrier) in &self.image_barriers {
            src_stages |= barrier.src.stage_access_layout().0;
            dst_stages |= barrier.dst.stage_access_layout().0;
        }
        if src_stages.is_empty() {
            src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stages.is_empty() {
            dst_stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }
        (src_stages, dst_stages)
    }

    /// Emit the pending batch into `command_buffer` and clear it
    pub fn flush(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }

        let (src_stages, dst_stages) = self.stage_masks();

        let buffer_barriers: Vec<vk::BufferMemoryBarrier> = self
            .buffer_barriers
            .drain(..)
            .map(|(_, barrier)| {
                let (_, src_access) = barrier.src.stage_access();
                let (_, dst_access) = barrier.dst.stage_access();
                vk::BufferMemoryBarrier::builder()
                    .buffer(barrier.buffer)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(barrier.src_queue_family)
                    .dst_queue_family_index(barrier.dst_queue_family)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build()
            })
            .collect();

        let image_barriers: Vec<vk::ImageMemoryBarrier> = self
            .image_barriers
            .drain(..)
            .map(|(_, barrier)| {
                let (_, src_access, src_layout) = barrier.src.stage_access_layout();
                let (_, dst_access, dst_layout) = barrier.dst.stage_access_layout();
                vk::ImageMemoryBarrier::builder()
                    .image(barrier.image)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(src_layout)
                    .new_layout(dst_layout)
                    .src_queue_family_index(barrier.src_queue_family)
                    .dst_queue_family_index(barrier.dst_queue_family)
                    .subresource_range(barrier.subresource.to_vk_range())
                    .build()
            })
            .collect();

        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ImageAspect;

    fn test_subresource() -> ImageSubresource {
        ImageSubresource::whole(ImageAspect::Color, 1, 1)
    }

    #[test]
    fn test_identical_buffer_barriers_fold() {
        let mut batcher = BarrierBatcher::new();
        let barrier = BufferBarrier::new(
            vk::Buffer::null(),
            BufferAccess::TransferDst,
            BufferAccess::ShaderRead,
        );
        batcher.add_buffer_barrier(barrier);
        batcher.add_buffer_barrier(barrier);
        assert_eq!(batcher.pending_count(), 1);
    }

    #[test]
    fn test_distinct_barriers_do_not_fold() {
        let mut batcher = BarrierBatcher::new();
        batcher.add_buffer_barrier(BufferBarrier::new(
            vk::Buffer::null(),
            BufferAccess::TransferDst,
            BufferAccess::ShaderRead,
        ));
        batcher.add_buffer_barrier(BufferBarrier::new(
            vk::Buffer::null(),
            BufferAccess::TransferDst,
            BufferAccess::VertexInput,
        ));
        batcher.add_image_barrier(ImageBarrier::new(
            vk::Image::null(),
            ImageAccess::Undefined,
            ImageAccess::TransferDst,
            test_subresource(),
        ));
        assert_eq!(batcher.pending_count(), 3);
    }

    #[test]
    fn test_stage_masks_union() {
        let mut batcher = BarrierBatcher::new();
        batcher.add_image_barrier(ImageBarrier::new(
            vk::Image::null(),
            ImageAccess::ColorTarget,
            ImageAccess::ShaderRead,
            test_subresource(),
        ));
        batcher.add_buffer_barrier(BufferBarrier::new(
            vk::Buffer::null(),
            BufferAccess::TransferDst,
            BufferAccess::IndexInput,
        ));

        let (src, dst) = batcher.stage_masks();
        assert!(src.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(src.contains(vk::PipelineStageFlags::TRANSFER));
        assert!(dst.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(dst.contains(vk::PipelineStageFlags::VERTEX_INPUT));
    }

    #[test]
    fn test_every_image_access_maps() {
        let all = [
            ImageAccess::Undefined,
            ImageAccess::TransferSrc,
            ImageAccess::TransferDst,
            ImageAccess::ShaderRead,
            ImageAccess::ShaderUav,
            ImageAccess::ColorTarget,
            ImageAccess::DepthWrite,
            ImageAccess::DepthRead,
            ImageAccess::Present,
        ];
        for access in all {
            // Every access type must map deterministically; a write access
            // must carry a non-empty access mask.
            let (_, mask, _) = access.stage_access_layout();
            if access.is_write() {
                assert!(!mask.is_empty());
            }
        }
    }

    #[test]
    fn test_write_classification() {
        assert!(ImageAccess::ColorTarget.is_write());
        assert!(ImageAccess::DepthWrite.is_write());
        assert!(!ImageAccess::DepthRead.is_write());
        assert!(!ImageAccess::Present.is_write());
        assert!(BufferAccess::ShaderUav.is_write());
        assert!(!BufferAccess::IndirectArgument.is_write());
    }
}
