//! Frame graph pass recording context
//!
//! The command-buffer facade handed to pass record callbacks. Draw-defining
//! state (targets, load/store operations, viewport) raises a dirty mask; the
//! next draw assembles the dynamic-rendering scope from the accumulated
//! state. Consecutive draws on unchanged targets share one rendering scope.

use ash::vk;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::bindless::BindlessManager;
use crate::command::{CommandBuffer, ImageAccess, ImageBarrier};
use crate::error::{GfxResult, GraphicsError};
use crate::frame_graph::draw::{DrawArguments, DrawList};
use crate::frame_graph::pool::TransientResource;
use crate::frame_graph::{GraphResources, ImageHandle};
use crate::frame_graph::blackboard::FrameGraphBlackboard;
use crate::geometry::GeometryPool;
use crate::pipeline::{Pipeline, MAX_ROOT_CONSTANT_BYTES};
use crate::resource::{ImageAspect, ImageSubresource, SamplerState, Texture, TextureSubresourceState};
use crate::sync::SyncPoint;

/// Maximum simultaneously-bound color attachments
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

bitflags! {
    /// Draw-defining state that has been set but not yet consumed by a draw
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipelineStateFlags: u32 {
        /// Load operations changed
        const LOAD_OPERATIONS = 1 << 0;
        /// Store operations changed
        const STORE_OPERATIONS = 1 << 1;
        /// Render target set changed
        const RENDER_TARGETS = 1 << 2;
        /// Viewport or scissor changed
        const VIEWPORT_SCISSOR = 1 << 3;
        /// Root constants changed
        const ROOT_CONSTANTS = 1 << 4;
        /// State that forces a new rendering scope
        const RENDERING_SCOPE = Self::LOAD_OPERATIONS.bits()
            | Self::STORE_OPERATIONS.bits()
            | Self::RENDER_TARGETS.bits();
    }
}

/// Attachment load behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    /// Preserve previous contents
    #[default]
    Load,
    /// Clear to the operation's clear value
    Clear,
    /// Contents undefined
    DontCare,
}

/// Attachment store behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    /// Keep the results
    #[default]
    Store,
    /// Results may be discarded
    DontCare,
}

/// Load operations and clear values for the bound attachments
#[derive(Debug, Clone, Copy)]
pub struct RenderTargetLoadOperations {
    /// Per-color-attachment load op
    pub color: [LoadOp; MAX_COLOR_ATTACHMENTS],
    /// Per-color-attachment clear color
    pub clear_colors: [[f32; 4]; MAX_COLOR_ATTACHMENTS],
    /// Depth attachment load op
    pub depth: LoadOp,
    /// Depth clear value
    pub clear_depth: f32,
    /// Stencil clear value
    pub clear_stencil: u32,
}

impl Default for RenderTargetLoadOperations {
    fn default() -> Self {
        Self {
            color: [LoadOp::Load; MAX_COLOR_ATTACHMENTS],
            clear_colors: [[0.0; 4]; MAX_COLOR_ATTACHMENTS],
            depth: LoadOp::Load,
            clear_depth: 0.0,
            clear_stencil: 0,
        }
    }
}

impl RenderTargetLoadOperations {
    /// Clear every color attachment to one color
    pub fn clear_all(color: [f32; 4]) -> Self {
        Self {
            color: [LoadOp::Clear; MAX_COLOR_ATTACHMENTS],
            clear_colors: [color; MAX_COLOR_ATTACHMENTS],
            depth: LoadOp::Clear,
            clear_depth: 0.0,
            clear_stencil: 0,
        }
    }
}

/// Store operations for the bound attachments
#[derive(Debug, Clone, Copy)]
pub struct RenderTargetStoreOperations {
    /// Per-color-attachment store op
    pub color: [StoreOp; MAX_COLOR_ATTACHMENTS],
    /// Depth attachment store op
    pub depth: StoreOp,
}

impl Default for RenderTargetStoreOperations {
    fn default() -> Self {
        Self {
            color: [StoreOp::Store; MAX_COLOR_ATTACHMENTS],
            depth: StoreOp::Store,
        }
    }
}

/// Viewport rectangle with depth range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRect {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width in pixels
    pub width: f32,
    /// Height in pixels
    pub height: f32,
    /// Minimum depth
    pub min_depth: f32,
    /// Maximum depth
    pub max_depth: f32,
}

impl ViewportRect {
    /// Full-extent viewport with the default depth range
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl ScissorRect {
    /// Full-extent scissor
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Accumulated draw-defining state; factored out of the context so the
/// dirty-mask rules are host-testable.
pub(crate) struct RenderState {
    pub dirty: PipelineStateFlags,
    pub color_targets: SmallVec<[ImageHandle; MAX_COLOR_ATTACHMENTS]>,
    pub depth_target: Option<ImageHandle>,
    pub load_ops: RenderTargetLoadOperations,
    pub store_ops: RenderTargetStoreOperations,
    pub viewport: Option<ViewportRect>,
    pub scissor: Option<ScissorRect>,
    pub root_constants: [u8; MAX_ROOT_CONSTANT_BYTES as usize],
    pub root_constant_size: usize,
}

impl RenderState {
    pub fn new() -> Self {
        Self {
            dirty: PipelineStateFlags::empty(),
            color_targets: SmallVec::new(),
            depth_target: None,
            load_ops: RenderTargetLoadOperations::default(),
            store_ops: RenderTargetStoreOperations::default(),
            viewport: None,
            scissor: None,
            root_constants: [0; MAX_ROOT_CONSTANT_BYTES as usize],
            root_constant_size: 0,
        }
    }

    pub fn set_render_targets(&mut self, color: &[ImageHandle], depth: Option<ImageHandle>) {
        debug_assert!(color.len() <= MAX_COLOR_ATTACHMENTS);
        self.color_targets.clear();
        self.color_targets.extend_from_slice(color);
        self.depth_target = depth;
        self.dirty |= PipelineStateFlags::RENDER_TARGETS;
    }

    pub fn set_load_operations(&mut self, operations: RenderTargetLoadOperations) {
        self.load_ops = operations;
        self.dirty |= PipelineStateFlags::LOAD_OPERATIONS;
    }

    pub fn set_store_operations(&mut self, operations: RenderTargetStoreOperations) {
        self.store_ops = operations;
        self.dirty |= PipelineStateFlags::STORE_OPERATIONS;
    }

    pub fn set_viewport_scissor(&mut self, viewport: ViewportRect, scissor: ScissorRect) {
        self.viewport = Some(viewport);
        self.scissor = Some(scissor);
        self.dirty |= PipelineStateFlags::VIEWPORT_SCISSOR;
    }

    pub fn set_root_constants(&mut self, data: &[u8]) {
        let size = data.len().min(MAX_ROOT_CONSTANT_BYTES as usize);
        self.root_constants[..size].copy_from_slice(&data[..size]);
        self.root_constant_size = size;
        self.dirty |= PipelineStateFlags::ROOT_CONSTANTS;
    }

    /// True when the next draw must open a fresh rendering scope
    pub fn needs_new_scope(&self) -> bool {
        self.dirty.intersects(PipelineStateFlags::RENDERING_SCOPE)
    }

    pub fn clear_scope_dirty(&mut self) {
        self.dirty &= !PipelineStateFlags::RENDERING_SCOPE;
    }

    pub fn root_constant_bytes(&self) -> &[u8] {
        &self.root_constants[..self.root_constant_size]
    }
}

/// Command-recording facade handed to pass record callbacks
pub struct FrameGraphContext<'a> {
    cmd: &'a mut CommandBuffer,
    bindless: &'a mut BindlessManager,
    geometry: &'a GeometryPool,
    resources: &'a GraphResources,
    blackboard: &'a mut FrameGraphBlackboard,
    state: RenderState,
    rendering_active: bool,
}

impl<'a> FrameGraphContext<'a> {
    pub(crate) fn new(
        cmd: &'a mut CommandBuffer,
        bindless: &'a mut BindlessManager,
        geometry: &'a GeometryPool,
        resources: &'a GraphResources,
        blackboard: &'a mut FrameGraphBlackboard,
    ) -> Self {
        Self {
            cmd,
            bindless,
            geometry,
            resources,
            blackboard,
            state: RenderState::new(),
            rendering_active: false,
        }
    }

    /// Blackboard of the current frame
    pub fn blackboard(&mut self) -> &mut FrameGraphBlackboard {
        self.blackboard
    }

    /// Declare the pass's render targets
    pub fn set_render_targets(&mut self, color: &[ImageHandle], depth: Option<ImageHandle>) {
        self.state.set_render_targets(color, depth);
    }

    /// Set attachment load operations
    pub fn set_render_target_load_operations(&mut self, operations: RenderTargetLoadOperations) {
        self.state.set_load_operations(operations);
    }

    /// Set attachment store operations
    pub fn set_render_target_store_operations(&mut self, operations: RenderTargetStoreOperations) {
        self.state.set_store_operations(operations);
    }

    /// Set viewport and scissor
    pub fn set_viewport_and_scissor(&mut self, viewport: ViewportRect, scissor: ScissorRect) {
        self.state.set_viewport_scissor(viewport, scissor);
    }

    /// Set the pass-level root constant blob (≤128 bytes)
    pub fn set_root_constants(&mut self, data: &[u8]) {
        self.state.set_root_constants(data);
    }

    /// Forward a fence wait to the submit closing this batch of passes
    pub fn enqueue_fence_to_wait(&mut self, point: SyncPoint) {
        self.cmd.enqueue_fence_to_wait(point);
    }

    /// Forward a fence signal to the submit closing this batch of passes
    pub fn enqueue_fence_to_signal(&mut self, point: SyncPoint) {
        self.cmd.enqueue_fence_to_signal(point);
    }

    /// Bindless SRV index of a transient or imported frame-graph image
    pub fn get_srv(&mut self, handle: ImageHandle, subresource: ImageSubresource) -> GfxResult<u32> {
        match self.resources.resolve_image(handle)? {
            TransientResource::Texture(texture) => {
                let texture = std::sync::Arc::clone(texture);
                self.get_texture_srv(&texture, subresource)
            }
            TransientResource::RenderTarget(target) => {
                self.bindless.register_render_target_srv(target, subresource)
            }
            TransientResource::Buffer(_) => Err(GraphicsError::InvalidOperation {
                reason: "SRV requested for a buffer handle".to_string(),
            }),
        }
    }

    /// Bindless UAV index of a frame-graph image
    pub fn get_uav(&mut self, handle: ImageHandle, subresource: ImageSubresource) -> GfxResult<u32> {
        match self.resources.resolve_image(handle)? {
            TransientResource::RenderTarget(target) => self.bindless.register_uav(target, subresource),
            _ => Err(GraphicsError::InvalidOperation {
                reason: "UAV requested for a non-render-target handle".to_string(),
            }),
        }
    }

    /// Bindless SRV index of an external texture.
    ///
    /// If the texture was uploaded on the async copy queue and not yet
    /// acquired this frame, the cross-queue acquire barrier and the fence
    /// wait are synthesized here.
    pub fn get_texture_srv(
        &mut self,
        texture: &std::sync::Arc<Texture>,
        subresource: ImageSubresource,
    ) -> GfxResult<u32> {
        self.acquire_uploaded_subresources(texture);
        self.bindless.register_srv(texture, subresource)
    }

    /// Bindless sampler index for a sampler state
    pub fn get_sampler(&mut self, state: SamplerState) -> GfxResult<u32> {
        self.bindless.register_sampler(state)
    }

    fn acquire_uploaded_subresources(&mut self, texture: &Texture) {
        let desc = *texture.desc();
        let core = std::sync::Arc::clone(self.cmd.device_core());
        let transfer_family = core.queue_family_index(crate::device::QueueKind::Transfer);
        let graphics_family = core.queue_family_index(crate::device::QueueKind::Graphics);

        let mut acquired_any = false;
        for layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                if texture.subresource_state(mip, layer) != TextureSubresourceState::TransferDst {
                    continue;
                }
                // Acquire half of the ownership transfer; mirrors the
                // release recorded by the copy queue.
                self.cmd.add_image_barrier(ImageBarrier {
                    image: texture.image().native(),
                    src: ImageAccess::TransferDst,
                    dst: ImageAccess::ShaderRead,
                    subresource: ImageSubresource::single(ImageAspect::Color, mip, layer),
                    src_queue_family: transfer_family,
                    dst_queue_family: graphics_family,
                });
                texture.set_subresource_state(mip, layer, TextureSubresourceState::ShaderRead);
                acquired_any = true;
            }
        }

        if acquired_any {
            if let Some(sync) = texture.take_upload_sync() {
                self.cmd.enqueue_fence_to_wait(sync);
            }
        }
    }

    /// Record a draw list. Pipelines that are still compiling or failed are
    /// skipped with a log.
    pub fn draw(&mut self, list: &DrawList) -> GfxResult<()> {
        if list.is_empty() {
            return Ok(());
        }
        self.ensure_rendering()?;

        for call in list.iter() {
            let Some((pipeline, layout)) = call.pipeline.native() else {
                if call.pipeline.is_failed() {
                    log::error!("skipping draw: pipeline {:?} failed to compile", call.pipeline.name());
                } else {
                    log::warn!("skipping draw: pipeline {:?} still compiling", call.pipeline.name());
                }
                continue;
            };

            let availability = self.geometry.availability_wait_group(call.geometry)?;
            if !availability.is_signaled() {
                log::warn!("skipping draw: geometry upload still in flight");
                continue;
            }
            let view = self.geometry.view(call.geometry)?;

            self.cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
            self.cmd.bind_descriptor_set(
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                self.bindless.descriptor_set(),
            );

            let constants = if call.root_constants.is_empty() {
                self.state.root_constant_bytes()
            } else {
                &call.root_constants
            };
            if !constants.is_empty() {
                self.cmd
                    .push_constants(layout, call.pipeline.push_constant_stages(), constants);
            }

            if !view.streams.is_empty() {
                let offsets = vec![0; view.streams.len()];
                self.cmd.bind_vertex_buffers(0, &view.streams, &offsets);
            }

            let instance_count = call.instance_count.max(1);
            match call.arguments {
                DrawArguments::Indexed {
                    index_offset,
                    index_count,
                    vertex_offset,
                } => {
                    self.cmd.bind_index_buffer(view.index_buffer, 0, view.index_type);
                    self.cmd
                        .draw_indexed(index_count, instance_count, index_offset, vertex_offset, 0);
                }
                DrawArguments::Linear {
                    vertex_offset,
                    vertex_count,
                } => {
                    self.cmd.draw(vertex_count, instance_count, vertex_offset, 0);
                }
            }
        }
        Ok(())
    }

    /// Record a compute dispatch. Ends any open rendering scope first.
    pub fn dispatch(&mut self, pipeline: &Pipeline, groups: [u32; 3]) -> GfxResult<()> {
        self.end_rendering_scope();

        let Some((native, layout)) = pipeline.native() else {
            log::warn!("skipping dispatch: pipeline {:?} not ready", pipeline.name());
            return Ok(());
        };
        self.cmd.bind_pipeline(vk::PipelineBindPoint::COMPUTE, native);
        self.cmd.bind_descriptor_set(
            vk::PipelineBindPoint::COMPUTE,
            layout,
            self.bindless.descriptor_set(),
        );
        let constants = self.state.root_constant_bytes();
        if !constants.is_empty() {
            self.cmd
                .push_constants(layout, pipeline.push_constant_stages(), constants);
        }
        self.cmd.dispatch(groups[0], groups[1], groups[2]);
        Ok(())
    }

    /// Record a mesh-shading dispatch inside the current rendering scope
    pub fn dispatch_mesh(&mut self, pipeline: &Pipeline, groups: [u32; 3]) -> GfxResult<()> {
        self.ensure_rendering()?;

        let Some((native, layout)) = pipeline.native() else {
            log::warn!("skipping mesh dispatch: pipeline {:?} not ready", pipeline.name());
            return Ok(());
        };
        self.cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, native);
        self.cmd.bind_descriptor_set(
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            self.bindless.descriptor_set(),
        );
        let constants = self.state.root_constant_bytes();
        if !constants.is_empty() {
            self.cmd
                .push_constants(layout, pipeline.push_constant_stages(), constants);
        }
        self.cmd.draw_mesh_tasks(groups[0], groups[1], groups[2]);
        Ok(())
    }

    /// Close any open rendering scope; called by the graph after the pass
    /// callback returns
    pub(crate) fn finish(mut self) {
        self.end_rendering_scope();
    }

    fn end_rendering_scope(&mut self) {
        if self.rendering_active {
            self.cmd.end_rendering();
            self.rendering_active = false;
        }
    }

    fn ensure_rendering(&mut self) -> GfxResult<()> {
        if self.rendering_active && !self.state.needs_new_scope() {
            self.apply_viewport_if_dirty();
            return Ok(());
        }

        self.end_rendering_scope();

        if self.state.color_targets.is_empty() && self.state.depth_target.is_none() {
            return Err(GraphicsError::InvalidOperation {
                reason: "draw recorded with no render targets set".to_string(),
            });
        }

        let load_op = |op: LoadOp| match op {
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        };
        let store_op = |op: StoreOp| match op {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        };

        let mut extent = None;
        let mut color_attachments: SmallVec<[vk::RenderingAttachmentInfoKHR; MAX_COLOR_ATTACHMENTS]> =
            SmallVec::new();
        for (index, handle) in self.state.color_targets.iter().enumerate() {
            let resource = self.resources.resolve_image(*handle)?;
            let TransientResource::RenderTarget(target) = resource else {
                return Err(GraphicsError::InvalidOperation {
                    reason: "color target handle does not resolve to a render target".to_string(),
                });
            };
            let desc = target.desc();
            extent.get_or_insert((desc.width, desc.height));

            color_attachments.push(
                vk::RenderingAttachmentInfoKHR::builder()
                    .image_view(target.image().whole_view())
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op(self.state.load_ops.color[index]))
                    .store_op(store_op(self.state.store_ops.color[index]))
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: self.state.load_ops.clear_colors[index],
                        },
                    })
                    .build(),
            );
        }

        let depth_attachment = match self.state.depth_target {
            Some(handle) => {
                let resource = self.resources.resolve_image(handle)?;
                let TransientResource::RenderTarget(target) = resource else {
                    return Err(GraphicsError::InvalidOperation {
                        reason: "depth target handle does not resolve to a render target".to_string(),
                    });
                };
                let desc = target.desc();
                extent.get_or_insert((desc.width, desc.height));
                Some(
                    vk::RenderingAttachmentInfoKHR::builder()
                        .image_view(target.image().whole_view())
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(load_op(self.state.load_ops.depth))
                        .store_op(store_op(self.state.store_ops.depth))
                        .clear_value(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: self.state.load_ops.clear_depth,
                                stencil: self.state.load_ops.clear_stencil,
                            },
                        })
                        .build(),
                )
            }
            None => None,
        };

        let (width, height) = extent.expect("at least one attachment is bound");
        let mut rendering_info = vk::RenderingInfoKHR::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        self.cmd.begin_rendering(&rendering_info);
        self.rendering_active = true;
        self.state.clear_scope_dirty();

        // Dynamic viewport state must be set inside the new scope.
        self.state.dirty |= PipelineStateFlags::VIEWPORT_SCISSOR;
        self.apply_viewport_if_dirty();
        Ok(())
    }

    fn apply_viewport_if_dirty(&mut self) {
        if !self.state.dirty.contains(PipelineStateFlags::VIEWPORT_SCISSOR) {
            return;
        }
        let Some(viewport) = self.state.viewport else {
            return;
        };
        let Some(scissor) = self.state.scissor else {
            return;
        };

        self.cmd.set_viewport_scissor(
            vk::Viewport {
                x: viewport.x,
                y: viewport.y,
                width: viewport.width,
                height: viewport.height,
                min_depth: viewport.min_depth,
                max_depth: viewport.max_depth,
            },
            vk::Rect2D {
                offset: vk::Offset2D {
                    x: scissor.x,
                    y: scissor.y,
                },
                extent: vk::Extent2D {
                    width: scissor.width,
                    height: scissor.height,
                },
            },
        );
        self.state.dirty &= !PipelineStateFlags::VIEWPORT_SCISSOR;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_targets_raises_dirty_mask() {
        let mut state = RenderState::new();
        assert!(!state.needs_new_scope());

        state.set_render_targets(&[ImageHandle::INVALID], None);
        assert!(state.needs_new_scope());
        assert!(state.dirty.contains(PipelineStateFlags::RENDER_TARGETS));
    }

    #[test]
    fn test_scope_dirty_clears_without_viewport() {
        let mut state = RenderState::new();
        state.set_render_targets(&[ImageHandle::INVALID], None);
        state.set_load_operations(RenderTargetLoadOperations::clear_all([0.0; 4]));
        state.set_viewport_scissor(ViewportRect::full(64, 64), ScissorRect::full(64, 64));

        state.clear_scope_dirty();
        assert!(!state.needs_new_scope());
        // Viewport dirtiness is independent of the rendering scope.
        assert!(state.dirty.contains(PipelineStateFlags::VIEWPORT_SCISSOR));
    }

    #[test]
    fn test_consecutive_draw_state_shares_scope() {
        let mut state = RenderState::new();
        state.set_render_targets(&[ImageHandle::INVALID], None);
        state.clear_scope_dirty();

        // Root constants alone do not force a new rendering scope.
        state.set_root_constants(&[1, 2, 3, 4]);
        assert!(!state.needs_new_scope());

        // Changing targets does.
        state.set_render_targets(&[ImageHandle::INVALID], None);
        assert!(state.needs_new_scope());
    }

    #[test]
    fn test_root_constants_truncate_to_limit() {
        let mut state = RenderState::new();
        let blob = vec![7u8; 200];
        state.set_root_constants(&blob);
        assert_eq!(state.root_constant_bytes().len(), MAX_ROOT_CONSTANT_BYTES as usize);
        assert!(state.root_constant_bytes().iter().all(|&byte| byte == 7));
    }
}
