//! Pipeline objects and the async pipeline factory
//!
//! Pipelines are keyed by the 64-bit hash of their request (state + defines
//! + specialization values); identical keys dedupe to the same pinned
//! instance. Creation happens on the job system against a shared
//! `VkPipelineCache`; callers observe completion through the pipeline's wait
//! group. A failed compilation marks the pipeline and still signals, so a
//! draw using it becomes a skip-with-log instead of a deadlock.

pub mod variants;

use std::sync::Arc;

use ash::vk;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::bindless::BindlessManager;
use crate::device::DeviceCore;
use crate::error::{GfxResult, GraphicsError};
use crate::jobs::{JobSystem, WaitGroup};
use crate::resource::desc_hash;
use crate::shader::{ShaderDefines, ShaderLibrary, ShaderStage};

pub use variants::{PipelineRequest, PipelineSetRegistry, PipelineVariant, PipelineVariantSet};

/// Maximum root constant blob size shared by every pipeline layout
pub const MAX_ROOT_CONSTANT_BYTES: u32 = 128;

/// One vertex attribute fetched from a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    /// Shader input location
    pub location: u32,
    /// Stream (binding) index
    pub binding: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Byte offset within the stream stride
    pub offset: u32,
}

/// One vertex stream (buffer binding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexStreamDesc {
    /// Bytes between consecutive elements
    pub stride: u32,
    /// Advance per instance instead of per vertex
    pub per_instance: bool,
}

/// Primitive assembly topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    /// Triangle list
    #[default]
    TriangleList,
    /// Triangle strip
    TriangleStrip,
    /// Line list
    LineList,
    /// Point list
    PointList,
}

impl PrimitiveTopology {
    fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

/// Vertex input layout of a graphics pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InputLayoutDesc {
    /// Vertex streams in binding order
    pub streams: Vec<VertexStreamDesc>,
    /// Attributes across all streams
    pub attributes: Vec<VertexAttributeDesc>,
    /// Assembly topology
    pub topology: PrimitiveTopology,
}

/// Face culling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    /// No culling
    None,
    /// Cull back faces
    #[default]
    Back,
    /// Cull front faces
    Front,
}

/// Rasterizer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerDesc {
    /// Face culling
    pub cull: CullMode,
    /// Counter-clockwise front faces
    pub front_ccw: bool,
    /// Rasterize as wireframe
    pub wireframe: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
            front_ccw: true,
            wireframe: false,
        }
    }
}

/// Depth-stencil state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    /// Enable depth testing
    pub depth_test: bool,
    /// Enable depth writes
    pub depth_write: bool,
    /// Depth compare operator
    pub compare: vk::CompareOp,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare: vk::CompareOp::GREATER_OR_EQUAL,
        }
    }
}

/// Per-attachment blend mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// No blending
    #[default]
    Opaque,
    /// Classic source-alpha blending
    AlphaBlend,
    /// Additive blending
    Additive,
}

impl BlendMode {
    fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        let builder = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            BlendMode::Opaque => builder.blend_enable(false).build(),
            BlendMode::AlphaBlend => builder
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
            BlendMode::Additive => builder
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        }
    }
}

/// Full fixed-function + shader state of a graphics pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    /// Vertex shader name (resolved via the shader library)
    pub vertex_shader: String,
    /// Fragment shader name; `None` for depth-only pipelines
    pub fragment_shader: Option<String>,
    /// Vertex input layout
    pub input_layout: InputLayoutDesc,
    /// Rasterizer state
    pub rasterizer: RasterizerDesc,
    /// Depth-stencil state
    pub depth_stencil: DepthStencilDesc,
    /// Blend mode per color attachment
    pub blend: Vec<BlendMode>,
    /// Color attachment formats (dynamic rendering)
    pub color_formats: Vec<vk::Format>,
    /// Depth attachment format
    pub depth_format: Option<vk::Format>,
}

/// Compute pipeline state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineDesc {
    /// Compute shader name
    pub compute_shader: String,
}

/// Specialization constant values, keyed by `constant_id`.
///
/// Unlike defines these do not change the SPIR-V; they participate only in
/// the pipeline cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SpecializationValues {
    entries: Vec<(u32, u32)>,
}

impl SpecializationValues {
    /// Empty value set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a constant value (32-bit payloads only)
    pub fn with(mut self, constant_id: u32, value: u32) -> Self {
        match self.entries.binary_search_by_key(&constant_id, |(id, _)| *id) {
            Ok(index) => self.entries[index].1 = value,
            Err(index) => self.entries.insert(index, (constant_id, value)),
        }
        self
    }

    /// True when no constants are set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn build_vk(&self) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
        let mut map_entries = Vec::with_capacity(self.entries.len());
        let mut data = Vec::with_capacity(self.entries.len() * 4);
        for (index, (constant_id, value)) in self.entries.iter().enumerate() {
            map_entries.push(vk::SpecializationMapEntry {
                constant_id: *constant_id,
                offset: (index * 4) as u32,
                size: 4,
            });
            data.extend_from_slice(&value.to_le_bytes());
        }
        (map_entries, data)
    }
}

/// Request for a graphics pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineRequest {
    /// Debug name
    pub name: String,
    /// Pipeline state
    pub desc: GraphicsPipelineDesc,
    /// Preprocessor defines (part of the shader module key)
    pub defines: ShaderDefines,
    /// Specialization values (part of the pipeline key only)
    pub specialization: SpecializationValues,
}

impl GraphicsPipelineRequest {
    /// 64-bit dedup key
    pub fn hash64(&self) -> u64 {
        desc_hash(&(&self.desc, &self.defines, &self.specialization))
    }
}

/// Request for a compute pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineRequest {
    /// Debug name
    pub name: String,
    /// Pipeline state
    pub desc: ComputePipelineDesc,
    /// Preprocessor defines
    pub defines: ShaderDefines,
    /// Specialization values
    pub specialization: SpecializationValues,
}

impl ComputePipelineRequest {
    /// 64-bit dedup key
    pub fn hash64(&self) -> u64 {
        desc_hash(&(&self.desc, &self.defines, &self.specialization))
    }
}

struct PipelineSlot {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    push_constant_stages: vk::ShaderStageFlags,
    failed: bool,
}

/// A pipeline visible to callers only after its wait group signals.
/// Immutable once compiled; pinned by the factory for its lifetime.
pub struct Pipeline {
    name: String,
    bind_point: vk::PipelineBindPoint,
    wait_group: Arc<WaitGroup>,
    slot: Mutex<PipelineSlot>,
}

/// Graphics pipeline alias
pub type GraphicsPipeline = Pipeline;
/// Compute pipeline alias
pub type ComputePipeline = Pipeline;

impl Pipeline {
    pub(crate) fn new_pending(name: &str, bind_point: vk::PipelineBindPoint) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            bind_point,
            wait_group: WaitGroup::with_count(1),
            slot: Mutex::new(PipelineSlot {
                pipeline: vk::Pipeline::null(),
                layout: vk::PipelineLayout::null(),
                push_constant_stages: vk::ShaderStageFlags::empty(),
                failed: false,
            }),
        })
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind point (graphics or compute)
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// Wait group signaling compilation completion (success or failure)
    pub fn wait_group(&self) -> Arc<WaitGroup> {
        Arc::clone(&self.wait_group)
    }

    /// True once compiled successfully
    pub fn is_ready(&self) -> bool {
        self.wait_group.is_signaled() && !self.slot.lock().failed
    }

    /// True once compilation finished with an error
    pub fn is_failed(&self) -> bool {
        self.wait_group.is_signaled() && self.slot.lock().failed
    }

    /// Native handles; `None` while pending or failed
    pub fn native(&self) -> Option<(vk::Pipeline, vk::PipelineLayout)> {
        if !self.wait_group.is_signaled() {
            return None;
        }
        let slot = self.slot.lock();
        if slot.failed || slot.pipeline == vk::Pipeline::null() {
            None
        } else {
            Some((slot.pipeline, slot.layout))
        }
    }

    /// Stages covered by the root constant range
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.slot.lock().push_constant_stages
    }

    fn complete(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags) {
        let mut slot = self.slot.lock();
        slot.pipeline = pipeline;
        slot.layout = layout;
        slot.push_constant_stages = stages;
        drop(slot);
        self.wait_group.done();
    }

    pub(crate) fn fail(&self) {
        self.slot.lock().failed = true;
        self.wait_group.done();
    }
}

/// Async pipeline compiler with a shared `VkPipelineCache`
pub struct PipelineFactory {
    core: Arc<DeviceCore>,
    bindless_layout: vk::DescriptorSetLayout,
    shader_library: Arc<ShaderLibrary>,
    jobs: Arc<JobSystem>,
    pipeline_cache: vk::PipelineCache,
    graphics_pipelines: Mutex<FxHashMap<u64, Arc<Pipeline>>>,
    compute_pipelines: Mutex<FxHashMap<u64, Arc<Pipeline>>>,
}

impl PipelineFactory {
    /// Create the factory
    pub fn new(
        core: Arc<DeviceCore>,
        bindless: &BindlessManager,
        shader_library: Arc<ShaderLibrary>,
        jobs: Arc<JobSystem>,
    ) -> GfxResult<Self> {
        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache = unsafe {
            core.raw()
                .create_pipeline_cache(&cache_info, None)
                .map_err(GraphicsError::Api)?
        };

        Ok(Self {
            core,
            bindless_layout: bindless.descriptor_set_layout(),
            shader_library,
            jobs,
            pipeline_cache,
            graphics_pipelines: Mutex::new(FxHashMap::default()),
            compute_pipelines: Mutex::new(FxHashMap::default()),
        })
    }

    /// Get or schedule compilation of a graphics pipeline. Equal requests
    /// return pointer-equal pipelines.
    pub fn create_graphics_pipeline(&self, request: &GraphicsPipelineRequest) -> Arc<Pipeline> {
        let key = request.hash64();
        let mut map = self.graphics_pipelines.lock();
        if let Some(pipeline) = map.get(&key) {
            return Arc::clone(pipeline);
        }

        let pipeline = Pipeline::new_pending(&request.name, vk::PipelineBindPoint::GRAPHICS);
        map.insert(key, Arc::clone(&pipeline));
        drop(map);

        let core = Arc::clone(&self.core);
        let library = Arc::clone(&self.shader_library);
        let bindless_layout = self.bindless_layout;
        let cache = self.pipeline_cache;
        let request = request.clone();
        let result_pipeline = Arc::clone(&pipeline);
        self.jobs.spawn(move || {
            match build_graphics_pipeline(&core, &library, bindless_layout, cache, &request) {
                Ok((native, layout, stages)) => result_pipeline.complete(native, layout, stages),
                Err(error) => {
                    log::error!("graphics pipeline {:?} failed to compile: {error}", request.name);
                    result_pipeline.fail();
                }
            }
        });

        pipeline
    }

    /// Get or schedule compilation of a compute pipeline
    pub fn create_compute_pipeline(&self, request: &ComputePipelineRequest) -> Arc<Pipeline> {
        let key = request.hash64();
        let mut map = self.compute_pipelines.lock();
        if let Some(pipeline) = map.get(&key) {
            return Arc::clone(pipeline);
        }

        let pipeline = Pipeline::new_pending(&request.name, vk::PipelineBindPoint::COMPUTE);
        map.insert(key, Arc::clone(&pipeline));
        drop(map);

        let core = Arc::clone(&self.core);
        let library = Arc::clone(&self.shader_library);
        let bindless_layout = self.bindless_layout;
        let cache = self.pipeline_cache;
        let request = request.clone();
        let result_pipeline = Arc::clone(&pipeline);
        self.jobs.spawn(move || {
            match build_compute_pipeline(&core, &library, bindless_layout, cache, &request) {
                Ok((native, layout, stages)) => result_pipeline.complete(native, layout, stages),
                Err(error) => {
                    log::error!("compute pipeline {:?} failed to compile: {error}", request.name);
                    result_pipeline.fail();
                }
            }
        });

        pipeline
    }

    /// Block until every pipeline requested so far has finished compiling
    pub fn wait_all(&self) {
        let pipelines: Vec<Arc<Pipeline>> = {
            let graphics = self.graphics_pipelines.lock();
            let compute = self.compute_pipelines.lock();
            graphics.values().chain(compute.values()).cloned().collect()
        };
        for pipeline in pipelines {
            pipeline.wait_group.wait();
        }
    }
}

impl Drop for PipelineFactory {
    fn drop(&mut self) {
        // In-flight compilations are awaited, never aborted.
        self.wait_all();

        let device = self.core.raw();
        let mut destroy = |map: &Mutex<FxHashMap<u64, Arc<Pipeline>>>| {
            for pipeline in map.lock().values() {
                let slot = pipeline.slot.lock();
                unsafe {
                    if slot.pipeline != vk::Pipeline::null() {
                        device.destroy_pipeline(slot.pipeline, None);
                    }
                    if slot.layout != vk::PipelineLayout::null() {
                        device.destroy_pipeline_layout(slot.layout, None);
                    }
                }
            }
        };
        destroy(&self.graphics_pipelines);
        destroy(&self.compute_pipelines);

        unsafe {
            self.core.raw().destroy_pipeline_cache(self.pipeline_cache, None);
        }
    }
}

fn build_pipeline_layout(
    core: &DeviceCore,
    bindless_layout: vk::DescriptorSetLayout,
    push_constant_size: u32,
    stages: vk::ShaderStageFlags,
) -> GfxResult<vk::PipelineLayout> {
    let set_layouts = [bindless_layout];
    let push_size = push_constant_size.min(MAX_ROOT_CONSTANT_BYTES);
    let push_ranges = [vk::PushConstantRange {
        stage_flags: stages,
        offset: 0,
        size: push_size,
    }];

    let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    if push_size > 0 {
        layout_info = layout_info.push_constant_ranges(&push_ranges);
    }

    unsafe {
        core.raw()
            .create_pipeline_layout(&layout_info, None)
            .map_err(GraphicsError::Api)
    }
}

type BuiltPipeline = (vk::Pipeline, vk::PipelineLayout, vk::ShaderStageFlags);

fn build_graphics_pipeline(
    core: &DeviceCore,
    library: &ShaderLibrary,
    bindless_layout: vk::DescriptorSetLayout,
    cache: vk::PipelineCache,
    request: &GraphicsPipelineRequest,
) -> GfxResult<BuiltPipeline> {
    let desc = &request.desc;

    let vertex_handle = library.get_shader(&desc.vertex_shader, &request.defines);
    let fragment_handle = desc
        .fragment_shader
        .as_ref()
        .map(|name| library.get_shader(name, &request.defines));

    library.completion_wait_group(vertex_handle).wait();
    if let Some(handle) = fragment_handle {
        library.completion_wait_group(handle).wait();
    }

    let (vertex_module, vertex_entry) = library.module_info(vertex_handle)?;
    let vertex_reflection = library.reflection(vertex_handle)?;
    debug_assert_eq!(vertex_reflection.stage, ShaderStage::Vertex);

    let mut push_constant_size = vertex_reflection.push_constant_size;
    let mut stage_flags = vk::ShaderStageFlags::VERTEX;

    let fragment_info = match fragment_handle {
        Some(handle) => {
            let (module, entry) = library.module_info(handle)?;
            let reflection = library.reflection(handle)?;
            push_constant_size = push_constant_size.max(reflection.push_constant_size);
            stage_flags |= vk::ShaderStageFlags::FRAGMENT;
            Some((module, entry))
        }
        None => None,
    };

    let layout = build_pipeline_layout(core, bindless_layout, push_constant_size, stage_flags)?;

    let (spec_entries, spec_data) = request.specialization.build_vk();
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data)
        .build();

    let vertex_entry_c = std::ffi::CString::new(vertex_entry).unwrap();
    let mut stages = vec![vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vertex_module)
        .name(&vertex_entry_c)
        .specialization_info(&spec_info)
        .build()];

    let fragment_entry_c;
    if let Some((module, entry)) = fragment_info {
        fragment_entry_c = std::ffi::CString::new(entry).unwrap();
        stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(&fragment_entry_c)
                .specialization_info(&spec_info)
                .build(),
        );
    }

    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .input_layout
        .streams
        .iter()
        .enumerate()
        .map(|(index, stream)| vk::VertexInputBindingDescription {
            binding: index as u32,
            stride: stream.stride,
            input_rate: if stream.per_instance {
                vk::VertexInputRate::INSTANCE
            } else {
                vk::VertexInputRate::VERTEX
            },
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .input_layout
        .attributes
        .iter()
        .map(|attribute| vk::VertexInputAttributeDescription {
            location: attribute.location,
            binding: attribute.binding,
            format: attribute.format,
            offset: attribute.offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.input_layout.topology.to_vk());

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(if desc.rasterizer.wireframe {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        })
        .cull_mode(match desc.rasterizer.cull {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::Front => vk::CullModeFlags::FRONT,
        })
        .front_face(if desc.rasterizer.front_ccw {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        })
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_stencil.depth_test)
        .depth_write_enable(desc.depth_stencil.depth_write)
        .depth_compare_op(desc.depth_stencil.compare);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_formats
        .iter()
        .enumerate()
        .map(|(index, _)| {
            desc.blend
                .get(index)
                .copied()
                .unwrap_or_default()
                .to_vk()
        })
        .collect();
    let blend_state =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let mut rendering_info = vk::PipelineRenderingCreateInfoKHR::builder()
        .color_attachment_formats(&desc.color_formats)
        .depth_attachment_format(desc.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        core.raw()
            .create_graphics_pipelines(cache, &[create_info.build()], None)
            .map_err(|(_, result)| GraphicsError::Api(result))?
    };

    Ok((pipelines[0], layout, stage_flags))
}

fn build_compute_pipeline(
    core: &DeviceCore,
    library: &ShaderLibrary,
    bindless_layout: vk::DescriptorSetLayout,
    cache: vk::PipelineCache,
    request: &ComputePipelineRequest,
) -> GfxResult<BuiltPipeline> {
    let handle = library.get_shader(&request.desc.compute_shader, &request.defines);
    library.completion_wait_group(handle).wait();

    let (module, entry) = library.module_info(handle)?;
    let reflection = library.reflection(handle)?;
    debug_assert_eq!(reflection.stage, ShaderStage::Compute);

    let stage_flags = vk::ShaderStageFlags::COMPUTE;
    let layout = build_pipeline_layout(core, bindless_layout, reflection.push_constant_size, stage_flags)?;

    let (spec_entries, spec_data) = request.specialization.build_vk();
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data)
        .build();

    let entry_c = std::ffi::CString::new(entry).unwrap();
    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry_c)
        .specialization_info(&spec_info)
        .build();

    let create_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout);

    let pipelines = unsafe {
        core.raw()
            .create_compute_pipelines(cache, &[create_info.build()], None)
            .map_err(|(_, result)| GraphicsError::Api(result))?
    };

    Ok((pipelines[0], layout, stage_flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request(define_value: &str, spec: SpecializationValues) -> GraphicsPipelineRequest {
        GraphicsPipelineRequest {
            name: "test".to_string(),
            desc: GraphicsPipelineDesc {
                vertex_shader: "fullscreen_vs".to_string(),
                fragment_shader: Some("tonemap_ps".to_string()),
                input_layout: InputLayoutDesc::default(),
                rasterizer: RasterizerDesc::default(),
                depth_stencil: DepthStencilDesc::default(),
                blend: vec![BlendMode::Opaque],
                color_formats: vec![vk::Format::R8G8B8A8_UNORM],
                depth_format: None,
            },
            defines: ShaderDefines::new().with("FEATURE_X", define_value),
            specialization: spec,
        }
    }

    #[test]
    fn test_equal_requests_hash_equal() {
        let a = test_request("1", SpecializationValues::new());
        let b = test_request("1", SpecializationValues::new());
        assert_eq!(a.hash64(), b.hash64());
    }

    #[test]
    fn test_defines_change_pipeline_key() {
        let a = test_request("0", SpecializationValues::new());
        let b = test_request("1", SpecializationValues::new());
        assert_ne!(a.hash64(), b.hash64());
    }

    #[test]
    fn test_spec_constants_change_pipeline_key_only() {
        let a = test_request("1", SpecializationValues::new().with(0, 0));
        let b = test_request("1", SpecializationValues::new().with(0, 1));
        assert_ne!(a.hash64(), b.hash64());
        // The shader-module key (name, defines) is untouched by spec values.
        assert_eq!(a.defines, b.defines);
    }

    #[test]
    fn test_pending_pipeline_has_no_native() {
        let pipeline = Pipeline::new_pending("pending", vk::PipelineBindPoint::GRAPHICS);
        assert!(!pipeline.is_ready());
        assert!(!pipeline.is_failed());
        assert!(pipeline.native().is_none());
    }

    #[test]
    fn test_failed_pipeline_signals() {
        let pipeline = Pipeline::new_pending("broken", vk::PipelineBindPoint::GRAPHICS);
        pipeline.fail();
        assert!(pipeline.wait_group().is_signaled());
        assert!(pipeline.is_failed());
        assert!(pipeline.native().is_none());
    }

    #[test]
    fn test_specialization_data_layout() {
        let values = SpecializationValues::new().with(7, 0xDEAD).with(2, 5);
        let (entries, data) = values.build_vk();
        assert_eq!(entries.len(), 2);
        // Sorted by constant id, packed at 4-byte strides.
        assert_eq!(entries[0].constant_id, 2);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].constant_id, 7);
        assert_eq!(entries[1].offset, 4);
        assert_eq!(data.len(), 8);
        assert_eq!(&data[0..4], &5u32.to_le_bytes());
        assert_eq!(&data[4..8], &0xDEADu32.to_le_bytes());
    }
}
