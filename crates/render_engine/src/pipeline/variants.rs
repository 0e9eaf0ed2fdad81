//! Pipeline variant sets
//!
//! A variant set enumerates every (define, specialization) permutation of a
//! pipeline family so the whole registry can be compiled up front to warm
//! the pipeline cache. The registry is a plain injected object handed to the
//! subsystems that need it; there is no process-wide list.

use std::sync::Arc;

use crate::pipeline::{
    ComputePipelineRequest, GraphicsPipelineRequest, Pipeline, PipelineFactory,
};

/// A graphics or compute pipeline request produced by a variant set
#[derive(Debug, Clone)]
pub enum PipelineRequest {
    /// Graphics pipeline permutation
    Graphics(GraphicsPipelineRequest),
    /// Compute pipeline permutation
    Compute(ComputePipelineRequest),
}

/// A compiled (or pending) pipeline variant
#[derive(Clone)]
pub enum PipelineVariant {
    /// Graphics pipeline
    Graphics(Arc<Pipeline>),
    /// Compute pipeline
    Compute(Arc<Pipeline>),
}

impl PipelineVariant {
    /// The wrapped pipeline regardless of kind
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        match self {
            PipelineVariant::Graphics(pipeline) | PipelineVariant::Compute(pipeline) => pipeline,
        }
    }
}

/// Enumerates the permutations of one pipeline family
pub trait PipelineVariantSet: Send {
    /// Number of permutations
    fn variant_count(&self) -> u32;

    /// Permutations excluded from compile-all (e.g. invalid combinations)
    fn is_variant_discarded(&self, _variant_index: u32) -> bool {
        false
    }

    /// Build the request for one permutation
    fn build_request(&self, variant_index: u32) -> PipelineRequest;
}

/// Identifier of a registered variant set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSetId(usize);

struct RegisteredSet {
    set: Box<dyn PipelineVariantSet>,
    variants: Vec<Option<PipelineVariant>>,
}

/// Registry of every variant set known to the application
#[derive(Default)]
pub struct PipelineSetRegistry {
    sets: Vec<RegisteredSet>,
}

impl PipelineSetRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant set
    pub fn register(&mut self, set: Box<dyn PipelineVariantSet>) -> PipelineSetId {
        let variants = vec![None; set.variant_count() as usize];
        self.sets.push(RegisteredSet { set, variants });
        PipelineSetId(self.sets.len() - 1)
    }

    /// Schedule compilation of every non-discarded permutation
    pub fn compile_all(&mut self, factory: &PipelineFactory) {
        self.compile_all_with(|request| match request {
            PipelineRequest::Graphics(request) => {
                PipelineVariant::Graphics(factory.create_graphics_pipeline(request))
            }
            PipelineRequest::Compute(request) => {
                PipelineVariant::Compute(factory.create_compute_pipeline(request))
            }
        });
    }

    /// Compile through an arbitrary resolver; the factory-based path above
    /// delegates here
    pub fn compile_all_with(&mut self, mut compile: impl FnMut(&PipelineRequest) -> PipelineVariant) {
        for registered in &mut self.sets {
            for variant_index in 0..registered.set.variant_count() {
                if registered.set.is_variant_discarded(variant_index) {
                    continue;
                }
                if registered.variants[variant_index as usize].is_some() {
                    continue;
                }
                let request = registered.set.build_request(variant_index);
                registered.variants[variant_index as usize] = Some(compile(&request));
            }
        }
    }

    /// Block until every compiled variant's wait group signals
    pub fn wait_all(&self) {
        for registered in &self.sets {
            for variant in registered.variants.iter().flatten() {
                variant.pipeline().wait_group().wait();
            }
        }
    }

    /// Look up a compiled variant
    pub fn variant(&self, set: PipelineSetId, variant_index: u32) -> Option<&PipelineVariant> {
        self.sets
            .get(set.0)?
            .variants
            .get(variant_index as usize)?
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        BlendMode, DepthStencilDesc, GraphicsPipelineDesc, InputLayoutDesc, RasterizerDesc,
        SpecializationValues,
    };
    use crate::shader::ShaderDefines;
    use ash::vk;

    struct FeatureToggleSet;

    impl PipelineVariantSet for FeatureToggleSet {
        fn variant_count(&self) -> u32 {
            3
        }

        fn is_variant_discarded(&self, variant_index: u32) -> bool {
            variant_index == 2
        }

        fn build_request(&self, variant_index: u32) -> PipelineRequest {
            PipelineRequest::Graphics(GraphicsPipelineRequest {
                name: format!("toggle_{variant_index}"),
                desc: GraphicsPipelineDesc {
                    vertex_shader: "mesh_vs".to_string(),
                    fragment_shader: Some("mesh_ps".to_string()),
                    input_layout: InputLayoutDesc::default(),
                    rasterizer: RasterizerDesc::default(),
                    depth_stencil: DepthStencilDesc::default(),
                    blend: vec![BlendMode::Opaque],
                    color_formats: vec![vk::Format::R8G8B8A8_UNORM],
                    depth_format: None,
                },
                defines: ShaderDefines::new().with("FEATURE_X", &variant_index.to_string()),
                specialization: SpecializationValues::new(),
            })
        }
    }

    fn dummy_variant(request: &PipelineRequest) -> PipelineVariant {
        let name = match request {
            PipelineRequest::Graphics(request) => request.name.clone(),
            PipelineRequest::Compute(request) => request.name.clone(),
        };
        let pipeline = Pipeline::new_pending(&name, vk::PipelineBindPoint::GRAPHICS);
        pipeline.fail(); // resolve immediately so wait_all terminates
        PipelineVariant::Graphics(pipeline)
    }

    #[test]
    fn test_compile_all_skips_discarded() {
        let mut registry = PipelineSetRegistry::new();
        let id = registry.register(Box::new(FeatureToggleSet));

        let mut compiled = Vec::new();
        registry.compile_all_with(|request| {
            if let PipelineRequest::Graphics(request) = request {
                compiled.push(request.name.clone());
            }
            dummy_variant(request)
        });

        assert_eq!(compiled, vec!["toggle_0".to_string(), "toggle_1".to_string()]);
        assert!(registry.variant(id, 0).is_some());
        assert!(registry.variant(id, 1).is_some());
        assert!(registry.variant(id, 2).is_none());
    }

    #[test]
    fn test_compile_all_is_idempotent() {
        let mut registry = PipelineSetRegistry::new();
        registry.register(Box::new(FeatureToggleSet));

        let mut calls = 0;
        registry.compile_all_with(|request| {
            calls += 1;
            dummy_variant(request)
        });
        registry.compile_all_with(|request| {
            calls += 1;
            dummy_variant(request)
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_wait_all_returns_once_resolved() {
        let mut registry = PipelineSetRegistry::new();
        registry.register(Box::new(FeatureToggleSet));
        registry.compile_all_with(dummy_variant);
        registry.wait_all();
    }
}
