//! # Render Engine
//!
//! A bindless, frame-graph driven Vulkan rendering runtime.
//!
//! ## Features
//!
//! - **Frame graph**: passes declare reads and writes through versioned
//!   handles; resource lifetimes, transient aliasing and pipeline barriers
//!   are derived automatically
//! - **Bindless resources**: one giant descriptor set; shaders address
//!   textures and samplers with plain 32-bit indices
//! - **Timeline synchronization**: a single fence abstraction spans queues
//!   and CPU jobs
//! - **Async uploads**: a dedicated copy thread streams geometry and texture
//!   data through a staging ring with cross-queue ownership transfer
//! - **Async pipelines**: graphics and compute pipelines compile on a worker
//!   pool against a shared pipeline cache, deduplicated by request hash
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use render_engine::prelude::*;
//!
//! struct FileShaders;
//!
//! impl ShaderSourceProvider for FileShaders {
//!     fn load(&self, name: &str, _defines: &ShaderDefines) -> GfxResult<Vec<u8>> {
//!         std::fs::read(format!("shaders/{name}.spv"))
//!             .map_err(|e| GraphicsError::Shader(e.to_string()))
//!     }
//! }
//!
//! fn main() -> GfxResult<()> {
//!     render_engine::logging::init();
//!     let config = GraphicsConfig::default();
//!     let mut runtime = GraphicsRuntime::new(&config, Arc::new(FileShaders), None)?;
//!
//!     runtime.begin_frame()?;
//!     // ... declare frame graph passes ...
//!     runtime.end_frame(None)?;
//!
//!     runtime.shutdown()
//! }
//! ```

#![warn(missing_docs)]

pub mod bindless;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod frame_graph;
pub mod geometry;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod resource;
pub mod runtime;
pub mod shader;
pub mod sync;
pub mod transfer;
pub mod viewport;

pub use config::GraphicsConfig;
pub use error::{GfxResult, GraphicsError, PresentOutcome};
pub use runtime::GraphicsRuntime;

/// Common imports for runtime users
pub mod prelude {
    pub use crate::bindless::BindlessManager;
    pub use crate::command::{BufferAccess, ImageAccess};
    pub use crate::config::GraphicsConfig;
    pub use crate::device::{Device, QueueKind};
    pub use crate::error::{GfxResult, GraphicsError, PresentOutcome};
    pub use crate::frame_graph::{
        BufferHandle, DrawArguments, DrawCall, DrawList, FrameGraph, FrameGraphContext,
        ImageHandle, LoadOp, RenderTargetLoadOperations, RenderTargetStoreOperations, ScissorRect,
        StoreOp, ViewportRect,
    };
    pub use crate::geometry::{GeometryAllocationDesc, GeometryHandle, GeometryPool, StreamData};
    pub use crate::jobs::{JobSystem, WaitGroup};
    pub use crate::pipeline::{
        ComputePipelineDesc, ComputePipelineRequest, GraphicsPipelineDesc, GraphicsPipelineRequest,
        Pipeline, PipelineFactory, SpecializationValues,
    };
    pub use crate::resource::{
        Buffer, BufferDesc, BufferUsage, ImageDesc, ImageSubresource, RenderTarget, ResourcePool,
        SamplerState, Texture,
    };
    pub use crate::runtime::GraphicsRuntime;
    pub use crate::shader::{ShaderDefines, ShaderLibrary, ShaderSourceProvider};
    pub use crate::sync::{Fence, SyncPoint};
    pub use crate::transfer::{AsyncCopyCommandList, AsyncCopyQueue};
    pub use crate::viewport::{Viewport, ViewportDesc};
}
