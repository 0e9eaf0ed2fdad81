//! Graphics runtime assembly
//!
//! Wires the device and every subsystem together with plain constructor
//! injection and drives the per-frame sequence: wait for the oldest frame,
//! rotate the bindless set, build and execute the frame graph, close the
//! frame and present. There is no process-wide state; the runtime object is
//! the service registry.

use std::sync::Arc;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::bindless::BindlessManager;
use crate::config::GraphicsConfig;
use crate::device::{Device, DeviceFactory, GraphicsQueue};
use crate::error::{GfxResult, PresentOutcome};
use crate::frame_graph::{FrameGraph, FrameGraphResourcePool};
use crate::geometry::GeometryPool;
use crate::jobs::JobSystem;
use crate::pipeline::PipelineFactory;
use crate::resource::ResourcePool;
use crate::shader::{ShaderLibrary, ShaderSourceProvider};
use crate::sync::SyncPoint;
use crate::transfer::AsyncCopyQueue;
use crate::viewport::{Viewport, ViewportDesc};

/// The assembled graphics device runtime
pub struct GraphicsRuntime {
    device: Device,
    resource_pool: Arc<ResourcePool>,
    jobs: Arc<JobSystem>,
    shader_library: Arc<ShaderLibrary>,
    bindless: BindlessManager,
    pipeline_factory: PipelineFactory,
    copy_queue: Arc<AsyncCopyQueue>,
    geometry_pool: GeometryPool,
    graphics_queue: GraphicsQueue,
    frame_graph: FrameGraph,
    frame_open: bool,
}

impl GraphicsRuntime {
    /// Bootstrap the full runtime.
    ///
    /// `display` supplies the surface instance extensions when presenting;
    /// headless tools pass `None`. Shader byte code is pulled through
    /// `shader_provider`.
    pub fn new(
        config: &GraphicsConfig,
        shader_provider: Arc<dyn ShaderSourceProvider>,
        display: Option<RawDisplayHandle>,
    ) -> GfxResult<Self> {
        config.validate()?;

        let factory = DeviceFactory::new(config, display)?;
        let device = Device::new(factory, config)?;
        let core = device.core();

        let resource_pool = Arc::new(ResourcePool::new(Arc::clone(&core)));

        let worker_count = std::thread::available_parallelism()
            .map(|count| count.get().saturating_sub(1))
            .unwrap_or(2)
            .max(1);
        let jobs = Arc::new(JobSystem::new(worker_count));

        let shader_library = Arc::new(ShaderLibrary::new(
            Arc::clone(&core),
            shader_provider,
            Arc::clone(&jobs),
        ));

        let bindless = BindlessManager::new(Arc::clone(&core))?;
        let pipeline_factory = PipelineFactory::new(
            Arc::clone(&core),
            &bindless,
            Arc::clone(&shader_library),
            Arc::clone(&jobs),
        )?;

        let copy_queue = Arc::new(AsyncCopyQueue::new(
            Arc::clone(&core),
            &resource_pool,
            config.async_copy.staging_bytes,
        )?);
        let geometry_pool = GeometryPool::new(Arc::clone(&resource_pool), Arc::clone(&copy_queue));

        let graphics_queue = GraphicsQueue::new(Arc::clone(&core))?;
        let frame_graph = FrameGraph::new(FrameGraphResourcePool::new(Box::new(Arc::clone(
            &resource_pool,
        ))));

        Ok(Self {
            device,
            resource_pool,
            jobs,
            shader_library,
            bindless,
            pipeline_factory,
            copy_queue,
            geometry_pool,
            graphics_queue,
            frame_graph,
            frame_open: false,
        })
    }

    /// Create a viewport presenting to the given window
    pub fn create_viewport(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        desc: ViewportDesc,
    ) -> GfxResult<Viewport> {
        Viewport::new(self.device.core(), display, window, desc)
    }

    /// The device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The resource pool
    pub fn resource_pool(&self) -> &Arc<ResourcePool> {
        &self.resource_pool
    }

    /// The shader library
    pub fn shader_library(&self) -> &Arc<ShaderLibrary> {
        &self.shader_library
    }

    /// The pipeline factory
    pub fn pipeline_factory(&self) -> &PipelineFactory {
        &self.pipeline_factory
    }

    /// The async copy queue
    pub fn copy_queue(&self) -> &Arc<AsyncCopyQueue> {
        &self.copy_queue
    }

    /// The geometry pool
    pub fn geometry_pool(&mut self) -> &mut GeometryPool {
        &mut self.geometry_pool
    }

    /// The bindless manager
    pub fn bindless(&mut self) -> &mut BindlessManager {
        &mut self.bindless
    }

    /// The frame graph of the current frame
    pub fn frame_graph(&mut self) -> &mut FrameGraph {
        &mut self.frame_graph
    }

    /// The background job system
    pub fn jobs(&self) -> &Arc<JobSystem> {
        &self.jobs
    }

    /// Open a frame: recycle the oldest frame's command buffer, rotate the
    /// bindless set and reset the frame graph for setup.
    pub fn begin_frame(&mut self) -> GfxResult<()> {
        debug_assert!(!self.frame_open, "begin_frame called twice");

        self.graphics_queue.wait_for_previous_frame()?;

        let protect = SyncPoint::new(
            self.graphics_queue.fence(),
            self.graphics_queue.next_signal_value(),
        );
        self.bindless.begin_frame(protect)?;

        self.frame_graph.begin_frame();
        self.graphics_queue.current_command_buffer().begin()?;
        self.frame_open = true;
        Ok(())
    }

    /// Close the frame: compile and execute the graph, submit, present when
    /// a viewport is given, and advance the deferred-destroy tick.
    pub fn end_frame(&mut self, viewport: Option<&mut Viewport>) -> GfxResult<PresentOutcome> {
        debug_assert!(self.frame_open, "end_frame without begin_frame");

        self.frame_graph.compile()?;

        let cmd = self.graphics_queue.current_command_buffer();
        self.frame_graph
            .execute(cmd, &mut self.bindless, &self.geometry_pool)?;

        let close = self.graphics_queue.close_frame();
        let cmd = self.graphics_queue.current_command_buffer();
        cmd.enqueue_fence_to_signal(close);

        let outcome = match viewport {
            Some(viewport) => viewport.present(cmd)?,
            None => {
                cmd.submit()?;
                PresentOutcome::Ok
            }
        };

        self.device.end_frame();
        self.frame_open = false;
        Ok(outcome)
    }

    /// Drain every queue and tear the runtime down in dependency order.
    /// Leaked resources are reported by the device at the end.
    ///
    /// Viewports hold registered swapchain render targets; drop them before
    /// calling this or they will be reported as leaks.
    pub fn shutdown(self) -> GfxResult<()> {
        let Self {
            device,
            resource_pool,
            jobs,
            shader_library,
            bindless,
            pipeline_factory,
            copy_queue,
            geometry_pool,
            graphics_queue,
            frame_graph,
            frame_open: _,
        } = self;

        copy_queue.drain()?;
        pipeline_factory.wait_all();

        drop(frame_graph);
        drop(geometry_pool);
        drop(copy_queue);
        drop(pipeline_factory);
        drop(shader_library);
        drop(bindless);
        drop(graphics_queue);
        drop(resource_pool);
        drop(jobs);

        device.shutdown()
    }
}
