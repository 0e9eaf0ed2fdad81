//! Viewport and swapchain ownership
//!
//! Owns the surface, the swapchain, per-slot acquire and per-image present
//! binary semaphores, and render-target wrappers around the swapchain
//! images. Recreation is triggered by `ERROR_OUT_OF_DATE_KHR`, a suboptimal
//! present or an explicit resize; it drains the device, releases the old
//! targets and rebuilds everything.

use std::sync::Arc;

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::command::CommandBuffer;
use crate::device::DeviceCore;
use crate::error::{GfxResult, GraphicsError, PresentOutcome};
use crate::resource::{ImageDesc, ImageDimension, ImageUsage, RenderTarget};
use crate::sync::BinarySemaphore;

/// Viewport creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ViewportDesc {
    /// Initial width in pixels
    pub width: u32,
    /// Initial height in pixels
    pub height: u32,
    /// Prefer mailbox over FIFO presentation when available
    pub prefer_mailbox: bool,
}

/// Present surface with its swapchain and per-frame synchronization
pub struct Viewport {
    core: Arc<DeviceCore>,
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    desc: ViewportDesc,

    acquire_semaphores: Vec<BinarySemaphore>,
    present_semaphores: Vec<BinarySemaphore>,
    render_targets: Vec<Arc<RenderTarget>>,

    frame_slot: usize,
    image_index: u32,
    needs_recreate: bool,
}

impl Viewport {
    /// Create the surface and the initial swapchain
    pub fn new(
        core: Arc<DeviceCore>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        desc: ViewportDesc,
    ) -> GfxResult<Self> {
        let surface = unsafe {
            ash_window::create_surface(core.vk_entry(), core.instance(), display, window, None)
                .map_err(GraphicsError::Api)?
        };
        let surface_loader = khr::Surface::new(core.vk_entry(), core.instance());
        let swapchain_loader = khr::Swapchain::new(core.instance(), core.raw());

        let mut viewport = Self {
            core,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            desc,
            acquire_semaphores: Vec::new(),
            present_semaphores: Vec::new(),
            render_targets: Vec::new(),
            frame_slot: 0,
            image_index: 0,
            needs_recreate: false,
        };
        viewport.create_swapchain()?;
        Ok(viewport)
    }

    /// Viewport description (updated by `resize`)
    pub fn desc(&self) -> &ViewportDesc {
        &self.desc
    }

    /// Color format of the swapchain render targets
    pub fn color_format(&self) -> vk::Format {
        self.surface_format.format
    }

    /// Number of swapchain images
    pub fn render_target_count(&self) -> usize {
        self.render_targets.len()
    }

    /// Render target wrapping the image acquired this frame
    pub fn current_render_target(&self) -> Arc<RenderTarget> {
        Arc::clone(&self.render_targets[self.image_index as usize])
    }

    fn choose_surface_format(&self) -> GfxResult<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.core.physical_device, self.surface)
                .map_err(GraphicsError::Api)?
        };
        let preferred = formats.iter().find(|format| {
            format.format == vk::Format::B8G8R8A8_UNORM
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        });
        preferred
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| GraphicsError::InitializationFailed("surface reports no formats".to_string()))
    }

    fn choose_present_mode(&self) -> vk::PresentModeKHR {
        if !self.desc.prefer_mailbox {
            return vk::PresentModeKHR::FIFO;
        }
        let modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.core.physical_device, self.surface)
                .unwrap_or_default()
        };
        if modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        }
    }

    fn create_swapchain(&mut self) -> GfxResult<()> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.core.physical_device, self.surface)
                .map_err(GraphicsError::Api)?
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: self.desc.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: self.desc.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };
        self.desc.width = extent.width;
        self.desc.height = extent.height;

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        self.surface_format = self.choose_surface_format()?;
        let present_mode = self.choose_present_mode();
        let old_swapchain = self.swapchain;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        self.swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(GraphicsError::Api)?
        };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
        }

        let images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(self.swapchain)
                .map_err(GraphicsError::Api)?
        };

        self.render_targets.clear();
        for (index, image) in images.iter().enumerate() {
            let desc = ImageDesc {
                width: extent.width,
                height: extent.height,
                depth: 1,
                mip_levels: 1,
                array_layers: 1,
                format: self.surface_format.format,
                dimension: ImageDimension::Dim2D,
                usage: ImageUsage::COLOR_TARGET | ImageUsage::TRANSFER_SRC,
            };
            self.render_targets.push(RenderTarget::from_swapchain_image(
                Arc::clone(&self.core),
                &format!("swapchain_image_{index}"),
                desc,
                *image,
            )?);
        }

        let device = self.core.raw().clone();
        self.acquire_semaphores.clear();
        for _ in 0..self.core.frames_in_flight {
            self.acquire_semaphores.push(BinarySemaphore::new(device.clone())?);
        }
        self.present_semaphores.clear();
        for _ in 0..images.len() {
            self.present_semaphores.push(BinarySemaphore::new(device.clone())?);
        }

        log::info!(
            "swapchain created: {}x{} {:?}, {} images, {:?}",
            extent.width,
            extent.height,
            self.surface_format.format,
            images.len(),
            present_mode
        );
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> GfxResult<()> {
        self.core.wait_idle()?;
        // Old targets die immediately; the drain above covers their frames.
        self.render_targets.clear();
        self.create_swapchain()?;
        self.needs_recreate = false;
        Ok(())
    }

    /// Explicit resize (window event); rebuilds the swapchain now
    pub fn resize(&mut self, width: u32, height: u32) -> GfxResult<()> {
        self.desc.width = width;
        self.desc.height = height;
        self.recreate_swapchain()
    }

    /// Acquire the next swapchain image, recreating the swapchain if it has
    /// gone out of date
    pub fn acquire_next_image(&mut self) -> GfxResult<PresentOutcome> {
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        let semaphore = self.acquire_semaphores[self.frame_slot].handle();
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                self.image_index = index;
                if suboptimal {
                    self.needs_recreate = true;
                }
                Ok(PresentOutcome::Ok)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate_swapchain()?;
                Ok(PresentOutcome::NeedsRecreate)
            }
            Err(result) => Err(GraphicsError::Api(result)),
        }
    }

    /// Final submit of the frame plus the present call.
    ///
    /// Wires the acquire semaphore as a wait and the render-finished
    /// semaphore as a signal on `cmd`'s submission, then presents waiting on
    /// the latter. A failed present schedules recreation for the next frame.
    pub fn present(&mut self, cmd: &mut CommandBuffer) -> GfxResult<PresentOutcome> {
        let acquire = self.acquire_semaphores[self.frame_slot].handle();
        let render_finished = self.present_semaphores[self.image_index as usize].handle();

        cmd.enqueue_semaphore_to_wait(acquire, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        cmd.enqueue_semaphore_to_signal(render_finished);
        cmd.submit()?;

        let wait_semaphores = [render_finished];
        let swapchains = [self.swapchain];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.core.queue(crate::device::QueueKind::Graphics);
        let result = {
            let queue = queue.lock();
            unsafe { self.swapchain_loader.queue_present(*queue, &present_info) }
        };

        self.frame_slot = (self.frame_slot + 1) % self.acquire_semaphores.len();

        match result {
            Ok(false) => Ok(PresentOutcome::Ok),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                self.needs_recreate = true;
                Ok(PresentOutcome::NeedsRecreate)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_recreate = true;
                Ok(PresentOutcome::NeedsRecreate)
            }
            Err(result) => Err(GraphicsError::Api(result)),
        }
    }
}

impl Drop for Viewport {
    fn drop(&mut self) {
        let _ = self.core.wait_idle();
        self.render_targets.clear();
        unsafe {
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
