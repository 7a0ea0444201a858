// =============================================================================
// WINDOWED COMMANDS - window, surface and clear
// =============================================================================
//
// FRAME FLOW (clear):
// 1. Acquire swapchain image (signals image_available)
// 2. Reset the fence, submit the pre-recorded clear for that image
// 3. Wait for the fence (bounded, a timeout is fatal)
// 4. Present (waits on render_finished)
//
// Window callbacks cannot return errors, so the first fatal one is kept on
// the App, the event loop exits, and `run` hands it back to main.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle_05::HasRawDisplayHandle,
    window::{Window, WindowAttributes, WindowId},
};

use crate::backend::command::{self, CommandPool};
use crate::backend::device::{presentation_family, PhysicalDeviceInfo};
use crate::backend::render_pass::{Framebuffers, RenderPass};
use crate::backend::swapchain::SwapchainSettings;
use crate::backend::sync::FrameSync;
use crate::backend::{Surface, Swapchain, VulkanDevice, VulkanInstance};
use crate::config::Config;
use crate::report;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Just the window
    Window,
    /// Window, surface and device, report what the surface supports, then exit
    Surface,
    /// The full clear and present loop
    Clear,
}

/// Open the window and drive the event loop for `mode`
pub fn run(config: Config, mode: RunMode) -> Result<()> {
    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config, mode);
    event_loop
        .run_app(&mut app)
        .context("Event loop terminated abnormally")?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// True once `presented` frames satisfy the configured limit
pub fn frame_limit_reached(presented: u64, limit: Option<u64>) -> bool {
    limit.is_some_and(|limit| presented >= limit)
}

/// Poll while frames are being presented, wait for events while minimized
pub fn control_flow(minimized: bool) -> ControlFlow {
    if minimized {
        ControlFlow::Wait
    } else {
        ControlFlow::Poll
    }
}

pub fn fps_title(title: &str, fps: f32, frame_time: Duration) -> String {
    format!(
        "{} - {:.0} FPS ({:.2}ms)",
        title,
        fps,
        frame_time.as_secs_f32() * 1000.0
    )
}

// =============================================================================
// RENDERER
// =============================================================================

/// Everything the clear loop owns.
///
/// Field order is drop order: sync objects, command pool, framebuffers,
/// render pass, swapchain, surface, device.
struct Renderer {
    sync: FrameSync,
    command_pool: CommandPool,
    /// One per swapchain image, recorded once
    command_buffers: Vec<vk::CommandBuffer>,
    framebuffers: Option<Framebuffers>,
    render_pass: RenderPass,
    swapchain: Option<Swapchain>,
    surface: Surface,
    device: Arc<VulkanDevice>,

    settings: SwapchainSettings,
    clear_color: vk::ClearColorValue,
    fence_timeout: Duration,
    wait_stages: [vk::PipelineStageFlags; 1],

    /// Set by resize, out-of-date or suboptimal results
    needs_recreate: bool,
    /// Zero-sized window, nothing to render to
    minimized: bool,
}

impl Renderer {
    fn new(config: &Config, window: &Window) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let instance = VulkanInstance::new(
            &config.application,
            config.enable_validation(),
            Some(window.raw_display_handle()),
        )?;
        let surface = Surface::new(instance.clone(), window)?;
        let device = VulkanDevice::new(instance, config.device_selection(), Some(&surface))?;

        let size = window.inner_size();
        let settings = SwapchainSettings {
            width: size.width,
            height: size.height,
            present_mode: config.get_present_mode(),
            min_image_count: config.graphics.min_image_count,
        };

        let swapchain = Swapchain::new(device.clone(), &surface, settings)?;
        let render_pass = RenderPass::new(device.clone(), swapchain.format.format)?;
        let framebuffers = Framebuffers::new(
            device.clone(),
            &render_pass,
            &swapchain.image_views,
            swapchain.extent,
        )?;

        let command_pool = CommandPool::new(device.clone())?;
        let command_buffers = command_pool.allocate(swapchain.images.len() as u32)?;
        let sync = FrameSync::new(device.clone())?;

        let renderer = Self {
            sync,
            command_pool,
            command_buffers,
            framebuffers: Some(framebuffers),
            render_pass,
            swapchain: Some(swapchain),
            surface,
            device,
            settings,
            clear_color: config.clear_color(),
            fence_timeout: config.fence_timeout(),
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            needs_recreate: false,
            minimized: false,
        };
        renderer.record_command_buffers()?;

        log::info!(
            "Vulkan initialized successfully! Presenting with {:?}",
            renderer.swapchain.as_ref().map(|s| s.present_mode)
        );
        Ok(renderer)
    }

    /// Pre-record one clear pass per swapchain image
    fn record_command_buffers(&self) -> Result<()> {
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let framebuffers = self
            .framebuffers
            .as_ref()
            .context("Framebuffers not initialized")?;

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let framebuffer = framebuffers
                .get(i)
                .with_context(|| format!("No framebuffer for swapchain image {}", i))?;
            command::record_clear_pass(
                &self.device.device,
                cmd,
                self.render_pass.render_pass,
                framebuffer,
                swapchain.extent,
                self.clear_color,
            )?;
        }

        log::info!(
            "Recorded {} clear command buffers",
            self.command_buffers.len()
        );
        Ok(())
    }

    /// Rebuild swapchain, image views, framebuffers and command buffers
    fn recreate_swapchain(&mut self, size: PhysicalSize<u32>) -> Result<()> {
        if size.width == 0 || size.height == 0 {
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;

        self.device.wait_idle()?;

        // The surface can only have one swapchain at a time
        self.framebuffers = None;
        self.command_pool.free(&std::mem::take(&mut self.command_buffers));
        self.swapchain = None;

        self.settings.width = size.width;
        self.settings.height = size.height;
        let swapchain = Swapchain::new(self.device.clone(), &self.surface, self.settings)?;

        if swapchain.format.format != self.render_pass.format {
            log::info!(
                "Surface format changed to {:?}, rebuilding render pass",
                swapchain.format.format
            );
            self.render_pass = RenderPass::new(self.device.clone(), swapchain.format.format)?;
        }

        self.framebuffers = Some(Framebuffers::new(
            self.device.clone(),
            &self.render_pass,
            &swapchain.image_views,
            swapchain.extent,
        )?);
        self.command_buffers = self
            .command_pool
            .allocate(swapchain.images.len() as u32)?;
        self.swapchain = Some(swapchain);
        self.record_command_buffers()?;

        self.needs_recreate = false;
        Ok(())
    }

    /// Render and present one frame. Returns false when nothing was presented.
    fn render_frame(&mut self, size: PhysicalSize<u32>) -> Result<bool> {
        if self.needs_recreate || self.minimized {
            self.recreate_swapchain(size)?;
        }
        if self.minimized {
            return Ok(false);
        }

        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;

        // STEP 1: Acquire next swapchain image
        let image_index = match swapchain.acquire_next_image(u64::MAX, self.sync.image_available)? {
            Some((index, suboptimal)) => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                index
            }
            None => {
                log::debug!("Swapchain out of date on acquire");
                self.needs_recreate = true;
                return Ok(false);
            }
        };

        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .with_context(|| format!("No command buffer for swapchain image {}", image_index))?;

        // STEP 2: Submit the pre-recorded clear
        self.sync.reset_fence()?;

        let wait_semaphores = [self.sync.image_available];
        let signal_semaphores = [self.sync.render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                self.sync.in_flight_fence,
            )
        }
        .context("Failed to submit command buffer")?;

        // STEP 3: Wait for the GPU, bounded
        self.sync.wait_fence(self.fence_timeout)?;

        // STEP 4: Present
        if swapchain.present(self.device.graphics_queue, image_index, &signal_semaphores)? {
            self.needs_recreate = true;
        }

        Ok(true)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be in use when the fields start dropping
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}

/// Create the presentation stack for `window` and report what the surface supports
fn report_surface(config: &Config, window: &Window) -> Result<()> {
    let instance = VulkanInstance::new(
        &config.application,
        config.enable_validation(),
        Some(window.raw_display_handle()),
    )?;
    let surface = Surface::new(instance.clone(), window)?;
    // Present support is reported, not required
    let device = VulkanDevice::new(instance.clone(), config.device_selection(), None)?;
    let info = PhysicalDeviceInfo::query(&instance.instance, device.physical_device)?;

    let mut support_error = None;
    let family = presentation_family(&info.queue_families, |family| {
        match surface.supports_queue_family(device.physical_device, family) {
            Ok(supported) => supported,
            Err(e) => {
                support_error.get_or_insert(e);
                false
            }
        }
    });
    if let Some(e) = support_error {
        return Err(e);
    }
    let (queue_family, present_supported) =
        family.context("Selected GPU has no graphics queue family")?;
    let support = surface.support(device.physical_device)?;

    let mut out = std::io::stdout().lock();
    report::write_surface(&mut out, queue_family, present_supported, &support)?;

    drop(device);
    drop(surface);
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    mode: RunMode,

    // Dropped before the window it renders into
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    /// First fatal error, returned from `run`
    error: Option<anyhow::Error>,

    frames_presented: u64,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config, mode: RunMode) -> Self {
        let now = Instant::now();
        Self {
            config,
            mode,
            renderer: None,
            window: None,
            error: None,
            frames_presented: 0,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time);
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&fps_title(&self.config.window.title, fps, frame_time));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return;
        };

        match renderer.render_frame(window.inner_size()) {
            Ok(true) => {
                self.frames_presented += 1;
                self.update_fps();
                if frame_limit_reached(self.frames_presented, self.config.graphics.frame_limit) {
                    log::info!("Presented {} frame(s), exiting", self.frames_presented);
                    event_loop.exit();
                }
            }
            Ok(false) => {}
            Err(e) => self.fail(event_loop, e.context("Render error")),
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(self.config.window.resizable);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };
        log::info!(
            "Opened {}x{} window '{}'",
            self.config.window.width,
            self.config.window.height,
            self.config.window.title
        );

        match self.mode {
            RunMode::Window => {
                event_loop.set_control_flow(ControlFlow::Wait);
            }
            RunMode::Surface => {
                if let Err(e) = report_surface(&self.config, &window) {
                    self.fail(event_loop, e);
                    return;
                }
                event_loop.exit();
            }
            RunMode::Clear => {
                // A zero frame limit still builds the whole pipeline
                if frame_limit_reached(0, self.config.graphics.frame_limit) {
                    event_loop.exit();
                }
                match Renderer::new(&self.config, &window) {
                    Ok(renderer) => {
                        event_loop.set_control_flow(control_flow(false));
                        self.renderer = Some(renderer);
                    }
                    Err(e) => {
                        self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                        return;
                    }
                }
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    if size.width == 0 || size.height == 0 {
                        renderer.minimized = true;
                    } else {
                        renderer.minimized = false;
                        renderer.needs_recreate = true;
                    }
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            _ => {}
        }
    }

    /// Keep redrawing as fast as presentation allows, sleep while minimized
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (self.renderer.as_ref(), self.window.as_ref()) else {
            return;
        };
        let size = window.inner_size();
        let minimized = renderer.minimized && (size.width == 0 || size.height == 0);

        event_loop.set_control_flow(control_flow(minimized));
        if !minimized {
            window.request_redraw();
        }
    }
}
