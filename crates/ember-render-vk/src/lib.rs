// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for `ember-render`.
//!
//! [`VkRenderer`] owns one [`DeviceContext`] and everything built on it: the
//! swapchain with its views and framebuffers, the render pass and pipeline,
//! the uploaded meshes, the per-image command buffers and the frame slots.
//! Command buffers are recorded once and re-recorded only when the swapchain
//! or the clear color changes.
use anyhow::{Context, Result};
use ash::vk;
use ember_render::{RenderSize, Renderer, SurfaceProvider};
use tracing::{debug, info, warn};

pub mod commands;
pub mod config;
pub mod context;
mod error;
pub mod frame;
pub mod memory;
pub mod mesh;
pub mod pipeline;
pub mod shader;
pub mod staging;
pub mod swapchain;
mod teardown;

pub use commands::CommandPool;
pub use config::{VkConfig, VkVsyncMode};
pub use context::DeviceContext;
pub use error::{VkError, VkResult};
pub use frame::PresentedFrame;
pub use memory::DeviceBuffer;
pub use mesh::{Mesh, MeshData, Vertex};
pub use staging::{read_back, upload_to_device_local};
pub use teardown::{release_offscreen, ShutdownStage, SHUTDOWN_ORDER};

use commands::{record_draw_commands, DrawTarget};
use frame::FrameController;
use pipeline::{MeshPipeline, RenderPass};
use shader::ShaderLibrary;
use swapchain::{Framebuffers, Swapchain};
use teardown::{release_in_order, PresentChain, TeardownLog};

// Field order is release order.
struct RendererState {
    frames: FrameController,
    pool: CommandPool,
    meshes: Vec<Mesh>,
    framebuffers: Framebuffers,
    pipeline: MeshPipeline,
    render_pass: RenderPass,
    swapchain: Swapchain,
    ctx: DeviceContext,
}

impl RendererState {
    // STRICT ORDER (init):
    //   pool -> meshes (staged uploads need the pool) -> swapchain -> render pass
    //   -> pipeline -> framebuffers -> per-image command buffers -> frame slots
    // Any `?` below drops what exists so far in reverse, then the context.
    fn build(
        ctx: DeviceContext,
        shaders: &ShaderLibrary,
        config: &VkConfig,
        size: RenderSize,
        scene: &[MeshData],
    ) -> VkResult<Self> {
        let mut pool = CommandPool::new(&ctx)?;
        let meshes = scene
            .iter()
            .map(|data| Mesh::upload(&ctx, &pool, data))
            .collect::<VkResult<Vec<_>>>()?;

        let swapchain = Swapchain::create(&ctx, size, config.vsync_mode, vk::SwapchainKHR::null())?;
        let render_pass = RenderPass::new(&ctx, swapchain.format())?;
        let pipeline = MeshPipeline::new(&ctx, shaders, &render_pass)?;
        let framebuffers = Framebuffers::new(&ctx, render_pass.handle(), &swapchain)?;
        pool.ensure_per_image(swapchain.image_count())?;
        let frames = FrameController::new(&ctx, config.frames_in_flight(), swapchain.image_count())?;

        let state = Self {
            frames,
            pool,
            meshes,
            framebuffers,
            pipeline,
            render_pass,
            swapchain,
            ctx,
        };
        state.record(config.clear_color)?;
        Ok(state)
    }

    /// Caller guarantees no command buffer is pending.
    fn record(&self, clear: [f32; 4]) -> VkResult<()> {
        let target = DrawTarget {
            render_pass: self.render_pass.handle(),
            framebuffers: self.framebuffers.handles(),
            extent: self.swapchain.extent(),
            pipeline: self.pipeline.handle(),
            clear,
        };
        record_draw_commands(self.ctx.device(), self.pool.per_image(), &target, &self.meshes)
    }

    // STRICT ORDER (recreate):
    //   1) device idle
    //   2) new swapchain from fresh surface caps, old handle passed for reuse;
    //      failing here leaves the old chain and its framebuffers untouched
    //   3) framebuffers (they reference the old views)
    //   4) old views + swapchain
    //   5) render pass + pipeline only if the format changed
    //   6) framebuffers, command buffers, re-record
    //   7) fresh frame slots (semaphores may still be tied to the old chain)
    // A failure past 2) leaves the recorded buffers unusable; the caller
    // keeps the surface marked stale so nothing is submitted until this succeeds.
    fn recreate(
        &mut self,
        shaders: &ShaderLibrary,
        config: &VkConfig,
        size: RenderSize,
    ) -> VkResult<()> {
        self.ctx.wait_idle();
        let fresh = Swapchain::create(&self.ctx, size, config.vsync_mode, self.swapchain.handle())?;

        self.framebuffers.clear();
        drop(std::mem::replace(&mut self.swapchain, fresh));

        if self.swapchain.format() != self.render_pass.format() {
            info!(
                "surface format changed {:?} -> {:?}; rebuilding pipeline",
                self.render_pass.format(),
                self.swapchain.format()
            );
            let render_pass = RenderPass::new(&self.ctx, self.swapchain.format())?;
            let pipeline = MeshPipeline::new(&self.ctx, shaders, &render_pass)?;
            self.pipeline = pipeline;
            self.render_pass = render_pass;
        }

        self.framebuffers = Framebuffers::new(&self.ctx, self.render_pass.handle(), &self.swapchain)?;
        self.pool.ensure_per_image(self.swapchain.image_count())?;
        self.record(config.clear_color)?;
        self.frames = FrameController::new(
            &self.ctx,
            config.frames_in_flight(),
            self.swapchain.image_count(),
        )?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameGate {
    Paused,
    Rebuild,
    Draw,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SurfaceState {
    // Zero-area framebuffer: nothing to present into.
    paused: bool,
    // Swapchain no longer matches the surface, or recorded buffers are invalid.
    stale: bool,
}

impl SurfaceState {
    fn new(size: RenderSize) -> Self {
        Self {
            paused: size.is_empty(),
            stale: false,
        }
    }

    fn resized(&mut self, size: RenderSize) {
        self.paused = size.is_empty();
        if !self.paused {
            self.stale = true;
        }
    }

    fn mark_stale(&mut self) {
        self.stale = true;
    }

    fn gate(&self) -> FrameGate {
        if self.paused {
            FrameGate::Paused
        } else if self.stale {
            FrameGate::Rebuild
        } else {
            FrameGate::Draw
        }
    }

    /// Folds in the result of a rebuild. Only success clears `stale`; a
    /// surface with no area yet skips the frame and retries next time.
    fn rebuilt(&mut self, outcome: VkResult<()>) -> VkResult<bool> {
        match outcome {
            Ok(()) => {
                self.stale = false;
                Ok(true)
            }
            Err(VkError::SwapchainStale) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub struct VkRenderer {
    state: Option<RendererState>,
    shaders: ShaderLibrary,
    config: VkConfig,
    size: RenderSize,
    surface: SurfaceState,
    last_frame: Option<PresentedFrame>,
    frames_presented: u64,
    teardown: TeardownLog,
}

impl VkRenderer {
    /// Like [`Renderer::new`] but draws `scene` instead of the demo quads.
    pub fn with_scene(
        surface: &dyn SurfaceProvider,
        config: VkConfig,
        scene: &[MeshData],
    ) -> Result<Self> {
        let size = surface.framebuffer_size();
        let display = surface.display_handle().context("display handle")?.as_raw();
        let window = surface.window_handle().context("window handle")?.as_raw();

        let ctx = unsafe { DeviceContext::for_window(display, window, config.validation)? };
        let shaders = ShaderLibrary::builtin()?;
        let state = RendererState::build(ctx, &shaders, &config, size, scene)
            .context("initialising Vulkan renderer")?;

        info!(
            "Vulkan renderer ready ({} meshes, {} frames in flight)",
            state.meshes.len(),
            config.frames_in_flight()
        );
        Ok(Self {
            state: Some(state),
            shaders,
            config,
            size,
            surface: SurfaceState::new(size),
            last_frame: None,
            frames_presented: 0,
            teardown: TeardownLog::default(),
        })
    }

    /// Acquire, submit and present one frame, recreating the swapchain when
    /// the surface has moved on. A no-op while paused or after shutdown.
    pub fn draw_frame(&mut self) -> VkResult<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        match self.surface.gate() {
            FrameGate::Paused => return Ok(()),
            FrameGate::Rebuild => {
                let outcome = state.recreate(&self.shaders, &self.config, self.size);
                if !self.surface.rebuilt(outcome)? {
                    debug!("surface has no area yet; skipping frame");
                    return Ok(());
                }
            }
            FrameGate::Draw => {}
        }

        let drawn = state.frames.draw_frame(
            &state.swapchain,
            state.pool.per_image(),
            state.ctx.graphics_queue,
            state.ctx.present_queue,
        );
        match drawn {
            Ok(frame) => {
                self.frames_presented += 1;
                self.last_frame = Some(frame);
                if frame.stale {
                    warn!("swapchain suboptimal after present; recreating");
                    self.surface.mark_stale();
                }
            }
            Err(VkError::SwapchainStale) => {
                warn!("swapchain out of date at acquire; recreating");
                self.surface.mark_stale();
            }
            Err(e) => return Err(e),
        }

        if self.surface.gate() == FrameGate::Rebuild {
            let outcome = state.recreate(&self.shaders, &self.config, self.size);
            self.surface.rebuilt(outcome)?;
        }
        Ok(())
    }

    /// Slot the next frame will use.
    pub fn frame_slot(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.frames.current_slot())
    }

    pub fn last_frame(&self) -> Option<PresentedFrame> {
        self.last_frame
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn is_paused(&self) -> bool {
        self.surface.paused
    }

    /// Stages released by [`Renderer::shutdown`], in the order they went.
    pub fn released_stages(&self) -> &[ShutdownStage] {
        self.teardown.stages()
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.state.as_ref().map(|s| s.swapchain.extent())
    }

    // STRICT TEARDOWN ORDER: see `teardown::SHUTDOWN_ORDER`.
    fn release_all(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let RendererState {
            frames,
            pool,
            meshes,
            framebuffers,
            pipeline,
            render_pass,
            swapchain,
            ctx,
        } = state;
        let chain = PresentChain {
            framebuffers,
            pipeline,
            render_pass,
            swapchain,
        };
        release_in_order(&mut self.teardown, frames, pool, meshes, Some(chain), ctx);
        info!("Vulkan renderer shut down");
    }
}

impl Renderer for VkRenderer {
    type Config = VkConfig;

    fn new(surface: &dyn SurfaceProvider, config: VkConfig) -> Result<Self> {
        Self::with_scene(surface, config, &mesh::demo_scene())
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.size = size;
        let was_paused = self.surface.paused;
        self.surface.resized(size);
        match (was_paused, self.surface.paused) {
            (false, true) => info!("framebuffer has zero area; pausing"),
            (true, false) => info!("resuming at {}x{}", size.width, size.height),
            _ => {}
        }
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        Ok(self.draw_frame()?)
    }

    fn shutdown(&mut self) {
        self.release_all();
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.config.clear_color = rgba;
        if let Some(state) = self.state.as_ref() {
            state.ctx.wait_idle();
            if let Err(e) = state.record(rgba) {
                warn!("re-recording with new clear color failed: {e}");
                // Next frame goes through recreation, which records again.
                self.surface.mark_stale();
            }
        }
    }

    fn set_vsync(&mut self, on: bool) {
        let mode = if on { VkVsyncMode::Fifo } else { VkVsyncMode::Mailbox };
        if self.config.vsync_mode != mode {
            self.config.vsync_mode = mode;
            self.surface.mark_stale();
        }
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: RenderSize = RenderSize {
        width: 800,
        height: 600,
    };
    const MINIMIZED: RenderSize = RenderSize {
        width: 0,
        height: 0,
    };

    fn lost() -> VkError {
        VkError::Device {
            what: "create_swapchain",
            result: vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR,
        }
    }

    #[test]
    fn failed_rebuild_keeps_the_surface_stale() {
        let mut surface = SurfaceState::new(WINDOW);
        assert_eq!(surface.gate(), FrameGate::Draw);

        // Present said suboptimal, then the rebuild failed partway.
        surface.mark_stale();
        assert!(surface.rebuilt(Err(lost())).is_err());
        assert_eq!(surface.gate(), FrameGate::Rebuild);

        // A later success is the only thing that lets frames draw again.
        assert!(surface.rebuilt(Ok(())).unwrap());
        assert_eq!(surface.gate(), FrameGate::Draw);
    }

    #[test]
    fn zero_area_surface_skips_the_frame_and_retries() {
        let mut surface = SurfaceState::new(WINDOW);
        surface.mark_stale();
        assert!(!surface.rebuilt(Err(VkError::SwapchainStale)).unwrap());
        assert_eq!(surface.gate(), FrameGate::Rebuild);
    }

    #[test]
    fn resize_pauses_and_resumes_through_a_rebuild() {
        let mut surface = SurfaceState::new(MINIMIZED);
        assert_eq!(surface.gate(), FrameGate::Paused);

        surface.resized(WINDOW);
        assert_eq!(surface.gate(), FrameGate::Rebuild);
        surface.resized(MINIMIZED);
        assert_eq!(surface.gate(), FrameGate::Paused);
        surface.resized(WINDOW);
        assert!(surface.rebuilt(Ok(())).unwrap());
        assert_eq!(surface.gate(), FrameGate::Draw);
    }
}
