// SPDX-License-Identifier: CEPL-1.0
use std::fmt;

use crate::commands::CommandPool;
use crate::context::DeviceContext;
use crate::frame::FrameController;
use crate::mesh::Mesh;
use crate::pipeline::{MeshPipeline, RenderPass};
use crate::swapchain::{Framebuffers, Swapchain};

// STRICT TEARDOWN ORDER (reverse of creation):
//   1) Device idle
//   2) Per-slot semaphores/fences
//   3) Command pool (frees its buffers)
//   4) Mesh buffers + memory
//   5) Framebuffers -> pipeline -> render pass
//   6) Image views -> swapchain
//   7) Surface -> device -> debug messenger -> instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownStage {
    FrameSync,
    CommandPool,
    Meshes,
    Framebuffers,
    Pipeline,
    RenderPass,
    ImageViews,
    Swapchain,
    Surface,
    Device,
    DebugMessenger,
    Instance,
}

pub const SHUTDOWN_ORDER: [ShutdownStage; 12] = [
    ShutdownStage::FrameSync,
    ShutdownStage::CommandPool,
    ShutdownStage::Meshes,
    ShutdownStage::Framebuffers,
    ShutdownStage::Pipeline,
    ShutdownStage::RenderPass,
    ShutdownStage::ImageViews,
    ShutdownStage::Swapchain,
    ShutdownStage::Surface,
    ShutdownStage::Device,
    ShutdownStage::DebugMessenger,
    ShutdownStage::Instance,
];

impl fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownStage::FrameSync => "frame sync objects",
            ShutdownStage::CommandPool => "command pool",
            ShutdownStage::Meshes => "mesh buffers",
            ShutdownStage::Framebuffers => "framebuffers",
            ShutdownStage::Pipeline => "pipeline",
            ShutdownStage::RenderPass => "render pass",
            ShutdownStage::ImageViews => "image views",
            ShutdownStage::Swapchain => "swapchain",
            ShutdownStage::Surface => "surface",
            ShutdownStage::Device => "device",
            ShutdownStage::DebugMessenger => "debug messenger",
            ShutdownStage::Instance => "instance",
        };
        f.write_str(s)
    }
}

/// Records what has been released, in order.
#[derive(Debug, Default)]
pub(crate) struct TeardownLog {
    released: Vec<ShutdownStage>,
}

impl TeardownLog {
    /// Drops `value` now and notes the stage. `None` (a context without a
    /// surface or messenger) records nothing.
    pub(crate) fn release<T>(&mut self, stage: ShutdownStage, value: Option<T>) {
        if let Some(v) = value {
            drop(v);
            self.record(stage);
        }
    }

    /// For stages released in place rather than by drop.
    pub(crate) fn record(&mut self, stage: ShutdownStage) {
        tracing::debug!("released {stage}");
        self.released.push(stage);
    }

    pub(crate) fn stages(&self) -> &[ShutdownStage] {
        &self.released
    }
}

/// True if every stage in `log` appears in the same relative order as [`SHUTDOWN_ORDER`].
pub(crate) fn follows_shutdown_order(log: &[ShutdownStage]) -> bool {
    log.windows(2).all(|w| w[0] < w[1])
}

/// Everything that exists only while a window is attached.
pub(crate) struct PresentChain {
    pub(crate) framebuffers: Framebuffers,
    pub(crate) pipeline: MeshPipeline,
    pub(crate) render_pass: RenderPass,
    pub(crate) swapchain: Swapchain,
}

/// Idles the device, then drops every part in [`SHUTDOWN_ORDER`], noting each in `log`.
pub(crate) fn release_in_order(
    log: &mut TeardownLog,
    frames: FrameController,
    pool: CommandPool,
    meshes: Vec<Mesh>,
    chain: Option<PresentChain>,
    ctx: DeviceContext,
) {
    ctx.wait_idle();

    log.release(ShutdownStage::FrameSync, Some(frames));
    log.release(ShutdownStage::CommandPool, Some(pool));
    log.release(ShutdownStage::Meshes, Some(meshes));
    if let Some(PresentChain {
        framebuffers,
        pipeline,
        render_pass,
        mut swapchain,
    }) = chain
    {
        log.release(ShutdownStage::Framebuffers, Some(framebuffers));
        log.release(ShutdownStage::Pipeline, Some(pipeline));
        log.release(ShutdownStage::RenderPass, Some(render_pass));
        swapchain.destroy_views();
        log.record(ShutdownStage::ImageViews);
        log.release(ShutdownStage::Swapchain, Some(swapchain));
    }

    let DeviceContext {
        surface,
        device,
        mut instance,
        ..
    } = ctx;
    log.release(ShutdownStage::Surface, surface);
    log.release(ShutdownStage::Device, Some(device));
    log.release(ShutdownStage::DebugMessenger, instance.take_debug_messenger());
    log.release(ShutdownStage::Instance, Some(instance));

    debug_assert!(follows_shutdown_order(log.stages()));
}

/// Tears down a windowless set of renderer parts along the same path as
/// `Renderer::shutdown` and returns the stages in the order they went.
pub fn release_offscreen(
    frames: FrameController,
    pool: CommandPool,
    meshes: Vec<Mesh>,
    ctx: DeviceContext,
) -> Vec<ShutdownStage> {
    let mut log = TeardownLog::default();
    release_in_order(&mut log, frames, pool, meshes, None, ctx);
    log.released
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(stage: ShutdownStage) -> usize {
        SHUTDOWN_ORDER.iter().position(|&s| s == stage).unwrap()
    }

    #[test]
    fn sync_objects_go_before_the_pool_and_the_pool_before_the_device() {
        assert!(pos(ShutdownStage::FrameSync) < pos(ShutdownStage::CommandPool));
        assert!(pos(ShutdownStage::CommandPool) < pos(ShutdownStage::Device));
        assert!(pos(ShutdownStage::Framebuffers) < pos(ShutdownStage::ImageViews));
        assert!(pos(ShutdownStage::Swapchain) < pos(ShutdownStage::Surface));
        assert!(pos(ShutdownStage::Device) < pos(ShutdownStage::Instance));
    }

    #[test]
    fn plan_is_sorted_and_complete() {
        assert!(follows_shutdown_order(&SHUTDOWN_ORDER));
        let mut sorted = SHUTDOWN_ORDER;
        sorted.sort();
        assert_eq!(sorted, SHUTDOWN_ORDER);
    }

    #[test]
    fn log_records_in_release_order_and_skips_absent_parts() {
        let mut log = TeardownLog::default();
        log.release(ShutdownStage::FrameSync, Some(vec![1u8]));
        log.release(ShutdownStage::CommandPool, Some(7u32));
        log.release::<u32>(ShutdownStage::Surface, None);
        log.release(ShutdownStage::Device, Some("device"));
        assert_eq!(
            log.stages(),
            &[
                ShutdownStage::FrameSync,
                ShutdownStage::CommandPool,
                ShutdownStage::Device
            ]
        );
        assert!(follows_shutdown_order(log.stages()));
        assert!(!follows_shutdown_order(&[
            ShutdownStage::Device,
            ShutdownStage::FrameSync
        ]));
    }
}
