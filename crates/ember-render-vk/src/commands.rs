// SPDX-License-Identifier: CEPL-1.0
//! Command pool ownership, one-shot submissions and static draw recording.
use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{CreateContext, VkResult};
use crate::mesh::Mesh;

/// The graphics-family command pool plus the per-swapchain-image buffers.
///
/// Buffers are indexed by swapchain image, never by frame slot.
pub struct CommandPool {
    device: ash::Device,
    pool: vk::CommandPool,
    per_image: Vec<vk::CommandBuffer>,
}

impl CommandPool {
    pub fn new(ctx: &DeviceContext) -> VkResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.families().graphics,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let pool = unsafe { ctx.device().create_command_pool(&pool_info, None) }
            .creating("command pool")?;
        Ok(Self {
            device: ctx.device().clone(),
            pool,
            per_image: Vec::new(),
        })
    }

    /// Makes sure exactly `count` per-image buffers exist.
    pub fn ensure_per_image(&mut self, count: usize) -> VkResult<()> {
        if self.per_image.len() == count {
            return Ok(());
        }
        self.free_per_image();
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count as u32,
            ..Default::default()
        };
        self.per_image = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .creating("command buffers")?;
        Ok(())
    }

    fn free_per_image(&mut self) {
        if !self.per_image.is_empty() {
            unsafe {
                self.device.free_command_buffers(self.pool, &self.per_image);
            }
            self.per_image.clear();
        }
    }

    #[inline]
    pub fn per_image(&self) -> &[vk::CommandBuffer] {
        &self.per_image
    }

    /// Records `record` into a temporary buffer, submits it and waits for the queue to drain.
    pub fn one_shot(
        &self,
        queue: vk::Queue,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> VkResult<()> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = unsafe { self.device.allocate_command_buffers(&ai) }
            .creating("transfer command buffer")?[0];
        let _guard = OneShot {
            device: &self.device,
            pool: self.pool,
            cmd,
        };

        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .begin_command_buffer(cmd, &bi)
                .during("begin_command_buffer")?;
            record(&self.device, cmd);
            self.device
                .end_command_buffer(cmd)
                .during("end_command_buffer")?;

            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            self.device
                .queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null())
                .during("queue_submit(transfer)")?;
            self.device
                .queue_wait_idle(queue)
                .during("queue_wait_idle(transfer)")?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.free_per_image();
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
        debug!("destroyed command pool");
    }
}

struct OneShot<'a> {
    device: &'a ash::Device,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl Drop for OneShot<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device
                .free_command_buffers(self.pool, std::slice::from_ref(&self.cmd));
        }
    }
}

/// What a static draw recording binds, per swapchain image.
pub struct DrawTarget<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffers: &'a [vk::Framebuffer],
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub clear: [f32; 4],
}

/// Records one command buffer per framebuffer: clear, bind, draw every mesh.
pub fn record_draw_commands(
    device: &ash::Device,
    cmd_bufs: &[vk::CommandBuffer],
    target: &DrawTarget<'_>,
    meshes: &[Mesh],
) -> VkResult<()> {
    for (&cmd, &framebuffer) in cmd_bufs.iter().zip(target.framebuffers) {
        unsafe { record_one(device, cmd, framebuffer, target, meshes)? };
    }
    debug!(buffers = cmd_bufs.len(), meshes = meshes.len(), "recorded draw commands");
    Ok(())
}

unsafe fn record_one(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    target: &DrawTarget<'_>,
    meshes: &[Mesh],
) -> VkResult<()> {
    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .during("reset_command_buffer")?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        device
            .begin_command_buffer(cmd, &begin)
            .during("begin_command_buffer")?;

        let clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: target.clear,
            },
        }];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: target.render_pass,
            framebuffer,
            render_area: area,
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);

        let vp = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
        device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));

        for mesh in meshes {
            let draw = mesh.draw_params();
            if draw.vertex_count == 0 {
                continue;
            }
            device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer()], &[0]);
            match mesh.index_buffer() {
                Some(ibuf) if draw.index_count > 0 => {
                    device.cmd_bind_index_buffer(cmd, ibuf, 0, vk::IndexType::UINT32);
                    device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
                }
                _ => device.cmd_draw(cmd, draw.vertex_count, 1, 0, 0),
            }
        }

        device.cmd_end_render_pass(cmd);
        device
            .end_command_buffer(cmd)
            .during("end_command_buffer")?;
    }
    Ok(())
}
