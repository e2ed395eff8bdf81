// SPDX-License-Identifier: CEPL-1.0
//! Host → device-local uploads through a throwaway staging buffer.
use ash::vk;
use tracing::debug;

use crate::commands::CommandPool;
use crate::context::DeviceContext;
use crate::error::VkResult;
use crate::memory::DeviceBuffer;

const HOST_STAGING: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Copies `data` into a new device-local buffer usable as `TRANSFER_DST | usage`.
///
/// Blocks until the transfer queue is idle. The staging buffer is released on
/// every path out of this function; on failure the destination is released too.
pub fn upload_to_device_local(
    ctx: &DeviceContext,
    pool: &CommandPool,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> VkResult<DeviceBuffer> {
    if data.is_empty() {
        return Ok(DeviceBuffer::empty(ctx));
    }
    let size = data.len() as vk::DeviceSize;

    let staging = DeviceBuffer::new(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC, HOST_STAGING)?;
    staging.write_mapped(data)?;

    let dst = DeviceBuffer::new(
        ctx,
        size,
        vk::BufferUsageFlags::TRANSFER_DST | usage,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    copy_buffer(ctx, pool, &staging, &dst, size)?;
    debug!(bytes = size, ?usage, "uploaded to device-local memory");
    Ok(dst)
}

/// Reads a device-local buffer back to the host. The buffer must have been
/// created with `TRANSFER_SRC` usage.
pub fn read_back(ctx: &DeviceContext, pool: &CommandPool, src: &DeviceBuffer) -> VkResult<Vec<u8>> {
    if src.is_empty() {
        return Ok(Vec::new());
    }
    let readback = DeviceBuffer::new(
        ctx,
        src.size(),
        vk::BufferUsageFlags::TRANSFER_DST,
        HOST_STAGING,
    )?;
    copy_buffer(ctx, pool, src, &readback, src.size())?;
    readback.read_mapped()
}

fn copy_buffer(
    ctx: &DeviceContext,
    pool: &CommandPool,
    src: &DeviceBuffer,
    dst: &DeviceBuffer,
    size: vk::DeviceSize,
) -> VkResult<()> {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    pool.one_shot(ctx.transfer_queue, |device, cmd| unsafe {
        device.cmd_copy_buffer(cmd, src.handle(), dst.handle(), std::slice::from_ref(&region));
    })
}
