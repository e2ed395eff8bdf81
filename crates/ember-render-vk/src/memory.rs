// SPDX-License-Identifier: CEPL-1.0
//! Memory type resolution and buffer ownership.
use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{CreateContext, VkError, VkResult};

#[derive(Clone, Copy, Debug)]
pub struct MemoryRequest {
    pub size: vk::DeviceSize,
    pub type_bits: u32,
    pub properties: vk::MemoryPropertyFlags,
}

/// First memory type allowed by `type_bits` whose flags include all of `required`.
///
/// `None` is final: the device's memory topology does not change at runtime.
pub fn resolve_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

pub(crate) fn allocate(ctx: &DeviceContext, req: MemoryRequest) -> VkResult<vk::DeviceMemory> {
    let memory_type_index = resolve_memory_type(ctx.memory_properties(), req.type_bits, req.properties)
        .ok_or(VkError::MemoryTypeNotFound {
            type_bits: req.type_bits,
            required: req.properties,
        })?;
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    unsafe { ctx.device().allocate_memory(&mai, None) }.creating("device memory")
}

/// A buffer and the memory bound to it, released together on drop.
///
/// A zero-sized `DeviceBuffer` owns no Vulkan objects at all.
pub struct DeviceBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl DeviceBuffer {
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        let mut out = Self::empty(ctx);
        if size == 0 {
            return Ok(out);
        }
        let device = ctx.device();

        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        out.buffer = unsafe { device.create_buffer(&bci, None) }.creating("buffer")?;
        out.size = size;

        let req = unsafe { device.get_buffer_memory_requirements(out.buffer) };
        out.memory = allocate(
            ctx,
            MemoryRequest {
                size: req.size,
                type_bits: req.memory_type_bits,
                properties,
            },
        )?;
        unsafe { device.bind_buffer_memory(out.buffer, out.memory, 0) }
            .creating("buffer memory binding")?;

        debug!(size, ?usage, ?properties, "created buffer");
        Ok(out)
    }

    pub(crate) fn empty(ctx: &DeviceContext) -> Self {
        Self {
            device: ctx.device().clone(),
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size: 0,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copies `data` in through a host mapping. The memory must be host-visible
    /// and host-coherent, so no flush follows.
    pub(crate) fn write_mapped(&self, data: &[u8]) -> VkResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .during("map_memory")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    pub(crate) fn read_mapped(&self) -> VkResult<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        if out.is_empty() {
            return Ok(out);
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .during("map_memory")?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), out.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.buffer != vk::Buffer::null() {
                self.device.destroy_buffer(self.buffer, None);
                self.buffer = vk::Buffer::null();
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory, None);
                self.memory = vk::DeviceMemory::null();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type F = vk::MemoryPropertyFlags;

    fn props(types: &[F]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties::default();
        p.memory_type_count = types.len() as u32;
        for (i, &flags) in types.iter().enumerate() {
            p.memory_types[i].property_flags = flags;
        }
        p
    }

    // A typical discrete GPU layout.
    fn discrete() -> vk::PhysicalDeviceMemoryProperties {
        props(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
        ])
    }

    #[test]
    fn picks_first_type_with_all_flags() {
        let p = discrete();
        assert_eq!(resolve_memory_type(&p, !0, F::DEVICE_LOCAL), Some(0));
        assert_eq!(
            resolve_memory_type(&p, !0, F::HOST_VISIBLE | F::HOST_COHERENT),
            Some(1)
        );
        assert_eq!(resolve_memory_type(&p, !0, F::HOST_CACHED), Some(2));
    }

    #[test]
    fn respects_the_allowed_mask() {
        let p = discrete();
        assert_eq!(resolve_memory_type(&p, 0b1000, F::DEVICE_LOCAL), Some(3));
        assert_eq!(resolve_memory_type(&p, 0b0110, F::DEVICE_LOCAL), None);
        assert_eq!(resolve_memory_type(&p, 0, F::empty()), None);
    }

    #[test]
    fn ignores_types_past_the_reported_count() {
        let mut p = discrete();
        p.memory_types[5].property_flags = F::LAZILY_ALLOCATED;
        assert_eq!(resolve_memory_type(&p, !0, F::LAZILY_ALLOCATED), None);
    }

    #[test]
    fn never_returns_a_type_missing_a_requested_bit() {
        let p = discrete();
        let bits = [
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE,
            F::HOST_COHERENT,
            F::HOST_CACHED,
            F::LAZILY_ALLOCATED,
        ];
        for combo in 0u32..(1 << bits.len()) {
            let required = bits
                .iter()
                .enumerate()
                .filter(|(i, _)| combo & (1 << i) != 0)
                .fold(F::empty(), |acc, (_, &b)| acc | b);
            for mask in 0u32..16 {
                match resolve_memory_type(&p, mask, required) {
                    Some(i) => {
                        assert!(mask & (1 << i) != 0);
                        assert!(p.memory_types[i as usize].property_flags.contains(required));
                    }
                    None => assert!((0..4).all(|i| mask & (1 << i) == 0
                        || !p.memory_types[i].property_flags.contains(required))),
                }
            }
        }
    }
}
