// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! Synchronization objects are indexed by frame slot; command buffers and
//! framebuffers by the swapchain image index that acquire hands back. The two
//! counts are independent: F slots bound how far the CPU may run ahead, the
//! presentation engine decides how many images exist.
//!
//! [`FrameCursor`] is the bookkeeping half (which slot is next, what state each
//! one is in, which slot last rendered each image). [`FrameController`] owns the
//! semaphores and fences and drives acquire → submit → present against it.
use ash::vk;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::context::DeviceContext;
use crate::error::{CreateContext, VkError, VkResult};
use crate::swapchain::Swapchain;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled; nothing of this slot is on the GPU.
    Idle,
    Acquiring,
    /// Fence reset, work queued.
    Submitted,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    #[error("frame slot {slot} is {found:?}, expected {expected:?}")]
    WrongState {
        slot: usize,
        expected: SlotState,
        found: SlotState,
    },
    #[error("image {image} is still being rendered by frame slot {slot}")]
    ImageBusy { image: usize, slot: usize },
    #[error("image index {image} out of range ({count} images)")]
    NoSuchImage { image: usize, count: usize },
}

#[derive(Clone, Debug)]
pub struct FrameCursor {
    current: usize,
    states: Vec<SlotState>,
    image_owner: Vec<Option<usize>>,
}

impl FrameCursor {
    pub fn new(slots: usize, images: usize) -> Self {
        Self {
            current: 0,
            states: vec![SlotState::Idle; slots.max(1)],
            image_owner: vec![None; images],
        }
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.states.len()
    }

    pub fn image_count(&self) -> usize {
        self.image_owner.len()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Records that `slot`'s fence was observed signaled.
    pub fn mark_signaled(&mut self, slot: usize) {
        if self.states[slot] == SlotState::Submitted {
            self.states[slot] = SlotState::Idle;
        }
    }

    fn require(&self, slot: usize, expected: SlotState) -> Result<(), SlotError> {
        let found = self.states[slot];
        if found == expected {
            Ok(())
        } else {
            Err(SlotError::WrongState {
                slot,
                expected,
                found,
            })
        }
    }

    /// Starts a frame on the current slot. The slot's fence must already be signaled.
    pub fn begin_acquire(&mut self) -> Result<usize, SlotError> {
        self.require(self.current, SlotState::Idle)?;
        self.states[self.current] = SlotState::Acquiring;
        Ok(self.current)
    }

    /// The frame never reached the queue: acquire produced no image, or the
    /// submit failed and the fence was put back signaled.
    pub fn abandon(&mut self) {
        if self.states[self.current] == SlotState::Acquiring {
            self.states[self.current] = SlotState::Idle;
        }
    }

    /// Another slot whose submission still renders into `image`, if any.
    pub fn image_blocker(&self, image: usize) -> Option<usize> {
        self.image_owner
            .get(image)
            .copied()
            .flatten()
            .filter(|&s| s != self.current && self.states[s] == SlotState::Submitted)
    }

    pub fn submit(&mut self, image: usize) -> Result<(), SlotError> {
        self.require(self.current, SlotState::Acquiring)?;
        let count = self.image_owner.len();
        if image >= count {
            return Err(SlotError::NoSuchImage { image, count });
        }
        if let Some(slot) = self.image_blocker(image) {
            return Err(SlotError::ImageBusy { image, slot });
        }
        self.states[self.current] = SlotState::Submitted;
        self.image_owner[image] = Some(self.current);
        Ok(())
    }

    /// `(slot + 1) mod F`.
    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.states.len();
        self.current
    }
}

pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentedFrame {
    pub slot: usize,
    pub image: u32,
    /// Acquire or present called the swapchain suboptimal/out-of-date; recreate before the next frame.
    pub stale: bool,
}

pub struct FrameController {
    device: ash::Device,
    slots: Vec<FrameSlot>,
    cursor: FrameCursor,
}

impl FrameController {
    pub fn new(ctx: &DeviceContext, frames_in_flight: usize, images: usize) -> VkResult<Self> {
        let device = ctx.device().clone();
        let mut out = Self {
            device,
            slots: Vec::with_capacity(frames_in_flight),
            cursor: FrameCursor::new(frames_in_flight, images),
        };
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        for _ in 0..out.cursor.slot_count() {
            unsafe {
                let image_available = out
                    .device
                    .create_semaphore(&sem_ci, None)
                    .creating("image-available semaphore")?;
                let render_finished = match out.device.create_semaphore(&sem_ci, None) {
                    Ok(s) => s,
                    Err(result) => {
                        out.device.destroy_semaphore(image_available, None);
                        return Err(VkError::ResourceCreation {
                            what: "render-finished semaphore",
                            result,
                        });
                    }
                };
                let in_flight = match out.device.create_fence(&fence_ci, None) {
                    Ok(f) => f,
                    Err(result) => {
                        out.device.destroy_semaphore(image_available, None);
                        out.device.destroy_semaphore(render_finished, None);
                        return Err(VkError::ResourceCreation {
                            what: "in-flight fence",
                            result,
                        });
                    }
                };
                out.slots.push(FrameSlot {
                    image_available,
                    render_finished,
                    in_flight,
                });
            }
        }
        debug!(slots = out.slots.len(), images, "created frame sync objects");
        Ok(out)
    }

    pub fn current_slot(&self) -> usize {
        self.cursor.current()
    }

    fn wait_slot(&mut self, slot: usize) -> VkResult<()> {
        let fence = self.slots[slot].in_flight;
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .during("wait_for_fences(in-flight)")?;
        }
        self.cursor.mark_signaled(slot);
        Ok(())
    }

    // No CPU reuse of a slot until its last submission retired.
    fn begin_frame(&mut self) -> VkResult<usize> {
        let slot = self.cursor.current();
        self.wait_slot(slot)?;
        self.cursor.begin_acquire()?;
        Ok(slot)
    }

    fn command_for(&mut self, img: usize, cmd_bufs: &[vk::CommandBuffer]) -> VkResult<vk::CommandBuffer> {
        let count = cmd_bufs.len().min(self.cursor.image_count());
        match cmd_bufs.get(img) {
            Some(&cmd) if img < count => Ok(cmd),
            _ => {
                self.cursor.abandon();
                Err(SlotError::NoSuchImage { image: img, count }.into())
            }
        }
    }

    /// Acquiring -> Submitted on the current slot. With `acquired` the
    /// submission waits on the slot's image-available semaphore and signals
    /// render-finished for present; without, it signals only the fence.
    fn submit_image(
        &mut self,
        img: usize,
        cmd: vk::CommandBuffer,
        queue: vk::Queue,
        acquired: bool,
    ) -> VkResult<()> {
        // The image's command buffer may still be pending under another slot.
        if let Some(blocker) = self.cursor.image_blocker(img) {
            trace!(image = img, blocker, "waiting on slot that last rendered this image");
            self.wait_slot(blocker)?;
        }

        // Reset only once an image is in hand, so an abandoned acquire
        // never strands the slot with an unsignaled fence.
        let slot = self.cursor.current();
        let s = &self.slots[slot];
        unsafe {
            self.device
                .reset_fences(&[s.in_flight])
                .during("reset_fences")?;
        }

        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let mut submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        if acquired {
            submit.wait_semaphore_count = 1;
            submit.p_wait_semaphores = &s.image_available;
            submit.p_wait_dst_stage_mask = wait_stages.as_ptr();
            submit.signal_semaphore_count = 1;
            submit.p_signal_semaphores = &s.render_finished;
        }
        let submitted = unsafe {
            self.device
                .queue_submit(queue, std::slice::from_ref(&submit), s.in_flight)
        };
        if let Err(result) = submitted {
            self.restore_slot(slot);
            return Err(VkError::Device {
                what: "queue_submit",
                result,
            });
        }
        self.cursor.submit(img)?;
        Ok(())
    }

    // A failed submit queued nothing, so the reset fence would never signal
    // again. Swap in a signaled one and hand the slot back.
    fn restore_slot(&mut self, slot: usize) {
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let s = &mut self.slots[slot];
        unsafe {
            match self.device.create_fence(&fence_ci, None) {
                Ok(fresh) => {
                    self.device.destroy_fence(s.in_flight, None);
                    s.in_flight = fresh;
                }
                Err(result) => warn!(slot, ?result, "could not replace in-flight fence"),
            }
        }
        self.cursor.abandon();
    }

    /// One acquire → submit → present cycle on the current slot.
    ///
    /// `cmd_bufs` is indexed by swapchain image. Returns
    /// [`VkError::SwapchainStale`] when acquire reports out-of-date; nothing
    /// was submitted and the slot is left idle.
    pub fn draw_frame(
        &mut self,
        sc: &Swapchain,
        cmd_bufs: &[vk::CommandBuffer],
        graphics_queue: vk::Queue,
        present_queue: vk::Queue,
    ) -> VkResult<PresentedFrame> {
        let slot = self.begin_frame()?;
        let image_available = self.slots[slot].image_available;

        let (image_index, mut stale) = match unsafe {
            sc.loader()
                .acquire_next_image(sc.handle(), u64::MAX, image_available, vk::Fence::null())
        } {
            Ok(pair) => pair,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.cursor.abandon();
                return Err(VkError::SwapchainStale);
            }
            Err(result) => {
                self.cursor.abandon();
                return Err(VkError::Device {
                    what: "acquire_next_image",
                    result,
                });
            }
        };
        let img = image_index as usize;
        let cmd = self.command_for(img, cmd_bufs)?;
        self.submit_image(img, cmd, graphics_queue, true)?;

        // Present once rendering finished.
        let swapchain = sc.handle();
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.slots[slot].render_finished,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let presented = unsafe { sc.loader().queue_present(present_queue, &present) };

        // Next slot, whatever present said.
        self.cursor.advance();

        match presented {
            Ok(suboptimal) => stale |= suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => stale = true,
            Err(result) => {
                return Err(VkError::Device {
                    what: "queue_present",
                    result,
                })
            }
        }

        Ok(PresentedFrame {
            slot,
            image: image_index,
            stale,
        })
    }

    /// Submits `cmd_bufs[image]` on the current slot with no swapchain
    /// involved, then advances. Returns the slot that carried it.
    pub fn submit_offscreen(
        &mut self,
        image: usize,
        cmd_bufs: &[vk::CommandBuffer],
        queue: vk::Queue,
    ) -> VkResult<usize> {
        let slot = self.begin_frame()?;
        let cmd = self.command_for(image, cmd_bufs)?;
        self.submit_image(image, cmd, queue, false)?;
        self.cursor.advance();
        Ok(slot)
    }
}

impl Drop for FrameController {
    fn drop(&mut self) {
        // Owner idles the device first. Waiting here would hang on a fence
        // that was reset but never submitted.
        unsafe {
            for s in self.slots.drain(..) {
                self.device.destroy_fence(s.in_flight, None);
                self.device.destroy_semaphore(s.render_finished, None);
                self.device.destroy_semaphore(s.image_available, None);
            }
        }
        debug!("destroyed frame sync objects");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A queue that retires submissions in order, `latency` ticks after they were made.
    struct FakeGpu {
        signaled: Vec<bool>,
        queue: VecDeque<(usize, usize, u64)>, // (slot, image, done_at)
        now: u64,
        latency: u64,
    }

    impl FakeGpu {
        fn new(slots: usize, latency: u64) -> Self {
            Self {
                signaled: vec![true; slots],
                queue: VecDeque::new(),
                now: 0,
                latency,
            }
        }

        fn tick(&mut self) {
            self.now += 1;
            while let Some(&(slot, _, done_at)) = self.queue.front() {
                if done_at > self.now {
                    break;
                }
                self.signaled[slot] = true;
                self.queue.pop_front();
            }
        }

        fn wait(&mut self, slot: usize) {
            while !self.signaled[slot] {
                self.tick();
            }
        }

        fn image_pending(&self, image: usize) -> bool {
            self.queue.iter().any(|&(_, i, _)| i == image)
        }

        fn submit(&mut self, slot: usize, image: usize) {
            self.signaled[slot] = false;
            self.queue.push_back((slot, image, self.now + self.latency));
        }
    }

    fn run(frames: usize, slots: usize, images: &[usize], image_count: usize) -> Vec<usize> {
        let mut cursor = FrameCursor::new(slots, image_count);
        let mut gpu = FakeGpu::new(slots, 3);
        let mut used = Vec::new();

        for frame in 0..frames {
            let slot = cursor.current();
            gpu.wait(slot);
            cursor.mark_signaled(slot);
            assert_eq!(cursor.begin_acquire(), Ok(slot));

            let image = images[frame % images.len()];
            if let Some(blocker) = cursor.image_blocker(image) {
                gpu.wait(blocker);
                cursor.mark_signaled(blocker);
            }

            // The fence is about to be reset: nothing from this slot may be queued,
            // and the image's command buffer must not be pending anywhere.
            assert!(gpu.signaled[slot], "slot {slot} reused with an unsignaled fence");
            assert!(
                !gpu.image_pending(image),
                "command buffer {image} resubmitted while still pending"
            );
            cursor.submit(image).unwrap();
            gpu.submit(slot, image);

            used.push(slot);
            cursor.advance();
            gpu.tick();
        }
        used
    }

    #[test]
    fn two_slots_over_ten_frames_respect_fences() {
        let used = run(10, 2, &[0, 1, 2], 3);
        assert_eq!(used, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn out_of_order_images_wait_on_the_owning_slot() {
        // The engine hands back the same image twice in a row.
        let used = run(10, 2, &[0, 0, 1, 1, 2], 3);
        assert_eq!(used.len(), 10);
    }

    #[test]
    fn more_slots_than_images() {
        let used = run(9, 3, &[0, 1], 2);
        assert_eq!(used, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn slot_cannot_restart_before_its_fence_signals() {
        let mut cursor = FrameCursor::new(2, 2);
        cursor.begin_acquire().unwrap();
        cursor.submit(0).unwrap();
        cursor.advance();
        cursor.begin_acquire().unwrap();
        cursor.submit(1).unwrap();
        cursor.advance();

        // Back on slot 0 without observing its fence.
        assert_eq!(
            cursor.begin_acquire(),
            Err(SlotError::WrongState {
                slot: 0,
                expected: SlotState::Idle,
                found: SlotState::Submitted
            })
        );
        cursor.mark_signaled(0);
        assert_eq!(cursor.begin_acquire(), Ok(0));
    }

    #[test]
    fn busy_image_is_refused() {
        let mut cursor = FrameCursor::new(2, 2);
        cursor.begin_acquire().unwrap();
        cursor.submit(1).unwrap();
        cursor.advance();
        cursor.begin_acquire().unwrap();
        assert_eq!(cursor.image_blocker(1), Some(0));
        assert_eq!(cursor.submit(1), Err(SlotError::ImageBusy { image: 1, slot: 0 }));
        assert_eq!(
            cursor.submit(7),
            Err(SlotError::NoSuchImage { image: 7, count: 2 })
        );
    }

    #[test]
    fn abandoned_acquire_leaves_slot_idle() {
        let mut cursor = FrameCursor::new(2, 3);
        cursor.begin_acquire().unwrap();
        cursor.abandon();
        assert_eq!(cursor.state(0), SlotState::Idle);
        assert_eq!(cursor.current(), 0);
        assert_eq!(cursor.begin_acquire(), Ok(0));
    }

    #[test]
    fn failed_submit_leaves_slot_reusable() {
        let mut cursor = FrameCursor::new(2, 2);
        cursor.begin_acquire().unwrap();
        cursor.submit(0).unwrap();
        cursor.advance();

        // Slot 1 starts a frame, then the queue rejects its batch.
        assert_eq!(cursor.begin_acquire(), Ok(1));
        cursor.abandon();
        assert_eq!(cursor.state(1), SlotState::Idle);
        assert_eq!(cursor.current(), 1);

        // Retrying the same slot works, and slot 0 still owns image 0.
        assert_eq!(cursor.begin_acquire(), Ok(1));
        assert_eq!(cursor.image_blocker(0), Some(0));
        cursor.submit(1).unwrap();
        assert_eq!(cursor.state(1), SlotState::Submitted);
    }

    #[test]
    fn three_frames_cycle_zero_one_zero() {
        let used = run(3, 2, &[0, 1, 2], 3);
        assert_eq!(used, vec![0, 1, 0]);
    }
}
