// SPDX-License-Identifier: CEPL-1.0
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VkVsyncMode {
    Fifo,    // Target monitor refresh rate
    #[default]
    Mailbox, // Low-latency triple buffering when the surface has it, else FIFO
}

/// Startup knobs for [`crate::VkRenderer`].
#[derive(Clone, Copy, Debug)]
pub struct VkConfig {
    pub frames_in_flight: usize,
    /// Enables the Khronos validation layer and routes its output into `tracing`.
    pub validation: bool,
    pub clear_color: [f32; 4],
    pub vsync_mode: VkVsyncMode,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            validation: false,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync_mode: VkVsyncMode::Mailbox,
        }
    }
}

impl VkConfig {
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut cfg = VkConfig::default();
        assert_eq!(cfg.frames_in_flight(), 2);
        cfg.frames_in_flight = 0;
        assert_eq!(cfg.frames_in_flight(), 1);
        cfg.frames_in_flight = 16;
        assert_eq!(cfg.frames_in_flight(), MAX_FRAMES_IN_FLIGHT);
    }
}
