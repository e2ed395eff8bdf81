// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// What a renderer needs from the window layer: native handles to build a
/// surface from, the current framebuffer size in pixels, and a close poll.
pub trait SurfaceProvider: HasWindowHandle + HasDisplayHandle {
    fn framebuffer_size(&self) -> RenderSize;
    fn should_close(&self) -> bool;
}

pub trait Renderer {
    type Config;

    fn new(surface: &dyn SurfaceProvider, config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    /// Idles the device and releases everything. Safe to call more than once.
    fn shutdown(&mut self);
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_sizes_are_empty() {
        assert!(RenderSize { width: 0, height: 600 }.is_empty());
        assert!(RenderSize { width: 800, height: 0 }.is_empty());
        assert!(!RenderSize { width: 1, height: 1 }.is_empty());
    }
}
