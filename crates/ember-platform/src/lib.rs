// SPDX-License-Identifier: CEPL-1.0
//! Window-layer glue: wraps a winit window as an [`ember_render::SurfaceProvider`].
pub use winit;

use anyhow::{Context, Result};
use ember_render::{RenderSize, SurfaceProvider};
use tracing::info;
use winit::event_loop::ActiveEventLoop;
use winit::raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::{Window, WindowId};

pub struct PlatformWindow {
    window: Window,
    close_requested: bool,
}

impl PlatformWindow {
    pub fn create(event_loop: &ActiveEventLoop, title: &str) -> Result<Self> {
        let window = event_loop
            .create_window(Window::default_attributes().with_title(title))
            .context("create_window")?;
        let size = window.inner_size();
        info!("window created ({}x{})", size.width, size.height);
        Ok(Self {
            window,
            close_requested: false,
        })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl SurfaceProvider for PlatformWindow {
    fn framebuffer_size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize {
            width: size.width,
            height: size.height,
        }
    }

    fn should_close(&self) -> bool {
        self.close_requested
    }
}
