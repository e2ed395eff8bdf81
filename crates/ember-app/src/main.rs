// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use ember_core::init_tracing;
use ember_platform::PlatformWindow;
use ember_render::{RenderSize, Renderer, SurfaceProvider};
use ember_render_vk::{VkConfig, VkRenderer, VkVsyncMode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use ember_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

const VALIDATION_ENV: &str = "EMBER_VALIDATION";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing means defaults
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// Enable the Vulkan validation layer
    #[arg(long)]
    validation: bool,
    /// Exit after this many presented frames
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    vsync_mode: VsyncMode,
    frames_in_flight: usize,
    validation: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let vk = VkConfig::default();
        RenderCfg {
            clear_color: vk.clear_color,
            vsync_mode: VsyncMode::Mailbox,
            frames_in_flight: vk.frames_in_flight,
            validation: false,
        }
    }
}

impl RenderCfg {
    fn to_vk(self, force_validation: bool) -> VkConfig {
        let mut vk = VkConfig {
            frames_in_flight: self.frames_in_flight,
            validation: self.validation || force_validation,
            clear_color: self.clear_color,
            vsync_mode: match self.vsync_mode {
                VsyncMode::Fifo => VkVsyncMode::Fifo,
                VsyncMode::Mailbox => VkVsyncMode::Mailbox,
            },
        };
        vk.frames_in_flight = vk.frames_in_flight();
        vk
    }
}

fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(s)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("ignoring {}: {e}", path.display());
            AppCfg::default()
        }),
        Err(_) => {
            debug!("no {}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

fn env_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

struct App {
    vk_cfg: VkConfig,
    frame_limit: Option<u64>,

    window: Option<PlatformWindow>,
    renderer: Option<VkRenderer>,
    failure: Option<anyhow::Error>,

    exiting: bool,
    presented: u64,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn stop(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        self.exiting = true;
        if let Some(w) = &mut self.window {
            w.request_close();
        }
        // Renderer before window: the surface borrows the native handle.
        if let Some(mut r) = self.renderer.take() {
            r.shutdown();
            debug!("released: {:?}", r.released_stages());
        }
        self.window = None;
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.failure = Some(err);
        self.stop(event_loop);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let window = match PlatformWindow::create(event_loop, "ember") {
            Ok(w) => w,
            Err(e) => return self.fail(event_loop, e),
        };
        match VkRenderer::new(&window, self.vk_cfg) {
            Ok(r) => self.renderer = Some(r),
            Err(e) => return self.fail(event_loop, e.context("vk init failed")),
        }
        info!(
            "vsync = {:?}, frames in flight = {}",
            self.vk_cfg.vsync_mode, self.vk_cfg.frames_in_flight
        );

        event_loop.set_control_flow(match self.vk_cfg.vsync_mode {
            VkVsyncMode::Fifo => ControlFlow::Wait,
            VkVsyncMode::Mailbox => ControlFlow::Poll,
        });
        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.stop(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                debug!("Resized → {}x{}", size.width, size.height);
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(size) {
                        return self.fail(event_loop, e);
                    }
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                let Some(r) = &mut self.renderer else {
                    return;
                };
                if r.is_paused() {
                    return;
                }
                let before = r.frames_presented();
                if let Err(e) = r.render() {
                    return self.fail(event_loop, e);
                }
                if r.frames_presented() > before {
                    self.presented += 1;
                    self.frames = self.frames.saturating_add(1);
                    if let Some(f) = r.last_frame() {
                        debug!(slot = f.slot, image = f.image, "presented");
                    }
                }
                if self.frame_limit.is_some_and(|n| self.presented >= n) {
                    info!("presented {} frames; exiting", self.presented);
                    self.stop(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if let Some(w) = &self.window {
            if w.should_close() {
                return self.stop(event_loop);
            }
            let paused = w.framebuffer_size().is_empty();
            if paused {
                // Zero-area window: sleep until a resize wakes us.
                event_loop.set_control_flow(ControlFlow::Wait);
                self.frames = 0;
                return;
            }
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let force_validation = args.validation || env_flag(std::env::var(VALIDATION_ENV).ok());

    let event_loop: EventLoop<()> = EventLoop::new().context("event loop")?;
    let mut app = App {
        vk_cfg: cfg.render.to_vk(force_validation),
        frame_limit: args.frames,
        window: None,
        renderer: None,
        failure: None,
        exiting: false,
        presented: 0,
        frames: 0,
        last_fps_instant: Instant::now(),
    };

    event_loop.run_app(&mut app)?;
    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        let vk = cfg.render.to_vk(false);
        assert_eq!(vk.frames_in_flight, 2);
        assert_eq!(vk.vsync_mode, VkVsyncMode::Mailbox);
        assert!(!vk.validation);
    }

    #[test]
    fn render_section_is_read() {
        let cfg = parse_cfg(
            r#"
            [render]
            clear_color = [1.0, 0.5, 0.25, 1.0]
            vsync_mode = "fifo"
            frames_in_flight = 3
            validation = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.clear_color, [1.0, 0.5, 0.25, 1.0]);
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Fifo);
        let vk = cfg.render.to_vk(false);
        assert_eq!(vk.frames_in_flight, 3);
        assert!(vk.validation);
        assert_eq!(vk.vsync_mode, VkVsyncMode::Fifo);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg = parse_cfg("[render]\nframes_in_flight = 9\n").unwrap();
        assert_eq!(cfg.render.clear_color, RenderCfg::default().clear_color);
        assert_eq!(cfg.render.to_vk(false).frames_in_flight, 4);
        assert_eq!(cfg.render.to_vk(true).frames_in_flight, 4);
        assert!(cfg.render.to_vk(true).validation);
    }

    #[test]
    fn unknown_vsync_mode_is_rejected() {
        assert!(parse_cfg("[render]\nvsync_mode = \"immediate\"\n").is_err());
    }

    #[test]
    fn validation_env_values() {
        assert!(env_flag(Some("1".into())));
        assert!(env_flag(Some(" true ".into())));
        assert!(!env_flag(Some("0".into())));
        assert!(!env_flag(None));
    }

    #[test]
    fn cli_flags_parse() {
        let args = Args::parse_from(["ember-app", "--validation", "--frames", "3"]);
        assert!(args.validation);
        assert_eq!(args.frames, Some(3));
        assert_eq!(args.config, PathBuf::from("ember.toml"));
    }
}
