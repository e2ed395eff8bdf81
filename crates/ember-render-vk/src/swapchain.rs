// SPDX-License-Identifier: CEPL-1.0
//! Surface negotiation, the swapchain with its image views, and framebuffers.
use ash::khr::swapchain;
use ash::vk;
use ember_render::RenderSize;
use tracing::{debug, info};

use crate::config::VkVsyncMode;
use crate::context::DeviceContext;
use crate::error::{CreateContext, VkError, VkResult};

/// Everything the surface reports, queried fresh for every (re)creation.
#[derive(Clone, Debug)]
pub struct SurfaceSupport {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub(crate) fn query(ctx: &DeviceContext) -> VkResult<Self> {
        let s = ctx.surface()?;
        unsafe {
            Ok(Self {
                caps: s
                    .loader
                    .get_physical_device_surface_capabilities(ctx.phys, s.handle)
                    .during("surface capabilities")?,
                formats: s
                    .loader
                    .get_physical_device_surface_formats(ctx.phys, s.handle)
                    .during("surface formats")?,
                present_modes: s
                    .loader
                    .get_physical_device_surface_present_modes(ctx.phys, s.handle)
                    .during("surface present modes")?,
            })
        }
    }
}

/// 8-bit RGBA/BGRA with sRGB-nonlinear color space, else whatever comes first.
///
/// A lone `UNDEFINED` entry means the surface takes any format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }
    formats
        .iter()
        .copied()
        .find(|f| {
            (f.format == vk::Format::R8G8B8A8_UNORM || f.format == vk::Format::B8G8R8A8_UNORM)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// FIFO is always available, so it is the fallback for every preference.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], mode: VkVsyncMode) -> vk::PresentModeKHR {
    match mode {
        VkVsyncMode::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

/// `None` while the surface has zero area (minimized); no swapchain can be built then.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> Option<vk::Extent2D> {
    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    };
    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// One more than the minimum, clamped to the maximum (0 = no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

/// The swapchain handle and one view per presentable image.
///
/// Images belong to the swapchain; views are ours and are destroyed first.
pub struct Swapchain {
    device: ash::Device,
    loader: swapchain::Device,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Negotiates against the surface's current state and builds the chain.
    ///
    /// `old` is handed to the driver for reuse but stays owned by the caller.
    pub fn create(
        ctx: &DeviceContext,
        hint: RenderSize,
        vsync_mode: VkVsyncMode,
        old: vk::SwapchainKHR,
    ) -> VkResult<Self> {
        let support = SurfaceSupport::query(ctx)?;
        let surf_format = choose_surface_format(&support.formats)
            .ok_or_else(|| VkError::Surface("surface reports no formats".into()))?;
        let present_mode = choose_present_mode(&support.present_modes, vsync_mode);
        let extent = choose_extent(&support.caps, hint).ok_or(VkError::SwapchainStale)?;
        let min_image_count = choose_image_count(&support.caps);
        let (sharing_mode, family_indices) = ctx.families().sharing();

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface()?.handle,
            min_image_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: support.caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };

        let loader = swapchain::Device::new(ctx.instance(), ctx.device());
        let handle = unsafe { loader.create_swapchain(&swap_info, None) }.creating("swapchain")?;
        let mut sc = Self {
            device: ctx.device().clone(),
            loader,
            handle,
            format: surf_format.format,
            extent,
            images: Vec::new(),
            views: Vec::new(),
        };
        sc.images = unsafe { sc.loader.get_swapchain_images(handle) }.during("get_swapchain_images")?;

        for &image in &sc.images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: sc.format,
                components: vk::ComponentMapping::default(),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = unsafe { sc.device.create_image_view(&iv_info, None) }.creating("image view")?;
            sc.views.push(view);
        }

        info!(
            "swapchain ready ({}x{}, {:?}/{:?}, {}, {} images)",
            extent.width,
            extent.height,
            surf_format.format,
            surf_format.color_space,
            pm_name(present_mode),
            sc.images.len()
        );
        Ok(sc)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub(crate) fn loader(&self) -> &swapchain::Device {
        &self.loader
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Destroys the image views, leaving the swapchain handle alive.
    pub(crate) fn destroy_views(&mut self) {
        for view in self.views.drain(..) {
            unsafe {
                self.device.destroy_image_view(view, None);
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_views();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe {
                self.loader.destroy_swapchain(self.handle, None);
            }
            self.handle = vk::SwapchainKHR::null();
        }
        debug!("destroyed swapchain");
    }
}

/// One framebuffer per swapchain image view, bound to the render pass.
pub struct Framebuffers {
    device: ash::Device,
    handles: Vec<vk::Framebuffer>,
}

impl Framebuffers {
    pub fn new(ctx: &DeviceContext, render_pass: vk::RenderPass, sc: &Swapchain) -> VkResult<Self> {
        let mut out = Self {
            device: ctx.device().clone(),
            handles: Vec::with_capacity(sc.views().len()),
        };
        let extent = sc.extent();
        for view in sc.views() {
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass,
                attachment_count: 1,
                p_attachments: view,
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { out.device.create_framebuffer(&fb_info, None) }.creating("framebuffer")?;
            out.handles.push(fb);
        }
        Ok(out)
    }

    pub fn handles(&self) -> &[vk::Framebuffer] {
        &self.handles
    }

    /// Destroys every framebuffer; they reference views that are about to go away.
    pub(crate) fn clear(&mut self) {
        for fb in self.handles.drain(..) {
            unsafe {
                self.device.destroy_framebuffer(fb, None);
            }
        }
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn image_count_stays_within_bounds() {
        for (min, max) in [(1, 0), (2, 2), (3, 8)] {
            let n = choose_image_count(&caps(min, max));
            assert!(n >= min, "{n} < {min}");
            if max != 0 {
                assert!(n <= max, "{n} > {max}");
            }
        }
        assert_eq!(choose_image_count(&caps(1, 0)), 2);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        assert_eq!(choose_image_count(&caps(3, 8)), 4);
    }

    #[test]
    fn srgb_rgba8_wins_wherever_it_sits() {
        let wanted = fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let others = [
            fmt(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ];
        for pos in 0..=others.len() {
            let mut list = others.to_vec();
            list.insert(pos, wanted);
            assert_eq!(choose_surface_format(&list), Some(wanted));
        }
    }

    #[test]
    fn bgra8_is_accepted_and_fallback_is_first() {
        let bgra = fmt(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let odd = fmt(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(choose_surface_format(&[odd, bgra]), Some(bgra));
        assert_eq!(choose_surface_format(&[odd]), Some(odd));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn undefined_means_any_format() {
        let any = [fmt(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = choose_surface_format(&any).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn mailbox_preferred_fifo_fallback() {
        use vk::PresentModeKHR as P;
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::IMMEDIATE, P::MAILBOX], VkVsyncMode::Mailbox),
            P::MAILBOX
        );
        assert_eq!(choose_present_mode(&[P::MAILBOX, P::FIFO], VkVsyncMode::Mailbox), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::IMMEDIATE, P::FIFO_RELAXED], VkVsyncMode::Mailbox), P::FIFO);
        assert_eq!(choose_present_mode(&[], VkVsyncMode::Mailbox), P::FIFO);
        assert_eq!(choose_present_mode(&[P::MAILBOX, P::FIFO], VkVsyncMode::Fifo), P::FIFO);
    }

    #[test]
    fn extent_uses_current_or_clamps_window_size() {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D { width: 640, height: 480 };
        let want = RenderSize { width: 1920, height: 1080 };
        assert_eq!(choose_extent(&c, want), Some(vk::Extent2D { width: 640, height: 480 }));

        c.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        c.min_image_extent = vk::Extent2D { width: 100, height: 100 };
        c.max_image_extent = vk::Extent2D { width: 1280, height: 2000 };
        assert_eq!(choose_extent(&c, want), Some(vk::Extent2D { width: 1280, height: 1080 }));
        let tiny = RenderSize { width: 10, height: 10 };
        assert_eq!(choose_extent(&c, tiny), Some(vk::Extent2D { width: 100, height: 100 }));
    }

    #[test]
    fn minimized_surface_has_no_extent() {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D { width: 0, height: 0 };
        let want = RenderSize { width: 800, height: 600 };
        assert_eq!(choose_extent(&c, want), None);

        c.current_extent = vk::Extent2D { width: 800, height: 0 };
        assert_eq!(choose_extent(&c, want), None);

        // Window-sized surfaces with a zero minimum follow a zero-area window.
        c.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        c.min_image_extent = vk::Extent2D { width: 0, height: 0 };
        c.max_image_extent = vk::Extent2D { width: 4096, height: 4096 };
        assert_eq!(choose_extent(&c, RenderSize { width: 0, height: 0 }), None);
    }
}
