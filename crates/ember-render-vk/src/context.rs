// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface and device setup.
//!
//! Everything in here is created once and handed to the rest of the backend
//! as plain handles. Each owner below releases exactly one Vulkan object in
//! `Drop`, so an `Init` that fails halfway unwinds whatever already exists.
use std::ffi::{c_char, c_void, CStr};

use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, error, info, warn};

use crate::error::{CreateContext, VkError, VkResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }

    /// Concurrent sharing only when two families actually touch the images.
    pub fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        if self.graphics == self.present {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, self.unique())
        }
    }
}

/// Picks graphics/present families, preferring a single family that does both.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let is_graphics =
        |q: &vk::QueueFamilyProperties| q.queue_count > 0 && q.queue_flags.contains(vk::QueueFlags::GRAPHICS);

    let mut graphics = None;
    let mut present = None;
    for (i, q) in props.iter().enumerate() {
        let i = i as u32;
        let can_present = q.queue_count > 0 && supports_present(i);
        if is_graphics(q) && can_present {
            return Some(QueueFamilies {
                graphics: i,
                present: i,
            });
        }
        if is_graphics(q) && graphics.is_none() {
            graphics = Some(i);
        }
        if can_present && present.is_none() {
            present = Some(i);
        }
    }
    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

pub(crate) struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_debug_utils_messenger(self.handle, None);
        }
        debug!("destroyed debug messenger");
    }
}

pub(crate) struct VulkanInstance {
    // Messenger before instance: fields drop in declaration order.
    debug: Option<DebugMessenger>,
    pub(crate) raw: ash::Instance,
    pub(crate) entry: Entry,
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        self.debug.take();
        unsafe {
            self.raw.destroy_instance(None);
        }
        debug!("destroyed instance");
    }
}

unsafe fn has_validation_layer(entry: &Entry) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER)
}

impl VulkanInstance {
    unsafe fn new(display: Option<RawDisplayHandle>, validation: bool) -> VkResult<Self> {
        let entry = unsafe { Entry::load()? };
        let app = c"ember";

        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app.as_ptr(),
            application_version: 0,
            p_engine_name: app.as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_2,
            ..Default::default()
        };

        let mut exts: Vec<*const c_char> = match display {
            Some(dh) => ash_window::enumerate_required_extensions(dh)
                .during("enumerate_required_extensions")?
                .to_vec(),
            None => Vec::new(),
        };

        let validation = validation && {
            let found = unsafe { has_validation_layer(&entry) };
            if !found {
                warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }
            found
        };
        let layers = [VALIDATION_LAYER.as_ptr()];
        if validation {
            exts.push(debug_utils::NAME.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: exts.len() as u32,
            pp_enabled_extension_names: exts.as_ptr(),
            enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
            pp_enabled_layer_names: if validation { layers.as_ptr() } else { std::ptr::null() },
            ..Default::default()
        };
        let raw = unsafe { entry.create_instance(&create_info, None) }.creating("instance")?;

        let mut instance = Self {
            debug: None,
            raw,
            entry,
        };
        if validation {
            instance.debug = Some(unsafe { instance.create_debug_messenger() }?);
            info!("validation layer enabled");
        }
        Ok(instance)
    }

    /// Hands the messenger out so it can be released ahead of the instance.
    pub(crate) fn take_debug_messenger(&mut self) -> Option<DebugMessenger> {
        self.debug.take()
    }

    unsafe fn create_debug_messenger(&self) -> VkResult<DebugMessenger> {
        let loader = debug_utils::Instance::new(&self.entry, &self.raw);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            ..Default::default()
        };
        let handle = unsafe { loader.create_debug_utils_messenger(&ci, None) }
            .creating("debug messenger")?;
        Ok(DebugMessenger { loader, handle })
    }
}

pub(crate) struct Surface {
    pub(crate) loader: surface::Instance,
    pub(crate) handle: vk::SurfaceKHR,
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        debug!("destroyed surface");
    }
}

pub(crate) struct LogicalDevice {
    pub(crate) raw: ash::Device,
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            self.raw.device_wait_idle().ok();
            self.raw.destroy_device(None);
        }
        debug!("destroyed device");
    }
}

/// Handles consumed from the device-setup layer.
///
/// Field order is release order: surface, then device, then instance.
pub struct DeviceContext {
    pub(crate) surface: Option<Surface>,
    pub(crate) device: LogicalDevice,
    pub(crate) instance: VulkanInstance,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) memory_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) families: QueueFamilies,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    /// Graphics-capable families always support transfers; uploads share the graphics queue.
    pub(crate) transfer_queue: vk::Queue,
}

impl DeviceContext {
    /// Builds everything a windowed renderer needs, against the given native handles.
    ///
    /// # Safety
    /// The handles must stay valid until the returned context is dropped.
    pub unsafe fn for_window(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        validation: bool,
    ) -> VkResult<Self> {
        let instance = unsafe { VulkanInstance::new(Some(display), validation)? };
        let handle = unsafe {
            ash_window::create_surface(&instance.entry, &instance.raw, display, window, None)
        }
        .creating("surface")?;
        let surface = Surface {
            loader: surface::Instance::new(&instance.entry, &instance.raw),
            handle,
        };

        let (phys, families) = unsafe { pick_device(&instance.raw, Some(&surface))? };
        unsafe { Self::finish(instance, Some(surface), phys, families, true) }
    }

    /// A surfaceless context for uploads and tests. Present queue aliases graphics.
    pub fn headless(validation: bool) -> VkResult<Self> {
        unsafe {
            let instance = VulkanInstance::new(None, validation)?;
            let (phys, families) = pick_device(&instance.raw, None)?;
            Self::finish(instance, None, phys, families, false)
        }
    }

    unsafe fn finish(
        instance: VulkanInstance,
        surface: Option<Surface>,
        phys: vk::PhysicalDevice,
        families: QueueFamilies,
        with_swapchain: bool,
    ) -> VkResult<Self> {
        let priorities = [1.0_f32];
        let qinfos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let device_exts = if with_swapchain {
            vec![swapchain::NAME.as_ptr()]
        } else {
            Vec::new()
        };
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: qinfos.len() as u32,
            p_queue_create_infos: qinfos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            ..Default::default()
        };
        let raw = unsafe { instance.raw.create_device(phys, &dinfo, None) }.creating("device")?;
        let device = LogicalDevice { raw };

        let graphics_queue = unsafe { device.raw.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.raw.get_device_queue(families.present, 0) };
        let memory_props = unsafe { instance.raw.get_physical_device_memory_properties(phys) };

        let props = unsafe { instance.raw.get_physical_device_properties(phys) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
        info!(
            "using {:?} (graphics family {}, present family {})",
            name, families.graphics, families.present
        );

        Ok(Self {
            surface,
            device,
            instance,
            phys,
            memory_props,
            families,
            graphics_queue,
            present_queue,
            transfer_queue: graphics_queue,
        })
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device.raw
    }

    #[inline]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance.raw
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_props
    }

    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub(crate) fn surface(&self) -> VkResult<&Surface> {
        self.surface
            .as_ref()
            .ok_or_else(|| VkError::Surface("context was created without a surface".into()))
    }

    pub fn wait_idle(&self) {
        unsafe {
            self.device.raw.device_wait_idle().ok();
        }
    }
}

unsafe fn supports_swapchain(instance: &ash::Instance, phys: vk::PhysicalDevice) -> bool {
    unsafe { instance.enumerate_device_extension_properties(phys) }
        .unwrap_or_default()
        .iter()
        .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == swapchain::NAME)
}

unsafe fn pick_device(
    instance: &ash::Instance,
    surface: Option<&Surface>,
) -> VkResult<(vk::PhysicalDevice, QueueFamilies)> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.during("enumerate_physical_devices")?;
    for phys in devices {
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let families = match surface {
            Some(s) => {
                if !unsafe { supports_swapchain(instance, phys) } {
                    continue;
                }
                let formats = unsafe {
                    s.loader
                        .get_physical_device_surface_formats(phys, s.handle)
                }
                .unwrap_or_default();
                let modes = unsafe {
                    s.loader
                        .get_physical_device_surface_present_modes(phys, s.handle)
                }
                .unwrap_or_default();
                if formats.is_empty() || modes.is_empty() {
                    continue;
                }
                find_queue_families(&qprops, |i| unsafe {
                    s.loader
                        .get_physical_device_surface_support(phys, i, s.handle)
                        .unwrap_or(false)
                })
            }
            None => find_queue_families(&qprops, |_| true),
        };
        if let Some(families) = families {
            return Ok((phys, families));
        }
    }
    Err(VkError::NoSuitableDevice)
}
