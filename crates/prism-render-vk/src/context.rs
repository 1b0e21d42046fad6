// SPDX-License-Identifier: CEPL-1.0
//! Device & capability resolver: instance, surface, adapter/queue choice,
//! surface format + present mode, logical device.

use anyhow::{anyhow, Context, Result};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use prism_render::PresentPreference;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::ffi::{c_char, CStr, CString};
use tracing::{debug, info, warn};

use crate::error::{FatalError, Unwind};

#[cfg(debug_assertions)]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentPolicy {
    pub preferred: vk::PresentModeKHR,
    /// Fail rather than fall back to FIFO.
    pub strict: bool,
}

impl PresentPolicy {
    pub fn new(preferred: PresentPreference, strict: bool) -> Self {
        let preferred = match preferred {
            PresentPreference::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentPreference::Fifo => vk::PresentModeKHR::FIFO,
            PresentPreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        };
        Self { preferred, strict }
    }
}

impl Default for PresentPolicy {
    fn default() -> Self {
        Self::new(PresentPreference::Mailbox, false)
    }
}

/// Format and present mode resolved once for the adapter/surface pair.
/// The extent is not here: it is re-queried on every swap-chain build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let first = formats.first().ok_or(FatalError::NoSurfaceFormats)?;
    Ok(formats
        .iter()
        .copied()
        .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
        .unwrap_or(*first))
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    policy: PresentPolicy,
) -> Result<vk::PresentModeKHR> {
    if modes.is_empty() {
        return Err(FatalError::NoPresentModes.into());
    }
    if modes.contains(&policy.preferred) {
        return Ok(policy.preferred);
    }
    if policy.strict {
        return Err(FatalError::PresentModeUnavailable(policy.preferred).into());
    }
    // FIFO is the one mode every conforming implementation must expose.
    Ok(vk::PresentModeKHR::FIFO)
}

pub fn graphics_present_family(
    families: &[vk::QueueFamilyProperties],
    mut presents: impl FnMut(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, q)| q.queue_count > 0 && q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .find(|&i| presents(i))
}

pub fn has_extension(props: &[vk::ExtensionProperties], name: &CStr) -> bool {
    props
        .iter()
        .any(|e| e.extension_name_as_c_str().map(|n| n == name).unwrap_or(false))
}

pub fn format_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        _ => "OTHER",
    }
}

pub fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

#[cfg(debug_assertions)]
struct DebugState {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}
#[cfg(not(debug_assertions))]
struct DebugState;

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!("[vulkan] {msg}");
    } else {
        tracing::trace!("[vulkan] {msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_state(entry: &Entry, instance: &Instance) -> Result<DebugState> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
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
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok(DebugState { loader, messenger })
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_state(_entry: &Entry, _instance: &Instance) -> Result<DebugState> {
    Ok(DebugState)
}

impl DebugState {
    #[cfg(debug_assertions)]
    unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }

    #[cfg(not(debug_assertions))]
    unsafe fn destroy(&self) {}
}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let app = CString::new("prism")?;

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: vk::make_api_version(0, 0, 1, 0),
        p_engine_name: app.as_ptr(),
        engine_version: vk::make_api_version(0, 0, 1, 0),
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut exts = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    let mut layers: Vec<*const c_char> = Vec::new();

    #[cfg(debug_assertions)]
    {
        exts.push(ash::ext::debug_utils::NAME.as_ptr());
        let available = entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default();
        if available
            .iter()
            .any(|l| l.layer_name_as_c_str().map(|n| n == VALIDATION_LAYER).unwrap_or(false))
        {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!("validation layer not installed; running without it");
        }
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    Ok(entry
        .create_instance(&create_info, None)
        .context("create_instance")?)
}

unsafe fn pick_adapter(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    for phys in instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
    {
        let props = instance.get_physical_device_properties(phys);
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let exts = instance
            .enumerate_device_extension_properties(phys)
            .context("enumerate_device_extension_properties")?;
        if !has_extension(&exts, swapchain::NAME) {
            debug!("adapter {name}: no VK_KHR_swapchain, skipped");
            continue;
        }

        let families = instance.get_physical_device_queue_family_properties(phys);
        let family = graphics_present_family(&families, |i| {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        });
        match family {
            Some(family) => {
                info!("adapter: {name} (queue family {family})");
                return Ok((phys, family));
            }
            None => debug!("adapter {name}: no graphics+present queue family, skipped"),
        }
    }
    Err(FatalError::NoSuitableAdapter.into())
}

/// Process-lifetime Vulkan state. Immutable after [`DeviceContext::new`];
/// everything else borrows it.
pub struct DeviceContext {
    _entry: Entry,
    pub instance: Instance,
    debug: DebugState,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub phys: vk::PhysicalDevice,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub swapchain_loader: swapchain::Device,
    pub surface_desc: SurfaceDescriptor,
}

impl DeviceContext {
    // STRICT ORDER: instance -> surface -> adapter (checked against the
    // surface) -> device. The surface must exist before present support
    // can be queried.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        policy: PresentPolicy,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::load().map_err(|e| anyhow!("load Vulkan loader: {e}"))?;

        let instance;
        let debug;
        let surface_loader;
        let surface;
        let mut unwind = Unwind::new();

        instance = create_instance(&entry, dh)?;
        unwind.push(|| instance.destroy_instance(None));
        debug = create_debug_state(&entry, &instance)?;
        unwind.push(|| debug.destroy());

        surface_loader = surface::Instance::new(&entry, &instance);
        surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;
        unwind.push(|| surface_loader.destroy_surface(surface, None));

        let (phys, queue_family) = pick_adapter(&instance, &surface_loader, surface)?;

        let formats = surface_loader
            .get_physical_device_surface_formats(phys, surface)
            .context("get_physical_device_surface_formats")?;
        let modes = surface_loader
            .get_physical_device_surface_present_modes(phys, surface)
            .context("get_physical_device_surface_present_modes")?;
        let surface_desc = SurfaceDescriptor {
            format: choose_surface_format(&formats)?,
            present_mode: choose_present_mode(&modes, policy)?,
        };
        if surface_desc.present_mode != policy.preferred {
            warn!(
                "present mode {} unavailable, using {}",
                present_mode_name(policy.preferred),
                present_mode_name(surface_desc.present_mode)
            );
        }
        info!(
            "surface: format {} / {:?}, present mode {}",
            format_name(surface_desc.format.format),
            surface_desc.format.color_space,
            present_mode_name(surface_desc.present_mode)
        );

        let priorities = [1.0_f32];
        let qinfo = vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };
        let features = vk::PhysicalDeviceFeatures::default();
        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: 1,
            p_queue_create_infos: &qinfo,
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        };
        let device = instance
            .create_device(phys, &dinfo, None)
            .context("create_device")?;
        let queue = device.get_device_queue(queue_family, 0);

        let memory_props = instance.get_physical_device_memory_properties(phys);
        let swapchain_loader = swapchain::Device::new(&instance, &device);
        unwind.disarm();

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            memory_props,
            device,
            queue_family,
            queue,
            swapchain_loader,
            surface_desc,
        })
    }

    pub unsafe fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self
            .surface_loader
            .get_physical_device_surface_capabilities(self.phys, self.surface)
            .context("get_physical_device_surface_capabilities")?)
    }

    /// Destroys device, messenger, surface and instance, in that order.
    /// Every object created from the device must already be gone.
    pub unsafe fn destroy(&self) {
        self.device.destroy_device(None);
        self.debug.destroy();
        self.surface_loader.destroy_surface(self.surface, None);
        self.instance.destroy_instance(None);
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

    fn ext(name: &CStr) -> vk::ExtensionProperties {
        let mut p = vk::ExtensionProperties::default();
        for (dst, &b) in p.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = b as c_char;
        }
        p
    }

    #[test]
    fn test_choose_surface_format_prefers_bgra8_srgb() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), PREFERRED_FORMAT);
    }

    #[test]
    fn test_choose_surface_format_falls_back_to_first() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), formats[0]);
    }

    #[test]
    fn test_choose_surface_format_empty_is_fatal() {
        let err = choose_surface_format(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::NoSurfaceFormats)
        ));
    }

    #[test]
    fn test_present_mode_prefers_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let mode = choose_present_mode(&modes, PresentPolicy::default()).unwrap();
        assert_eq!(mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let mode = choose_present_mode(&modes, PresentPolicy::default()).unwrap();
        assert_eq!(mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_present_mode_strict_fails_when_absent() {
        let modes = [vk::PresentModeKHR::FIFO];
        let policy = PresentPolicy::new(PresentPreference::Mailbox, true);
        let err = choose_present_mode(&modes, policy).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::PresentModeUnavailable(vk::PresentModeKHR::MAILBOX))
        ));
    }

    #[test]
    fn test_present_mode_strict_ok_when_present() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        let policy = PresentPolicy::new(PresentPreference::Immediate, true);
        assert_eq!(
            choose_present_mode(&modes, policy).unwrap(),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn test_present_mode_empty_is_fatal() {
        assert!(choose_present_mode(&[], PresentPolicy::default()).is_err());
    }

    #[test]
    fn test_graphics_present_family_needs_both() {
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::COMPUTE,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            },
        ];
        // family 1 can't present, family 2 can
        assert_eq!(graphics_present_family(&families, |i| i != 1), Some(2));
        assert_eq!(graphics_present_family(&families, |_| false), None);
        assert_eq!(graphics_present_family(&families, |_| true), Some(1));
    }

    #[test]
    fn test_has_extension() {
        let props = [ext(c"VK_KHR_maintenance1"), ext(swapchain::NAME)];
        assert!(has_extension(&props, swapchain::NAME));
        assert!(!has_extension(&props[..1], swapchain::NAME));
    }
}
