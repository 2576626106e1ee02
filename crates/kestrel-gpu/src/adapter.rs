//! Instance creation and adapter selection.

use std::ffi::{CStr, CString};

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::error::{GpuError, Result};

/// Instance extensions needed to present to a window on this platform.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
    ]
}

fn portability_extensions() -> &'static [&'static CStr] {
    &[
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance.
///
/// Missing validation layers are logged and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    with_surface: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InvalidArgument(format!("application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Kestrel")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let surface_extensions = if with_surface {
        surface_instance_extensions()
    } else {
        Vec::new()
    };
    let extension_names: Vec<*const std::ffi::c_char> = surface_extensions
        .iter()
        .chain(portability_extensions().iter())
        .map(|ext| ext.as_ptr())
        .collect();

    let mut layer_names = Vec::new();
    if enable_validation {
        let available = entry.enumerate_instance_layer_properties()?;
        let found = available
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation layer {:?} not available", VALIDATION_LAYER);
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Adapter selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterPreference {
    /// First discrete GPU, falling back to the first usable adapter.
    #[default]
    FirstDiscrete,
    /// Highest [`AdapterInfo::score`].
    HighestScore,
}

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Adapter class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

impl AdapterKind {
    fn from_vk(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Other,
        }
    }
}

/// What one queue family can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub index: u32,
    pub queue_count: u32,
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    /// Whether the family can present to the target surface. Always false
    /// when probing without a surface.
    pub present: bool,
}

/// Enumerated adapter description.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: GpuVendor,
    pub kind: AdapterKind,
    pub api_version: u32,
    pub device_local_bytes: u64,
    pub queue_families: Vec<QueueFamilySupport>,
}

impl AdapterInfo {
    /// First graphics family, which must also present when `needs_present`.
    pub fn graphics_family(&self, needs_present: bool) -> Option<u32> {
        self.queue_families
            .iter()
            .find(|family| family.graphics && (family.present || !needs_present))
            .map(|family| family.index)
    }

    /// Preference score: class bonus plus one point per GiB of device-local
    /// memory.
    pub fn score(&self) -> u64 {
        let class = match self.kind {
            AdapterKind::Discrete => 1000,
            AdapterKind::Integrated => 100,
            AdapterKind::Virtual => 50,
            AdapterKind::Cpu | AdapterKind::Other => 0,
        };
        class + self.device_local_bytes / (1024 * 1024 * 1024)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}, Vulkan {}.{}, {} MiB device-local)",
            self.name,
            self.vendor,
            self.kind,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            self.device_local_bytes / (1024 * 1024)
        )
    }
}

/// Pick an adapter index out of `adapters`.
///
/// Adapters without a graphics family (that can also present, when
/// `needs_present`) are never chosen.
pub fn select_adapter(
    adapters: &[AdapterInfo],
    preference: AdapterPreference,
    needs_present: bool,
) -> Result<usize> {
    let usable = adapters
        .iter()
        .enumerate()
        .filter(|(_, adapter)| adapter.graphics_family(needs_present).is_some());

    let chosen = match preference {
        AdapterPreference::FirstDiscrete => {
            let candidates: Vec<_> = usable.collect();
            candidates
                .iter()
                .find(|(_, adapter)| adapter.kind == AdapterKind::Discrete)
                .or_else(|| candidates.first())
                .map(|&(index, _)| index)
        }
        AdapterPreference::HighestScore => usable
            .max_by(|(ia, a), (ib, b)| a.score().cmp(&b.score()).then(ib.cmp(ia)))
            .map(|(index, _)| index),
    };

    chosen.ok_or(GpuError::NoCompatibleDevice)
}

/// Surface adapters are checked for presentation support against.
pub struct PresentTarget<'a> {
    pub loader: &'a ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// Describe every adapter of `instance`.
///
/// # Safety
/// The instance and the surface, if any, must be valid.
pub unsafe fn enumerate_adapters(
    instance: &ash::Instance,
    surface: Option<&PresentTarget<'_>>,
) -> Result<Vec<(vk::PhysicalDevice, AdapterInfo)>> {
    let devices = instance.enumerate_physical_devices()?;
    let mut adapters = Vec::with_capacity(devices.len());

    for device in devices {
        let properties = instance.get_physical_device_properties(device);
        let memory = instance.get_physical_device_memory_properties(device);

        let device_local_bytes = memory
            .memory_heaps
            .iter()
            .take(memory.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        let mut queue_families = Vec::new();
        for (index, family) in instance
            .get_physical_device_queue_family_properties(device)
            .iter()
            .enumerate()
        {
            let index = index as u32;
            let present = match surface {
                Some(target) => target
                    .loader
                    .get_physical_device_surface_support(device, index, target.surface)
                    .unwrap_or(false),
                None => false,
            };
            queue_families.push(QueueFamilySupport {
                index,
                queue_count: family.queue_count,
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                compute: family.queue_flags.contains(vk::QueueFlags::COMPUTE),
                transfer: family.queue_flags.intersects(
                    vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                ),
                present,
            });
        }

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        adapters.push((
            device,
            AdapterInfo {
                name,
                vendor: GpuVendor::from_vendor_id(properties.vendor_id),
                kind: AdapterKind::from_vk(properties.device_type),
                api_version: properties.api_version,
                device_local_bytes,
                queue_families,
            },
        ));
    }

    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn family(index: u32, graphics: bool, present: bool) -> QueueFamilySupport {
        QueueFamilySupport {
            index,
            queue_count: 1,
            graphics,
            compute: graphics,
            transfer: true,
            present,
        }
    }

    fn adapter(name: &str, kind: AdapterKind, gib: u64, families: Vec<QueueFamilySupport>) -> AdapterInfo {
        AdapterInfo {
            name: name.into(),
            vendor: GpuVendor::Other(0),
            kind,
            api_version: vk::API_VERSION_1_1,
            device_local_bytes: gib * GIB,
            queue_families: families,
        }
    }

    #[test]
    fn vendor_ids_are_recognised() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn summary_names_kind_and_memory() {
        let info = adapter("Test GPU", AdapterKind::Discrete, 8, vec![]);
        insta::assert_snapshot!(
            info.summary(),
            @"Test GPU (Other(0), Discrete, Vulkan 1.1, 8192 MiB device-local)"
        );
    }

    #[test]
    fn score_favours_class_then_memory() {
        let discrete = adapter("d", AdapterKind::Discrete, 8, vec![]);
        let integrated = adapter("i", AdapterKind::Integrated, 16, vec![]);
        let virt = adapter("v", AdapterKind::Virtual, 0, vec![]);
        assert_eq!(discrete.score(), 1008);
        assert_eq!(integrated.score(), 116);
        assert_eq!(virt.score(), 50);
    }

    #[test]
    fn first_discrete_falls_back_to_first_usable() {
        let adapters = vec![
            adapter("integrated", AdapterKind::Integrated, 2, vec![family(0, true, true)]),
            adapter("discrete", AdapterKind::Discrete, 4, vec![family(0, true, true)]),
        ];
        assert_eq!(
            select_adapter(&adapters, AdapterPreference::FirstDiscrete, true).unwrap(),
            1
        );
        assert_eq!(
            select_adapter(&adapters[..1], AdapterPreference::FirstDiscrete, true).unwrap(),
            0
        );
    }

    #[test]
    fn highest_score_prefers_earlier_on_ties() {
        let adapters = vec![
            adapter("a", AdapterKind::Discrete, 8, vec![family(0, true, true)]),
            adapter("b", AdapterKind::Discrete, 8, vec![family(0, true, true)]),
            adapter("c", AdapterKind::Integrated, 64, vec![family(0, true, true)]),
        ];
        assert_eq!(
            select_adapter(&adapters, AdapterPreference::HighestScore, true).unwrap(),
            0
        );
    }

    #[test]
    fn presentation_is_required_only_with_a_surface() {
        let adapters = vec![adapter(
            "split",
            AdapterKind::Discrete,
            4,
            vec![family(0, true, false), family(1, false, true)],
        )];

        assert!(matches!(
            select_adapter(&adapters, AdapterPreference::FirstDiscrete, true),
            Err(GpuError::NoCompatibleDevice)
        ));
        assert_eq!(
            select_adapter(&adapters, AdapterPreference::FirstDiscrete, false).unwrap(),
            0
        );
        assert_eq!(adapters[0].graphics_family(false), Some(0));
    }

    #[test]
    fn no_adapters_is_no_compatible_device() {
        assert!(matches!(
            select_adapter(&[], AdapterPreference::HighestScore, false),
            Err(GpuError::NoCompatibleDevice)
        ));
    }
}
