//! Physical device and queue family selection.

use std::collections::BTreeSet;
use std::ffi::CStr;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::surface::Surface;

/// Logical role a queue plays for the rest of the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    /// Can present to the context's surface.
    Present,
}

impl QueueRole {
    /// Queue flags a family must expose for this role. `Present` is tested
    /// against the surface instead.
    pub fn queue_flags(self) -> Option<vk::QueueFlags> {
        match self {
            Self::Graphics => Some(vk::QueueFlags::GRAPHICS),
            Self::Compute => Some(vk::QueueFlags::COMPUTE),
            Self::Transfer => Some(vk::QueueFlags::TRANSFER),
            Self::Present => None,
        }
    }
}

/// Pick one queue family per requested role.
///
/// Each role is resolved independently: the first family that satisfies it
/// wins, so several roles may share a family. Fails on the first role that no
/// family satisfies.
pub fn select_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    roles: &[QueueRole],
    mut supports_present: F,
) -> Result<Vec<(QueueRole, u32)>>
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut assignments = Vec::with_capacity(roles.len());

    for &role in roles {
        let mut found = None;
        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 {
                continue;
            }
            let matches = match role.queue_flags() {
                Some(flags) => family.queue_flags.contains(flags),
                None => supports_present(index)?,
            };
            if matches {
                found = Some(index);
                break;
            }
        }

        let family = found.ok_or(GpuError::MissingQueue(role))?;
        assignments.push((role, family));
    }

    Ok(assignments)
}

/// Distinct family indices out of a role assignment, in ascending order.
pub fn unique_families(assignments: &[(QueueRole, u32)]) -> Vec<u32> {
    assignments
        .iter()
        .map(|&(_, family)| family)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Index of the device to use.
///
/// The first device whose type matches the earliest entry of `preferred` is
/// chosen; when nothing matches, the first enumerated device is used.
pub fn pick_physical_device(
    device_types: &[vk::PhysicalDeviceType],
    preferred: &[vk::PhysicalDeviceType],
) -> Option<usize> {
    if device_types.is_empty() {
        return None;
    }

    preferred
        .iter()
        .find_map(|wanted| device_types.iter().position(|ty| ty == wanted))
        .or(Some(0))
}

/// Split requested extensions into the set to enable.
///
/// Returns the name of the first missing required extension as the error.
pub fn resolve_extensions<'a>(
    required: &[&'a CStr],
    optional: &[&'a CStr],
    available: &[&CStr],
) -> std::result::Result<Vec<&'a CStr>, &'a CStr> {
    let mut enabled = Vec::with_capacity(required.len() + optional.len());

    for &name in required {
        if !available.contains(&name) {
            return Err(name);
        }
        if !enabled.contains(&name) {
            enabled.push(name);
        }
    }

    for &name in optional {
        if available.contains(&name) {
            if !enabled.contains(&name) {
                enabled.push(name);
            }
        } else {
            tracing::warn!("Optional extension {} not available", name.to_string_lossy());
        }
    }

    Ok(enabled)
}

/// Device features the crate knows how to enable.
///
/// Core 1.0 flags, plus the Vulkan 1.1, 1.2 and 1.3 feature blocks that the
/// renderers use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub sample_rate_shading: bool,
    pub shader_draw_parameters: bool,
    pub descriptor_indexing: bool,
    pub buffer_device_address: bool,
    pub timeline_semaphore: bool,
    pub scalar_block_layout: bool,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
}

impl DeviceFeatures {
    /// Features every renderer in the workspace records with.
    pub const BASELINE: Self = Self {
        sampler_anisotropy: false,
        sample_rate_shading: false,
        shader_draw_parameters: false,
        descriptor_indexing: false,
        buffer_device_address: false,
        timeline_semaphore: false,
        scalar_block_layout: false,
        dynamic_rendering: true,
        synchronization2: true,
    };

    fn flags(self) -> [(&'static str, bool); 9] {
        [
            ("samplerAnisotropy", self.sampler_anisotropy),
            ("sampleRateShading", self.sample_rate_shading),
            ("shaderDrawParameters", self.shader_draw_parameters),
            ("descriptorIndexing", self.descriptor_indexing),
            ("bufferDeviceAddress", self.buffer_device_address),
            ("timelineSemaphore", self.timeline_semaphore),
            ("scalarBlockLayout", self.scalar_block_layout),
            ("dynamicRendering", self.dynamic_rendering),
            ("synchronization2", self.synchronization2),
        ]
    }

    fn from_flags(flags: [bool; 9]) -> Self {
        let [
            sampler_anisotropy,
            sample_rate_shading,
            shader_draw_parameters,
            descriptor_indexing,
            buffer_device_address,
            timeline_semaphore,
            scalar_block_layout,
            dynamic_rendering,
            synchronization2,
        ] = flags;
        Self {
            sampler_anisotropy,
            sample_rate_shading,
            shader_draw_parameters,
            descriptor_indexing,
            buffer_device_address,
            timeline_semaphore,
            scalar_block_layout,
            dynamic_rendering,
            synchronization2,
        }
    }

    fn zip(self, other: Self, op: impl Fn(bool, bool) -> bool) -> Self {
        let (a, b) = (self.flags(), other.flags());
        Self::from_flags(std::array::from_fn(|i| op(a[i].1, b[i].1)))
    }

    /// Features set in either.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        self.zip(other, |a, b| a || b)
    }

    /// Features set in both.
    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        self.zip(other, |a, b| a && b)
    }

    /// Vulkan name of the first feature set here but not in `supported`.
    pub fn first_missing(self, supported: Self) -> Option<&'static str> {
        self.flags()
            .into_iter()
            .zip(supported.flags())
            .find(|((_, wanted), (_, have))| *wanted && !*have)
            .map(|((name, _), _)| name)
    }
}

/// Features to enable given what the device supports.
///
/// Every required feature must be supported; optional ones are enabled when
/// available. Returns the Vulkan name of the first unsupported required
/// feature as the error.
pub fn resolve_features(
    required: DeviceFeatures,
    optional: DeviceFeatures,
    supported: DeviceFeatures,
) -> std::result::Result<DeviceFeatures, &'static str> {
    if let Some(name) = required.first_missing(supported) {
        return Err(name);
    }
    if let Some(name) = optional.first_missing(supported) {
        tracing::warn!("Optional device feature {name} not supported");
    }
    Ok(required.union(optional.intersection(supported)))
}

/// One created queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueEntry {
    pub role: QueueRole,
    pub family: u32,
    pub queue: vk::Queue,
}

/// Mapping from logical role to family index and queue handle.
#[derive(Debug, Clone, Default)]
pub struct QueueMap {
    entries: Vec<QueueEntry>,
}

impl QueueMap {
    /// Look up the queue serving `role`.
    pub fn get(&self, role: QueueRole) -> Option<&QueueEntry> {
        self.entries.iter().find(|entry| entry.role == role)
    }

    /// Family index serving `role`.
    pub fn family(&self, role: QueueRole) -> Option<u32> {
        self.get(role).map(|entry| entry.family)
    }

    /// Queue handle serving `role`.
    pub fn queue(&self, role: QueueRole) -> Option<vk::Queue> {
        self.get(role).map(|entry| entry.queue)
    }

    /// Distinct families touched by any role.
    pub fn unique_families(&self) -> Vec<u32> {
        self.entries
            .iter()
            .map(|entry| entry.family)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }
}

/// Device selection parameters.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device types in order of preference.
    pub preferred_types: Vec<vk::PhysicalDeviceType>,
    /// Queue roles that must be served.
    pub roles: Vec<QueueRole>,
    pub required_extensions: Vec<&'static CStr>,
    pub optional_extensions: Vec<&'static CStr>,
    /// Creation fails when any of these is unsupported.
    pub required_features: DeviceFeatures,
    /// Enabled when supported.
    pub optional_features: DeviceFeatures,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            preferred_types: vec![
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vk::PhysicalDeviceType::INTEGRATED_GPU,
            ],
            roles: vec![QueueRole::Graphics, QueueRole::Present],
            required_extensions: Vec::new(),
            optional_extensions: Vec::new(),
            required_features: DeviceFeatures::BASELINE,
            optional_features: DeviceFeatures {
                sampler_anisotropy: true,
                sample_rate_shading: true,
                ..DeviceFeatures::default()
            },
        }
    }
}

/// Human readable device description for logs.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn describe_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> String {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let name = properties
        .device_name_as_c_str()
        .map_or_else(|_| "<unnamed>".into(), CStr::to_string_lossy);
    format!(
        "{} ({:?}) - Vulkan {}.{}.{}",
        name,
        properties.device_type,
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version),
    )
}

/// Choose the physical device according to `preferred`.
///
/// # Safety
/// The instance must be valid.
pub(crate) unsafe fn select_physical_device(
    instance: &ash::Instance,
    preferred: &[vk::PhysicalDeviceType],
) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    let types: Vec<_> = devices
        .iter()
        .map(|&device| unsafe { instance.get_physical_device_properties(device) }.device_type)
        .collect();

    let index = pick_physical_device(&types, preferred).ok_or(GpuError::NoSuitableDevice)?;
    Ok(devices[index])
}

/// Features `physical_device` supports, out of those [`DeviceFeatures`] names.
///
/// # Safety
/// The instance and physical device must be valid, and the device must
/// support Vulkan 1.3.
pub unsafe fn supported_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> DeviceFeatures {
    let mut vulkan_1_1 = vk::PhysicalDeviceVulkan11Features::default();
    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let core = {
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_1)
            .push_next(&mut vulkan_1_2)
            .push_next(&mut vulkan_1_3);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        features2.features
    };

    DeviceFeatures {
        sampler_anisotropy: core.sampler_anisotropy == vk::TRUE,
        sample_rate_shading: core.sample_rate_shading == vk::TRUE,
        shader_draw_parameters: vulkan_1_1.shader_draw_parameters == vk::TRUE,
        descriptor_indexing: vulkan_1_2.descriptor_indexing == vk::TRUE,
        buffer_device_address: vulkan_1_2.buffer_device_address == vk::TRUE,
        timeline_semaphore: vulkan_1_2.timeline_semaphore == vk::TRUE,
        scalar_block_layout: vulkan_1_2.scalar_block_layout == vk::TRUE,
        dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
        synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
    }
}

/// Logical device plus what was enabled on it.
pub(crate) struct CreatedDevice {
    pub device: ash::Device,
    pub queues: QueueMap,
    pub features: DeviceFeatures,
}

/// Create the logical device with one queue per unique family.
///
/// # Safety
/// The instance and physical device must be valid, and `surface` must belong
/// to the same instance.
pub(crate) unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&Surface>,
    config: &DeviceConfig,
) -> Result<CreatedDevice> {
    let mut required = vec![];
    if surface.is_some() {
        required.push(ash::khr::swapchain::NAME);
    }
    required.extend(config.required_extensions.iter().copied());

    let available_props =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    let available: Vec<&CStr> = available_props
        .iter()
        .filter_map(|props| props.extension_name_as_c_str().ok())
        .collect();
    let extensions = resolve_extensions(&required, &config.optional_extensions, &available)
        .map_err(|name| GpuError::MissingDeviceExtension(name.to_string_lossy().into_owned()))?;

    let supported = unsafe { supported_features(instance, physical_device) };
    let enabled = resolve_features(config.required_features, config.optional_features, supported)
        .map_err(GpuError::MissingDeviceFeature)?;

    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let assignments = select_queue_families(&families, &config.roles, |family| match surface {
        Some(surface) => surface.supports_present(physical_device, family),
        None => Err(GpuError::InvalidState(
            "Present queue requested without a surface".to_string(),
        )),
    })?;

    let unique = unique_families(&assignments);
    tracing::debug!(?assignments, ?unique, "Queue families selected");

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let core = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(enabled.sampler_anisotropy)
        .sample_rate_shading(enabled.sample_rate_shading);
    let mut vulkan_1_1 = vk::PhysicalDeviceVulkan11Features::default()
        .shader_draw_parameters(enabled.shader_draw_parameters);
    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(enabled.descriptor_indexing)
        .buffer_device_address(enabled.buffer_device_address)
        .timeline_semaphore(enabled.timeline_semaphore)
        .scalar_block_layout(enabled.scalar_block_layout);
    let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(enabled.dynamic_rendering)
        .synchronization2(enabled.synchronization2);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(core)
        .push_next(&mut vulkan_1_1)
        .push_next(&mut vulkan_1_2)
        .push_next(&mut vulkan_1_3);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };
    tracing::debug!(?enabled, "Logical device created");

    let entries = assignments
        .into_iter()
        .map(|(role, family)| QueueEntry {
            role,
            family,
            queue: unsafe { device.get_device_queue(family, 0) },
        })
        .collect();

    Ok(CreatedDevice {
        device,
        queues: QueueMap { entries },
        features: enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn typical_families() -> Vec<vk::QueueFamilyProperties> {
        vec![
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ]
    }

    #[test]
    fn every_role_gets_a_family() {
        let families = typical_families();
        let roles = [
            QueueRole::Graphics,
            QueueRole::Compute,
            QueueRole::Transfer,
            QueueRole::Present,
        ];
        let assignments = select_queue_families(&families, &roles, |i| Ok(i == 0)).unwrap();

        assert_eq!(assignments.len(), roles.len());
        for (role, family) in &assignments {
            let props = families[*family as usize];
            if let Some(flags) = role.queue_flags() {
                assert!(props.queue_flags.contains(flags));
            }
        }
        assert_eq!(assignments[3], (QueueRole::Present, 0));
    }

    #[test]
    fn shared_families_collapse_to_one_queue() {
        let families = typical_families();
        let roles = [QueueRole::Graphics, QueueRole::Compute, QueueRole::Present];
        let assignments = select_queue_families(&families, &roles, |_| Ok(true)).unwrap();

        // Graphics, compute and present all land on family 0.
        assert_eq!(unique_families(&assignments), vec![0]);
    }

    #[test]
    fn present_can_live_on_another_family() {
        let families = typical_families();
        let roles = [QueueRole::Graphics, QueueRole::Present];
        let assignments = select_queue_families(&families, &roles, |i| Ok(i == 2)).unwrap();
        assert_eq!(unique_families(&assignments), vec![0, 2]);
    }

    #[test]
    fn missing_capability_fails() {
        let families = vec![family(vk::QueueFlags::TRANSFER)];
        let err = select_queue_families(&families, &[QueueRole::Graphics], |_| Ok(true))
            .unwrap_err();
        assert!(matches!(err, GpuError::MissingQueue(QueueRole::Graphics)));

        let err = select_queue_families(&typical_families(), &[QueueRole::Present], |_| Ok(false))
            .unwrap_err();
        assert!(matches!(err, GpuError::MissingQueue(QueueRole::Present)));
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = vec![
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS,
                queue_count: 0,
                ..Default::default()
            },
            family(vk::QueueFlags::GRAPHICS),
        ];
        let assignments = select_queue_families(&families, &[QueueRole::Graphics], |_| Ok(false))
            .unwrap();
        assert_eq!(assignments, vec![(QueueRole::Graphics, 1)]);
    }

    #[test]
    fn preferred_device_type_wins() {
        use vk::PhysicalDeviceType as T;
        let devices = [T::CPU, T::INTEGRATED_GPU, T::DISCRETE_GPU, T::DISCRETE_GPU];

        assert_eq!(pick_physical_device(&devices, &[T::DISCRETE_GPU]), Some(2));
        assert_eq!(
            pick_physical_device(&devices, &[T::VIRTUAL_GPU, T::INTEGRATED_GPU]),
            Some(1)
        );
        assert_eq!(pick_physical_device(&devices, &[T::VIRTUAL_GPU]), Some(0));
        assert_eq!(pick_physical_device(&[], &[T::DISCRETE_GPU]), None);
    }

    #[test]
    fn required_features_must_be_supported() {
        let supported = DeviceFeatures {
            sampler_anisotropy: true,
            ..DeviceFeatures::BASELINE
        };

        let enabled =
            resolve_features(DeviceFeatures::BASELINE, DeviceFeatures::default(), supported)
                .unwrap();
        assert_eq!(enabled, DeviceFeatures::BASELINE);

        let required = DeviceFeatures {
            buffer_device_address: true,
            ..DeviceFeatures::BASELINE
        };
        let err = resolve_features(required, DeviceFeatures::default(), supported).unwrap_err();
        assert_eq!(err, "bufferDeviceAddress");

        let err = resolve_features(
            DeviceFeatures::BASELINE,
            DeviceFeatures::default(),
            DeviceFeatures::default(),
        )
        .unwrap_err();
        assert_eq!(err, "dynamicRendering");
    }

    #[test]
    fn optional_features_follow_support() {
        let supported = DeviceFeatures {
            sampler_anisotropy: true,
            timeline_semaphore: true,
            ..DeviceFeatures::BASELINE
        };
        let optional = DeviceFeatures {
            sampler_anisotropy: true,
            sample_rate_shading: true,
            timeline_semaphore: true,
            ..DeviceFeatures::default()
        };

        let enabled = resolve_features(DeviceFeatures::BASELINE, optional, supported).unwrap();
        assert!(enabled.sampler_anisotropy);
        assert!(enabled.timeline_semaphore);
        assert!(!enabled.sample_rate_shading);
        assert!(enabled.dynamic_rendering && enabled.synchronization2);
    }

    #[test]
    fn default_config_requires_dynamic_rendering() {
        let config = DeviceConfig::default();
        assert!(config.required_features.dynamic_rendering);
        assert!(config.required_features.synchronization2);
        assert!(!config.required_features.sampler_anisotropy);
        assert!(config.optional_features.sampler_anisotropy);
    }

    #[test]
    fn extension_resolution() {
        let swapchain = c"VK_KHR_swapchain";
        let maintenance = c"VK_KHR_maintenance5";
        let missing = c"VK_EXT_mesh_shader";

        let available = [swapchain, maintenance];
        let enabled =
            resolve_extensions(&[swapchain], &[maintenance, missing], &available).unwrap();
        assert_eq!(enabled, vec![swapchain, maintenance]);

        let err = resolve_extensions(&[missing], &[], &available).unwrap_err();
        assert_eq!(err, missing);
    }
}
