//! Vulkan instance creation.

use std::ffi::{c_char, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::device::resolve_extensions;
use crate::error::{GpuError, Result};

/// Khronos validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance creation parameters.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Enable the validation layer and the debug messenger when available.
    pub validation: bool,
    pub required_extensions: Vec<&'static CStr>,
    pub optional_extensions: Vec<&'static CStr>,
    pub required_layers: Vec<&'static CStr>,
    pub optional_layers: Vec<&'static CStr>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "vb".to_string(),
            validation: cfg!(debug_assertions),
            required_extensions: Vec::new(),
            optional_extensions: Vec::new(),
            required_layers: Vec::new(),
            optional_layers: Vec::new(),
        }
    }
}

/// Created instance plus what ended up enabled.
pub(crate) struct CreatedInstance {
    pub instance: ash::Instance,
    pub debug_utils: bool,
}

/// Resolve requested layers against the available ones.
///
/// Missing required layers fail; missing optional layers are skipped.
pub fn resolve_layers<'a>(
    required: &[&'a CStr],
    optional: &[&'a CStr],
    available: &[&CStr],
) -> Result<Vec<&'a CStr>> {
    let mut enabled = Vec::new();
    for &layer in required {
        if !available.contains(&layer) {
            return Err(GpuError::MissingLayer(layer.to_string_lossy().into_owned()));
        }
        enabled.push(layer);
    }
    for &layer in optional {
        if available.contains(&layer) {
            if !enabled.contains(&layer) {
                enabled.push(layer);
            }
        } else {
            tracing::warn!("Layer {} not available", layer.to_string_lossy());
        }
    }
    Ok(enabled)
}

/// Create a Vulkan instance.
///
/// Surface extensions for `display` are added to the required set. With
/// validation on, the Khronos layer and `VK_EXT_debug_utils` are requested as
/// optional so machines without the SDK still start.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub(crate) unsafe fn create_instance(
    entry: &ash::Entry,
    config: &InstanceConfig,
    display: Option<RawDisplayHandle>,
) -> Result<CreatedInstance> {
    let app_name = CString::new(config.app_name.as_str())
        .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vb")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut required_extensions = config.required_extensions.clone();
    if let Some(display) = display {
        let surface_extensions = ash_window::enumerate_required_extensions(display)?;
        // SAFETY: ash-window returns static NUL-terminated extension names.
        required_extensions.extend(
            surface_extensions
                .iter()
                .map(|&ext| unsafe { CStr::from_ptr(ext) }),
        );
    }
    #[cfg(target_os = "macos")]
    required_extensions.push(ash::khr::portability_enumeration::NAME);

    let mut optional_extensions = config.optional_extensions.clone();
    let mut optional_layers = config.optional_layers.clone();
    if config.validation {
        optional_extensions.push(ash::ext::debug_utils::NAME);
        optional_layers.push(VALIDATION_LAYER);
    }

    let extension_props = unsafe { entry.enumerate_instance_extension_properties(None)? };
    let available_extensions: Vec<&CStr> = extension_props
        .iter()
        .filter_map(|props| props.extension_name_as_c_str().ok())
        .collect();
    let extensions = resolve_extensions(
        &required_extensions,
        &optional_extensions,
        &available_extensions,
    )
    .map_err(|name| GpuError::MissingInstanceExtension(name.to_string_lossy().into_owned()))?;

    let layer_props = unsafe { entry.enumerate_instance_layer_properties()? };
    let available_layers: Vec<&CStr> = layer_props
        .iter()
        .filter_map(|props| props.layer_name_as_c_str().ok())
        .collect();
    let layers = resolve_layers(&config.required_layers, &optional_layers, &available_layers)?;

    let debug_utils = extensions.contains(&ash::ext::debug_utils::NAME);

    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };

    tracing::debug!(
        extensions = extensions.len(),
        layers = layers.len(),
        debug_utils,
        "Vulkan instance created"
    );

    Ok(CreatedInstance {
        instance,
        debug_utils,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_optional_layer_is_skipped() {
        let available = [c"VK_LAYER_MESA_overlay"];
        let layers = resolve_layers(&[], &[VALIDATION_LAYER], &available).unwrap();
        assert!(layers.is_empty());
    }

    #[test]
    fn missing_required_layer_fails() {
        let err = resolve_layers(&[VALIDATION_LAYER], &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            GpuError::MissingLayer(name) if name == "VK_LAYER_KHRONOS_validation"
        ));
    }

    #[test]
    fn layers_are_not_duplicated() {
        let available = [VALIDATION_LAYER];
        let layers = resolve_layers(&[VALIDATION_LAYER], &[VALIDATION_LAYER], &available).unwrap();
        assert_eq!(layers, vec![VALIDATION_LAYER]);
    }
}
