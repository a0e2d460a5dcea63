//! GPU context: the single owner of instance, device, surface and allocator.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};

use crate::command::ImmediateSubmitter;
use crate::debug::{DebugMessenger, DebugSink, TracingSink};
use crate::device::{
    create_device, describe_device, select_physical_device, DeviceConfig, DeviceFeatures,
    QueueMap, QueueRole,
};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, InstanceConfig};
use crate::memory::GpuAllocator;
use crate::surface::{Surface, SurfaceSupport};

/// Vulkan state shared by everything that touches the GPU.
///
/// Dropping the context waits for the device and releases resources in the
/// reverse order they were acquired, instance last. Objects created from the
/// context (swapchains, buffers, pipelines) must be destroyed first.
pub struct GpuContext {
    // Keeps the loader library mapped.
    _entry: ash::Entry,
    instance: ash::Instance,
    messenger: Option<DebugMessenger>,
    surface: Option<Surface>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    queues: QueueMap,
    features: DeviceFeatures,
    allocator: Mutex<GpuAllocator>,
    immediate: ImmediateSubmitter,
}

impl GpuContext {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle for objects that must destroy themselves later.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    /// Capabilities, formats and present modes of the surface.
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        self.surface
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Context has no surface".to_string()))?
            .support(self.physical_device)
    }

    /// Features enabled on the logical device.
    pub fn enabled_features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn queues(&self) -> &QueueMap {
        &self.queues
    }

    /// Queue serving graphics. Always present.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.queues
            .queue(QueueRole::Graphics)
            .unwrap_or_else(vk::Queue::null)
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.queues.family(QueueRole::Graphics).unwrap_or(0)
    }

    /// Queue able to present to the surface, if one was requested.
    pub fn present_queue(&self) -> Option<vk::Queue> {
        self.queues.queue(QueueRole::Present)
    }

    /// Families that touch swapchain images.
    pub fn swapchain_families(&self) -> Vec<u32> {
        [QueueRole::Graphics, QueueRole::Present]
            .into_iter()
            .filter_map(|role| self.queues.family(role))
            .collect()
    }

    /// Lock the allocator.
    pub fn allocator(&self) -> MutexGuard<'_, GpuAllocator> {
        self.allocator.lock()
    }

    /// Record with `record`, submit on the graphics queue and wait.
    pub fn submit_immediate<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe { self.immediate.submit(&self.device, record) }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("Device wait idle failed during teardown: {e}");
            }

            self.immediate.destroy(&self.device);
            // Frees all device memory, so it must precede the device.
            self.allocator.lock().shutdown();
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            if let Some(messenger) = self.messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Objects created so far during a build; destroyed in reverse on failure.
struct Partial {
    instance: Option<ash::Instance>,
    messenger: Option<DebugMessenger>,
    surface: Option<Surface>,
    device: Option<Arc<ash::Device>>,
}

impl Drop for Partial {
    fn drop(&mut self) {
        unsafe {
            if let Some(device) = self.device.take() {
                device.destroy_device(None);
            }
            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            if let Some(messenger) = self.messenger.take() {
                messenger.destroy();
            }
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
    }
}

/// Builder for [`GpuContext`].
pub struct GpuContextBuilder {
    instance: InstanceConfig,
    device: DeviceConfig,
    debug_sink: Arc<dyn DebugSink>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            instance: InstanceConfig::default(),
            device: DeviceConfig::default(),
            debug_sink: Arc::new(TracingSink),
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.instance.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.instance.validation = enable;
        self
    }

    /// Receiver for validation messages. Defaults to [`TracingSink`].
    pub fn debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = sink;
        self
    }

    /// Device types in order of preference.
    pub fn preferred_device_types(mut self, types: Vec<vk::PhysicalDeviceType>) -> Self {
        self.device.preferred_types = types;
        self
    }

    /// Queue roles to serve. Graphics is always added.
    pub fn queue_roles(mut self, roles: Vec<QueueRole>) -> Self {
        self.device.roles = roles;
        self
    }

    pub fn required_instance_extension(mut self, name: &'static CStr) -> Self {
        self.instance.required_extensions.push(name);
        self
    }

    pub fn optional_instance_extension(mut self, name: &'static CStr) -> Self {
        self.instance.optional_extensions.push(name);
        self
    }

    pub fn required_device_extension(mut self, name: &'static CStr) -> Self {
        self.device.required_extensions.push(name);
        self
    }

    pub fn optional_device_extension(mut self, name: &'static CStr) -> Self {
        self.device.optional_extensions.push(name);
        self
    }

    /// Features the device must support, added to the defaults.
    pub fn require_features(mut self, features: DeviceFeatures) -> Self {
        self.device.required_features = self.device.required_features.union(features);
        self
    }

    /// Features enabled only when the device supports them.
    pub fn request_features(mut self, features: DeviceFeatures) -> Self {
        self.device.optional_features = self.device.optional_features.union(features);
        self
    }

    /// Build a context presenting to `window`.
    ///
    /// The window must outlive the context.
    pub fn build_with_window<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        self.build_inner(Some(display), |entry, instance| unsafe {
            Surface::from_window(entry, instance, window).map(Some)
        })
    }

    /// Build a context without a surface, for offscreen work and tests.
    pub fn build_headless(mut self) -> Result<GpuContext> {
        if self.device.roles.contains(&QueueRole::Present) {
            tracing::debug!("Dropping present queue role for headless context");
            self.device.roles.retain(|&role| role != QueueRole::Present);
        }
        self.build_inner(None, |_, _| Ok(None))
    }

    fn build_inner<F>(
        mut self,
        display: Option<RawDisplayHandle>,
        make_surface: F,
    ) -> Result<GpuContext>
    where
        F: FnOnce(&ash::Entry, &ash::Instance) -> Result<Option<Surface>>,
    {
        if !self.device.roles.contains(&QueueRole::Graphics) {
            self.device.roles.insert(0, QueueRole::Graphics);
        }

        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loader(e.to_string()))?;

        let created = unsafe { create_instance(&entry, &self.instance, display)? };
        let mut partial = Partial {
            instance: Some(created.instance),
            messenger: None,
            surface: None,
            device: None,
        };
        let instance = partial
            .instance
            .clone()
            .ok_or_else(|| GpuError::InvalidState("Instance missing".to_string()))?;

        if created.debug_utils {
            let sink = Arc::clone(&self.debug_sink);
            partial.messenger = Some(unsafe { DebugMessenger::new(&entry, &instance, sink)? });
        }

        partial.surface = make_surface(&entry, &instance)?;

        let physical_device =
            unsafe { select_physical_device(&instance, &self.device.preferred_types)? };
        tracing::info!("Selected GPU: {}", unsafe {
            describe_device(&instance, physical_device)
        });

        let created = unsafe {
            create_device(
                &instance,
                physical_device,
                partial.surface.as_ref(),
                &self.device,
            )?
        };
        let device = Arc::new(created.device);
        let queues = created.queues;
        partial.device = Some(Arc::clone(&device));

        let allocator =
            unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical_device)? };

        let graphics = queues
            .get(QueueRole::Graphics)
            .copied()
            .ok_or(GpuError::MissingQueue(QueueRole::Graphics))?;
        let immediate =
            unsafe { ImmediateSubmitter::new(&device, graphics.family, graphics.queue) };
        let immediate = match immediate {
            Ok(immediate) => immediate,
            Err(e) => {
                // The allocator must go before the device.
                drop(allocator);
                return Err(e);
            }
        };

        // Everything succeeded; ownership moves into the context.
        partial.device = None;
        let surface = partial.surface.take();
        let messenger = partial.messenger.take();
        partial.instance = None;

        Ok(GpuContext {
            _entry: entry,
            instance,
            messenger,
            surface,
            physical_device,
            device,
            queues,
            features: created.features,
            allocator: Mutex::new(allocator),
            immediate,
        })
    }
}
