//! Swapchain management.
//!
//! The policy half of this module is pure: [`SwapchainPlan`] turns a surface
//! query plus the requested window size into every parameter of the create
//! call. [`SwapchainChain`] sequences creation, recreation and teardown over
//! any [`SwapchainOps`]; [`SwapchainManager`] pairs it with the Vulkan
//! implementation and replaces the chain wholesale when the window changes.

use std::sync::Arc;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::surface::{Surface, SurfaceSupport};

/// Number of images to request: one more than the minimum, capped at the
/// maximum when the surface reports one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Swapchain extent for a window of `width` x `height`.
///
/// The surface's current extent wins unless it is the `u32::MAX` sentinel, in
/// which case the window size is clamped to the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Exact match for `desired`, else the first reported format.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| f.format == desired.format && f.color_space == desired.color_space)
        .or_else(|| available.first())
        .copied()
}

/// `desired` when supported, else FIFO which every surface supports.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&desired) {
        desired
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Exclusive when one family touches the images, concurrent otherwise.
pub fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    let mut unique = families.to_vec();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}

/// Requested swapchain properties.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    /// Usage added on top of color attachment and transfer destination.
    pub extra_usage: vk::ImageUsageFlags,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            extra_usage: vk::ImageUsageFlags::empty(),
        }
    }
}

impl SwapchainConfig {
    /// FIFO with vsync, mailbox without.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.present_mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        };
        self
    }

    pub fn with_surface_format(
        mut self,
        format: vk::Format,
        color_space: vk::ColorSpaceKHR,
    ) -> Self {
        self.surface_format = vk::SurfaceFormatKHR {
            format,
            color_space,
        };
        self
    }

    pub fn with_present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = mode;
        self
    }

    pub fn with_extra_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.extra_usage = usage;
        self
    }
}

/// Fully resolved swapchain parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainPlan {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    /// Family indices listed for concurrent sharing; empty when exclusive.
    pub queue_families: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    /// Resolve the create parameters for a `width` x `height` window.
    pub fn new(
        support: &SurfaceSupport,
        config: &SwapchainConfig,
        families: &[u32],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let surface_format = choose_surface_format(&support.formats, config.surface_format)
            .ok_or(GpuError::NoSurfaceFormat)?;
        let present_mode = choose_present_mode(&support.present_modes, config.present_mode);
        let sharing_mode = sharing_mode(families);

        let queue_families = if sharing_mode == vk::SharingMode::CONCURRENT {
            let mut unique = families.to_vec();
            unique.sort_unstable();
            unique.dedup();
            unique
        } else {
            Vec::new()
        };

        Ok(Self {
            image_count: choose_image_count(&support.capabilities),
            surface_format,
            present_mode,
            extent: choose_extent(&support.capabilities, width, height),
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST
                | config.extra_usage,
            sharing_mode,
            queue_families,
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// Live swapchain: handle, images and one view per image.
///
/// Format, extent and present mode never change; a resize builds a new one.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Device-side steps of creating, replacing and destroying a swapchain.
///
/// [`SwapchainChain`] drives these in the recreation order; the Vulkan
/// implementation lives behind [`SwapchainManager`].
pub trait SwapchainOps {
    /// Block until the device is idle.
    fn wait_idle(&self) -> Result<()>;
    /// Query the surface as it is now.
    fn support(&self) -> Result<SurfaceSupport>;
    /// Create a chain for `plan`, linked to `old` when that is not null.
    fn build(&self, plan: &SwapchainPlan, old: vk::SwapchainKHR) -> Result<Swapchain>;
    /// Destroy the views and then the handle of `swapchain`.
    fn destroy(&self, swapchain: Swapchain);
}

struct VulkanOps<'a> {
    device: &'a ash::Device,
    loader: &'a ash::khr::swapchain::Device,
    surface: Option<(&'a Surface, vk::PhysicalDevice)>,
}

impl VulkanOps<'_> {
    fn surface(&self) -> Result<(&Surface, vk::PhysicalDevice)> {
        self.surface
            .ok_or_else(|| GpuError::InvalidState("No surface to build against".to_string()))
    }
}

// Only constructed inside the unsafe methods of `SwapchainManager`, whose
// contracts cover every call below.
impl SwapchainOps for VulkanOps<'_> {
    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn support(&self) -> Result<SurfaceSupport> {
        let (surface, physical_device) = self.surface()?;
        surface.support(physical_device)
    }

    fn build(&self, plan: &SwapchainPlan, old: vk::SwapchainKHR) -> Result<Swapchain> {
        let (surface, _) = self.surface()?;
        let (device, loader) = (self.device, self.loader);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(plan.usage)
            .image_sharing_mode(plan.sharing_mode)
            .queue_family_indices(&plan.queue_families)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(plan.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    unsafe {
                        for view in views {
                            device.destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(handle, None);
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Swapchain {
            handle,
            images,
            views,
            format: plan.surface_format.format,
            extent: plan.extent,
            present_mode: plan.present_mode,
        })
    }

    fn destroy(&self, swapchain: Swapchain) {
        unsafe {
            for view in swapchain.views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(swapchain.handle, None);
        }
    }
}

/// Lifecycle of the managed swapchain.
pub enum SwapchainState {
    Uninitialized,
    Live(Swapchain),
    Destroyed,
}

/// Result of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Image ready for rendering once the acquire semaphore is signaled.
    Image(u32),
    /// The swapchain no longer matches the surface. The frame must be
    /// skipped and the swapchain recreated. `semaphore_signaled` is set when
    /// an image was still handed out, leaving the semaphore pending.
    Stale { semaphore_signaled: bool },
}

/// State machine of the swapchain lifecycle, independent of the device.
pub struct SwapchainChain {
    config: SwapchainConfig,
    state: SwapchainState,
    generation: u64,
}

impl SwapchainChain {
    pub fn new(config: SwapchainConfig) -> Self {
        Self {
            config,
            state: SwapchainState::Uninitialized,
            generation: 0,
        }
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn state(&self) -> &SwapchainState {
        &self.state
    }

    /// Live swapchain, if any.
    pub fn current(&self) -> Option<&Swapchain> {
        match &self.state {
            SwapchainState::Live(swapchain) => Some(swapchain),
            _ => None,
        }
    }

    fn live(&self) -> Result<&Swapchain> {
        self.current()
            .ok_or_else(|| GpuError::InvalidState("Swapchain is not live".to_string()))
    }

    /// Number of (re)creations so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Image views owned by the live swapchain.
    pub fn live_view_count(&self) -> usize {
        self.current().map_or(0, |swapchain| swapchain.views.len())
    }

    /// Build the first swapchain.
    pub fn create(
        &mut self,
        ops: &impl SwapchainOps,
        families: &[u32],
        width: u32,
        height: u32,
    ) -> Result<&Swapchain> {
        if !matches!(self.state, SwapchainState::Uninitialized) {
            return Err(GpuError::InvalidState(
                "Swapchain already created".to_string(),
            ));
        }

        let support = ops.support()?;
        let plan = SwapchainPlan::new(&support, &self.config, families, width, height)?;
        let swapchain = ops.build(&plan, vk::SwapchainKHR::null())?;

        tracing::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format,
            swapchain.present_mode
        );

        self.generation += 1;
        self.state = SwapchainState::Live(swapchain);
        self.live()
    }

    /// Replace the live swapchain for a window of `width` x `height`.
    ///
    /// Waits for the device to idle, re-queries the surface, runs `hook` with
    /// the extent the new chain will have so dependent targets can be torn
    /// down, creates the new chain linked to the old one, then destroys the
    /// old one. The old chain is destroyed even when the build fails, which
    /// leaves the state [`Destroyed`](SwapchainState::Destroyed).
    pub fn recreate<F>(
        &mut self,
        ops: &impl SwapchainOps,
        families: &[u32],
        width: u32,
        height: u32,
        hook: F,
    ) -> Result<&Swapchain>
    where
        F: FnOnce(u32, u32),
    {
        let old_handle = self.live()?.handle;

        ops.wait_idle()?;

        let support = ops.support()?;
        let plan = SwapchainPlan::new(&support, &self.config, families, width, height)?;
        hook(plan.extent.width, plan.extent.height);

        let built = ops.build(&plan, old_handle);

        if let SwapchainState::Live(old) =
            std::mem::replace(&mut self.state, SwapchainState::Destroyed)
        {
            ops.destroy(old);
        }

        let swapchain = built?;
        tracing::debug!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            generation = self.generation + 1,
            "Swapchain recreated"
        );

        self.generation += 1;
        self.state = SwapchainState::Live(swapchain);
        self.live()
    }

    /// Destroy the live swapchain. Further calls are no-ops.
    pub fn destroy(&mut self, ops: &impl SwapchainOps) {
        if let SwapchainState::Live(swapchain) =
            std::mem::replace(&mut self.state, SwapchainState::Destroyed)
        {
            ops.destroy(swapchain);
            tracing::debug!("Swapchain destroyed");
        }
    }
}

/// Owner of the swapchain and its recreation protocol.
pub struct SwapchainManager {
    loader: ash::khr::swapchain::Device,
    device: Arc<ash::Device>,
    chain: SwapchainChain,
}

impl SwapchainManager {
    pub fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        config: SwapchainConfig,
    ) -> Self {
        Self {
            loader: ash::khr::swapchain::Device::new(instance, &device),
            device,
            chain: SwapchainChain::new(config),
        }
    }

    pub fn config(&self) -> &SwapchainConfig {
        self.chain.config()
    }

    pub fn state(&self) -> &SwapchainState {
        self.chain.state()
    }

    /// Live swapchain, if any.
    pub fn current(&self) -> Option<&Swapchain> {
        self.chain.current()
    }

    /// Number of (re)creations so far.
    pub fn generation(&self) -> u64 {
        self.chain.generation()
    }

    /// Image views owned by the live swapchain.
    pub fn live_view_count(&self) -> usize {
        self.chain.live_view_count()
    }

    /// Build the first swapchain.
    ///
    /// # Safety
    /// `surface` and `physical_device` must belong to the instance the
    /// device was created from.
    pub unsafe fn create(
        &mut self,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
        families: &[u32],
        width: u32,
        height: u32,
    ) -> Result<&Swapchain> {
        let ops = VulkanOps {
            device: &self.device,
            loader: &self.loader,
            surface: Some((surface, physical_device)),
        };
        self.chain.create(&ops, families, width, height)
    }

    /// Replace the swapchain for a window of `width` x `height`.
    ///
    /// See [`SwapchainChain::recreate`] for the order of operations. No
    /// stale image is reachable once this returns.
    ///
    /// # Safety
    /// Same requirements as [`create`](Self::create).
    pub unsafe fn recreate<F>(
        &mut self,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
        families: &[u32],
        width: u32,
        height: u32,
        hook: F,
    ) -> Result<&Swapchain>
    where
        F: FnOnce(u32, u32),
    {
        let ops = VulkanOps {
            device: &self.device,
            loader: &self.loader,
            surface: Some((surface, physical_device)),
        };
        self.chain.recreate(&ops, families, width, height, hook)
    }

    /// Acquire the next image, signaling `semaphore`.
    ///
    /// Out-of-date and suboptimal results are reported as [`Acquire::Stale`].
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal operation.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Acquire> {
        let swapchain = self.chain.live()?;
        let result = unsafe {
            self.loader
                .acquire_next_image(swapchain.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, false)) => Ok(Acquire::Image(index)),
            Ok((_, true)) => Ok(Acquire::Stale {
                semaphore_signaled: true,
            }),
            // No image was acquired; the semaphore stays untouched.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::Stale {
                semaphore_signaled: false,
            }),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present `image_index` once `wait_semaphore` is signaled.
    ///
    /// Returns `true` when the swapchain went stale.
    ///
    /// # Safety
    /// `queue` must support presenting to the surface.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        let swapchain = self.chain.live()?;
        let swapchains = [swapchain.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain. Further calls are no-ops.
    ///
    /// # Safety
    /// No image of the swapchain may still be in use.
    pub unsafe fn destroy(&mut self) {
        let ops = VulkanOps {
            device: &self.device,
            loader: &self.loader,
            surface: None,
        };
        self.chain.destroy(&ops);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn support() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: capabilities(2, 8),
            formats: vec![
                format(vk::Format::B8G8R8A8_UNORM),
                format(vk::Format::B8G8R8A8_SRGB),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn image_count_stays_within_bounds() {
        for min in 1..6 {
            for max in min..8 {
                let count = choose_image_count(&capabilities(min, max));
                assert!(min <= count && count <= max, "min {min} max {max} got {count}");
            }
        }
        assert_eq!(choose_image_count(&capabilities(2, 2)), 2);
    }

    #[test]
    fn unlimited_max_adds_one() {
        assert_eq!(choose_image_count(&capabilities(3, 0)), 4);
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let mut caps = capabilities(2, 3);
        caps.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let extent = choose_extent(&caps, 800, 600);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn extent_is_clamped_when_free() {
        let mut caps = capabilities(2, 3);
        caps.min_image_extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1024,
            height: 1024,
        };
        let extent = choose_extent(&caps, 4000, 10);
        assert_eq!((extent.width, extent.height), (1024, 64));
    }

    #[test]
    fn format_prefers_exact_match() {
        let available = support().formats;
        let desired = format(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(choose_surface_format(&available, desired), Some(desired));

        let fallback = choose_surface_format(&available, format(vk::Format::R16G16B16A16_SFLOAT));
        assert_eq!(fallback, Some(format(vk::Format::B8G8R8A8_UNORM)));

        assert_eq!(choose_surface_format(&[], desired), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn sharing_depends_on_unique_families() {
        assert_eq!(sharing_mode(&[0]), vk::SharingMode::EXCLUSIVE);
        assert_eq!(sharing_mode(&[0, 0]), vk::SharingMode::EXCLUSIVE);
        assert_eq!(sharing_mode(&[0, 2]), vk::SharingMode::CONCURRENT);
    }

    #[test]
    fn plan_lists_families_only_when_concurrent() {
        let config = SwapchainConfig::default();

        let exclusive = SwapchainPlan::new(&support(), &config, &[0, 0], 800, 600).unwrap();
        assert_eq!(exclusive.sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert!(exclusive.queue_families.is_empty());

        let concurrent = SwapchainPlan::new(&support(), &config, &[2, 0], 800, 600).unwrap();
        assert_eq!(concurrent.sharing_mode, vk::SharingMode::CONCURRENT);
        assert_eq!(concurrent.queue_families, vec![0, 2]);
    }

    #[test]
    fn plan_is_stable_for_identical_sizes() {
        let config = SwapchainConfig::default().with_vsync(false);
        let first = SwapchainPlan::new(&support(), &config, &[0], 800, 600).unwrap();
        let second = SwapchainPlan::new(&support(), &config, &[0], 800, 600).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.image_count, 3);
        assert_eq!(first.surface_format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(first.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!((first.extent.width, first.extent.height), (800, 600));
        assert!(first
            .usage
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn plan_without_formats_fails() {
        let mut empty = support();
        empty.formats.clear();
        let err = SwapchainPlan::new(&empty, &SwapchainConfig::default(), &[0], 800, 600)
            .unwrap_err();
        assert!(matches!(err, GpuError::NoSurfaceFormat));
    }

    mod chain {
        use std::cell::{Cell, RefCell};
        use std::collections::BTreeSet;

        use ash::vk::Handle;

        use super::*;

        #[derive(Debug, Clone, PartialEq, Eq)]
        enum Call {
            WaitIdle,
            Support,
            Hook(u32, u32),
            Build { old: u64 },
            Destroy(u64),
        }

        /// Hands out numbered handles and remembers which views are alive.
        #[derive(Default)]
        struct FakeOps {
            calls: RefCell<Vec<Call>>,
            next_handle: Cell<u64>,
            live_views: RefCell<BTreeSet<u64>>,
            live_chains: RefCell<BTreeSet<u64>>,
            fail_build: Cell<bool>,
        }

        impl FakeOps {
            fn next(&self) -> u64 {
                let id = self.next_handle.get() + 1;
                self.next_handle.set(id);
                id
            }

            fn record(&self, call: Call) {
                self.calls.borrow_mut().push(call);
            }

            fn take_calls(&self) -> Vec<Call> {
                std::mem::take(&mut *self.calls.borrow_mut())
            }
        }

        impl SwapchainOps for FakeOps {
            fn wait_idle(&self) -> Result<()> {
                self.record(Call::WaitIdle);
                Ok(())
            }

            fn support(&self) -> Result<SurfaceSupport> {
                self.record(Call::Support);
                Ok(super::support())
            }

            fn build(&self, plan: &SwapchainPlan, old: vk::SwapchainKHR) -> Result<Swapchain> {
                self.record(Call::Build {
                    old: old.as_raw(),
                });
                if self.fail_build.get() {
                    return Err(GpuError::SwapchainCreation("surface lost".to_string()));
                }

                let handle = self.next();
                self.live_chains.borrow_mut().insert(handle);
                let mut images = Vec::new();
                let mut views = Vec::new();
                for _ in 0..plan.image_count {
                    images.push(vk::Image::from_raw(self.next()));
                    let view = self.next();
                    self.live_views.borrow_mut().insert(view);
                    views.push(vk::ImageView::from_raw(view));
                }

                Ok(Swapchain {
                    handle: vk::SwapchainKHR::from_raw(handle),
                    images,
                    views,
                    format: plan.surface_format.format,
                    extent: plan.extent,
                    present_mode: plan.present_mode,
                })
            }

            fn destroy(&self, swapchain: Swapchain) {
                self.record(Call::Destroy(swapchain.handle.as_raw()));
                for view in swapchain.views {
                    assert!(
                        self.live_views.borrow_mut().remove(&view.as_raw()),
                        "view destroyed twice"
                    );
                }
                assert!(self
                    .live_chains
                    .borrow_mut()
                    .remove(&swapchain.handle.as_raw()));
            }
        }

        fn created(ops: &FakeOps) -> (SwapchainChain, u64) {
            let mut chain = SwapchainChain::new(SwapchainConfig::default());
            let handle = chain.create(ops, &[0], 800, 600).unwrap().handle.as_raw();
            ops.take_calls();
            (chain, handle)
        }

        #[test]
        fn recreate_runs_steps_in_order() {
            let ops = FakeOps::default();
            let (mut chain, first) = created(&ops);

            let new = chain
                .recreate(&ops, &[0], 1024, 768, |w, h| ops.record(Call::Hook(w, h)))
                .unwrap()
                .handle
                .as_raw();

            assert_eq!(
                ops.take_calls(),
                vec![
                    Call::WaitIdle,
                    Call::Support,
                    Call::Hook(1024, 768),
                    Call::Build { old: first },
                    Call::Destroy(first),
                ]
            );
            assert_ne!(new, first);
            assert_eq!(*ops.live_chains.borrow(), BTreeSet::from([new]));
        }

        #[test]
        fn repeated_recreation_leaves_one_set_of_views() {
            let ops = FakeOps::default();
            let (mut chain, _) = created(&ops);
            let image_count = chain.current().unwrap().image_count();

            for i in 0..100 {
                let size = 600 + (i % 7) * 10;
                chain.recreate(&ops, &[0], size, size, |_, _| {}).unwrap();

                assert_eq!(chain.live_view_count(), image_count);
                assert_eq!(ops.live_views.borrow().len(), image_count);
                assert_eq!(ops.live_chains.borrow().len(), 1);
            }
            assert_eq!(chain.generation(), 101);

            chain.destroy(&ops);
            chain.destroy(&ops);
            assert!(ops.live_views.borrow().is_empty());
            assert!(ops.live_chains.borrow().is_empty());
            assert!(matches!(chain.state(), SwapchainState::Destroyed));
        }

        #[test]
        fn failed_build_still_releases_old_chain() {
            let ops = FakeOps::default();
            let (mut chain, first) = created(&ops);

            ops.fail_build.set(true);
            let err = chain.recreate(&ops, &[0], 640, 480, |_, _| {}).err();
            assert!(matches!(err, Some(GpuError::SwapchainCreation(_))));

            assert_eq!(ops.take_calls().last(), Some(&Call::Destroy(first)));
            assert!(matches!(chain.state(), SwapchainState::Destroyed));
            assert_eq!(chain.live_view_count(), 0);
            assert!(ops.live_views.borrow().is_empty());
            assert_eq!(chain.generation(), 1);

            // Nothing left to replace.
            ops.fail_build.set(false);
            let err = chain.recreate(&ops, &[0], 640, 480, |_, _| {}).err();
            assert!(matches!(err, Some(GpuError::InvalidState(_))));
            assert!(ops.take_calls().is_empty());
        }

        #[test]
        fn lifecycle_guards() {
            let ops = FakeOps::default();
            let mut chain = SwapchainChain::new(SwapchainConfig::default());

            let err = chain.recreate(&ops, &[0], 800, 600, |_, _| {}).err();
            assert!(matches!(err, Some(GpuError::InvalidState(_))));

            chain.create(&ops, &[0], 800, 600).unwrap();
            let err = chain.create(&ops, &[0], 800, 600).err();
            assert!(matches!(err, Some(GpuError::InvalidState(_))));
            assert_eq!(chain.generation(), 1);
            assert_eq!(
                ops.take_calls(),
                vec![Call::Support, Call::Build { old: 0 }]
            );
        }
    }
}
