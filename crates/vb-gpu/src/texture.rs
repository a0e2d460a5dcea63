//! Images with views: render targets, depth buffers and sampled textures.

use std::path::Path;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuImage;
use crate::transition::{aspect_for_format, generate_mipmaps, mip_levels, transition_image};
use crate::upload::with_staging;

/// Bytes per texel for the uncompressed color formats uploads accept.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Parameters for a 2D image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mipmapped: bool,
    pub samples: vk::SampleCountFlags,
}

impl ImageDesc {
    pub fn new(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format,
            usage,
            mipmapped: false,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn mipmapped(mut self, mipmapped: bool) -> Self {
        self.mipmapped = mipmapped;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Mip levels the image will be created with.
    pub fn mip_levels(&self) -> u32 {
        if self.mipmapped {
            mip_levels(self.extent.width, self.extent.height)
        } else {
            1
        }
    }

    /// Bytes of tightly packed level-0 data needed to fill the image.
    ///
    /// `None` when the format has no known texel size.
    pub fn upload_size(&self) -> Option<u64> {
        texel_size(self.format)
            .map(|texel| u64::from(self.extent.width) * u64::from(self.extent.height) * texel)
    }

    /// Check that `len` bytes exactly cover level 0.
    pub fn check_upload(&self, len: usize) -> Result<()> {
        let expected = self.upload_size().ok_or_else(|| {
            GpuError::InvalidState(format!("Cannot upload pixels in format {:?}", self.format))
        })?;
        if expected == 0 || len as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "{}x{} {:?} image needs {expected} bytes of pixel data, got {len}",
                self.extent.width, self.extent.height, self.format
            )));
        }
        Ok(())
    }

    fn create_info(&self, extra_usage: vk::ImageUsageFlags) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(self.mip_levels())
            .array_layers(1)
            .samples(self.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage | extra_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// Device-local image plus a view over all of its mip levels.
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl Texture {
    /// Create an empty image in `UNDEFINED` layout.
    ///
    /// Depth formats get a depth-aspect view; everything else a color view.
    pub fn create(ctx: &GpuContext, desc: &ImageDesc, name: &str) -> Result<Self> {
        Self::create_inner(ctx, desc, vk::ImageUsageFlags::empty(), name)
    }

    fn create_inner(
        ctx: &GpuContext,
        desc: &ImageDesc,
        extra_usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let info = desc.create_info(extra_usage);
        let mut image = ctx
            .allocator()
            .create_image(&info, MemoryLocation::GpuOnly, name)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for_format(desc.format),
                base_mip_level: 0,
                level_count: image.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { ctx.device().create_image_view(&view_info, None) } {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                ctx.allocator().free_image(&mut image)?;
                Err(e.into())
            }
        }
    }

    /// Create an image filled with tightly packed `pixels`, left in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// With `desc.mipmapped` the full mip chain is generated by blitting down
    /// from level 0. `pixels` must be exactly [`ImageDesc::upload_size`]
    /// bytes; nothing is allocated otherwise.
    pub fn create_with_data(
        ctx: &GpuContext,
        desc: &ImageDesc,
        pixels: &[u8],
        name: &str,
    ) -> Result<Self> {
        desc.check_upload(pixels.len())?;

        let mut extra = vk::ImageUsageFlags::TRANSFER_DST;
        if desc.mipmapped {
            extra |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        let texture = Self::create_inner(ctx, desc, extra, name)?;

        let image = texture.image.image;
        let levels = texture.image.mip_levels;
        let extent = desc.extent;
        let uploaded = with_staging(
            ctx,
            pixels.len() as u64,
            "texture staging",
            |staging| staging.write_bytes(0, pixels),
            |cmd, source| unsafe {
                let device = ctx.device();
                transition_image(
                    device,
                    cmd,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );

                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                };
                device.cmd_copy_buffer_to_image(
                    cmd,
                    source,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                if levels > 1 {
                    generate_mipmaps(device, cmd, image, extent, levels);
                } else {
                    transition_image(
                        device,
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    );
                }
            },
        );

        match uploaded {
            Ok(()) => Ok(texture),
            Err(e) => {
                let mut texture = texture;
                texture.destroy(ctx)?;
                Err(e)
            }
        }
    }

    /// Decode an image file to RGBA8 and upload it as a sampled texture.
    pub fn load(ctx: &GpuContext, path: impl AsRef<Path>, mipmapped: bool) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| GpuError::ImageDecode(format!("{}: {e}", path.display())))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();

        let desc = ImageDesc::new(
            width,
            height,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED,
        )
        .mipmapped(mipmapped);

        tracing::debug!(path = %path.display(), width, height, "Loading texture");
        Self::create_with_data(ctx, &desc, decoded.as_raw(), &path.display().to_string())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent_2d()
    }

    pub fn format(&self) -> vk::Format {
        self.image.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels
    }

    /// Destroy the view and free the image. Safe to call twice.
    pub fn destroy(&mut self, ctx: &GpuContext) -> Result<()> {
        if self.view != vk::ImageView::null() {
            unsafe { ctx.device().destroy_image_view(self.view, None) };
            self.view = vk::ImageView::null();
        }
        ctx.allocator().free_image(&mut self.image)
    }
}

/// Sampler with the given filter and repeat addressing over `max_lod` levels.
///
/// Uses the device's maximum anisotropy when the feature was enabled.
pub fn create_sampler(ctx: &GpuContext, filter: vk::Filter, max_lod: f32) -> Result<vk::Sampler> {
    let max_anisotropy = ctx.enabled_features().sampler_anisotropy.then(|| {
        unsafe {
            ctx.instance()
                .get_physical_device_properties(ctx.physical_device())
        }
        .limits
        .max_sampler_anisotropy
    });

    let info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .min_lod(0.0)
        .max_lod(max_lod)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .anisotropy_enable(max_anisotropy.is_some())
        .max_anisotropy(max_anisotropy.unwrap_or(1.0));

    let sampler = unsafe { ctx.device().create_sampler(&info, None)? };
    Ok(sampler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_images_have_one_level() {
        let desc = ImageDesc::new(
            256,
            256,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(desc.mip_levels(), 1);
        assert_eq!(desc.mipmapped(true).mip_levels(), 9);
    }

    #[test]
    fn upload_must_cover_level_zero_exactly() {
        let desc = ImageDesc::new(
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(desc.upload_size(), Some(64));
        assert!(desc.check_upload(64).is_ok());

        // A single row is too short and must never reach the staging copy.
        assert!(matches!(
            desc.check_upload(16),
            Err(GpuError::InvalidState(_))
        ));
        assert!(desc.check_upload(0).is_err());
        assert!(desc.check_upload(65).is_err());
    }

    #[test]
    fn upload_size_follows_format() {
        let hdr = ImageDesc::new(
            8,
            2,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(hdr.upload_size(), Some(128));

        let mask = ImageDesc::new(3, 3, vk::Format::R8_UNORM, vk::ImageUsageFlags::SAMPLED);
        assert_eq!(mask.upload_size(), Some(9));

        let depth = ImageDesc::new(
            4,
            4,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(depth.upload_size(), None);
        assert!(depth.check_upload(64).is_err());

        let empty = ImageDesc::new(0, 4, vk::Format::R8_UNORM, vk::ImageUsageFlags::SAMPLED);
        assert!(empty.check_upload(0).is_err());
    }

    #[test]
    fn create_info_carries_extra_usage() {
        let desc = ImageDesc::new(
            64,
            32,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );
        let info = desc.create_info(vk::ImageUsageFlags::TRANSFER_SRC);
        let expected =
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;
        assert!(info.usage.contains(expected));
        assert_eq!(info.extent.depth, 1);
        assert_eq!(info.mip_levels, 1);
        assert_eq!(info.initial_layout, vk::ImageLayout::UNDEFINED);
    }
}
