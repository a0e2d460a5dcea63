//! Offscreen run: one dispatch on a context without a surface, read back
//! into host memory and written as a PNG.

use std::path::Path;

use anyhow::Context as _;
use ash::vk;
use tracing::{error, info};
use vb_gpu::{GpuBuffer, GpuContext, GpuContextBuilder, MemoryLocation, Texture};

use crate::gradient::{create_target, target_desc, GradientPass};
use crate::Args;

/// Tightly packed copy of the whole color image.
pub fn readback_region(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
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
    }
}

/// Render one gradient frame of `args.size` and save it to `output`.
pub fn render_to_png(args: &Args, output: &Path) -> anyhow::Result<()> {
    let (width, height) = args.size;
    let extent = vk::Extent2D { width, height };
    let size = target_desc(extent)
        .upload_size()
        .filter(|&size| size > 0)
        .context("Output size must be non-zero")?;

    let gpu = GpuContextBuilder::new()
        .app_name("vb compute")
        .validation(cfg!(debug_assertions))
        .build_headless()?;

    let pass = GradientPass::new(&gpu, &args.shader_dir)?;
    let result = create_target(&gpu, extent).and_then(|mut target| {
        let result = dispatch_and_read(&gpu, &pass, &target, size);
        if let Err(e) = target.destroy(&gpu) {
            error!("Failed to destroy gradient target: {e}");
        }
        result
    });
    pass.destroy(&gpu);

    let pixels = result?;
    let png = image::RgbaImage::from_raw(width, height, pixels)
        .context("Readback does not match the image size")?;
    png.save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Gradient {width}x{height} written to {}", output.display());
    Ok(())
}

fn dispatch_and_read(
    gpu: &GpuContext,
    pass: &GradientPass,
    target: &Texture,
    size: u64,
) -> anyhow::Result<Vec<u8>> {
    pass.bind_target(gpu, target);

    let mut readback: GpuBuffer = gpu.allocator().create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
        "gradient readback",
    )?;

    let device = gpu.device();
    let copied = gpu.submit_immediate(|cmd| {
        // SAFETY: cmd is recording; the target and buffer outlive the
        // blocking submission.
        unsafe {
            pass.record(device, cmd, target, 0.0);
            device.cmd_copy_image_to_buffer(
                cmd,
                target.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback.buffer,
                &[readback_region(target.extent())],
            );
        }
    });
    let pixels = copied.and_then(|()| readback.read_bytes(0, size));

    if let Err(e) = gpu.allocator().free_buffer(&mut readback) {
        error!("Failed to free readback buffer: {e}");
    }
    Ok(pixels?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_covers_whole_image_tightly() {
        let region = readback_region(vk::Extent2D {
            width: 300,
            height: 200,
        });
        assert_eq!(region.buffer_offset, 0);
        assert_eq!(region.buffer_row_length, 0);
        assert_eq!(region.buffer_image_height, 0);
        assert_eq!(
            (region.image_extent.width, region.image_extent.height),
            (300, 200)
        );
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.image_subresource.aspect_mask, vk::ImageAspectFlags::COLOR);
    }
}
