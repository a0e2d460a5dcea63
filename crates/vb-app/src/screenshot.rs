//! Screenshot capture.
//!
//! A frame is blitted into a linear, host-visible RGBA image through the
//! immediate submitter, read back row by row and written as a PNG named
//! after the local time.

use std::path::{Path, PathBuf};

use ash::vk;
use chrono::NaiveDateTime;
use thiserror::Error;
use vb_gpu::transition::{blit_image, transition_image};
use vb_gpu::{GpuContext, GpuError, GpuImage, MemoryLocation};

const BYTES_PER_PIXEL: usize = 4;
const CAPTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

#[derive(Error, Debug)]
pub enum ScreenshotError {
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("Readback image is not host visible")]
    NotMapped,
    #[error("Readback holds {actual} bytes, {expected} needed")]
    ShortRead { expected: usize, actual: usize },
    #[error("Failed to encode screenshot: {0}")]
    Encode(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// File name for a capture taken at `time`: `DDMMYYYYHHMMSS.png`.
pub fn screenshot_filename(time: &NaiveDateTime) -> String {
    time.format("%d%m%Y%H%M%S.png").to_string()
}

/// Copy `height` rows of `width` RGBA pixels out of a buffer whose rows are
/// `row_pitch` bytes apart.
pub fn unpack_rows(
    data: &[u8],
    row_pitch: usize,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, ScreenshotError> {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    let height = height as usize;
    if height == 0 || row_bytes == 0 {
        return Ok(Vec::new());
    }

    let expected = row_pitch * (height - 1) + row_bytes;
    if row_pitch < row_bytes || data.len() < expected {
        return Err(ScreenshotError::ShortRead {
            expected,
            actual: data.len(),
        });
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * row_pitch;
        pixels.extend_from_slice(&data[start..start + row_bytes]);
    }
    Ok(pixels)
}

/// Save the contents of `source` to a PNG in `dir` and return its path.
///
/// `source` must be a color image of `extent` currently in `source_layout`
/// with `TRANSFER_SRC` usage. It is returned to `source_layout` afterwards,
/// or left in `TRANSFER_SRC_OPTIMAL` when that was `UNDEFINED`. The call
/// blocks until the copy has completed.
pub fn capture_screenshot(
    gpu: &GpuContext,
    source: vk::Image,
    source_layout: vk::ImageLayout,
    extent: vk::Extent2D,
    dir: &Path,
) -> Result<PathBuf, ScreenshotError> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(CAPTURE_FORMAT)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::LINEAR)
        .usage(vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let mut readback = gpu.allocator().create_image(
        &create_info,
        MemoryLocation::GpuToCpu,
        "screenshot_readback",
    )?;

    let result = copy_and_save(gpu, source, source_layout, extent, &readback, dir);

    if let Err(e) = gpu.allocator().free_image(&mut readback) {
        tracing::warn!("Failed to free screenshot image: {e}");
    }
    result
}

fn copy_and_save(
    gpu: &GpuContext,
    source: vk::Image,
    source_layout: vk::ImageLayout,
    extent: vk::Extent2D,
    readback: &GpuImage,
    dir: &Path,
) -> Result<PathBuf, ScreenshotError> {
    let device = gpu.device();

    gpu.submit_immediate(|cmd| {
        // SAFETY: cmd is recording and both images are alive until the
        // submission has been waited on.
        unsafe {
            if source_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                transition_image(
                    device,
                    cmd,
                    source,
                    source_layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
            }
            transition_image(
                device,
                cmd,
                readback.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            blit_image(device, cmd, source, readback.image, extent, extent);

            transition_image(
                device,
                cmd,
                readback.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::GENERAL,
            );
            if source_layout != vk::ImageLayout::UNDEFINED
                && source_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            {
                transition_image(
                    device,
                    cmd,
                    source,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    source_layout,
                );
            }
        }
    })?;

    let subresource = vk::ImageSubresource {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        array_layer: 0,
    };
    // SAFETY: the image is linear and alive.
    let layout = unsafe { device.get_image_subresource_layout(readback.image, subresource) };

    let mapped = readback
        .allocation
        .as_ref()
        .and_then(|allocation| allocation.mapped_slice())
        .ok_or(ScreenshotError::NotMapped)?;
    let offset = layout.offset as usize;
    let data = mapped.get(offset..).ok_or(ScreenshotError::ShortRead {
        expected: offset,
        actual: mapped.len(),
    })?;
    let pixels = unpack_rows(data, layout.row_pitch as usize, extent.width, extent.height)?;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(screenshot_filename(&chrono::Local::now().naive_local()));

    let image = image::RgbaImage::from_raw(extent.width, extent.height, pixels).ok_or(
        ScreenshotError::ShortRead {
            expected: extent.width as usize * extent.height as usize * BYTES_PER_PIXEL,
            actual: 0,
        },
    )?;
    image.save(&path)?;

    tracing::info!("Screenshot saved to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn filename_is_day_month_year_time() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 1)
            .unwrap();
        assert_eq!(screenshot_filename(&time), "07032024090501.png");
    }

    #[test]
    fn rows_are_unpacked_without_padding() {
        // 2x2 image, rows padded to 12 bytes.
        let mut data = vec![0u8; 24];
        data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data[8..12].copy_from_slice(&[0xAA; 4]);
        data[12..20].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);

        let pixels = unpack_rows(&data, 12, 2, 2).unwrap();
        assert_eq!(pixels, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn tight_rows_are_copied_as_is() {
        let data: Vec<u8> = (0..48).collect();
        assert_eq!(unpack_rows(&data, 12, 3, 4).unwrap(), data);
    }

    #[test]
    fn last_row_needs_no_padding() {
        let data = vec![7u8; 16 + 8];
        let pixels = unpack_rows(&data, 16, 2, 2).unwrap();
        assert_eq!(pixels.len(), 16);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let data = vec![0u8; 20];
        assert!(unpack_rows(&data, 12, 2, 2).is_ok());
        assert!(matches!(
            unpack_rows(&data[..19], 12, 2, 2),
            Err(ScreenshotError::ShortRead {
                expected: 20,
                actual: 19
            })
        ));
    }

    #[test]
    fn pitch_smaller_than_row_is_rejected() {
        let data = vec![0u8; 64];
        assert!(unpack_rows(&data, 4, 2, 2).is_err());
    }
}
