//! Image layout transitions, blits and mip chain generation.

use ash::vk;

/// Aspect mask implied by a destination layout.
pub fn aspect_for_layout(layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    match layout {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Aspect mask for views of an image in `format`.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Whether `format` is a depth or depth-stencil format.
pub fn is_depth_format(format: vk::Format) -> bool {
    aspect_for_format(format).contains(vk::ImageAspectFlags::DEPTH)
}

/// Catch-all barrier moving every mip level of layer 0 from `old` to `new`.
///
/// Uses `ALL_COMMANDS` on both sides with full memory access, so it is
/// correct for any pair of layouts at the cost of a full pipeline drain.
pub fn layout_barrier(
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(old)
        .new_layout(new)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_for_layout(new),
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: 1,
        })
}

/// Record a transition of `image` from `old` to `new`.
///
/// # Safety
/// `cmd` must be recording and `image` must be valid.
pub unsafe fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let barrier = layout_barrier(image, old, new);
    let dependency_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn far_corner(width: u32, height: u32) -> vk::Offset3D {
    vk::Offset3D {
        x: width as i32,
        y: height as i32,
        z: 1,
    }
}

/// Linear blit covering the whole of `src_extent` into the whole of
/// `dst_extent`, mip level 0.
///
/// `src` must be in `TRANSFER_SRC_OPTIMAL` and `dst` in
/// `TRANSFER_DST_OPTIMAL`.
///
/// # Safety
/// `cmd` must be recording and both images must be valid.
pub unsafe fn blit_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    src_extent: vk::Extent2D,
    dst_extent: vk::Extent2D,
) {
    let blit = vk::ImageBlit {
        src_subresource: color_layers(0),
        src_offsets: [
            vk::Offset3D::default(),
            far_corner(src_extent.width, src_extent.height),
        ],
        dst_subresource: color_layers(0),
        dst_offsets: [
            vk::Offset3D::default(),
            far_corner(dst_extent.width, dst_extent.height),
        ],
    };

    unsafe {
        device.cmd_blit_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );
    }
}

/// Length of the full mip chain for a `width` x `height` image.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Size of mip `level`, halving per level with a floor of one pixel.
pub fn mip_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    let shrink = |size: u32| size.checked_shr(level).unwrap_or(0).max(1);
    (shrink(width), shrink(height))
}

/// One recorded operation of a mip chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipStep {
    /// Move `level` from transfer destination to transfer source.
    ToTransferSrc { level: u32 },
    /// Downsample `level - 1` into `level`.
    Blit {
        level: u32,
        src: (u32, u32),
        dst: (u32, u32),
    },
    /// Move `level` from `from` to shader read-only.
    ToShaderRead { level: u32, from: vk::ImageLayout },
}

/// Operations that turn level 0 of a freshly copied image into a complete
/// mip chain with every level in `SHADER_READ_ONLY_OPTIMAL`.
///
/// All levels start in `TRANSFER_DST_OPTIMAL`.
pub fn mip_chain_steps(width: u32, height: u32, levels: u32) -> Vec<MipStep> {
    let levels = levels.max(1);
    let mut steps = Vec::with_capacity(levels as usize * 3);

    for level in 1..levels {
        steps.push(MipStep::ToTransferSrc { level: level - 1 });
        steps.push(MipStep::Blit {
            level,
            src: mip_extent(width, height, level - 1),
            dst: mip_extent(width, height, level),
        });
        steps.push(MipStep::ToShaderRead {
            level: level - 1,
            from: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        });
    }

    steps.push(MipStep::ToShaderRead {
        level: levels - 1,
        from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    });
    steps
}

fn mip_barrier(image: vk::Image, step: MipStep) -> Option<vk::ImageMemoryBarrier2<'static>> {
    let (level, old, new, src_stage, src_access, dst_stage, dst_access) = match step {
        MipStep::ToTransferSrc { level } => (
            level,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        MipStep::ToShaderRead { level, from } => (
            level,
            from,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        ),
        MipStep::Blit { .. } => return None,
    };

    Some(
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old)
            .new_layout(new)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: level,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            }),
    )
}

/// Record the mip chain for `image`, whose every level is in
/// `TRANSFER_DST_OPTIMAL` with level 0 already filled.
///
/// # Safety
/// `cmd` must be recording, `image` must have `levels` mip levels and
/// support blitting with linear filtering.
pub unsafe fn generate_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    extent: vk::Extent2D,
    levels: u32,
) {
    for step in mip_chain_steps(extent.width, extent.height, levels) {
        match step {
            MipStep::Blit { level, src, dst } => {
                let blit = vk::ImageBlit {
                    src_subresource: color_layers(level - 1),
                    src_offsets: [vk::Offset3D::default(), far_corner(src.0, src.1)],
                    dst_subresource: color_layers(level),
                    dst_offsets: [vk::Offset3D::default(), far_corner(dst.0, dst.1)],
                };
                unsafe {
                    device.cmd_blit_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
            }
            barrier_step => {
                if let Some(barrier) = mip_barrier(image, barrier_step) {
                    let dependency_info = vk::DependencyInfo::default()
                        .image_memory_barriers(std::slice::from_ref(&barrier));
                    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_layout() {
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn depth_formats_get_depth_views() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(is_depth_format(vk::Format::D24_UNORM_S8_UINT));
        assert!(!is_depth_format(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn catch_all_barrier_covers_every_level() {
        let barrier = layout_barrier(
            vk::Image::null(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::MEMORY_WRITE);
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ
        );
        assert_eq!(barrier.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(barrier.subresource_range.layer_count, 1);
    }

    #[test]
    fn mip_count_matches_log2() {
        assert_eq!(mip_levels(256, 256), 9);
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(300, 100), 9);
        assert_eq!(mip_levels(1024, 512), 11);
        assert_eq!(mip_levels(0, 0), 1);
    }

    #[test]
    fn mip_levels_halve_down_to_one() {
        for level in 0..9 {
            let expected = (256u32 >> level).max(1);
            assert_eq!(mip_extent(256, 256, level), (expected, expected));
        }
        assert_eq!(mip_extent(300, 100, 7), (2, 1));
        assert_eq!(mip_extent(300, 100, 40), (1, 1));
    }

    #[test]
    fn chain_for_256_generates_nine_levels() {
        let steps = mip_chain_steps(256, 256, 9);
        assert_eq!(steps.len(), 8 * 3 + 1);

        let blits: Vec<_> = steps
            .iter()
            .filter_map(|step| match step {
                MipStep::Blit { level, dst, .. } => Some((*level, *dst)),
                _ => None,
            })
            .collect();
        assert_eq!(blits.len(), 8);
        for (level, dst) in blits {
            let expected = (256u32 >> level).max(1);
            assert_eq!(dst, (expected, expected));
        }
    }

    #[test]
    fn chain_steps_are_ordered_per_level() {
        let steps = mip_chain_steps(4, 4, 3);
        assert_eq!(
            steps,
            vec![
                MipStep::ToTransferSrc { level: 0 },
                MipStep::Blit {
                    level: 1,
                    src: (4, 4),
                    dst: (2, 2)
                },
                MipStep::ToShaderRead {
                    level: 0,
                    from: vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                },
                MipStep::ToTransferSrc { level: 1 },
                MipStep::Blit {
                    level: 2,
                    src: (2, 2),
                    dst: (1, 1)
                },
                MipStep::ToShaderRead {
                    level: 1,
                    from: vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                },
                MipStep::ToShaderRead {
                    level: 2,
                    from: vk::ImageLayout::TRANSFER_DST_OPTIMAL
                },
            ]
        );
    }

    #[test]
    fn single_level_only_transitions() {
        assert_eq!(
            mip_chain_steps(1, 1, 1),
            vec![MipStep::ToShaderRead {
                level: 0,
                from: vk::ImageLayout::TRANSFER_DST_OPTIMAL
            }]
        );
    }
}
