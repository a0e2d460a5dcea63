//! The gradient compute pass and the storage image it writes.

use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use vb_gpu::{
    transition_image, write_storage_image, ComputePipeline, DescriptorPool,
    DescriptorSetLayoutBuilder, GpuContext, ImageDesc, Pipeline, ShaderModule, Texture,
};

/// Workgroup edge declared by `gradient.comp`.
pub const GROUP_SIZE: u32 = 16;
pub const TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub time: f32,
}

/// Workgroups needed to cover `extent`, rounding partial groups up.
pub fn group_count(extent: vk::Extent2D, group_size: u32) -> (u32, u32) {
    (
        extent.width.div_ceil(group_size),
        extent.height.div_ceil(group_size),
    )
}

/// Storage image usable as a blit or copy source.
pub fn target_desc(extent: vk::Extent2D) -> ImageDesc {
    ImageDesc::new(
        extent.width,
        extent.height,
        TARGET_FORMAT,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
    )
}

/// Create the storage image for `extent`.
pub fn create_target(gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<Texture> {
    Ok(Texture::create(gpu, &target_desc(extent), "gradient target")?)
}

/// Pipeline, layout and the single descriptor set pointing at the target.
pub struct GradientPass {
    pipeline: Pipeline,
    set_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    set: vk::DescriptorSet,
}

impl GradientPass {
    pub fn new(gpu: &GpuContext, shader_dir: &Path) -> anyhow::Result<Self> {
        let device = gpu.device();
        let layout_builder =
            DescriptorSetLayoutBuilder::new().storage_image(0, vk::ShaderStageFlags::COMPUTE);
        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: std::mem::size_of::<PushConstants>() as u32,
        };
        let shader_path = shader_dir.join("gradient.comp.spv");

        // SAFETY: every handle below comes from this device.
        let set_layout = unsafe { layout_builder.build(device)? };
        let pool = match unsafe { DescriptorPool::for_layout(device, &layout_builder, 1) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e.into());
            }
        };
        let release = || unsafe {
            pool.destroy(device);
            device.destroy_descriptor_set_layout(set_layout, None);
        };

        let set = match unsafe { pool.allocate(device, &[set_layout]) } {
            Ok(sets) => sets.first().copied(),
            Err(e) => {
                release();
                return Err(e.into());
            }
        };
        let Some(set) = set else {
            release();
            anyhow::bail!("Descriptor pool returned no sets");
        };

        // The module is only needed until the pipeline exists.
        let pipeline = unsafe { ShaderModule::from_path(device, &shader_path) }.and_then(|shader| {
            let pipeline =
                unsafe { ComputePipeline::new(device, &shader, &[set_layout], &[push_range]) };
            unsafe { shader.destroy(device) };
            pipeline
        });
        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(e) => {
                release();
                return Err(anyhow::Error::new(e).context(format!(
                    "Failed to build compute pipeline from {}",
                    shader_path.display()
                )));
            }
        };

        Ok(Self {
            pipeline,
            set_layout,
            pool,
            set,
        })
    }

    /// Point the descriptor set at `target`. The set must not be in use.
    pub fn bind_target(&self, gpu: &GpuContext, target: &Texture) {
        // SAFETY: the caller guarantees no submission references the set.
        unsafe { write_storage_image(gpu.device(), self.set, 0, target.view) };
    }

    /// Fill `target` and leave it in `TRANSFER_SRC_OPTIMAL`.
    ///
    /// # Safety
    /// `cmd` must be recording and `target` must be the bound image.
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        target: &Texture,
        time: f32,
    ) {
        let (groups_x, groups_y) = group_count(target.extent(), GROUP_SIZE);
        let push = PushConstants { time };
        let image = target.image.image;

        unsafe {
            transition_image(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline.layout,
                0,
                &[self.set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
            transition_image(
                device,
                cmd,
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );
        }
    }

    /// The device must be idle.
    pub fn destroy(&self, gpu: &GpuContext) {
        let device = gpu.device();
        // SAFETY: nothing references the pipeline or the set any more.
        unsafe {
            self.pipeline.destroy(device);
            self.pool.destroy(device);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn partial_groups_round_up() {
        assert_eq!(group_count(extent(1024, 768), GROUP_SIZE), (64, 48));
        assert_eq!(group_count(extent(1025, 1), GROUP_SIZE), (65, 1));
        assert_eq!(group_count(extent(15, 17), GROUP_SIZE), (1, 2));
        assert_eq!(group_count(extent(0, 0), GROUP_SIZE), (0, 0));
    }

    #[test]
    fn target_can_be_written_and_copied() {
        let desc = target_desc(extent(320, 200));
        assert!(desc.usage.contains(vk::ImageUsageFlags::STORAGE));
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert_eq!(desc.mip_levels(), 1);
        assert_eq!(desc.upload_size(), Some(320 * 200 * 4));
    }

    #[test]
    fn push_constants_fit_one_float() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 4);
    }
}
