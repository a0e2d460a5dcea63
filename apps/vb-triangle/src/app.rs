//! The spinning textured quad.

use std::mem::{offset_of, size_of};

use anyhow::Context as _;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use tracing::{error, info};
use vb_app::{capture_screenshot, App, AppContext, AppFlow, FrameContext, KeyCode, PlatformEvent};
use vb_gpu::{
    blit_image, create_sampler, transition_image, upload_buffers, write_combined_image_sampler,
    DescriptorPool, DescriptorSetLayoutBuilder, GpuBuffer, GpuContext, GraphicsPipelineBuilder,
    ImageDesc, MemoryLocation, Pipeline, StagingLayout, Texture, UploadTarget,
};

use crate::Args;

const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const CHECKER_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    const fn new(position: [f32; 3], color: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            color,
            uv,
        }
    }
}

const VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.2, 0.2], [0.0, 0.0]),
    Vertex::new([0.5, -0.5, 0.0], [0.2, 1.0, 0.2], [1.0, 0.0]),
    Vertex::new([0.5, 0.5, 0.0], [0.2, 0.2, 1.0], [1.0, 1.0]),
    Vertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 0.2], [0.0, 1.0]),
];

const INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// RGBA8 checkerboard, `size` pixels square with `cell`-pixel cells.
pub fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let v = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[v, v, v, 255]);
        }
    }
    pixels
}

/// Model-view-projection for the quad after `time` seconds of spin.
///
/// Y is flipped so +Y points up in Vulkan clip space.
pub fn model_view_projection(time: f32, aspect: f32) -> Mat4 {
    let model = Mat4::from_rotation_y(time * 0.8) * Mat4::from_rotation_z(time * 0.3);
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
    let mut proj = Mat4::perspective_rh(60f32.to_radians(), aspect.max(f32::EPSILON), 0.1, 10.0);
    proj.y_axis.y *= -1.0;
    proj * view * model
}

/// Offscreen color and depth targets sized to the swapchain.
struct Targets {
    color: Texture,
    depth: Texture,
    extent: vk::Extent2D,
    /// Layout the color image was left in by the last frame.
    color_layout: vk::ImageLayout,
}

impl Targets {
    fn create(gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<Self> {
        let color_desc = ImageDesc::new(
            extent.width,
            extent.height,
            COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        );
        let depth_desc = ImageDesc::new(
            extent.width,
            extent.height,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );

        let mut color = Texture::create(gpu, &color_desc, "offscreen color")?;
        let depth = match Texture::create(gpu, &depth_desc, "offscreen depth") {
            Ok(depth) => depth,
            Err(e) => {
                color.destroy(gpu)?;
                return Err(e.into());
            }
        };

        Ok(Self {
            color,
            depth,
            extent,
            color_layout: vk::ImageLayout::UNDEFINED,
        })
    }

    fn destroy(&mut self, gpu: &GpuContext) {
        for (name, texture) in [("color", &mut self.color), ("depth", &mut self.depth)] {
            if let Err(e) = texture.destroy(gpu) {
                error!("Failed to destroy {name} target: {e}");
            }
        }
    }
}

pub struct Triangle {
    pipeline: Pipeline,
    set_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    geometry: GpuBuffer,
    index_offset: u64,
    texture: Texture,
    sampler: vk::Sampler,
    targets: Option<Targets>,
    time: f32,
    screenshot_requested: bool,
}

impl Triangle {
    /// Vertices and indices packed into one device-local buffer.
    fn upload_geometry(gpu: &GpuContext) -> anyhow::Result<(GpuBuffer, u64)> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&VERTICES);
        let index_bytes: &[u8] = bytemuck::cast_slice(&INDICES);
        let layout = StagingLayout::new(&[vertex_bytes.len() as u64, index_bytes.len() as u64]);

        let mut geometry = gpu.allocator().create_buffer(
            layout.total_size(),
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "quad geometry",
        )?;

        let targets = [
            UploadTarget {
                buffer: geometry.buffer,
                dst_offset: layout.offset(0),
                data: vertex_bytes,
            },
            UploadTarget {
                buffer: geometry.buffer,
                dst_offset: layout.offset(1),
                data: index_bytes,
            },
        ];
        if let Err(e) = upload_buffers(gpu, &targets) {
            gpu.allocator().free_buffer(&mut geometry)?;
            return Err(e.into());
        }

        Ok((geometry, layout.offset(1)))
    }

    fn load_texture(gpu: &GpuContext, args: &Args) -> anyhow::Result<Texture> {
        if let Some(path) = &args.texture {
            return Texture::load(gpu, path, true)
                .with_context(|| format!("Failed to load texture {}", path.display()));
        }

        let desc = ImageDesc::new(
            CHECKER_SIZE,
            CHECKER_SIZE,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED,
        )
        .mipmapped(true);
        let pixels = checkerboard(CHECKER_SIZE, CHECKER_CELL);
        Ok(Texture::create_with_data(gpu, &desc, &pixels, "checkerboard")?)
    }

    fn build_pipeline(
        gpu: &GpuContext,
        args: &Args,
        set_layout: vk::DescriptorSetLayout,
    ) -> anyhow::Result<Pipeline> {
        let builder = GraphicsPipelineBuilder::new()
            .add_shader_file(
                vk::ShaderStageFlags::VERTEX,
                args.shader_dir.join("triangle.vert.spv"),
            )
            .add_shader_file(
                vk::ShaderStageFlags::FRAGMENT,
                args.shader_dir.join("triangle.frag.spv"),
            )
            .add_descriptor_set_layout(set_layout)
            .add_push_constant(size_of::<Mat4>() as u32, vk::ShaderStageFlags::VERTEX, 0)
            .add_vertex_binding(0, size_of::<Vertex>() as u32)
            .add_vertex_attribute(
                0,
                0,
                vk::Format::R32G32B32_SFLOAT,
                offset_of!(Vertex, position) as u32,
            )
            .add_vertex_attribute(
                1,
                0,
                vk::Format::R32G32B32_SFLOAT,
                offset_of!(Vertex, color) as u32,
            )
            .add_vertex_attribute(2, 0, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv) as u32)
            .color_format(COLOR_FORMAT)
            .depth_format(DEPTH_FORMAT)
            .enable_depth_test(true, vk::CompareOp::LESS)
            .cull_mode(vk::CullModeFlags::NONE);

        // SAFETY: the device outlives the pipeline, which is destroyed in cleanup.
        let pipeline = unsafe { builder.build(gpu.device()) }.with_context(|| {
            format!("Failed to build pipeline from {}", args.shader_dir.display())
        })?;
        Ok(pipeline)
    }

    fn take_screenshot(&mut self, ctx: &AppContext) {
        let Some(targets) = &self.targets else {
            return;
        };

        if let Err(e) = ctx.gpu.wait_idle() {
            error!("Failed to wait idle before screenshot: {e}");
            return;
        }

        match capture_screenshot(
            &ctx.gpu,
            targets.color.image.image,
            targets.color_layout,
            targets.extent,
            ctx.screenshot_dir(),
        ) {
            Ok(path) => info!("Screenshot saved to {}", path.display()),
            Err(e) => error!("Screenshot failed: {e}"),
        }
    }
}

impl App for Triangle {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let args = Args::from_env();
        let gpu = &ctx.gpu;

        let (geometry, index_offset) = Self::upload_geometry(gpu)?;
        let texture = Self::load_texture(gpu, &args)?;
        let sampler = create_sampler(gpu, vk::Filter::LINEAR, texture.mip_levels() as f32)?;
        info!(
            "Texture {}x{} with {} mip levels",
            texture.extent().width,
            texture.extent().height,
            texture.mip_levels()
        );

        let layout_builder = DescriptorSetLayoutBuilder::new()
            .combined_image_sampler(0, vk::ShaderStageFlags::FRAGMENT);
        let device = gpu.device();

        // SAFETY: all handles come from this device and live until cleanup.
        let (set_layout, pool, descriptor_set) = unsafe {
            let set_layout = layout_builder.build(device)?;
            let pool = DescriptorPool::for_layout(device, &layout_builder, 1)?;
            let sets = pool.allocate(device, &[set_layout])?;
            let set = sets
                .first()
                .copied()
                .context("Descriptor pool returned no sets")?;
            write_combined_image_sampler(device, set, 0, texture.view, sampler);
            (set_layout, pool, set)
        };

        let pipeline = Self::build_pipeline(gpu, &args, set_layout)?;
        let targets = Targets::create(gpu, ctx.extent())?;

        info!("Press P for a screenshot, Escape to quit");

        Ok(Self {
            pipeline,
            set_layout,
            pool,
            descriptor_set,
            geometry,
            index_offset,
            texture,
            sampler,
            targets: Some(targets),
            time: 0.0,
            screenshot_requested: false,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
    }

    fn render(
        &mut self,
        ctx: &AppContext,
        frame: &mut FrameContext,
    ) -> anyhow::Result<vk::ImageLayout> {
        if std::mem::take(&mut self.screenshot_requested) {
            self.take_screenshot(ctx);
        }

        let targets = self
            .targets
            .as_mut()
            .context("Render targets missing")?;
        let device = ctx.gpu.device();
        let cmd = frame.command_buffer;
        let extent = targets.extent;
        let mvp = model_view_projection(self.time, extent.width as f32 / extent.height as f32);

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(targets.color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.05, 0.05, 0.08, 1.0],
                },
            });
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(targets.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        // SAFETY: the command buffer is recording and every handle is owned by
        // this app or the current frame.
        unsafe {
            transition_image(
                device,
                cmd,
                targets.color.image.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );
            transition_image(
                device,
                cmd,
                targets.depth.image.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            );

            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.geometry.buffer], &[0]);
            device.cmd_bind_index_buffer(
                cmd,
                self.geometry.buffer,
                self.index_offset,
                vk::IndexType::UINT16,
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&mvp),
            );
            device.cmd_draw_indexed(cmd, INDICES.len() as u32, 1, 0, 0, 0);
            device.cmd_end_rendering(cmd);

            transition_image(
                device,
                cmd,
                targets.color.image.image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );
            transition_image(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            blit_image(
                device,
                cmd,
                targets.color.image.image,
                frame.swapchain_image,
                extent,
                frame.extent,
            );
        }
        targets.color_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;

        Ok(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    }

    fn on_event(&mut self, _ctx: &AppContext, event: &PlatformEvent) -> AppFlow {
        match event {
            PlatformEvent::KeyDown {
                key: KeyCode::KeyP,
                repeat: false,
            } => {
                self.screenshot_requested = true;
                AppFlow::Continue
            }
            PlatformEvent::KeyDown {
                key: KeyCode::Escape,
                ..
            } => AppFlow::Exit,
            _ => AppFlow::Continue,
        }
    }

    fn destroy_targets(&mut self, gpu: &GpuContext) {
        if let Some(mut targets) = self.targets.take() {
            targets.destroy(gpu);
        }
    }

    fn create_targets(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<()> {
        tracing::debug!("Recreating targets at {}x{}", extent.width, extent.height);
        self.targets = Some(Targets::create(gpu, extent)?);
        Ok(())
    }

    fn cleanup(&mut self, ctx: &AppContext) {
        let gpu = &ctx.gpu;
        self.destroy_targets(gpu);

        // SAFETY: the device is idle and nothing references these handles.
        unsafe {
            let device = gpu.device();
            self.pipeline.destroy(device);
            self.pool.destroy(device);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_sampler(self.sampler, None);
        }

        if let Err(e) = self.texture.destroy(gpu) {
            error!("Failed to destroy texture: {e}");
        }
        if let Err(e) = gpu.allocator().free_buffer(&mut self.geometry) {
            error!("Failed to free geometry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec4;

    use super::*;

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(offset_of!(Vertex, color), 12);
        assert_eq!(offset_of!(Vertex, uv), 24);
    }

    #[test]
    fn index_data_follows_aligned_vertices() {
        let vertex_bytes = size_of::<[Vertex; 4]>() as u64;
        let index_bytes = size_of::<[u16; 6]>() as u64;
        let layout = StagingLayout::new(&[vertex_bytes, index_bytes]);
        assert_eq!(layout.offset(0), 0);
        assert!(layout.offset(1) >= vertex_bytes);
        assert_eq!(layout.offset(1) % 4, 0);
        assert!(INDICES.iter().all(|&i| (i as usize) < VERTICES.len()));
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let pixels = checkerboard(16, 4);
        assert_eq!(pixels.len(), 16 * 16 * 4);

        let texel = |x: usize, y: usize| pixels[(y * 16 + x) * 4];
        assert_eq!(texel(0, 0), 230);
        assert_eq!(texel(4, 0), 40);
        assert_eq!(texel(4, 4), 230);
        assert_eq!(texel(3, 7), 40);
        assert!(pixels.chunks(4).all(|p| p[3] == 255));
    }

    #[test]
    fn projection_flips_y() {
        let mvp = model_view_projection(0.0, 1.0);
        let top = mvp * Vec4::new(0.0, 0.5, 0.0, 1.0);
        assert!(top.y / top.w < 0.0);
        let center = mvp * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let depth = center.z / center.w;
        assert!((0.0..1.0).contains(&depth));
    }
}
