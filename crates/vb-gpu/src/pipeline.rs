//! Pipeline creation.
//!
//! [`GraphicsPipelineBuilder`] accumulates stages, layout inputs and
//! fixed-function overrides; nothing touches the device until
//! [`build`](GraphicsPipelineBuilder::build). Pipelines target dynamic
//! rendering unless a render pass is named.

use std::path::PathBuf;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::shader::ShaderModule;

/// Pipeline plus the layout derived for it.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Pipeline {
    /// Destroy the pipeline and its layout.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

unsafe fn create_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constants);

    unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Compute pipeline wrapper.
pub struct ComputePipeline;

impl ComputePipeline {
    /// Create a compute pipeline with entry point `main`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        shader: &ShaderModule,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Pipeline> {
        let layout = unsafe { create_layout(device, set_layouts, push_constants)? };

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let created = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        match created {
            Ok(pipelines) => {
                tracing::debug!("Compute pipeline created");
                Ok(Pipeline {
                    pipeline: pipelines[0],
                    layout,
                })
            }
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(GpuError::PipelineCreation(e.to_string()))
            }
        }
    }
}

/// Where a stage's SPIR-V comes from.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    /// Borrowed module, left alive after the build.
    Module(vk::ShaderModule),
    /// SPIR-V file read at build time.
    Path(PathBuf),
    /// SPIR-V bytes.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct StageDesc {
    stage: vk::ShaderStageFlags,
    source: ShaderSource,
}

/// Color blend equation used when blending is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendFactors {
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
}

impl Default for BlendFactors {
    /// Straight alpha blending.
    fn default() -> Self {
        Self {
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
        }
    }
}

/// Builder for graphics pipelines.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineBuilder {
    stages: Vec<StageDesc>,
    push_constants: Vec<vk::PushConstantRange>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    stencil_format: vk::Format,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    line_width: f32,
    samples: vk::SampleCountFlags,
    min_sample_shading: Option<f32>,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    depth_bounds: Option<(f32, f32)>,
    stencil: Option<(vk::StencilOpState, vk::StencilOpState)>,
    blend: Option<BlendFactors>,
    render_pass: Option<(vk::RenderPass, u32)>,
}

impl Default for GraphicsPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsPipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            push_constants: Vec::new(),
            set_layouts: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
            stencil_format: vk::Format::UNDEFINED,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            line_width: 1.0,
            samples: vk::SampleCountFlags::TYPE_1,
            min_sample_shading: None,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS,
            depth_bounds: None,
            stencil: None,
            blend: None,
            render_pass: None,
        }
    }

    /// Add a stage whose module the caller keeps ownership of.
    pub fn add_shader_stage(mut self, stage: vk::ShaderStageFlags, module: &ShaderModule) -> Self {
        self.stages.push(StageDesc {
            stage,
            source: ShaderSource::Module(module.module),
        });
        self
    }

    /// Add a stage loaded from a SPIR-V file when the pipeline is built.
    pub fn add_shader_file(
        mut self,
        stage: vk::ShaderStageFlags,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.stages.push(StageDesc {
            stage,
            source: ShaderSource::Path(path.into()),
        });
        self
    }

    /// Add a stage from in-memory SPIR-V bytes.
    pub fn add_shader_bytes(mut self, stage: vk::ShaderStageFlags, bytes: Vec<u8>) -> Self {
        self.stages.push(StageDesc {
            stage,
            source: ShaderSource::Bytes(bytes),
        });
        self
    }

    pub fn add_push_constant(
        mut self,
        size: u32,
        stages: vk::ShaderStageFlags,
        offset: u32,
    ) -> Self {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    pub fn add_descriptor_set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }

    pub fn add_vertex_binding(mut self, binding: u32, stride: u32) -> Self {
        self.vertex_bindings.push(vk::VertexInputBindingDescription {
            binding,
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
        });
        self
    }

    pub fn add_vertex_attribute(
        mut self,
        location: u32,
        binding: u32,
        format: vk::Format,
        offset: u32,
    ) -> Self {
        self.vertex_attributes.push(vk::VertexInputAttributeDescription {
            location,
            binding,
            format,
            offset,
        });
        self
    }

    pub fn color_format(mut self, format: vk::Format) -> Self {
        self.color_formats.push(format);
        self
    }

    pub fn depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = format;
        self
    }

    pub fn stencil_format(mut self, format: vk::Format) -> Self {
        self.stencil_format = format;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    pub fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn line_width(mut self, width: f32) -> Self {
        self.line_width = width;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Enable sample shading with the given minimum fraction.
    pub fn sample_shading(mut self, min_fraction: f32) -> Self {
        self.min_sample_shading = Some(min_fraction);
        self
    }

    /// Enable depth testing with `compare`, optionally writing depth.
    pub fn enable_depth_test(mut self, write: bool, compare: vk::CompareOp) -> Self {
        self.depth_test = true;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    pub fn depth_bounds(mut self, min: f32, max: f32) -> Self {
        self.depth_bounds = Some((min, max));
        self
    }

    pub fn stencil(mut self, front: vk::StencilOpState, back: vk::StencilOpState) -> Self {
        self.stencil = Some((front, back));
        self
    }

    /// Enable blending on every color attachment.
    pub fn enable_blending(mut self, factors: BlendFactors) -> Self {
        self.blend = Some(factors);
        self
    }

    /// Enable straight alpha blending.
    pub fn enable_alpha_blending(self) -> Self {
        self.enable_blending(BlendFactors::default())
    }

    /// Build against `subpass` of a classic render pass instead of dynamic
    /// rendering. Color formats still size the blend state, one per color
    /// attachment of the subpass.
    pub fn render_pass(mut self, render_pass: vk::RenderPass, subpass: u32) -> Self {
        self.render_pass = Some((render_pass, subpass));
        self
    }

    /// Whether the pipeline will chain `PipelineRenderingCreateInfo`.
    pub fn uses_dynamic_rendering(&self) -> bool {
        self.render_pass.is_none()
    }

    pub fn input_assembly_state(&self) -> vk::PipelineInputAssemblyStateCreateInfo<'static> {
        vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(false)
    }

    pub fn rasterization_state(&self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false)
            .line_width(self.line_width)
    }

    pub fn multisample_state(&self) -> vk::PipelineMultisampleStateCreateInfo<'static> {
        vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(self.samples)
            .sample_shading_enable(self.min_sample_shading.is_some())
            .min_sample_shading(self.min_sample_shading.unwrap_or(1.0))
    }

    pub fn depth_stencil_state(&self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        let (min_bounds, max_bounds) = self.depth_bounds.unwrap_or((0.0, 1.0));
        let mut state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare)
            .depth_bounds_test_enable(self.depth_bounds.is_some())
            .min_depth_bounds(min_bounds)
            .max_depth_bounds(max_bounds)
            .stencil_test_enable(self.stencil.is_some());
        if let Some((front, back)) = self.stencil {
            state = state.front(front).back(back);
        }
        state
    }

    pub fn color_blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        match self.blend {
            Some(f) => attachment
                .blend_enable(true)
                .src_color_blend_factor(f.src_color)
                .dst_color_blend_factor(f.dst_color)
                .color_blend_op(f.color_op)
                .src_alpha_blend_factor(f.src_alpha)
                .dst_alpha_blend_factor(f.dst_alpha)
                .alpha_blend_op(f.alpha_op),
            None => attachment.blend_enable(false),
        }
    }

    pub fn dynamic_states(&self) -> [vk::DynamicState; 2] {
        [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constants
    }

    /// Create the layout from the accumulated inputs, then the pipeline.
    ///
    /// Modules loaded from paths or bytes are destroyed before returning;
    /// borrowed modules are left alone.
    ///
    /// # Safety
    /// The device must be valid and every borrowed module and set layout
    /// must still be alive.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(GpuError::PipelineCreation(
                "Pipeline has no shader stages".to_string(),
            ));
        }

        let mut owned: Vec<ShaderModule> = Vec::new();
        let mut modules = Vec::with_capacity(self.stages.len());
        for desc in &self.stages {
            let loaded = match &desc.source {
                ShaderSource::Module(module) => Ok(*module),
                ShaderSource::Path(path) => {
                    unsafe { ShaderModule::from_path(device, path) }.map(|m| {
                        let handle = m.module;
                        owned.push(m);
                        handle
                    })
                }
                ShaderSource::Bytes(bytes) => {
                    unsafe { ShaderModule::from_bytes(device, bytes) }.map(|m| {
                        let handle = m.module;
                        owned.push(m);
                        handle
                    })
                }
            };
            match loaded {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in &owned {
                        unsafe { module.destroy(device) };
                    }
                    return Err(e);
                }
            }
        }

        let result = unsafe { self.build_with_modules(device, &modules) };
        for module in &owned {
            unsafe { module.destroy(device) };
        }
        result
    }

    unsafe fn build_with_modules(
        &self,
        device: &ash::Device,
        modules: &[vk::ShaderModule],
    ) -> Result<Pipeline> {
        let stages: Vec<_> = self
            .stages
            .iter()
            .zip(modules)
            .map(|(desc, &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(desc.stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);
        let input_assembly = self.input_assembly_state();
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = self.rasterization_state();
        let multisampling = self.multisample_state();
        let depth_stencil = self.depth_stencil_state();

        let blend_attachments = vec![self.color_blend_attachment(); self.color_formats.len()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = self.dynamic_states();
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout = unsafe { create_layout(device, &self.set_layouts, &self.push_constants)? };

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&self.color_formats)
            .depth_attachment_format(self.depth_format)
            .stencil_attachment_format(self.stencil_format);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout);
        pipeline_info = match self.render_pass {
            Some((render_pass, subpass)) => pipeline_info.render_pass(render_pass).subpass(subpass),
            None => pipeline_info.push_next(&mut rendering_info),
        };

        let created = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        match created {
            Ok(pipelines) => {
                tracing::debug!(stages = stages.len(), "Graphics pipeline created");
                Ok(Pipeline {
                    pipeline: pipelines[0],
                    layout,
                })
            }
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(GpuError::PipelineCreation(e.to_string()))
            }
        }
    }
}
