//! Vulkan core for vb.
//!
//! This crate provides:
//! - Instance, device and queue selection with a role-to-queue mapping
//! - Swapchain creation and stale-and-replace recreation
//! - The frame ring of per-frame synchronization objects
//! - Blocking one-shot submission for uploads and transitions
//! - Staging uploads, layout transitions and mip chain generation
//! - Pipeline and descriptor builders

pub mod command;
pub mod context;
pub mod debug;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
mod rollback;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transition;
pub mod upload;

pub use command::{CommandPool, ImmediateSubmitter};
pub use context::{GpuContext, GpuContextBuilder};
pub use debug::{DebugSink, Severity, TracingSink};
pub use descriptors::{
    write_combined_image_sampler, write_storage_buffer, write_storage_image, write_uniform_buffer,
    DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use device::{DeviceConfig, DeviceFeatures, QueueMap, QueueRole};
pub use error::{GpuError, Result};
pub use instance::InstanceConfig;
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{BlendFactors, ComputePipeline, GraphicsPipelineBuilder, Pipeline};
pub use shader::ShaderModule;
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::{
    Acquire, Swapchain, SwapchainChain, SwapchainConfig, SwapchainManager, SwapchainOps,
    SwapchainPlan, SwapchainState,
};
pub use sync::{drain_semaphore, FrameRing, FrameSlot};
pub use texture::{create_sampler, texel_size, ImageDesc, Texture};
pub use transition::{blit_image, generate_mipmaps, transition_image};
pub use upload::{
    create_buffer_with_data, upload_buffer, upload_buffers, StagingLayout, UploadTarget,
};

pub use gpu_allocator::MemoryLocation;
