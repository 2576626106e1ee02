//! Vulkan resource and command orchestration for the Kestrel renderer.
//!
//! This crate provides:
//! - Adapter selection, device creation and shutdown
//! - Generational handles for every device object
//! - A bit-packed pipeline state that hashes and compares cheaply
//! - Content-addressed caches of render passes, framebuffers, pipelines and
//!   descriptor sets, with frame-based garbage collection
//! - A sub-allocating memory pool, a staging ring and a descriptor pool chain
//! - Swapchain management, per-frame command lists and frame-delayed release

pub mod adapter;
pub mod barrier;
pub mod cache;
pub mod command_list;
pub mod config;
pub mod descriptor_pool;
pub mod descriptor_set;
pub mod device;
pub mod error;
pub mod flags;
pub mod frame;
pub mod framebuffer;
pub mod handle;
pub mod memory;
pub mod pipeline;
pub mod release;
pub mod renderpass;
pub mod resources;
pub mod staging;
pub mod state;
pub mod swapchain;
pub mod sync;

pub use adapter::{AdapterInfo, AdapterKind, AdapterPreference, GpuVendor};
pub use barrier::{Barrier, QueueTransfer, SubresourceRange};
pub use command_list::CommandList;
pub use config::DeviceConfig;
pub use descriptor_pool::DescriptorCapacity;
pub use descriptor_set::{
    BufferRange, DescriptorBinding, DescriptorResources, DescriptorSet, DescriptorSetInfo,
};
pub use device::{CacheStats, GpuDevice, GpuDeviceBuilder};
pub use error::{GpuError, Result};
pub use flags::{AccessFlags, ImageLayout, PipelineStages, SampleCount, ShaderStages};
pub use frame::FrameInfo;
pub use handle::{Handle, ObjectKind, RawHandle};
pub use renderpass::{AttachmentInfo, LoadStoreFlags, RenderpassInfo, SubpassDependency};
pub use resources::{
    Buffer, BufferDesc, BufferUsage, IndexType, MemoryProperties, ShaderModule, ShaderProgram,
    ShaderProgramBuilder, Texture, TextureDesc, TextureKind, TextureUsage, VertexFormat,
    VertexInputRate, VertexLayoutBuilder, VertexLayoutSet,
};
pub use state::{
    AttachmentBlend, DrawCallPipeline, PackedPipelineState, PipelineState, ScissorRect, Viewport,
};
pub use swapchain::{SwapchainState, WindowSurface};
