//! Device objects created explicitly by callers.
//!
//! - Buffers with sub-allocated memory
//! - Textures, including swapchain backbuffers
//! - Shader modules and programs with their descriptor layouts
//! - Vertex layout sets

mod buffer;
mod shader;
mod texture;
mod vertex_layout;

pub use buffer::{Buffer, BufferDesc, BufferUsage, IndexType, MemoryProperties};
pub use shader::{
    DescriptorDemand, DescriptorKind, DescriptorSetLayoutInfo, LayoutBinding, ShaderModule,
    ShaderProgram, ShaderProgramBuilder,
};
pub use texture::{Texture, TextureDesc, TextureKind, TextureUsage};
pub use vertex_layout::{
    VertexAttribute, VertexBinding, VertexFormat, VertexInputRate, VertexLayoutBuilder,
    VertexLayoutSet,
};

pub(crate) use buffer::create_buffer;
pub(crate) use shader::{
    create_pipeline_layout, create_set_layout, create_shader_module, validate_spirv,
};
pub(crate) use texture::{aspect_for_format, create_image, create_sampler, create_view};
