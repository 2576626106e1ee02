//! Draw commands and the encoder they are replayed into.

use kestrel_gpu::{
    Buffer, CommandList, DescriptorSet, DescriptorSetInfo, DrawCallPipeline, Handle, IndexType,
};

/// Descriptor set slot of the view's camera data.
pub const CAMERA_SET: u32 = 0;
/// Descriptor set slot of the view's light data.
pub const LIGHT_SET: u32 = 1;
/// Descriptor set slot of a draw's material.
pub const MATERIAL_SET: u32 = 2;
/// Descriptor set slot of a draw's per-object data.
pub const OBJECT_SET: u32 = 3;

/// A vertex buffer and the byte offset its data starts at.
pub type VertexBufferBinding = (Handle<Buffer>, u64);

/// How a descriptor set reaches the command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorBind {
    /// A set created up front with
    /// [`GpuDevice::create_descriptor_set`](kestrel_gpu::GpuDevice::create_descriptor_set).
    Retained(Handle<DescriptorSet>),
    /// Contents resolved through the descriptor set cache at bind time.
    Immediate(DescriptorSetInfo),
}

/// Non-indexed draw.
#[derive(Debug, Clone)]
pub struct DrawArrays<'a> {
    pub pipeline: DrawCallPipeline,
    pub material: Option<DescriptorBind>,
    pub object: Option<DescriptorBind>,
    pub vertex_buffers: &'a [VertexBufferBinding],
    pub first_vertex: u32,
    pub vertex_count: u32,
}

/// Indexed draw.
#[derive(Debug, Clone)]
pub struct DrawIndexed<'a> {
    pub pipeline: DrawCallPipeline,
    pub material: Option<DescriptorBind>,
    pub object: Option<DescriptorBind>,
    pub vertex_buffers: &'a [VertexBufferBinding],
    pub index_buffer: Handle<Buffer>,
    pub index_type: IndexType,
    /// Byte offset of the index data in `index_buffer`.
    pub index_offset: u64,
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
}

/// Recording surface a render queue executes into.
///
/// Implemented by [`CommandList`]; anything else that records draws can
/// stand in for it.
pub trait DrawEncoder {
    fn bind_draw_call_pipeline(&mut self, pipeline: &DrawCallPipeline);
    fn bind_descriptor_set(&mut self, index: u32, set: Handle<DescriptorSet>);
    fn bind_descriptor_info(&mut self, index: u32, info: DescriptorSetInfo);
    fn bind_vertex_buffers(&mut self, first: u32, buffers: &[VertexBufferBinding]);
    fn bind_index_buffer(&mut self, buffer: Handle<Buffer>, offset: u64, index_type: IndexType);
    fn draw(&mut self, first_vertex: u32, vertex_count: u32);
    fn draw_indexed(&mut self, first_index: u32, index_count: u32, vertex_offset: i32);

    /// Bind `bind` at set `index`.
    fn bind(&mut self, index: u32, bind: &DescriptorBind) {
        match bind {
            DescriptorBind::Retained(set) => self.bind_descriptor_set(index, *set),
            DescriptorBind::Immediate(info) => self.bind_descriptor_info(index, info.clone()),
        }
    }
}

impl DrawEncoder for CommandList<'_> {
    fn bind_draw_call_pipeline(&mut self, pipeline: &DrawCallPipeline) {
        CommandList::bind_draw_call_pipeline(self, pipeline);
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle<DescriptorSet>) {
        CommandList::bind_descriptor_set(self, index, set);
    }

    fn bind_descriptor_info(&mut self, index: u32, info: DescriptorSetInfo) {
        CommandList::bind_descriptor_info(self, index, info);
    }

    fn bind_vertex_buffers(&mut self, first: u32, buffers: &[VertexBufferBinding]) {
        CommandList::bind_vertex_buffers(self, first, buffers);
    }

    fn bind_index_buffer(&mut self, buffer: Handle<Buffer>, offset: u64, index_type: IndexType) {
        CommandList::bind_index_buffer(self, buffer, offset, index_type);
    }

    fn draw(&mut self, first_vertex: u32, vertex_count: u32) {
        CommandList::draw(self, first_vertex, vertex_count);
    }

    fn draw_indexed(&mut self, first_index: u32, index_count: u32, vertex_offset: i32) {
        CommandList::draw_indexed(self, first_index, index_count, vertex_offset);
    }
}
