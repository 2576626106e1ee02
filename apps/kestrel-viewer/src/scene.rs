//! The triangle every scenario draws.

use bytemuck::{Pod, Zeroable};
use kestrel_gpu::{
    AttachmentInfo, Buffer, BufferDesc, BufferUsage, CommandList, DrawCallPipeline, GpuDevice,
    Handle, ImageLayout, LoadStoreFlags, RenderpassInfo, ShaderModule, ShaderProgram,
    ShaderProgramBuilder, ShaderStages, VertexFormat, VertexInputRate, VertexLayoutBuilder,
    VertexLayoutSet,
};
use kestrel_render::{DrawArrays, RenderQueue, RenderQueueType, RenderView};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.6],
        color: [1.0, 0.3, 0.2],
    },
    Vertex {
        position: [0.6, 0.6],
        color: [0.2, 1.0, 0.3],
    },
    Vertex {
        position: [-0.6, 0.6],
        color: [0.3, 0.2, 1.0],
    },
];

const CLEAR_COLOR: [f32; 4] = [0.1, 0.2, 0.3, 1.0];

/// GPU objects of the triangle plus the queue that draws it.
pub struct TriangleScene {
    modules: [Handle<ShaderModule>; 2],
    program: Handle<ShaderProgram>,
    layout: Handle<VertexLayoutSet>,
    vertices: Handle<Buffer>,
    queue: RenderQueue,
}

impl TriangleScene {
    pub fn new(device: &mut GpuDevice) -> anyhow::Result<Self> {
        let vert = device.create_shader_module(
            ShaderStages::VERTEX,
            kestrel_shaders::builtin::triangle_vertex(),
        )?;
        let frag = device.create_shader_module(
            ShaderStages::FRAGMENT,
            kestrel_shaders::builtin::triangle_fragment(),
        )?;
        let program = device.create_program(&ShaderProgramBuilder::new().module(vert).module(frag))?;

        let layout = device.create_vertex_layout(
            VertexLayoutBuilder::new()
                .binding(0, std::mem::size_of::<Vertex>() as u32, VertexInputRate::Vertex)
                .attribute(0, 0, VertexFormat::Float2, 0)
                .attribute(1, 0, VertexFormat::Float3, 8),
        )?;

        let bytes: &[u8] = bytemuck::cast_slice(&VERTICES);
        let vertices = device.create_buffer(
            &BufferDesc::device(bytes.len() as u64, BufferUsage::VERTEX),
            Some(bytes),
        )?;
        device.flush_uploads()?;

        let mut queue = RenderQueue::new(RenderQueueType::Opaque);
        let draw = queue.draw_arrays(DrawArrays {
            pipeline: DrawCallPipeline {
                program: Some(program),
                vertex_layout: Some(layout),
                ..DrawCallPipeline::default()
            },
            material: None,
            object: None,
            vertex_buffers: &[(vertices, 0)],
            first_vertex: 0,
            vertex_count: 3,
        })?;
        queue.submit(draw, 0.0)?;

        Ok(Self {
            modules: [vert, frag],
            program,
            layout,
            vertices,
            queue,
        })
    }

    /// Clear the backbuffer and draw the triangle.
    pub fn record(&mut self, cmd: &mut CommandList<'_>) -> anyhow::Result<()> {
        let mut info = RenderpassInfo::new(1)?;
        let color = info.add_attachment(AttachmentInfo {
            texture: cmd.backbuffer(),
            final_layout: ImageLayout::PresentSrc,
            may_alias: false,
        })?;
        info.add_color_out(0, color, ImageLayout::ColorAttachmentOptimal)?;
        info.clear_ops = LoadStoreFlags::attachment(0);
        info.store_ops = LoadStoreFlags::attachment(0);

        cmd.set_renderpass_info(&info);
        cmd.set_clear_color(0, CLEAR_COLOR);
        cmd.begin_renderpass();
        cmd.set_render_area_rel(0.0, 0.0, 1.0, 1.0);
        self.queue.execute(cmd, &RenderView::default());
        cmd.end_renderpass();
        Ok(())
    }

    /// Hand every object back to the device.
    pub fn release(self, device: &mut GpuDevice) -> anyhow::Result<()> {
        device.release(self.vertices)?;
        device.release(self.layout)?;
        device.release(self.program)?;
        for module in self.modules {
            device.release(module)?;
        }
        Ok(())
    }
}
