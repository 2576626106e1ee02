//! Per-frame command recording.
//!
//! A [`CommandList`] records into the acquired frame's command buffer. Render
//! passes, framebuffers, pipelines and immediate descriptor sets are looked up
//! in the device caches by content and created on a miss.
//!
//! Record operations never fail. The first problem encountered while
//! recording is kept and returned by [`CommandList::submit`], and the
//! offending command is skipped.

use ash::vk;
use kestrel_core::limits::{MAX_ATTACHMENTS, MAX_DESCRIPTOR_SETS, MAX_VERTEX_BINDINGS};

use crate::barrier::{Barrier, BarrierBatch};
use crate::cache::CacheKey;
use crate::descriptor_set::{
    plan_writes, write_descriptor_set, DescriptorSet, DescriptorSetInfo, DescriptorSetKey,
};
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::flags::{ImageLayout, PipelineStages};
use crate::framebuffer::{create_framebuffer, Framebuffer, FramebufferKey};
use crate::handle::{GpuObject, Handle, HandleTable, ObjectKind};
use crate::pipeline::{create_graphics_pipeline, Pipeline, PipelineInputs};
use crate::renderpass::{create_render_pass, RenderPass, RenderPassKey, RenderpassInfo};
use crate::resources::{Buffer, IndexType, ShaderProgram, Texture, VertexLayoutSet};
use crate::state::{
    AttachmentBlend, DepthBias, DepthBounds, DrawCallPipeline, DynamicState, PackedPipelineState,
    PipelineCacheKey, PipelineState, ScissorRect, StencilFace, Viewport,
};
use crate::swapchain::{FrameTarget, WindowSurface};

fn touch<T: GpuObject>(table: &mut HandleTable<T>, handle: Handle<T>, frame: u32) {
    if let Some(object) = table.get_mut(handle) {
        object.header_mut().last_frame_used = frame;
    }
}

/// Viewport covering the normalized rectangle `(x, y, width, height)` of an
/// attachment of `extent`.
pub(crate) fn relative_area(extent: vk::Extent2D, x: f32, y: f32, width: f32, height: f32) -> Viewport {
    let (w, h) = (extent.width as f32, extent.height as f32);
    Viewport {
        x: x * w,
        y: y * h,
        width: width * w,
        height: height * h,
        ..Viewport::default()
    }
}

fn scissor_for(viewport: &Viewport) -> ScissorRect {
    ScissorRect {
        x: viewport.x as i32,
        y: viewport.y as i32,
        width: viewport.width.max(0.0) as u32,
        height: viewport.height.max(0.0) as u32,
    }
}

fn face_flags(face: StencilFace) -> vk::StencilFaceFlags {
    match face {
        StencilFace::Front => vk::StencilFaceFlags::FRONT,
        StencilFace::Back => vk::StencilFaceFlags::BACK,
    }
}

/// First error hit while recording.
#[derive(Debug, Default)]
struct DeferredError(Option<GpuError>);

impl DeferredError {
    fn record(&mut self, error: GpuError) {
        tracing::warn!("Command skipped: {error}");
        if self.0.is_none() {
            self.0 = Some(error);
        }
    }

    fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.record(err);
                None
            }
        }
    }

    fn take(&mut self) -> Result<()> {
        match self.0.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Pipeline bound in the command buffer and the dynamic states not yet
/// written for it.
#[derive(Debug, Clone, Copy)]
struct BoundPipeline {
    pipeline: vk::Pipeline,
    dirty: DynamicState,
}

impl Default for BoundPipeline {
    fn default() -> Self {
        Self {
            pipeline: vk::Pipeline::null(),
            dirty: DynamicState::all(),
        }
    }
}

impl BoundPipeline {
    /// Switch to `pipeline`, which reads `dynamic` from the command buffer.
    ///
    /// Returns whether the pipeline must be bound and the states to write.
    /// A newly bound pipeline needs every state it reads written again.
    fn flush(&mut self, pipeline: vk::Pipeline, dynamic: DynamicState) -> (bool, DynamicState) {
        let rebind = pipeline != self.pipeline;
        if rebind {
            self.pipeline = pipeline;
            self.dirty = DynamicState::all();
        }
        let pending = self.dirty & dynamic;
        self.dirty.remove(pending);
        (rebind, pending)
    }
}

/// Render pass a draw records into.
fn draw_renderpass(
    renderpass: Option<Handle<RenderPass>>,
    in_renderpass: bool,
) -> Result<Handle<RenderPass>> {
    let renderpass =
        renderpass.ok_or_else(|| GpuError::InvalidArgument("draw without a render pass".into()))?;
    if !in_renderpass {
        return Err(GpuError::InvalidArgument("draw outside a render pass".into()));
    }
    Ok(renderpass)
}

/// Records one frame's commands.
pub struct CommandList<'a> {
    device: &'a mut GpuDevice,
    surface: Handle<WindowSurface>,
    target: FrameTarget,
    frame: u32,
    begun: bool,
    recording: bool,
    submitted: bool,
    error: DeferredError,

    state: PipelineState,
    bound: BoundPipeline,

    final_layouts: Vec<(Handle<Texture>, ImageLayout)>,
    framebuffer: Option<Handle<Framebuffer>>,
    clear_values: [vk::ClearValue; MAX_ATTACHMENTS],
    in_renderpass: bool,
}

impl GpuDevice {
    /// Hand out the command list of the frame in progress on `surface`.
    ///
    /// One list exists per frame; `thread_index` must be 0.
    pub fn request_command_list(
        &mut self,
        surface: Handle<WindowSurface>,
        thread_index: usize,
    ) -> Result<CommandList<'_>> {
        if thread_index != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "command lists are recorded on thread 0, got {thread_index}"
            )));
        }
        let window = self
            .surfaces
            .get_mut(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?;
        let target = window.acquired.ok_or_else(|| {
            GpuError::InvalidArgument("no frame in progress, call begin_frame first".into())
        })?;
        if window.recording || window.submitted {
            return Err(GpuError::InvalidArgument(
                "command list already requested this frame".into(),
            ));
        }
        window.recording = true;

        let frame = self.frame.stamp();
        Ok(CommandList {
            device: self,
            surface,
            target,
            frame,
            begun: false,
            recording: false,
            submitted: false,
            error: DeferredError::default(),
            state: PipelineState::default(),
            bound: BoundPipeline::default(),
            final_layouts: Vec::new(),
            framebuffer: None,
            clear_values: [vk::ClearValue::default(); MAX_ATTACHMENTS],
            in_renderpass: false,
        })
    }
}

impl CommandList<'_> {
    fn fail(&mut self, error: GpuError) {
        self.error.record(error);
    }

    fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        self.error.check(result)
    }

    /// Backbuffer acquired for this frame.
    pub fn backbuffer(&self) -> Handle<Texture> {
        self.target.backbuffer
    }

    /// Extent of the acquired backbuffer.
    pub fn backbuffer_extent(&self) -> vk::Extent2D {
        self.device
            .textures
            .get(self.target.backbuffer)
            .map_or_else(vk::Extent2D::default, Texture::extent)
    }

    /// Current pipeline state.
    pub fn pipeline_state(&self) -> &PipelineState {
        &self.state
    }

    /// Start recording. Every dynamic state is marked dirty.
    pub fn begin(&mut self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .begin_command_buffer(self.target.cmd, &begin_info)?;
        }
        self.begun = true;
        self.recording = true;
        self.bound = BoundPipeline::default();
        Ok(())
    }

    /// Stop recording. [`submit`](Self::submit) ends recording itself when
    /// this was not called.
    pub fn end(&mut self) {
        if !self.recording {
            return;
        }
        if self.in_renderpass {
            self.fail(GpuError::InvalidArgument(
                "recording ended inside a render pass".into(),
            ));
            self.end_renderpass();
        }
        let result = unsafe { self.device.device.end_command_buffer(self.target.cmd) };
        self.recording = false;
        self.check(result.map_err(GpuError::from_vk));
    }

    /// Reset the pipeline state to its defaults, keeping the bound program,
    /// vertex layout and render pass.
    pub fn set_default_pipeline(&mut self) {
        let defaults = PipelineState {
            program: self.state.program,
            renderpass: self.state.renderpass,
            vertex_layout: self.state.vertex_layout,
            ..PipelineState::default()
        };
        let subpass = self.state.state.subpass_index();
        self.state = defaults;
        self.state.state.set_subpass_index(subpass);
        self.bound.dirty = DynamicState::all();
    }

    /// Bind a draw item's pipeline in one step. The subpass index stays
    /// that of the active render pass.
    pub fn bind_draw_call_pipeline(&mut self, pipeline: &DrawCallPipeline) {
        self.state.apply(pipeline);
        self.bound.dirty |= DynamicState::LINE_WIDTH
            | DynamicState::BLEND_CONSTANTS
            | DynamicState::STENCIL_COMPARE_MASK
            | DynamicState::STENCIL_WRITE_MASK
            | DynamicState::STENCIL_REFERENCE;
    }

    /// Replace the packed state alone, e.g. to change culling for the next
    /// draws.
    pub fn bind_packed_state(&mut self, state: PackedPipelineState) {
        let subpass = self.state.state.subpass_index();
        self.state.state = state;
        self.state.state.set_subpass_index(subpass);
        self.bound.dirty |= DynamicState::STENCIL_COMPARE_MASK
            | DynamicState::STENCIL_WRITE_MASK
            | DynamicState::STENCIL_REFERENCE;
    }

    /// Set the blend state of color attachment `index`.
    pub fn set_blend(&mut self, index: usize, blend: AttachmentBlend) {
        match self.state.blending.get_mut(index) {
            Some(slot) => *slot = blend,
            None => self.fail(GpuError::InvalidArgument(format!(
                "blend index {index} exceeds {MAX_ATTACHMENTS} attachments"
            ))),
        }
    }

    /// Describe the render pass of the next [`begin_renderpass`]. The
    /// framebuffer is bound to the attachments named in `info`.
    ///
    /// [`begin_renderpass`]: Self::begin_renderpass
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn set_renderpass_info(&mut self, info: &RenderpassInfo) {
        let resolved = self.resolve_renderpass(info);
        let Some(renderpass) = self.check(resolved) else {
            return;
        };
        self.state.renderpass = Some(renderpass);
        self.final_layouts = info
            .attachments
            .iter()
            .map(|a| (a.texture, a.final_layout))
            .collect();

        let textures: Vec<Handle<Texture>> = info.attachments.iter().map(|a| a.texture).collect();
        self.set_attachments(&textures);
    }

    fn resolve_renderpass(&mut self, info: &RenderpassInfo) -> Result<Handle<RenderPass>> {
        let device = &mut *self.device;
        let key = RenderPassKey::resolve(info, |texture| {
            device
                .textures
                .get(texture)
                .map(|t| (t.format(), t.samples(), t.layout()))
        })?;
        let hash = key.content_hash();

        let handle = match device.caches.render_passes.find(hash, &key) {
            Some(handle) => handle,
            None => {
                let pass = unsafe { create_render_pass(&device.device, &key)? };
                let mut header = device.ids.issue(ObjectKind::RenderPass);
                header.hash = hash;
                header.last_frame_used = self.frame;
                let handle = device.render_passes.insert(RenderPass {
                    header,
                    handle: pass,
                    key: key.clone(),
                });
                device.caches.render_passes.insert(hash, key, handle)?;
                device.cached.push(handle.into());
                tracing::debug!("Created render pass {:?} ({:#018x})", handle, hash);
                handle
            }
        };
        touch(&mut device.render_passes, handle, self.frame);
        Ok(handle)
    }

    /// Bind the framebuffer made of `attachments` for the current render
    /// pass. Its extent is that of the first attachment.
    pub fn set_attachments(&mut self, attachments: &[Handle<Texture>]) {
        let resolved = self.resolve_framebuffer(attachments);
        if let Some(framebuffer) = self.check(resolved) {
            self.framebuffer = Some(framebuffer);
        }
    }

    fn resolve_framebuffer(&mut self, attachments: &[Handle<Texture>]) -> Result<Handle<Framebuffer>> {
        let renderpass = self
            .state
            .renderpass
            .ok_or_else(|| GpuError::InvalidArgument("attachments set without a render pass".into()))?;
        let device = &mut *self.device;

        let mut views = Vec::with_capacity(attachments.len());
        for &attachment in attachments {
            let texture = device
                .textures
                .get(attachment)
                .ok_or_else(|| GpuError::InvalidHandle(format!("{attachment:?}")))?;
            views.push(texture.view);
        }
        let extent = attachments
            .first()
            .and_then(|&first| device.textures.get(first))
            .map_or_else(vk::Extent2D::default, Texture::extent);

        let key = FramebufferKey::new(renderpass, attachments, extent.width, extent.height)?;
        let hash = key.content_hash();
        let handle = match device.caches.framebuffers.find(hash, &key) {
            Some(handle) => handle,
            None => {
                let pass = device
                    .render_passes
                    .get(renderpass)
                    .ok_or_else(|| GpuError::InvalidHandle(format!("{renderpass:?}")))?
                    .handle;
                let framebuffer = unsafe { create_framebuffer(&device.device, pass, &views, extent)? };
                let mut header = device.ids.issue(ObjectKind::Framebuffer);
                header.hash = hash;
                header.last_frame_used = self.frame;
                let handle = device.framebuffers.insert(Framebuffer {
                    header,
                    handle: framebuffer,
                    attachments: attachments.to_vec(),
                    extent,
                });
                device.caches.framebuffers.insert(hash, key, handle)?;
                device.cached.push(handle.into());
                tracing::debug!(
                    "Created framebuffer {:?} {}x{}",
                    handle,
                    extent.width,
                    extent.height
                );
                handle
            }
        };
        touch(&mut device.framebuffers, handle, self.frame);
        Ok(handle)
    }

    /// Clear color of attachment `index`.
    pub fn set_clear_color(&mut self, index: usize, color: [f32; 4]) {
        match self.clear_values.get_mut(index) {
            Some(value) => {
                *value = vk::ClearValue {
                    color: vk::ClearColorValue { float32: color },
                }
            }
            None => self.fail(GpuError::InvalidArgument(format!("clear index {index}"))),
        }
    }

    /// Clear depth and stencil of attachment `index`.
    pub fn set_clear_depth_stencil(&mut self, index: usize, depth: f32, stencil: u32) {
        match self.clear_values.get_mut(index) {
            Some(value) => {
                *value = vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                }
            }
            None => self.fail(GpuError::InvalidArgument(format!("clear index {index}"))),
        }
    }

    /// Begin the render pass on the bound framebuffer. The render area
    /// defaults to the whole framebuffer.
    pub fn begin_renderpass(&mut self) {
        let device = &*self.device;
        let pass = self
            .state
            .renderpass
            .and_then(|h| device.render_passes.get(h))
            .map(|p| p.handle);
        let framebuffer = self.framebuffer.and_then(|h| device.framebuffers.get(h));
        let (Some(pass), Some(framebuffer)) = (pass, framebuffer) else {
            self.fail(GpuError::InvalidArgument(
                "render pass begun without render pass info and attachments".into(),
            ));
            return;
        };

        let extent = framebuffer.extent;
        let clear_count = framebuffer.attachments.len();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(framebuffer.handle)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&self.clear_values[..clear_count]);
        unsafe {
            device
                .device
                .cmd_begin_render_pass(self.target.cmd, &begin_info, vk::SubpassContents::INLINE);
        }

        self.in_renderpass = true;
        self.state.state.set_subpass_index(0);
        self.set_render_area_abs(0, 0, extent.width, extent.height);
    }

    /// Advance to the next subpass.
    pub fn next_subpass(&mut self) {
        if !self.in_renderpass {
            self.fail(GpuError::InvalidArgument("next_subpass outside a render pass".into()));
            return;
        }
        unsafe {
            self.device
                .device
                .cmd_next_subpass(self.target.cmd, vk::SubpassContents::INLINE);
        }
        let next = self.state.state.subpass_index() + 1;
        self.state.state.set_subpass_index(next);
    }

    /// End the render pass. Attachments take their final layouts.
    pub fn end_renderpass(&mut self) {
        if !self.in_renderpass {
            self.fail(GpuError::InvalidArgument("end_renderpass outside a render pass".into()));
            return;
        }
        unsafe { self.device.device.cmd_end_render_pass(self.target.cmd) };
        self.in_renderpass = false;

        for &(texture, layout) in &self.final_layouts {
            if let Some(texture) = self.device.textures.get_mut(texture) {
                texture.layout = layout;
            }
        }
    }

    /// Bind the shader program used by subsequent draws.
    pub fn bind_program(&mut self, program: Handle<ShaderProgram>) {
        if self.device.programs.contains(program) {
            self.state.program = Some(program);
        } else {
            self.fail(GpuError::InvalidHandle(format!("{program:?}")));
        }
    }

    /// Bind the vertex input layout; `None` draws without vertex input.
    pub fn bind_vertex_layout(&mut self, layout: Option<Handle<VertexLayoutSet>>) {
        match layout {
            Some(handle) if !self.device.vertex_layouts.contains(handle) => {
                self.fail(GpuError::InvalidHandle(format!("{handle:?}")));
            }
            _ => self.state.vertex_layout = layout,
        }
    }

    /// Bind `buffers` with their byte offsets starting at binding `first`.
    pub fn bind_vertex_buffers(&mut self, first: u32, buffers: &[(Handle<Buffer>, u64)]) {
        if first as usize + buffers.len() > MAX_VERTEX_BINDINGS {
            self.fail(GpuError::InvalidArgument(format!(
                "vertex bindings {first}..{} exceed {MAX_VERTEX_BINDINGS}",
                first as usize + buffers.len()
            )));
            return;
        }

        let mut handles = Vec::with_capacity(buffers.len());
        let mut offsets = Vec::with_capacity(buffers.len());
        for &(buffer, offset) in buffers {
            match self.device.buffers.get(buffer) {
                Some(buffer) => {
                    handles.push(buffer.handle);
                    offsets.push(offset);
                }
                None => {
                    self.fail(GpuError::InvalidHandle(format!("{buffer:?}")));
                    return;
                }
            }
        }
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.target.cmd, first, &handles, &offsets);
        }
    }

    /// Bind the index buffer for indexed draws.
    pub fn bind_index_buffer(&mut self, buffer: Handle<Buffer>, offset: u64, index_type: IndexType) {
        let Some(raw) = self.device.buffers.get(buffer).map(|b| b.handle) else {
            self.fail(GpuError::InvalidHandle(format!("{buffer:?}")));
            return;
        };
        unsafe {
            self.device
                .device
                .cmd_bind_index_buffer(self.target.cmd, raw, offset, index_type.to_vk());
        }
    }

    fn bound_program(&self) -> Result<(Handle<ShaderProgram>, &ShaderProgram)> {
        let handle = self
            .state
            .program
            .ok_or_else(|| GpuError::InvalidArgument("no program bound".into()))?;
        let program = self
            .device
            .programs
            .get(handle)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle:?}")))?;
        Ok((handle, program))
    }

    /// Bind a retained descriptor set at set `index` of the bound program.
    pub fn bind_descriptor_set(&mut self, index: u32, set: Handle<DescriptorSet>) {
        let layout = self.bound_program().map(|(_, p)| p.pipeline_layout);
        let Some(layout) = self.check(layout) else {
            return;
        };
        let Some(raw) = self.device.descriptor_sets.get(set).map(|s| s.handle) else {
            self.fail(GpuError::InvalidHandle(format!("{set:?}")));
            return;
        };
        self.record_descriptor_bind(index, layout, raw);
    }

    /// Bind the descriptor set described by `info` at set `index` of the
    /// bound program, creating and writing it when no equal set is cached.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn bind_descriptor_info(&mut self, index: u32, info: DescriptorSetInfo) {
        let resolved = self.resolve_descriptor_set(index, info);
        if let Some((layout, raw)) = self.check(resolved) {
            self.record_descriptor_bind(index, layout, raw);
        }
    }

    fn resolve_descriptor_set(
        &mut self,
        index: u32,
        info: DescriptorSetInfo,
    ) -> Result<(vk::PipelineLayout, vk::DescriptorSet)> {
        let (_, program) = self.bound_program()?;
        let slot = index as usize;
        let layout_info = program
            .layout_info(slot)
            .ok_or_else(|| GpuError::InvalidArgument(format!("program has no set {index}")))?;
        let set_layout = program.set_layouts[slot];
        let pipeline_layout = program.pipeline_layout;
        let demand = layout_info.demand();
        let key = DescriptorSetKey::new(info, layout_info)?;
        let hash = key.content_hash();

        let device = &mut *self.device;
        let handle = match device.caches.descriptor_sets.find(hash, &key) {
            Some(handle) => handle,
            None => {
                let planned = plan_writes(
                    &key.info,
                    |t| device.textures.get(t).map(|t| (t.view, t.sampler)),
                    |b| device.buffers.get(b).map(|b| b.handle),
                )?;
                let (set, link) = unsafe {
                    device
                        .descriptor_pools
                        .allocate(&device.device, set_layout, &demand)?
                };
                unsafe { write_descriptor_set(&device.device, set, &planned) };

                let mut header = device.ids.issue(ObjectKind::DescriptorSet);
                header.hash = hash;
                header.last_frame_used = self.frame;
                let handle = device.descriptor_sets.insert(DescriptorSet {
                    header,
                    handle: set,
                    link,
                });
                device.caches.descriptor_sets.insert(hash, key, handle)?;
                device.cached.push(handle.into());
                tracing::debug!("Created descriptor set {:?} ({:#018x})", handle, hash);
                handle
            }
        };
        touch(&mut device.descriptor_sets, handle, self.frame);

        let raw = device
            .descriptor_sets
            .get(handle)
            .map(|s| s.handle)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle:?}")))?;
        Ok((pipeline_layout, raw))
    }

    fn record_descriptor_bind(&mut self, index: u32, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        if index as usize >= MAX_DESCRIPTOR_SETS {
            self.fail(GpuError::InvalidArgument(format!("descriptor set index {index}")));
            return;
        }
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                self.target.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                index,
                &[set],
                &[],
            );
        }
    }

    /// Set the viewport.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = viewport;
        self.bound.dirty |= DynamicState::VIEWPORT;
    }

    /// Set the scissor rectangle.
    pub fn set_scissor(&mut self, scissor: ScissorRect) {
        self.state.scissor = scissor;
        self.bound.dirty |= DynamicState::SCISSOR;
    }

    /// Set the rasterized line width.
    pub fn set_line_width(&mut self, width: f32) {
        self.state.line_width = width;
        self.bound.dirty |= DynamicState::LINE_WIDTH;
    }

    /// Set the depth bias factors.
    pub fn set_depth_bias(&mut self, bias: DepthBias) {
        self.state.depth_bias = bias;
        self.bound.dirty |= DynamicState::DEPTH_BIAS;
    }

    /// Set the blend constants.
    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.state.blend_constants = constants;
        self.bound.dirty |= DynamicState::BLEND_CONSTANTS;
    }

    /// Set the depth bounds test range.
    pub fn set_depth_bounds(&mut self, bounds: DepthBounds) {
        self.state.depth_bounds = bounds;
        self.bound.dirty |= DynamicState::DEPTH_BOUNDS;
    }

    /// Set compare mask, write mask and reference of one stencil face.
    pub fn set_stencil(&mut self, face: StencilFace, compare_mask: u8, write_mask: u8, reference: u8) {
        let packed = &mut self.state.state;
        packed.set_stencil_compare_mask(face, compare_mask);
        packed.set_stencil_write_mask(face, write_mask);
        packed.set_stencil_reference(face, reference);
        self.bound.dirty |= DynamicState::STENCIL_COMPARE_MASK
            | DynamicState::STENCIL_WRITE_MASK
            | DynamicState::STENCIL_REFERENCE;
    }

    /// Set viewport and scissor to the pixel rectangle given.
    pub fn set_render_area_abs(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let viewport = Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            ..Viewport::default()
        };
        self.set_viewport(viewport);
        self.set_scissor(scissor_for(&viewport));
    }

    /// Set viewport and scissor to a rectangle normalized to the size of
    /// attachment 0.
    pub fn set_render_area_rel(&mut self, x: f32, y: f32, width: f32, height: f32) {
        let extent = self
            .framebuffer
            .and_then(|h| self.device.framebuffers.get(h))
            .map(|f| f.extent);
        let Some(extent) = extent else {
            self.fail(GpuError::InvalidArgument(
                "relative render area needs bound attachments".into(),
            ));
            return;
        };
        let viewport = relative_area(extent, x, y, width, height);
        self.set_viewport(viewport);
        self.set_scissor(scissor_for(&viewport));
    }

    /// Look up or create the pipeline for the current state, bind it and
    /// write the dirty dynamic states it expects.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn flush_pipeline(&mut self) -> Result<()> {
        let renderpass = draw_renderpass(self.state.renderpass, self.in_renderpass)?;
        let (program, _) = self.bound_program()?;
        let subpass = self.state.state.subpass_index();

        let device = &mut *self.device;
        let pass = device
            .render_passes
            .get(renderpass)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{renderpass:?}")))?;
        let key = PipelineCacheKey::new(self.state, pass.key.color_attachment_count(subpass));
        let hash = key.content_hash();

        let handle = match device.caches.pipelines.find(hash, &key) {
            Some(handle) => handle,
            None => {
                let vk_pipeline = {
                    let program = device
                        .programs
                        .get(program)
                        .ok_or_else(|| GpuError::InvalidHandle(format!("{program:?}")))?;
                    let vertex_layout = match self.state.vertex_layout {
                        Some(layout) => Some(
                            device
                                .vertex_layouts
                                .get(layout)
                                .ok_or_else(|| GpuError::InvalidHandle(format!("{layout:?}")))?,
                        ),
                        None => None,
                    };
                    let inputs = PipelineInputs {
                        stages: &program.stages,
                        layout: program.pipeline_layout,
                        vertex_layout,
                        render_pass: pass.handle,
                        samples: pass.key.subpass_samples(subpass),
                    };
                    unsafe { create_graphics_pipeline(&device.device, &key, &inputs)? }
                };

                let mut header = device.ids.issue(ObjectKind::Pipeline);
                header.hash = hash;
                header.last_frame_used = self.frame;
                let handle = device.pipelines.insert(Pipeline {
                    header,
                    handle: vk_pipeline,
                    dynamic: key.state.state.dynamic_states(),
                });
                device.caches.pipelines.insert(hash, key, handle)?;
                device.cached.push(handle.into());
                device.pipeline_creations += 1;
                tracing::debug!("Created pipeline {:?} ({:#018x})", handle, hash);
                handle
            }
        };
        touch(&mut device.pipelines, handle, self.frame);

        let (vk_pipeline, dynamic) = device
            .pipelines
            .get(handle)
            .map(|p| (p.handle, p.dynamic))
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle:?}")))?;
        let (rebind, pending) = self.bound.flush(vk_pipeline, dynamic);
        if rebind {
            unsafe {
                device.device.cmd_bind_pipeline(
                    self.target.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    vk_pipeline,
                );
            }
        }
        unsafe { self.write_dynamic_state(pending) };
        Ok(())
    }

    unsafe fn write_dynamic_state(&self, pending: DynamicState) {
        let device = &self.device.device;
        let cmd = self.target.cmd;
        let state = &self.state;

        if pending.contains(DynamicState::VIEWPORT) {
            let v = state.viewport;
            device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: v.x,
                    y: v.y,
                    width: v.width,
                    height: v.height,
                    min_depth: v.min_depth,
                    max_depth: v.max_depth,
                }],
            );
        }
        if pending.contains(DynamicState::SCISSOR) {
            let s = state.scissor;
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: s.x, y: s.y },
                    extent: vk::Extent2D {
                        width: s.width,
                        height: s.height,
                    },
                }],
            );
        }
        if pending.contains(DynamicState::LINE_WIDTH) {
            device.cmd_set_line_width(cmd, state.line_width);
        }
        if pending.contains(DynamicState::DEPTH_BIAS) {
            let bias = state.depth_bias;
            device.cmd_set_depth_bias(cmd, bias.constant_factor, bias.clamp, bias.slope_factor);
        }
        if pending.contains(DynamicState::BLEND_CONSTANTS) {
            device.cmd_set_blend_constants(cmd, &state.blend_constants);
        }
        if pending.contains(DynamicState::DEPTH_BOUNDS) {
            device.cmd_set_depth_bounds(cmd, state.depth_bounds.min, state.depth_bounds.max);
        }
        for face in [StencilFace::Front, StencilFace::Back] {
            let stencil = state.state.stencil(face);
            let flags = face_flags(face);
            if pending.contains(DynamicState::STENCIL_COMPARE_MASK) {
                device.cmd_set_stencil_compare_mask(cmd, flags, u32::from(stencil.compare_mask));
            }
            if pending.contains(DynamicState::STENCIL_WRITE_MASK) {
                device.cmd_set_stencil_write_mask(cmd, flags, u32::from(stencil.write_mask));
            }
            if pending.contains(DynamicState::STENCIL_REFERENCE) {
                device.cmd_set_stencil_reference(cmd, flags, u32::from(stencil.reference));
            }
        }
    }

    /// Draw `vertex_count` vertices starting at `first_vertex`.
    pub fn draw(&mut self, first_vertex: u32, vertex_count: u32) {
        self.draw_instanced(first_vertex, vertex_count, 0, 1);
    }

    /// Draw `instance_count` instances of `vertex_count` vertices.
    pub fn draw_instanced(&mut self, first_vertex: u32, vertex_count: u32, first_instance: u32, instance_count: u32) {
        let flushed = self.flush_pipeline();
        if self.check(flushed).is_none() {
            return;
        }
        unsafe {
            self.device.device.cmd_draw(
                self.target.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    /// Draw `index_count` indices starting at `first_index`.
    pub fn draw_indexed(&mut self, first_index: u32, index_count: u32, vertex_offset: i32) {
        self.draw_indexed_instanced(first_index, index_count, vertex_offset, 0, 1);
    }

    /// Draw `instance_count` instances of `index_count` indices.
    pub fn draw_indexed_instanced(
        &mut self,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
        first_instance: u32,
        instance_count: u32,
    ) {
        let flushed = self.flush_pipeline();
        if self.check(flushed).is_none() {
            return;
        }
        unsafe {
            self.device.device.cmd_draw_indexed(
                self.target.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    /// Record up to 16 barriers between `src` and `dst` stages. Image
    /// barriers with a layout change update the tracked layout.
    pub fn pipeline_barrier(&mut self, src: PipelineStages, dst: PipelineStages, barriers: &[Barrier]) {
        let device = &*self.device;
        let batch = BarrierBatch::translate(
            barriers,
            |b| device.buffers.get(b).map(|b| b.handle),
            |t| device.textures.get(t).map(|t| (t.image, t.full_range())),
        );
        let Some(batch) = self.check(batch) else {
            return;
        };

        if !batch.is_empty() {
            unsafe {
                self.device.device.cmd_pipeline_barrier(
                    self.target.cmd,
                    src.to_vk(),
                    dst.to_vk(),
                    vk::DependencyFlags::empty(),
                    &batch.memory,
                    &batch.buffers,
                    &batch.images,
                );
            }
        }
        for (texture, layout) in batch.transitions {
            if let Some(texture) = self.device.textures.get_mut(texture) {
                texture.layout = layout;
            }
        }
    }

    /// Submit the recorded commands. Pending uploads are submitted first.
    ///
    /// Returns the first error deferred while recording; the commands that
    /// did record are still submitted.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(mut self) -> Result<()> {
        if !self.begun {
            return Err(GpuError::InvalidArgument("submit without begin".into()));
        }
        self.end();

        let sync = self.target.sync;
        let wait = [sync.image_available];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [self.target.cmd];
        let signal = [sync.render_done];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal);

        let device = &mut *self.device;
        unsafe {
            device.staging.flush(&device.device)?;
            device
                .device
                .queue_submit(device.queue, &[submit], sync.in_flight)?;
        }
        if let Some(window) = device.surfaces.get_mut(self.surface) {
            window.submitted = true;
            window.recording = false;
        }
        self.submitted = true;
        self.error.take()
    }
}

impl Drop for CommandList<'_> {
    fn drop(&mut self) {
        if self.submitted {
            return;
        }
        if self.recording {
            // The buffer is begun again next frame and must not stay in the
            // recording state.
            if let Err(err) = unsafe { self.device.device.end_command_buffer(self.target.cmd) } {
                tracing::warn!("Ending abandoned command buffer failed: {err}");
            }
        }
        if let Some(window) = self.device.surfaces.get_mut(self.surface) {
            window.recording = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ash::vk::Handle as _;

    fn pipeline(raw: u64) -> vk::Pipeline {
        vk::Pipeline::from_raw(raw)
    }

    #[test]
    fn relative_area_scales_by_attachment_size() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let viewport = relative_area(extent, 0.5, 0.25, 0.5, 0.5);
        assert_relative_eq!(viewport.x, 640.0);
        assert_relative_eq!(viewport.y, 180.0);
        assert_relative_eq!(viewport.width, 640.0);
        assert_relative_eq!(viewport.height, 360.0);
        assert_relative_eq!(viewport.max_depth, 1.0);
    }

    #[test]
    fn scissor_matches_viewport_pixels() {
        let viewport = relative_area(
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            0.0,
            0.0,
            1.0,
            1.0,
        );
        assert_eq!(
            scissor_for(&viewport),
            ScissorRect {
                x: 0,
                y: 0,
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn stencil_faces_map_to_back_end_flags() {
        assert_eq!(face_flags(StencilFace::Front), vk::StencilFaceFlags::FRONT);
        assert_eq!(face_flags(StencilFace::Back), vk::StencilFaceFlags::BACK);
    }

    #[test]
    fn the_first_recording_error_is_returned() {
        let mut error = DeferredError::default();
        error.record(GpuError::InvalidArgument("first".into()));
        error.record(GpuError::InvalidArgument("second".into()));

        assert_eq!(error.take(), Err(GpuError::InvalidArgument("first".into())));
        assert_eq!(error.take(), Ok(()));
    }

    #[test]
    fn failed_commands_are_skipped_and_deferred() {
        let mut error = DeferredError::default();
        assert_eq!(error.check(Ok(3)), Some(3));
        assert_eq!(error.take(), Ok(()));

        let failed: Result<u32> = Err(GpuError::InvalidHandle("gone".into()));
        assert_eq!(error.check(failed), None);
        assert_eq!(error.check(Ok(4)), Some(4));
        assert_eq!(error.take(), Err(GpuError::InvalidHandle("gone".into())));
    }

    #[test]
    fn draws_need_an_active_render_pass() {
        let mut passes = HandleTable::new();
        let pass = passes.insert(RenderPass::detached());

        assert!(matches!(
            draw_renderpass(None, false),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            draw_renderpass(Some(pass), false),
            Err(GpuError::InvalidArgument(_))
        ));
        assert_eq!(draw_renderpass(Some(pass), true), Ok(pass));
    }

    #[test]
    fn first_draw_binds_and_writes_what_the_pipeline_reads() {
        let mut bound = BoundPipeline::default();
        let reads = DynamicState::VIEWPORT | DynamicState::SCISSOR;

        assert_eq!(bound.flush(pipeline(1), reads), (true, reads));
        assert_eq!(bound.flush(pipeline(1), reads), (false, DynamicState::empty()));
    }

    #[test]
    fn changed_state_is_written_on_the_next_draw() {
        let mut bound = BoundPipeline::default();
        let reads = DynamicState::VIEWPORT | DynamicState::SCISSOR;
        bound.flush(pipeline(1), reads);

        bound.dirty |= DynamicState::VIEWPORT | DynamicState::LINE_WIDTH;
        assert_eq!(bound.flush(pipeline(1), reads), (false, DynamicState::VIEWPORT));
        assert!(bound.dirty.contains(DynamicState::LINE_WIDTH));
    }

    #[test]
    fn switching_pipelines_rewrites_dynamic_state() {
        let mut bound = BoundPipeline::default();
        let reads = DynamicState::VIEWPORT | DynamicState::STENCIL_REFERENCE;
        bound.flush(pipeline(1), reads);
        bound.flush(pipeline(2), reads);

        assert_eq!(bound.flush(pipeline(1), reads), (true, reads));
    }
}
