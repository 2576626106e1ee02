//! Cached graphics pipelines.

use std::ffi::CStr;

use ash::vk;

use crate::cache::CacheKey;
use crate::error::{GpuError, Result};
use crate::flags::{SampleCount, ShaderStages};
use crate::handle::{GpuObject, ObjectHeader, ObjectKind};
use crate::resources::VertexLayoutSet;
use crate::state::{AttachmentBlend, DynamicState, PipelineCacheKey, StencilFace, StencilFaceState};

const ENTRY_POINT: &CStr = c"main";

impl CacheKey for PipelineCacheKey {
    fn content_hash(&self) -> u64 {
        Self::content_hash(self)
    }

    fn content_eq(&self, other: &Self) -> bool {
        Self::content_eq(self, other)
    }
}

/// Cached pipeline object.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) header: ObjectHeader,
    pub(crate) handle: vk::Pipeline,
    pub(crate) dynamic: DynamicState,
}

impl GpuObject for Pipeline {
    const KIND: ObjectKind = ObjectKind::Pipeline;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl Pipeline {
    /// Back-end handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// States the pipeline expects from the command buffer.
    pub fn dynamic_states(&self) -> DynamicState {
        self.dynamic
    }
}

/// Back-end stencil state of one face.
pub fn stencil_to_vk(face: StencilFaceState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: face.fail_op.to_vk(),
        pass_op: face.pass_op.to_vk(),
        depth_fail_op: face.depth_fail_op.to_vk(),
        compare_op: face.compare_op.to_vk(),
        compare_mask: u32::from(face.compare_mask),
        write_mask: u32::from(face.write_mask),
        reference: u32::from(face.reference),
    }
}

/// Back-end blend state of one attachment.
pub fn blend_to_vk(blend: AttachmentBlend) -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::Bool32::from(blend.blend_enabled()),
        src_color_blend_factor: blend.color_src().to_vk(),
        dst_color_blend_factor: blend.color_dst().to_vk(),
        color_blend_op: blend.color_op().to_vk(),
        src_alpha_blend_factor: blend.alpha_src().to_vk(),
        dst_alpha_blend_factor: blend.alpha_dst().to_vk(),
        alpha_blend_op: blend.alpha_op().to_vk(),
        color_write_mask: blend.write_mask().to_vk(),
    }
}

/// Everything besides the key a pipeline is built from.
pub struct PipelineInputs<'a> {
    pub stages: &'a [(ShaderStages, vk::ShaderModule)],
    pub layout: vk::PipelineLayout,
    pub vertex_layout: Option<&'a VertexLayoutSet>,
    pub render_pass: vk::RenderPass,
    pub samples: SampleCount,
}

/// Translate `key` into a back-end graphics pipeline.
///
/// # Safety
/// The device and every handle in `inputs` must be valid.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    key: &PipelineCacheKey,
    inputs: &PipelineInputs<'_>,
) -> Result<vk::Pipeline> {
    let state = &key.state;
    let packed = &state.state;
    let dynamic = packed.dynamic_states();

    let stages: Vec<vk::PipelineShaderStageCreateInfo> = inputs
        .stages
        .iter()
        .map(|&(stage, module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage.to_vk())
                .module(module)
                .name(ENTRY_POINT)
        })
        .collect();

    let (bindings, attributes) = inputs
        .vertex_layout
        .map(|layout| (layout.vk_bindings(), layout.vk_attributes()))
        .unwrap_or_default();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(packed.draw_mode().to_vk())
        .primitive_restart_enable(packed.primitive_restart());

    let viewports = [vk::Viewport {
        x: state.viewport.x,
        y: state.viewport.y,
        width: state.viewport.width,
        height: state.viewport.height,
        min_depth: state.viewport.min_depth,
        max_depth: state.viewport.max_depth,
    }];
    let scissors = [vk::Rect2D {
        offset: vk::Offset2D {
            x: state.scissor.x,
            y: state.scissor.y,
        },
        extent: vk::Extent2D {
            width: state.scissor.width,
            height: state.scissor.height,
        },
    }];
    let mut viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    if !dynamic.contains(DynamicState::VIEWPORT) {
        viewport_state = viewport_state.viewports(&viewports);
    }
    if !dynamic.contains(DynamicState::SCISSOR) {
        viewport_state = viewport_state.scissors(&scissors);
    }

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(packed.depth_clamp())
        .rasterizer_discard_enable(packed.rasterizer_discard())
        .polygon_mode(packed.fill_mode().to_vk())
        .cull_mode(packed.cull_face().to_vk())
        .front_face(packed.front_face().to_vk())
        .depth_bias_enable(packed.depth_bias())
        .depth_bias_constant_factor(state.depth_bias.constant_factor)
        .depth_bias_clamp(state.depth_bias.clamp)
        .depth_bias_slope_factor(state.depth_bias.slope_factor)
        .line_width(state.line_width);

    let sample_mask = [state.sample_mask];
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(inputs.samples.to_vk())
        .sample_shading_enable(packed.sample_shading())
        .min_sample_shading(state.min_sample_shading)
        .sample_mask(&sample_mask)
        .alpha_to_coverage_enable(packed.alpha_to_coverage())
        .alpha_to_one_enable(packed.alpha_to_one());

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(packed.depth_test())
        .depth_write_enable(packed.depth_write())
        .depth_compare_op(packed.depth_op().to_vk())
        .depth_bounds_test_enable(packed.depth_bounds_test())
        .stencil_test_enable(packed.stencil_test())
        .front(stencil_to_vk(packed.stencil(StencilFace::Front)))
        .back(stencil_to_vk(packed.stencil(StencilFace::Back)))
        .min_depth_bounds(state.depth_bounds.min)
        .max_depth_bounds(state.depth_bounds.max);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = state.blending
        [..key.color_attachments as usize]
        .iter()
        .map(|&blend| blend_to_vk(blend))
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(packed.logic_op_enabled())
        .logic_op(packed.logic_op().to_vk())
        .attachments(&blend_attachments)
        .blend_constants(state.blend_constants);

    let dynamic_states = dynamic.to_vk();
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(inputs.layout)
        .render_pass(inputs.render_pass)
        .subpass(packed.subpass_index());

    let pipelines = device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_, err)| match GpuError::from_vk(err) {
            GpuError::Vulkan(code) => GpuError::ShaderCompileFailed(code.to_string()),
            other => other,
        })?;

    pipelines
        .first()
        .copied()
        .ok_or_else(|| GpuError::ShaderCompileFailed("no pipeline returned".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BlendFactor, BlendOp, ColorMask, CompareOp, PipelineState, StencilOp};

    #[test]
    fn stencil_faces_translate_field_by_field() {
        let face = StencilFaceState {
            fail_op: StencilOp::Zero,
            pass_op: StencilOp::IncrementAndWrap,
            depth_fail_op: StencilOp::Invert,
            compare_op: CompareOp::GreaterOrEqual,
            compare_mask: 0x0F,
            write_mask: 0xF0,
            reference: 7,
        };
        let vk_face = stencil_to_vk(face);
        assert_eq!(vk_face.fail_op, vk::StencilOp::ZERO);
        assert_eq!(vk_face.pass_op, vk::StencilOp::INCREMENT_AND_WRAP);
        assert_eq!(vk_face.depth_fail_op, vk::StencilOp::INVERT);
        assert_eq!(vk_face.compare_op, vk::CompareOp::GREATER_OR_EQUAL);
        assert_eq!(
            (vk_face.compare_mask, vk_face.write_mask, vk_face.reference),
            (0x0F, 0xF0, 7)
        );
    }

    #[test]
    fn default_blend_is_alpha_blending() {
        let vk_blend = blend_to_vk(PipelineState::default().blending[0]);
        assert_eq!(vk_blend.blend_enable, vk::TRUE);
        assert_eq!(vk_blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            vk_blend.dst_alpha_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
        assert_eq!(vk_blend.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn none_factor_writes_without_blending() {
        let mut blend = AttachmentBlend::default();
        blend.set_alpha_dst(BlendFactor::None);
        blend.set_color_op(BlendOp::Max);
        blend.set_write_mask(ColorMask::R | ColorMask::A);

        let vk_blend = blend_to_vk(blend);
        assert_eq!(vk_blend.blend_enable, vk::FALSE);
        assert_eq!(vk_blend.color_blend_op, vk::BlendOp::MAX);
        assert_eq!(
            vk_blend.color_write_mask,
            vk::ColorComponentFlags::R | vk::ColorComponentFlags::A
        );
    }

    #[test]
    fn cache_trait_delegates_to_masked_comparison() {
        let a = PipelineCacheKey::new(PipelineState::default(), 1);
        let mut state = PipelineState::default();
        state.line_width = 2.0;
        let b = PipelineCacheKey::new(state, 1);

        assert!(CacheKey::content_eq(&a, &a));
        assert!(!CacheKey::content_eq(&a, &b));
        assert_eq!(CacheKey::content_hash(&a), a.content_hash());
    }
}
