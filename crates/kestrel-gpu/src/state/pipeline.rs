//! Full pipeline cache key built on top of the packed state.

use kestrel_core::limits::MAX_ATTACHMENTS;
use kestrel_core::ContentHasher;

use super::{
    BlendFactor, BlendOp, ColorMask, CompareOp, CullFace, DrawMode, DynamicState, FrontFace,
    LogicOp, PackedPipelineState, PolygonMode, StencilFace, StencilFaceState,
};
use crate::handle::Handle;
use crate::renderpass::RenderPass;
use crate::resources::{ShaderProgram, VertexLayoutSet};

/// Viewport rectangle and depth range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

impl Viewport {
    fn hash_into(&self, hasher: &mut ContentHasher) {
        for value in self.fields() {
            hasher.add_f32(value);
        }
    }

    fn fields(&self) -> [f32; 6] {
        [
            self.x,
            self.y,
            self.width,
            self.height,
            self.min_depth,
            self.max_depth,
        ]
    }

    fn bit_eq(&self, other: &Self) -> bool {
        bits_eq(&self.fields(), &other.fields())
    }
}

/// Scissor rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for ScissorRect {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        }
    }
}

/// Depth bias constant, clamp and slope factors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

impl DepthBias {
    fn fields(&self) -> [f32; 3] {
        [self.constant_factor, self.clamp, self.slope_factor]
    }
}

/// Depth bounds test range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBounds {
    pub min: f32,
    pub max: f32,
}

impl Default for DepthBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

/// Blend state of one color attachment packed into 32 bits.
///
/// Layout: `write_mask:4 color_op:3 color_src:5 color_dst:5 alpha_op:3
/// alpha_src:5 alpha_dst:5 reserved:2`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentBlend(u32);

impl std::fmt::Debug for AttachmentBlend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentBlend")
            .field("write_mask", &self.write_mask())
            .field("color", &(self.color_src(), self.color_op(), self.color_dst()))
            .field("alpha", &(self.alpha_src(), self.alpha_op(), self.alpha_dst()))
            .finish()
    }
}

impl Default for AttachmentBlend {
    fn default() -> Self {
        let mut blend = Self(0);
        blend.set_write_mask(ColorMask::RGBA);
        blend.set_color_op(BlendOp::Add);
        blend.set_color_src(BlendFactor::SrcAlpha);
        blend.set_color_dst(BlendFactor::OneMinusSrcAlpha);
        blend.set_alpha_op(BlendOp::Add);
        blend.set_alpha_src(BlendFactor::SrcAlpha);
        blend.set_alpha_dst(BlendFactor::OneMinusSrcAlpha);
        blend
    }
}

impl AttachmentBlend {
    const WRITE_MASK: (u32, u32) = (0, 4);
    const COLOR_OP: (u32, u32) = (4, 3);
    const COLOR_SRC: (u32, u32) = (7, 5);
    const COLOR_DST: (u32, u32) = (12, 5);
    const ALPHA_OP: (u32, u32) = (17, 3);
    const ALPHA_SRC: (u32, u32) = (20, 5);
    const ALPHA_DST: (u32, u32) = (25, 5);

    fn get(self, (offset, width): (u32, u32)) -> u64 {
        u64::from((self.0 >> offset) & ((1 << width) - 1))
    }

    fn set(&mut self, (offset, width): (u32, u32), value: u64) {
        let mask = ((1u32 << width) - 1) << offset;
        self.0 = (self.0 & !mask) | (((value as u32) << offset) & mask);
    }

    /// Raw packed word.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether blending is on; any `None` factor turns it off.
    pub fn blend_enabled(self) -> bool {
        ![
            self.color_src(),
            self.color_dst(),
            self.alpha_src(),
            self.alpha_dst(),
        ]
        .contains(&BlendFactor::None)
    }

    pub fn write_mask(self) -> ColorMask {
        ColorMask::from_bits_truncate(self.get(Self::WRITE_MASK) as u8)
    }

    pub fn set_write_mask(&mut self, mask: ColorMask) {
        self.set(Self::WRITE_MASK, u64::from(mask.bits()));
    }

    pub fn color_op(self) -> BlendOp {
        BlendOp::from_bits(self.get(Self::COLOR_OP))
    }

    pub fn set_color_op(&mut self, op: BlendOp) {
        self.set(Self::COLOR_OP, op.bits());
    }

    pub fn color_src(self) -> BlendFactor {
        BlendFactor::from_bits(self.get(Self::COLOR_SRC))
    }

    pub fn set_color_src(&mut self, factor: BlendFactor) {
        self.set(Self::COLOR_SRC, factor.bits());
    }

    pub fn color_dst(self) -> BlendFactor {
        BlendFactor::from_bits(self.get(Self::COLOR_DST))
    }

    pub fn set_color_dst(&mut self, factor: BlendFactor) {
        self.set(Self::COLOR_DST, factor.bits());
    }

    pub fn alpha_op(self) -> BlendOp {
        BlendOp::from_bits(self.get(Self::ALPHA_OP))
    }

    pub fn set_alpha_op(&mut self, op: BlendOp) {
        self.set(Self::ALPHA_OP, op.bits());
    }

    pub fn alpha_src(self) -> BlendFactor {
        BlendFactor::from_bits(self.get(Self::ALPHA_SRC))
    }

    pub fn set_alpha_src(&mut self, factor: BlendFactor) {
        self.set(Self::ALPHA_SRC, factor.bits());
    }

    pub fn alpha_dst(self) -> BlendFactor {
        BlendFactor::from_bits(self.get(Self::ALPHA_DST))
    }

    pub fn set_alpha_dst(&mut self, factor: BlendFactor) {
        self.set(Self::ALPHA_DST, factor.bits());
    }
}

/// Everything a graphics pipeline object is built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineState {
    pub state: PackedPipelineState,
    pub viewport: Viewport,
    pub scissor: ScissorRect,
    pub blend_constants: [f32; 4],
    pub line_width: f32,
    pub depth_bias: DepthBias,
    pub depth_bounds: DepthBounds,
    pub min_sample_shading: f32,
    pub sample_mask: u32,
    pub blending: [AttachmentBlend; MAX_ATTACHMENTS],
    pub program: Option<Handle<ShaderProgram>>,
    pub renderpass: Option<Handle<RenderPass>>,
    pub vertex_layout: Option<Handle<VertexLayoutSet>>,
}

impl Default for PipelineState {
    fn default() -> Self {
        let mut state = PackedPipelineState::default();
        state.set_draw_mode(DrawMode::TriangleList);
        state.set_front_face(FrontFace::Ccw);
        state.set_cull_face(CullFace::empty());
        state.set_depth_test(false);
        state.set_depth_write(false);
        state.set_depth_op(CompareOp::Always);
        state.set_logic_op(LogicOp::Clear);
        state.set_fill_mode(PolygonMode::Fill);
        state.set_stencil(StencilFace::Front, StencilFaceState::default());
        state.set_stencil(StencilFace::Back, StencilFaceState::default());

        Self {
            state,
            viewport: Viewport::default(),
            scissor: ScissorRect::default(),
            blend_constants: [1.0; 4],
            line_width: 1.0,
            depth_bias: DepthBias::default(),
            depth_bounds: DepthBounds::default(),
            min_sample_shading: 0.0,
            sample_mask: u32::MAX,
            blending: [AttachmentBlend::default(); MAX_ATTACHMENTS],
            program: None,
            renderpass: None,
            vertex_layout: None,
        }
    }
}

/// State a draw item carries. Binding it replaces the matching fields of
/// the recorded [`PipelineState`] in one step; viewport, scissor and the
/// render pass are left alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCallPipeline {
    pub state: PackedPipelineState,
    pub line_width: f32,
    pub blend_constants: [f32; 4],
    pub blending: [AttachmentBlend; MAX_ATTACHMENTS],
    pub program: Option<Handle<ShaderProgram>>,
    pub vertex_layout: Option<Handle<VertexLayoutSet>>,
}

impl Default for DrawCallPipeline {
    fn default() -> Self {
        Self::from(&PipelineState::default())
    }
}

impl From<&PipelineState> for DrawCallPipeline {
    fn from(state: &PipelineState) -> Self {
        Self {
            state: state.state,
            line_width: state.line_width,
            blend_constants: state.blend_constants,
            blending: state.blending,
            program: state.program,
            vertex_layout: state.vertex_layout,
        }
    }
}

impl PipelineState {
    /// Take over the fields of `pipeline`, keeping the subpass index.
    pub fn apply(&mut self, pipeline: &DrawCallPipeline) {
        let subpass = self.state.subpass_index();
        self.state = pipeline.state;
        self.state.set_subpass_index(subpass);
        self.line_width = pipeline.line_width;
        self.blend_constants = pipeline.blend_constants;
        self.blending = pipeline.blending;
        self.program = pipeline.program;
        self.vertex_layout = pipeline.vertex_layout;
    }
}

fn bits_eq(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

fn handle_bits<T>(handle: Option<Handle<T>>) -> u64 {
    handle.map_or(0, Handle::to_bits)
}

/// Cache key of a graphics pipeline.
///
/// Pairs the recorded state with the color attachment count of the target
/// subpass, which bounds how many blend states participate.
#[derive(Debug, Clone, Copy)]
pub struct PipelineCacheKey {
    pub state: PipelineState,
    pub color_attachments: u32,
}

impl PipelineCacheKey {
    /// Build a key for `state` targeting a subpass with `color_attachments`.
    pub fn new(state: PipelineState, color_attachments: u32) -> Self {
        Self {
            state,
            color_attachments: color_attachments.min(MAX_ATTACHMENTS as u32),
        }
    }

    fn dynamic(&self) -> DynamicState {
        self.state.state.dynamic_states()
    }

    fn active_blending(&self) -> &[AttachmentBlend] {
        &self.state.blending[..self.color_attachments as usize]
    }

    /// Content hash with dynamic state excluded.
    pub fn content_hash(&self) -> u64 {
        let state = &self.state;
        let dynamic = self.dynamic();
        let mut hasher = ContentHasher::new();

        let [low, high] = state.state.masked_words();
        hasher.add_u64(low);
        hasher.add_u64(high);

        if !dynamic.contains(DynamicState::VIEWPORT) {
            state.viewport.hash_into(&mut hasher);
        }

        if !dynamic.contains(DynamicState::SCISSOR) {
            hasher.add_u32(state.scissor.x as u32);
            hasher.add_u32(state.scissor.y as u32);
            hasher.add_u32(state.scissor.width);
            hasher.add_u32(state.scissor.height);
        }

        if !dynamic.contains(DynamicState::BLEND_CONSTANTS) {
            for value in state.blend_constants {
                hasher.add_f32(value);
            }
        }

        if !dynamic.contains(DynamicState::LINE_WIDTH) {
            hasher.add_f32(state.line_width);
        }

        if !dynamic.contains(DynamicState::DEPTH_BIAS) {
            for value in state.depth_bias.fields() {
                hasher.add_f32(value);
            }
        }

        if !dynamic.contains(DynamicState::DEPTH_BOUNDS) {
            hasher.add_f32(state.depth_bounds.min);
            hasher.add_f32(state.depth_bounds.max);
        }

        hasher.add_f32(state.min_sample_shading);
        hasher.add_u32(state.sample_mask);
        hasher.add_u32(state.state.subpass_index());
        hasher.add_u32(self.color_attachments);

        for blend in self.active_blending() {
            hasher.add_u32(blend.bits());
        }

        hasher.add_id(handle_bits(state.program));
        hasher.add_id(handle_bits(state.renderpass));
        hasher.add_id(handle_bits(state.vertex_layout));

        hasher.finish()
    }

    /// Equality under the same masking as [`Self::content_hash`].
    pub fn content_eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.state, &other.state);

        if a.state.masked_words() != b.state.masked_words()
            || self.color_attachments != other.color_attachments
        {
            return false;
        }

        let dynamic = self.dynamic();

        if !dynamic.contains(DynamicState::VIEWPORT) && !a.viewport.bit_eq(&b.viewport) {
            return false;
        }

        if !dynamic.contains(DynamicState::SCISSOR) && a.scissor != b.scissor {
            return false;
        }

        if !dynamic.contains(DynamicState::BLEND_CONSTANTS)
            && !bits_eq(&a.blend_constants, &b.blend_constants)
        {
            return false;
        }

        if !dynamic.contains(DynamicState::LINE_WIDTH)
            && a.line_width.to_bits() != b.line_width.to_bits()
        {
            return false;
        }

        if !dynamic.contains(DynamicState::DEPTH_BIAS)
            && !bits_eq(&a.depth_bias.fields(), &b.depth_bias.fields())
        {
            return false;
        }

        if !dynamic.contains(DynamicState::DEPTH_BOUNDS)
            && !bits_eq(
                &[a.depth_bounds.min, a.depth_bounds.max],
                &[b.depth_bounds.min, b.depth_bounds.max],
            )
        {
            return false;
        }

        a.min_sample_shading.to_bits() == b.min_sample_shading.to_bits()
            && a.sample_mask == b.sample_mask
            && self.active_blending() == other.active_blending()
            && a.program == b.program
            && a.renderpass == b.renderpass
            && a.vertex_layout == b.vertex_layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StencilOp;

    fn key(state: PipelineState) -> PipelineCacheKey {
        PipelineCacheKey::new(state, 1)
    }

    #[test]
    fn default_state_matches_documented_defaults() {
        let state = PipelineState::default();
        assert_eq!(state.state.draw_mode(), DrawMode::TriangleList);
        assert_eq!(state.state.depth_op(), CompareOp::Always);
        assert!(!state.state.depth_test());
        assert_eq!(state.scissor, ScissorRect::default());
        assert_eq!(state.sample_mask, u32::MAX);
        let front = state.state.stencil(StencilFace::Front);
        assert_eq!(front.pass_op, StencilOp::Replace);
        assert_eq!(front.reference, 0xFF);
        let blend = state.blending[0];
        assert_eq!(blend.color_src(), BlendFactor::SrcAlpha);
        assert_eq!(blend.alpha_dst(), BlendFactor::OneMinusSrcAlpha);
        assert_eq!(blend.write_mask(), ColorMask::RGBA);
        assert!(blend.blend_enabled());
    }

    #[test]
    fn equal_keys_hash_equal() {
        let a = key(PipelineState::default());
        let b = key(PipelineState::default());
        assert!(a.content_eq(&b));
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn dynamic_viewport_is_excluded() {
        let mut a = PipelineState::default();
        a.state.set_dynamic(DynamicState::VIEWPORT | DynamicState::SCISSOR, true);
        let mut b = a;
        b.viewport.width = 1920.0;
        b.scissor.width = 1920;

        assert!(key(a).content_eq(&key(b)));
        assert_eq!(key(a).content_hash(), key(b).content_hash());

        a.state.set_dynamic(DynamicState::VIEWPORT | DynamicState::SCISSOR, false);
        b.state.set_dynamic(DynamicState::VIEWPORT | DynamicState::SCISSOR, false);
        assert!(!key(a).content_eq(&key(b)));
        assert_ne!(key(a).content_hash(), key(b).content_hash());
    }

    #[test]
    fn dynamic_stencil_values_are_excluded() {
        let mut a = PipelineState::default();
        a.state.set_dynamic(
            DynamicState::STENCIL_COMPARE_MASK
                | DynamicState::STENCIL_WRITE_MASK
                | DynamicState::STENCIL_REFERENCE,
            true,
        );
        let mut b = a;
        b.state.set_stencil_reference(StencilFace::Back, 3);
        b.state.set_stencil_write_mask(StencilFace::Front, 7);
        b.state.set_stencil_compare_mask(StencilFace::Back, 9);

        assert!(key(a).content_eq(&key(b)));
        assert_eq!(key(a).content_hash(), key(b).content_hash());
    }

    #[test]
    fn float_fields_compare_bit_exactly() {
        let a = PipelineState::default();
        let mut b = a;
        b.depth_bias.constant_factor = -0.0;
        assert!(!key(a).content_eq(&key(b)));
    }

    #[test]
    fn only_active_attachments_participate() {
        let a = PipelineState::default();
        let mut b = a;
        b.blending[3].set_color_op(BlendOp::Max);

        assert!(key(a).content_eq(&key(b)));
        assert_eq!(key(a).content_hash(), key(b).content_hash());
        assert!(!PipelineCacheKey::new(a, 4).content_eq(&PipelineCacheKey::new(b, 4)));
    }

    #[test]
    fn none_factor_disables_blending() {
        let mut blend = AttachmentBlend::default();
        blend.set_color_src(BlendFactor::None);
        assert!(!blend.blend_enabled());
        assert_eq!(blend.color_src(), BlendFactor::None);
        assert_eq!(blend.bits() >> 30, 0);
    }
}
