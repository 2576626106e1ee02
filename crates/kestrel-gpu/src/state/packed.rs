//! 128-bit packed pipeline state.
//!
//! Bit layout (offset/width), fixed explicitly:
//!
//! | bits     | field                    |
//! |----------|--------------------------|
//! | 0..3     | draw mode                |
//! | 3        | front face               |
//! | 4..6     | cull face                |
//! | 6        | depth test               |
//! | 7        | depth clamp              |
//! | 8        | depth bounds test        |
//! | 9        | depth write              |
//! | 10..13   | depth compare op         |
//! | 13       | stencil test             |
//! | 14       | primitive restart        |
//! | 15       | rasterizer discard       |
//! | 16       | depth bias               |
//! | 17       | sample shading           |
//! | 18       | alpha to coverage        |
//! | 19       | alpha to one             |
//! | 20       | logic op enable          |
//! | 21..25   | logic op                 |
//! | 25..27   | polygon fill mode        |
//! | 27..63   | front stencil (36 bits)  |
//! | 63..99   | back stencil (36 bits)   |
//! | 99..108  | dynamic state flags      |
//! | 108..110 | subpass index            |
//! | 110..128 | reserved, always zero    |
//!
//! Each stencil face is `fail:3 pass:3 depth_fail:3 compare_op:3
//! compare_mask:8 write_mask:8 reference:8`. The back face straddles the
//! boundary between the two 64-bit words.

use super::{
    CompareOp, CullFace, DrawMode, DynamicState, FrontFace, LogicOp, PolygonMode, StencilFace,
    StencilOp,
};

#[derive(Clone, Copy)]
struct Field {
    offset: u32,
    width: u32,
}

impl Field {
    const fn new(offset: u32, width: u32) -> Self {
        Self { offset, width }
    }

    const fn mask(self) -> u128 {
        ((1u128 << self.width) - 1) << self.offset
    }
}

const DRAW_MODE: Field = Field::new(0, 3);
const FRONT_FACE: Field = Field::new(3, 1);
const CULL_FACE: Field = Field::new(4, 2);
const DEPTH_TEST: Field = Field::new(6, 1);
const DEPTH_CLAMP: Field = Field::new(7, 1);
const DEPTH_BOUNDS_TEST: Field = Field::new(8, 1);
const DEPTH_WRITE: Field = Field::new(9, 1);
const DEPTH_OP: Field = Field::new(10, 3);
const STENCIL_TEST: Field = Field::new(13, 1);
const PRIMITIVE_RESTART: Field = Field::new(14, 1);
const RASTERIZER_DISCARD: Field = Field::new(15, 1);
const DEPTH_BIAS: Field = Field::new(16, 1);
const SAMPLE_SHADING: Field = Field::new(17, 1);
const ALPHA_TO_COVERAGE: Field = Field::new(18, 1);
const ALPHA_TO_ONE: Field = Field::new(19, 1);
const LOGIC_OP_ENABLE: Field = Field::new(20, 1);
const LOGIC_OP: Field = Field::new(21, 4);
const FILL_MODE: Field = Field::new(25, 2);
const FRONT_STENCIL: u32 = 27;
const BACK_STENCIL: u32 = 63;
const DYNAMIC_STATES: Field = Field::new(99, 9);
const SUBPASS_INDEX: Field = Field::new(108, 2);

const STENCIL_FAIL: u32 = 0;
const STENCIL_PASS: u32 = 3;
const STENCIL_DEPTH_FAIL: u32 = 6;
const STENCIL_COMPARE_OP: u32 = 9;
const STENCIL_COMPARE_MASK: u32 = 12;
const STENCIL_WRITE_MASK: u32 = 20;
const STENCIL_REFERENCE: u32 = 28;

const fn stencil_field(face: StencilFace, offset: u32, width: u32) -> Field {
    let base = match face {
        StencilFace::Front => FRONT_STENCIL,
        StencilFace::Back => BACK_STENCIL,
    };
    Field::new(base + offset, width)
}

const fn stencil_value_mask(offset: u32) -> u128 {
    stencil_field(StencilFace::Front, offset, 8).mask()
        | stencil_field(StencilFace::Back, offset, 8).mask()
}

/// Full stencil configuration of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
    pub compare_mask: u8,
    pub write_mask: u8,
    pub reference: u8,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Replace,
            depth_fail_op: StencilOp::Keep,
            compare_op: CompareOp::Always,
            compare_mask: 0xFF,
            write_mask: 0xFF,
            reference: 0xFF,
        }
    }
}

/// Fixed-function pipeline state packed into exactly 128 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackedPipelineState {
    bits: u128,
}

impl std::fmt::Debug for PackedPipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [low, high] = self.words();
        write!(f, "PackedPipelineState({high:016x}_{low:016x})")
    }
}

impl PackedPipelineState {
    fn get(&self, field: Field) -> u64 {
        ((self.bits & field.mask()) >> field.offset) as u64
    }

    fn set(&mut self, field: Field, value: u64) {
        let value = (u128::from(value) << field.offset) & field.mask();
        self.bits = (self.bits & !field.mask()) | value;
    }

    fn flag(&self, field: Field) -> bool {
        self.get(field) != 0
    }

    fn set_flag(&mut self, field: Field, value: bool) {
        self.set(field, u64::from(value));
    }

    /// The two raw 64-bit words, low word first.
    pub fn words(&self) -> [u64; 2] {
        [self.bits as u64, (self.bits >> 64) as u64]
    }

    /// Mask clearing the stencil bits made dynamic by `dynamic`.
    fn dynamic_mask(dynamic: DynamicState) -> u128 {
        let mut mask = !0u128;
        if dynamic.contains(DynamicState::STENCIL_COMPARE_MASK) {
            mask &= !stencil_value_mask(STENCIL_COMPARE_MASK);
        }
        if dynamic.contains(DynamicState::STENCIL_WRITE_MASK) {
            mask &= !stencil_value_mask(STENCIL_WRITE_MASK);
        }
        if dynamic.contains(DynamicState::STENCIL_REFERENCE) {
            mask &= !stencil_value_mask(STENCIL_REFERENCE);
        }
        mask
    }

    /// Mask for the low word under this state's dynamic flags.
    pub fn state0_mask(&self) -> u64 {
        Self::dynamic_mask(self.dynamic_states()) as u64
    }

    /// Mask for the high word under this state's dynamic flags.
    pub fn state1_mask(&self) -> u64 {
        (Self::dynamic_mask(self.dynamic_states()) >> 64) as u64
    }

    /// Both words with dynamic bits cleared.
    pub fn masked_words(&self) -> [u64; 2] {
        let [low, high] = self.words();
        [low & self.state0_mask(), high & self.state1_mask()]
    }

    pub fn draw_mode(&self) -> DrawMode {
        DrawMode::from_bits(self.get(DRAW_MODE))
    }

    pub fn set_draw_mode(&mut self, mode: DrawMode) {
        self.set(DRAW_MODE, mode.bits());
    }

    pub fn front_face(&self) -> FrontFace {
        FrontFace::from_bits(self.get(FRONT_FACE))
    }

    pub fn set_front_face(&mut self, face: FrontFace) {
        self.set(FRONT_FACE, face.bits());
    }

    pub fn cull_face(&self) -> CullFace {
        CullFace::from_bits_truncate(self.get(CULL_FACE) as u8)
    }

    pub fn set_cull_face(&mut self, cull: CullFace) {
        self.set(CULL_FACE, u64::from(cull.bits()));
    }

    pub fn depth_test(&self) -> bool {
        self.flag(DEPTH_TEST)
    }

    pub fn set_depth_test(&mut self, enable: bool) {
        self.set_flag(DEPTH_TEST, enable);
    }

    pub fn depth_clamp(&self) -> bool {
        self.flag(DEPTH_CLAMP)
    }

    pub fn set_depth_clamp(&mut self, enable: bool) {
        self.set_flag(DEPTH_CLAMP, enable);
    }

    pub fn depth_bounds_test(&self) -> bool {
        self.flag(DEPTH_BOUNDS_TEST)
    }

    pub fn set_depth_bounds_test(&mut self, enable: bool) {
        self.set_flag(DEPTH_BOUNDS_TEST, enable);
    }

    pub fn depth_write(&self) -> bool {
        self.flag(DEPTH_WRITE)
    }

    pub fn set_depth_write(&mut self, enable: bool) {
        self.set_flag(DEPTH_WRITE, enable);
    }

    pub fn depth_op(&self) -> CompareOp {
        CompareOp::from_bits(self.get(DEPTH_OP))
    }

    pub fn set_depth_op(&mut self, op: CompareOp) {
        self.set(DEPTH_OP, op.bits());
    }

    pub fn stencil_test(&self) -> bool {
        self.flag(STENCIL_TEST)
    }

    pub fn set_stencil_test(&mut self, enable: bool) {
        self.set_flag(STENCIL_TEST, enable);
    }

    pub fn primitive_restart(&self) -> bool {
        self.flag(PRIMITIVE_RESTART)
    }

    pub fn set_primitive_restart(&mut self, enable: bool) {
        self.set_flag(PRIMITIVE_RESTART, enable);
    }

    pub fn rasterizer_discard(&self) -> bool {
        self.flag(RASTERIZER_DISCARD)
    }

    pub fn set_rasterizer_discard(&mut self, enable: bool) {
        self.set_flag(RASTERIZER_DISCARD, enable);
    }

    pub fn depth_bias(&self) -> bool {
        self.flag(DEPTH_BIAS)
    }

    pub fn set_depth_bias(&mut self, enable: bool) {
        self.set_flag(DEPTH_BIAS, enable);
    }

    pub fn sample_shading(&self) -> bool {
        self.flag(SAMPLE_SHADING)
    }

    pub fn set_sample_shading(&mut self, enable: bool) {
        self.set_flag(SAMPLE_SHADING, enable);
    }

    pub fn alpha_to_coverage(&self) -> bool {
        self.flag(ALPHA_TO_COVERAGE)
    }

    pub fn set_alpha_to_coverage(&mut self, enable: bool) {
        self.set_flag(ALPHA_TO_COVERAGE, enable);
    }

    pub fn alpha_to_one(&self) -> bool {
        self.flag(ALPHA_TO_ONE)
    }

    pub fn set_alpha_to_one(&mut self, enable: bool) {
        self.set_flag(ALPHA_TO_ONE, enable);
    }

    pub fn logic_op_enabled(&self) -> bool {
        self.flag(LOGIC_OP_ENABLE)
    }

    pub fn set_logic_op_enabled(&mut self, enable: bool) {
        self.set_flag(LOGIC_OP_ENABLE, enable);
    }

    pub fn logic_op(&self) -> LogicOp {
        LogicOp::from_bits(self.get(LOGIC_OP))
    }

    pub fn set_logic_op(&mut self, op: LogicOp) {
        self.set(LOGIC_OP, op.bits());
    }

    pub fn fill_mode(&self) -> PolygonMode {
        PolygonMode::from_bits(self.get(FILL_MODE))
    }

    pub fn set_fill_mode(&mut self, mode: PolygonMode) {
        self.set(FILL_MODE, mode.bits());
    }

    /// Stencil configuration of one face.
    pub fn stencil(&self, face: StencilFace) -> StencilFaceState {
        let op = |offset| StencilOp::from_bits(self.get(stencil_field(face, offset, 3)));
        let byte = |offset| self.get(stencil_field(face, offset, 8)) as u8;

        StencilFaceState {
            fail_op: op(STENCIL_FAIL),
            pass_op: op(STENCIL_PASS),
            depth_fail_op: op(STENCIL_DEPTH_FAIL),
            compare_op: CompareOp::from_bits(self.get(stencil_field(face, STENCIL_COMPARE_OP, 3))),
            compare_mask: byte(STENCIL_COMPARE_MASK),
            write_mask: byte(STENCIL_WRITE_MASK),
            reference: byte(STENCIL_REFERENCE),
        }
    }

    /// Replace the stencil configuration of one face.
    pub fn set_stencil(&mut self, face: StencilFace, state: StencilFaceState) {
        self.set(stencil_field(face, STENCIL_FAIL, 3), state.fail_op.bits());
        self.set(stencil_field(face, STENCIL_PASS, 3), state.pass_op.bits());
        self.set(
            stencil_field(face, STENCIL_DEPTH_FAIL, 3),
            state.depth_fail_op.bits(),
        );
        self.set(
            stencil_field(face, STENCIL_COMPARE_OP, 3),
            state.compare_op.bits(),
        );
        self.set_stencil_compare_mask(face, state.compare_mask);
        self.set_stencil_write_mask(face, state.write_mask);
        self.set_stencil_reference(face, state.reference);
    }

    pub fn set_stencil_compare_mask(&mut self, face: StencilFace, mask: u8) {
        self.set(
            stencil_field(face, STENCIL_COMPARE_MASK, 8),
            u64::from(mask),
        );
    }

    pub fn set_stencil_write_mask(&mut self, face: StencilFace, mask: u8) {
        self.set(stencil_field(face, STENCIL_WRITE_MASK, 8), u64::from(mask));
    }

    pub fn set_stencil_reference(&mut self, face: StencilFace, reference: u8) {
        self.set(
            stencil_field(face, STENCIL_REFERENCE, 8),
            u64::from(reference),
        );
    }

    /// States recorded dynamically.
    pub fn dynamic_states(&self) -> DynamicState {
        DynamicState::from_bits_truncate(self.get(DYNAMIC_STATES) as u16)
    }

    /// Mark `states` dynamic or baked.
    pub fn set_dynamic(&mut self, states: DynamicState, enable: bool) {
        let mut current = self.dynamic_states();
        current.set(states, enable);
        self.set(DYNAMIC_STATES, u64::from(current.bits()));
    }

    pub fn subpass_index(&self) -> u32 {
        self.get(SUBPASS_INDEX) as u32
    }

    pub fn set_subpass_index(&mut self, index: u32) {
        self.set(SUBPASS_INDEX, u64::from(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESERVED: Field = Field::new(110, 18);

    #[test]
    fn layout_fills_exactly_110_bits() {
        assert_eq!(stencil_field(StencilFace::Back, STENCIL_REFERENCE, 8).offset + 8, 99);
        assert_eq!(SUBPASS_INDEX.offset + SUBPASS_INDEX.width, RESERVED.offset);
        assert_eq!(std::mem::size_of::<PackedPipelineState>(), 16);
    }

    #[test]
    fn fields_round_trip_independently() {
        let mut state = PackedPipelineState::default();
        state.set_draw_mode(DrawMode::TriangleFan);
        state.set_logic_op(LogicOp::Set);
        state.set_fill_mode(PolygonMode::Line);
        state.set_depth_write(true);
        state.set_subpass_index(3);

        assert_eq!(state.draw_mode(), DrawMode::TriangleFan);
        assert_eq!(state.logic_op(), LogicOp::Set);
        assert_eq!(state.fill_mode(), PolygonMode::Line);
        assert!(state.depth_write());
        assert!(!state.depth_test());
        assert_eq!(state.subpass_index(), 3);
        assert_eq!(state.get(RESERVED), 0);
    }

    #[test]
    fn back_stencil_straddles_word_boundary() {
        let mut state = PackedPipelineState::default();
        let back = StencilFaceState {
            fail_op: StencilOp::DecrementAndWrap,
            pass_op: StencilOp::Invert,
            depth_fail_op: StencilOp::Zero,
            compare_op: CompareOp::GreaterOrEqual,
            compare_mask: 0xA5,
            write_mask: 0x3C,
            reference: 0x81,
        };
        state.set_stencil(StencilFace::Back, back);

        assert_eq!(state.stencil(StencilFace::Back), back);
        let [low, high] = state.words();
        assert_eq!(low >> 63, 1, "lowest fail-op bit lives in word 0");
        assert_eq!(high & 0b11, 0b11, "upper fail-op bits live in word 1");
        assert_eq!(state.stencil(StencilFace::Front).compare_mask, 0);
    }

    #[test]
    fn dynamic_stencil_bits_are_masked() {
        let mut a = PackedPipelineState::default();
        a.set_stencil(StencilFace::Front, StencilFaceState::default());
        a.set_stencil(StencilFace::Back, StencilFaceState::default());
        a.set_dynamic(DynamicState::STENCIL_REFERENCE, true);

        let mut b = a;
        b.set_stencil_reference(StencilFace::Front, 0x01);
        b.set_stencil_reference(StencilFace::Back, 0x02);

        assert_ne!(a.words(), b.words());
        assert_eq!(a.masked_words(), b.masked_words());

        b.set_stencil_write_mask(StencilFace::Back, 0x0F);
        assert_ne!(a.masked_words(), b.masked_words());
    }

    #[test]
    fn masks_are_all_ones_without_dynamic_stencil() {
        let mut state = PackedPipelineState::default();
        state.set_dynamic(DynamicState::VIEWPORT | DynamicState::SCISSOR, true);
        assert_eq!(state.state0_mask(), u64::MAX);
        assert_eq!(state.state1_mask(), u64::MAX);
    }

    #[test]
    fn compare_mask_flag_clears_both_faces() {
        let mut state = PackedPipelineState::default();
        state.set_dynamic(DynamicState::STENCIL_COMPARE_MASK, true);
        let front = stencil_field(StencilFace::Front, STENCIL_COMPARE_MASK, 8).mask();
        let back = stencil_field(StencilFace::Back, STENCIL_COMPARE_MASK, 8).mask();
        assert_eq!(state.state0_mask(), !(front as u64));
        assert_eq!(state.state1_mask(), !((back >> 64) as u64));
    }
}
