//! Pipeline state vocabulary.
//!
//! Every enum here packs into a fixed number of bits of
//! [`PackedPipelineState`] and converts 1-to-1 into its `ash::vk` counterpart.

mod packed;
mod pipeline;

pub use packed::{PackedPipelineState, StencilFaceState};
pub use pipeline::{
    AttachmentBlend, DepthBias, DepthBounds, DrawCallPipeline, PipelineCacheKey, PipelineState,
    ScissorRect, Viewport,
};

use ash::vk;
use bitflags::bitflags;

macro_rules! packed_enum {
    (
        $(#[$meta:meta])*
        $name:ident => $vk:ty {
            $($(#[$vmeta:meta])* $variant:ident => $vkval:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub(crate) fn from_bits(bits: u64) -> Self {
                Self::ALL.get(bits as usize).copied().unwrap_or(Self::ALL[0])
            }

            pub(crate) const fn bits(self) -> u64 {
                self as u64
            }

            /// Back-end value.
            pub fn to_vk(self) -> $vk {
                match self {
                    $(Self::$variant => $vkval),+
                }
            }
        }
    };
}

packed_enum! {
    /// Primitive topology.
    DrawMode => vk::PrimitiveTopology {
        PointList => vk::PrimitiveTopology::POINT_LIST,
        LineList => vk::PrimitiveTopology::LINE_LIST,
        LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
    }
}

packed_enum! {
    /// Winding considered front facing.
    FrontFace => vk::FrontFace {
        Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
        Cw => vk::FrontFace::CLOCKWISE,
    }
}

packed_enum! {
    /// Depth and stencil comparison.
    CompareOp => vk::CompareOp {
        Never => vk::CompareOp::NEVER,
        Less => vk::CompareOp::LESS,
        Equal => vk::CompareOp::EQUAL,
        LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        Greater => vk::CompareOp::GREATER,
        NotEqual => vk::CompareOp::NOT_EQUAL,
        GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        Always => vk::CompareOp::ALWAYS,
    }
}

packed_enum! {
    /// Stencil buffer update.
    StencilOp => vk::StencilOp {
        Keep => vk::StencilOp::KEEP,
        Zero => vk::StencilOp::ZERO,
        Replace => vk::StencilOp::REPLACE,
        IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        Invert => vk::StencilOp::INVERT,
        IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

packed_enum! {
    /// Polygon rasterization mode.
    PolygonMode => vk::PolygonMode {
        Fill => vk::PolygonMode::FILL,
        Line => vk::PolygonMode::LINE,
        Point => vk::PolygonMode::POINT,
    }
}

packed_enum! {
    /// Blend equation.
    BlendOp => vk::BlendOp {
        Add => vk::BlendOp::ADD,
        Subtract => vk::BlendOp::SUBTRACT,
        ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        Min => vk::BlendOp::MIN,
        Max => vk::BlendOp::MAX,
    }
}

packed_enum! {
    /// Blend factor. `None` disables blending for the attachment.
    BlendFactor => vk::BlendFactor {
        Zero => vk::BlendFactor::ZERO,
        One => vk::BlendFactor::ONE,
        SrcColor => vk::BlendFactor::SRC_COLOR,
        OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        DstColor => vk::BlendFactor::DST_COLOR,
        OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        DstAlpha => vk::BlendFactor::DST_ALPHA,
        OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
        OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        ConstantAlpha => vk::BlendFactor::CONSTANT_ALPHA,
        OneMinusConstantAlpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
        SrcAlphaSaturate => vk::BlendFactor::SRC_ALPHA_SATURATE,
        Src1Color => vk::BlendFactor::SRC1_COLOR,
        OneMinusSrc1Color => vk::BlendFactor::ONE_MINUS_SRC1_COLOR,
        Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
        OneMinusSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
        None => vk::BlendFactor::ZERO,
    }
}

packed_enum! {
    /// Framebuffer logic operation.
    LogicOp => vk::LogicOp {
        Clear => vk::LogicOp::CLEAR,
        And => vk::LogicOp::AND,
        AndReverse => vk::LogicOp::AND_REVERSE,
        Copy => vk::LogicOp::COPY,
        AndInverted => vk::LogicOp::AND_INVERTED,
        NoOp => vk::LogicOp::NO_OP,
        Xor => vk::LogicOp::XOR,
        Or => vk::LogicOp::OR,
        Nor => vk::LogicOp::NOR,
        Equivalent => vk::LogicOp::EQUIVALENT,
        Invert => vk::LogicOp::INVERT,
        OrReverse => vk::LogicOp::OR_REVERSE,
        CopyInverted => vk::LogicOp::COPY_INVERTED,
        OrInverted => vk::LogicOp::OR_INVERTED,
        Nand => vk::LogicOp::NAND,
        Set => vk::LogicOp::SET,
    }
}

bitflags! {
    /// Faces removed by culling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CullFace: u8 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
        const FRONT_AND_BACK = Self::FRONT.bits() | Self::BACK.bits();
    }
}

impl CullFace {
    /// Back-end value.
    pub fn to_vk(self) -> vk::CullModeFlags {
        vk::CullModeFlags::from_raw(u32::from(self.bits()))
    }
}

bitflags! {
    /// Color channels written by an attachment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RGBA = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

impl ColorMask {
    /// Back-end value.
    pub fn to_vk(self) -> vk::ColorComponentFlags {
        vk::ColorComponentFlags::from_raw(u32::from(self.bits()))
    }
}

bitflags! {
    /// Pipeline state recorded into the command buffer instead of baked
    /// into the pipeline object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DynamicState: u16 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const LINE_WIDTH = 1 << 2;
        const DEPTH_BIAS = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const DEPTH_BOUNDS = 1 << 5;
        const STENCIL_COMPARE_MASK = 1 << 6;
        const STENCIL_WRITE_MASK = 1 << 7;
        const STENCIL_REFERENCE = 1 << 8;
    }
}

impl DynamicState {
    /// Back-end dynamic states for every set flag.
    pub fn to_vk(self) -> Vec<vk::DynamicState> {
        const TABLE: [(DynamicState, vk::DynamicState); 9] = [
            (DynamicState::VIEWPORT, vk::DynamicState::VIEWPORT),
            (DynamicState::SCISSOR, vk::DynamicState::SCISSOR),
            (DynamicState::LINE_WIDTH, vk::DynamicState::LINE_WIDTH),
            (DynamicState::DEPTH_BIAS, vk::DynamicState::DEPTH_BIAS),
            (DynamicState::BLEND_CONSTANTS, vk::DynamicState::BLEND_CONSTANTS),
            (DynamicState::DEPTH_BOUNDS, vk::DynamicState::DEPTH_BOUNDS),
            (
                DynamicState::STENCIL_COMPARE_MASK,
                vk::DynamicState::STENCIL_COMPARE_MASK,
            ),
            (
                DynamicState::STENCIL_WRITE_MASK,
                vk::DynamicState::STENCIL_WRITE_MASK,
            ),
            (
                DynamicState::STENCIL_REFERENCE,
                vk::DynamicState::STENCIL_REFERENCE,
            ),
        ];

        TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|&(_, state)| state)
            .collect()
    }
}

/// Stencil face selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilFace {
    Front,
    Back,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_follow_back_end_numbering() {
        assert_eq!(CompareOp::Always.to_vk(), vk::CompareOp::ALWAYS);
        assert_eq!(CompareOp::Always.bits(), 7);
        assert_eq!(LogicOp::Set.bits(), 15);
        assert_eq!(BlendFactor::None.bits(), 19);
        assert_eq!(
            BlendFactor::OneMinusSrc1Alpha.to_vk(),
            vk::BlendFactor::ONE_MINUS_SRC1_ALPHA
        );
    }

    #[test]
    fn out_of_range_bits_decode_to_first_variant() {
        assert_eq!(DrawMode::from_bits(7), DrawMode::PointList);
        assert_eq!(PolygonMode::from_bits(2), PolygonMode::Point);
    }

    #[test]
    fn dynamic_state_lists_only_set_flags() {
        let states = (DynamicState::SCISSOR | DynamicState::STENCIL_REFERENCE).to_vk();
        assert_eq!(
            states,
            vec![vk::DynamicState::SCISSOR, vk::DynamicState::STENCIL_REFERENCE]
        );
    }

    #[test]
    fn cull_and_mask_flags_convert() {
        assert_eq!(CullFace::FRONT_AND_BACK.to_vk(), vk::CullModeFlags::FRONT_AND_BACK);
        assert_eq!(ColorMask::RGBA.to_vk(), vk::ColorComponentFlags::RGBA);
    }
}
