//! Core constants and primitives for the Kestrel renderer.
//!
//! This crate provides the pieces shared by every other crate:
//! - Hard graphics limits exposed to callers
//! - The order-dependent content hasher used by the object caches

pub mod hash;

pub use hash::{reduce_id, ContentHasher};

/// Hard limits of the graphics layer.
pub mod limits {
    /// Maximum subpasses in a single render pass.
    pub const MAX_SUBPASSES: usize = 4;
    /// Maximum attachments in a render pass or framebuffer.
    pub const MAX_ATTACHMENTS: usize = 8;
    /// Maximum subpass dependencies in a render pass.
    pub const MAX_SUBPASS_DEPENDENCIES: usize = 4;
    /// Maximum descriptor sets per shader program.
    pub const MAX_DESCRIPTOR_SETS: usize = 4;
    /// Maximum bindings per descriptor set layout.
    pub const MAX_LAYOUT_BINDINGS: usize = 6;
    /// Maximum vertex buffer bindings.
    pub const MAX_VERTEX_BINDINGS: usize = 16;
    /// Maximum descriptor writes flushed in one batch.
    pub const MAX_DESCRIPTOR_WRITES: usize = 32;
    /// Maximum barriers in a single pipeline barrier call.
    pub const MAX_BARRIER_WRITES: usize = 16;
    /// Maximum frames the CPU may run ahead of the GPU.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
    /// Maximum shader stages attached to a program.
    pub const MAX_SHADER_STAGES: usize = 6;
}
