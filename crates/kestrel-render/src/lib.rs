//! Sort-keyed render queues for the Kestrel renderer.
//!
//! This crate provides:
//! - Opaque, alpha-blended and screen overlay queues with 64-bit sort keys
//! - A stable byte-wise radix sort
//! - Execution of sorted draws into a [`kestrel_gpu::CommandList`]

pub mod command;
pub mod error;
pub mod keys;
pub mod queue;
pub mod sort;

pub use command::{
    DescriptorBind, DrawArrays, DrawEncoder, DrawIndexed, VertexBufferBinding, CAMERA_SET,
    LIGHT_SET, MATERIAL_SET, OBJECT_SET,
};
pub use error::{RenderError, Result};
pub use keys::view_depth;
pub use queue::{CommandId, QueueUsage, RenderQueue, RenderQueueConfig, RenderQueueType, RenderView};
