//! Portable pipeline barriers.
//!
//! A [`Barrier`] names resources by handle. [`BarrierBatch::translate`]
//! resolves them into back-end barrier structs grouped the way
//! `vkCmdPipelineBarrier` takes them.

use ash::vk;
use kestrel_core::limits::MAX_BARRIER_WRITES;

use crate::error::{GpuError, Result};
use crate::flags::{AccessFlags, ImageLayout};
use crate::handle::Handle;
use crate::resources::{Buffer, Texture};

/// Source and destination queue family of an ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTransfer {
    pub src: u32,
    pub dst: u32,
}

impl QueueTransfer {
    /// No ownership transfer.
    pub const NONE: Self = Self {
        src: vk::QUEUE_FAMILY_IGNORED,
        dst: vk::QUEUE_FAMILY_IGNORED,
    };
}

impl Default for QueueTransfer {
    fn default() -> Self {
        Self::NONE
    }
}

/// Mip and layer range of an image barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

/// One barrier of a [`pipeline_barrier`](crate::CommandList::pipeline_barrier) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Global memory dependency.
    Memory {
        src_access: AccessFlags,
        dst_access: AccessFlags,
    },
    /// Dependency on a buffer range. `size: None` covers the rest of the
    /// buffer.
    Buffer {
        buffer: Handle<Buffer>,
        src_access: AccessFlags,
        dst_access: AccessFlags,
        queue_transfer: QueueTransfer,
        offset: u64,
        size: Option<u64>,
    },
    /// Dependency on a texture with an optional layout transition.
    /// `range: None` covers every mip and layer.
    Image {
        texture: Handle<Texture>,
        src_access: AccessFlags,
        dst_access: AccessFlags,
        queue_transfer: QueueTransfer,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        range: Option<SubresourceRange>,
    },
}

/// Back-end barriers ready to record.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    pub memory: Vec<vk::MemoryBarrier<'static>>,
    pub buffers: Vec<vk::BufferMemoryBarrier<'static>>,
    pub images: Vec<vk::ImageMemoryBarrier<'static>>,
    /// Textures whose tracked layout changes once the batch is recorded.
    pub transitions: Vec<(Handle<Texture>, ImageLayout)>,
}

impl BarrierBatch {
    /// Resolve `barriers` through the given lookups.
    ///
    /// `buffer` maps a handle to its back-end buffer; `image` maps a handle
    /// to its back-end image and full subresource range.
    pub fn translate(
        barriers: &[Barrier],
        mut buffer: impl FnMut(Handle<Buffer>) -> Option<vk::Buffer>,
        mut image: impl FnMut(Handle<Texture>) -> Option<(vk::Image, vk::ImageSubresourceRange)>,
    ) -> Result<Self> {
        if barriers.len() > MAX_BARRIER_WRITES {
            return Err(GpuError::InvalidArgument(format!(
                "{} barriers exceed the limit of {MAX_BARRIER_WRITES}",
                barriers.len()
            )));
        }

        let mut batch = Self::default();
        for barrier in barriers {
            match *barrier {
                Barrier::Memory {
                    src_access,
                    dst_access,
                } => batch.memory.push(
                    vk::MemoryBarrier::default()
                        .src_access_mask(src_access.to_vk())
                        .dst_access_mask(dst_access.to_vk()),
                ),
                Barrier::Buffer {
                    buffer: handle,
                    src_access,
                    dst_access,
                    queue_transfer,
                    offset,
                    size,
                } => {
                    let raw = buffer(handle)
                        .ok_or_else(|| GpuError::InvalidHandle(format!("{handle:?}")))?;
                    batch.buffers.push(
                        vk::BufferMemoryBarrier::default()
                            .src_access_mask(src_access.to_vk())
                            .dst_access_mask(dst_access.to_vk())
                            .src_queue_family_index(queue_transfer.src)
                            .dst_queue_family_index(queue_transfer.dst)
                            .buffer(raw)
                            .offset(offset)
                            .size(size.unwrap_or(vk::WHOLE_SIZE)),
                    );
                }
                Barrier::Image {
                    texture,
                    src_access,
                    dst_access,
                    queue_transfer,
                    old_layout,
                    new_layout,
                    range,
                } => {
                    let (raw, full) = image(texture)
                        .ok_or_else(|| GpuError::InvalidHandle(format!("{texture:?}")))?;
                    let subresource = range.map_or(full, |r| {
                        full.base_mip_level(r.base_mip)
                            .level_count(r.mip_count)
                            .base_array_layer(r.base_layer)
                            .layer_count(r.layer_count)
                    });
                    batch.images.push(
                        vk::ImageMemoryBarrier::default()
                            .src_access_mask(src_access.to_vk())
                            .dst_access_mask(dst_access.to_vk())
                            .old_layout(old_layout.to_vk())
                            .new_layout(new_layout.to_vk())
                            .src_queue_family_index(queue_transfer.src)
                            .dst_queue_family_index(queue_transfer.dst)
                            .image(raw)
                            .subresource_range(subresource),
                    );
                    if old_layout != new_layout {
                        batch.transitions.push((texture, new_layout));
                    }
                }
            }
        }

        Ok(batch)
    }

    /// Whether nothing would be recorded.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;

    fn color_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(4)
            .layer_count(1)
    }

    #[test]
    fn barriers_are_grouped_by_kind() {
        let mut buffers = HandleTable::new();
        let buffer = buffers.insert(Buffer::detached(256, None));
        let mut textures = HandleTable::new();
        let texture = textures.insert(Texture::detached(vk::Format::R8G8B8A8_UNORM, 4, 4));

        let barriers = [
            Barrier::Image {
                texture,
                src_access: AccessFlags::TRANSFER_WRITE,
                dst_access: AccessFlags::SHADER_READ,
                queue_transfer: QueueTransfer::NONE,
                old_layout: ImageLayout::TransferDstOptimal,
                new_layout: ImageLayout::ShaderReadOnlyOptimal,
                range: None,
            },
            Barrier::Memory {
                src_access: AccessFlags::SHADER_WRITE,
                dst_access: AccessFlags::SHADER_READ,
            },
            Barrier::Buffer {
                buffer,
                src_access: AccessFlags::TRANSFER_WRITE,
                dst_access: AccessFlags::VERTEX_ATTRIBUTE_READ,
                queue_transfer: QueueTransfer { src: 1, dst: 0 },
                offset: 64,
                size: None,
            },
        ];

        let batch = BarrierBatch::translate(
            &barriers,
            |_| Some(vk::Buffer::null()),
            |_| Some((vk::Image::null(), color_range())),
        )
        .unwrap();

        assert_eq!(batch.memory.len(), 1);
        assert_eq!(batch.buffers[0].offset, 64);
        assert_eq!(batch.buffers[0].size, vk::WHOLE_SIZE);
        assert_eq!(batch.buffers[0].src_queue_family_index, 1);
        assert_eq!(batch.images[0].subresource_range.level_count, 4);
        assert_eq!(
            batch.images[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            batch.transitions,
            vec![(texture, ImageLayout::ShaderReadOnlyOptimal)]
        );
    }

    #[test]
    fn explicit_range_keeps_the_aspect() {
        let mut textures = HandleTable::new();
        let texture = textures.insert(Texture::detached(vk::Format::R8G8B8A8_UNORM, 4, 4));
        let barrier = Barrier::Image {
            texture,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::empty(),
            queue_transfer: QueueTransfer::default(),
            old_layout: ImageLayout::General,
            new_layout: ImageLayout::General,
            range: Some(SubresourceRange {
                base_mip: 2,
                mip_count: 1,
                base_layer: 0,
                layer_count: 1,
            }),
        };

        let batch = BarrierBatch::translate(
            &[barrier],
            |_| None,
            |_| Some((vk::Image::null(), color_range())),
        )
        .unwrap();
        let range = batch.images[0].subresource_range;
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!((range.base_mip_level, range.level_count), (2, 1));
        assert!(batch.transitions.is_empty());
    }

    #[test]
    fn unresolved_handles_and_oversized_batches_fail() {
        let mut buffers = HandleTable::new();
        let buffer = buffers.insert(Buffer::detached(16, None));
        let barrier = Barrier::Buffer {
            buffer,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::empty(),
            queue_transfer: QueueTransfer::NONE,
            offset: 0,
            size: Some(16),
        };
        assert!(matches!(
            BarrierBatch::translate(&[barrier], |_| None, |_| None),
            Err(GpuError::InvalidHandle(_))
        ));

        let memory = Barrier::Memory {
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::empty(),
        };
        assert!(matches!(
            BarrierBatch::translate(&[memory; 17], |_| None, |_| None),
            Err(GpuError::InvalidArgument(_))
        ));
    }
}
