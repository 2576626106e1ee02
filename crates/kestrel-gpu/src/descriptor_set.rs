//! Descriptor set contents, their cache key and back-end writes.

use ash::vk;
use kestrel_core::limits::{MAX_DESCRIPTOR_WRITES, MAX_LAYOUT_BINDINGS};
use kestrel_core::ContentHasher;

use crate::cache::CacheKey;
use crate::error::{GpuError, Result};
use crate::flags::ShaderStages;
use crate::handle::{GpuObject, Handle, ObjectHeader, ObjectKind};
use crate::resources::{Buffer, DescriptorKind, DescriptorSetLayoutInfo, Texture};

/// A range of a uniform buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRange {
    pub buffer: Handle<Buffer>,
    pub offset: u64,
    pub size: u64,
}

/// Resources written to consecutive array elements of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorResources {
    Textures(Vec<Handle<Texture>>),
    UniformBuffers(Vec<BufferRange>),
}

impl DescriptorResources {
    fn kind(&self) -> DescriptorKind {
        match self {
            Self::Textures(_) => DescriptorKind::ImageSampler,
            Self::UniformBuffers(_) => DescriptorKind::UniformBuffer,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Textures(textures) => textures.len(),
            Self::UniformBuffers(buffers) => buffers.len(),
        }
    }
}

/// One binding's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub array_start: u32,
    pub resources: DescriptorResources,
}

/// Contents of a descriptor set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetInfo {
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetInfo {
    /// Create an empty set description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind textures starting at array element 0.
    pub fn textures(mut self, binding: u32, textures: &[Handle<Texture>]) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            array_start: 0,
            resources: DescriptorResources::Textures(textures.to_vec()),
        });
        self
    }

    /// Bind a whole uniform buffer range at array element 0.
    pub fn uniform_buffer(mut self, binding: u32, buffer: Handle<Buffer>, offset: u64, size: u64) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            array_start: 0,
            resources: DescriptorResources::UniformBuffers(vec![BufferRange {
                buffer,
                offset,
                size,
            }]),
        });
        self
    }

    /// Append a binding.
    pub fn binding(mut self, binding: DescriptorBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

/// Cache key of a descriptor set: its contents plus the stage visibility of
/// every binding in the layout it is allocated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSetKey {
    pub info: DescriptorSetInfo,
    pub stages: Vec<ShaderStages>,
}

impl DescriptorSetKey {
    /// Check `info` against `layout` and capture the stage bits.
    pub fn new(info: DescriptorSetInfo, layout: &DescriptorSetLayoutInfo) -> Result<Self> {
        if info.bindings.is_empty() || info.bindings.len() > MAX_LAYOUT_BINDINGS {
            return Err(GpuError::InvalidArgument(format!(
                "descriptor sets write 1..={MAX_LAYOUT_BINDINGS} bindings, got {}",
                info.bindings.len()
            )));
        }

        let stages = info
            .bindings
            .iter()
            .map(|binding| {
                let declared = layout.find(binding.binding).ok_or_else(|| {
                    GpuError::InvalidArgument(format!(
                        "binding {} is not in the set layout",
                        binding.binding
                    ))
                })?;

                if declared.kind != binding.resources.kind() {
                    return Err(GpuError::InvalidArgument(format!(
                        "binding {} expects {:?}",
                        binding.binding, declared.kind
                    )));
                }

                let count = binding.resources.len() as u32;
                if count == 0 || binding.array_start + count > declared.count {
                    return Err(GpuError::InvalidArgument(format!(
                        "binding {} elements {}..{} exceed array size {}",
                        binding.binding,
                        binding.array_start,
                        binding.array_start + count,
                        declared.count
                    )));
                }

                Ok(declared.stages)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { info, stages })
    }
}

impl CacheKey for DescriptorSetKey {
    fn content_hash(&self) -> u64 {
        let mut hasher = ContentHasher::new();
        hasher.add_u32(self.info.bindings.len() as u32);

        for (binding, stages) in self.info.bindings.iter().zip(&self.stages) {
            hasher.add_u32(binding.resources.kind().tag());
            hasher.add_u32(binding.binding);
            hasher.add_u32(binding.array_start);
            hasher.add_u32(binding.resources.len() as u32);
            hasher.add_u32(stages.bits());

            match &binding.resources {
                DescriptorResources::Textures(textures) => {
                    for texture in textures {
                        hasher.add_id(texture.to_bits());
                    }
                }
                DescriptorResources::UniformBuffers(buffers) => {
                    for range in buffers {
                        hasher.add_id(range.buffer.to_bits());
                        hasher.add_u64(range.offset);
                        hasher.add_u64(range.size);
                    }
                }
            }
        }

        hasher.finish()
    }

    fn content_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// Allocated descriptor set.
#[derive(Debug)]
pub struct DescriptorSet {
    pub(crate) header: ObjectHeader,
    pub(crate) handle: vk::DescriptorSet,
    pub(crate) link: u64,
}

impl GpuObject for DescriptorSet {
    const KIND: ObjectKind = ObjectKind::DescriptorSet;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl DescriptorSet {
    /// Back-end handle.
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }
}

/// A write of consecutive array elements of one binding.
#[derive(Debug, Clone)]
pub(crate) struct PlannedWrite {
    pub binding: u32,
    pub array_element: u32,
    pub kind: DescriptorKind,
    pub images: Vec<vk::DescriptorImageInfo>,
    pub buffers: Vec<vk::DescriptorBufferInfo>,
}

/// Resolve every resource in `info` into back-end write payloads.
pub(crate) fn plan_writes(
    info: &DescriptorSetInfo,
    mut texture: impl FnMut(Handle<Texture>) -> Option<(vk::ImageView, vk::Sampler)>,
    mut buffer: impl FnMut(Handle<Buffer>) -> Option<vk::Buffer>,
) -> Result<Vec<PlannedWrite>> {
    info.bindings
        .iter()
        .map(|binding| {
            let mut write = PlannedWrite {
                binding: binding.binding,
                array_element: binding.array_start,
                kind: binding.resources.kind(),
                images: Vec::new(),
                buffers: Vec::new(),
            };

            match &binding.resources {
                DescriptorResources::Textures(textures) => {
                    for &handle in textures {
                        let (view, sampler) = texture(handle)
                            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle:?}")))?;
                        write.images.push(
                            vk::DescriptorImageInfo::default()
                                .image_view(view)
                                .sampler(sampler)
                                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                        );
                    }
                }
                DescriptorResources::UniformBuffers(ranges) => {
                    for range in ranges {
                        let handle = buffer(range.buffer)
                            .ok_or_else(|| GpuError::InvalidHandle(format!("{:?}", range.buffer)))?;
                        write.buffers.push(
                            vk::DescriptorBufferInfo::default()
                                .buffer(handle)
                                .offset(range.offset)
                                .range(range.size),
                        );
                    }
                }
            }

            Ok(write)
        })
        .collect()
}

/// Write `planned` into `set`, flushing in batches.
///
/// # Safety
/// The device, set and every referenced resource must be valid.
pub(crate) unsafe fn write_descriptor_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    planned: &[PlannedWrite],
) {
    for batch in planned.chunks(MAX_DESCRIPTOR_WRITES) {
        let writes: Vec<vk::WriteDescriptorSet> = batch
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.kind.to_vk());
                match write.kind {
                    DescriptorKind::ImageSampler => base.image_info(&write.images),
                    DescriptorKind::UniformBuffer => base.buffer_info(&write.buffers),
                }
            })
            .collect();

        device.update_descriptor_sets(&writes, &[]);
    }
}
