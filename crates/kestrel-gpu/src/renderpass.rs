//! Render pass descriptions and their cached back-end objects.

use ash::vk;
use bitflags::bitflags;
use kestrel_core::limits::{MAX_ATTACHMENTS, MAX_SUBPASSES, MAX_SUBPASS_DEPENDENCIES};
use kestrel_core::ContentHasher;

use crate::cache::CacheKey;
use crate::error::{GpuError, Result};
use crate::flags::{AccessFlags, ImageLayout, PipelineStages, SampleCount};
use crate::handle::{GpuObject, Handle, ObjectHeader, ObjectKind};
use crate::resources::Texture;

bitflags! {
    /// One bit per attachment index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadStoreFlags: u16 {
        const ATTACHMENT_0 = 1 << 0;
        const ATTACHMENT_1 = 1 << 1;
        const ATTACHMENT_2 = 1 << 2;
        const ATTACHMENT_3 = 1 << 3;
        const ATTACHMENT_4 = 1 << 4;
        const ATTACHMENT_5 = 1 << 5;
        const ATTACHMENT_6 = 1 << 6;
        const ATTACHMENT_7 = 1 << 7;
    }
}

impl LoadStoreFlags {
    /// Flag for attachment `index`.
    pub fn attachment(index: usize) -> Self {
        Self::from_bits_truncate(1 << index)
    }

    fn has(self, index: usize) -> bool {
        self.contains(Self::attachment(index))
    }
}

/// Load op for attachment `index`; clearing wins over loading.
pub fn load_op(index: usize, load: LoadStoreFlags, clear: LoadStoreFlags) -> vk::AttachmentLoadOp {
    if clear.has(index) {
        vk::AttachmentLoadOp::CLEAR
    } else if load.has(index) {
        vk::AttachmentLoadOp::LOAD
    } else {
        vk::AttachmentLoadOp::DONT_CARE
    }
}

/// Store op for attachment `index`.
pub fn store_op(index: usize, store: LoadStoreFlags) -> vk::AttachmentStoreOp {
    if store.has(index) {
        vk::AttachmentStoreOp::STORE
    } else {
        vk::AttachmentStoreOp::DONT_CARE
    }
}

/// A texture bound as a render pass attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentInfo {
    pub texture: Handle<Texture>,
    pub final_layout: ImageLayout,
    pub may_alias: bool,
}

/// Reference from a subpass to an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentRef {
    pub index: u32,
    pub layout: ImageLayout,
}

impl AttachmentRef {
    fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.add_u32(self.index);
        hasher.add_u32(self.layout.ordinal());
    }

    fn to_vk(self) -> vk::AttachmentReference {
        vk::AttachmentReference::default()
            .attachment(self.index)
            .layout(self.layout.to_vk())
    }
}

/// Attachments read and written by one subpass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubpassInfo {
    pub color_refs: Vec<AttachmentRef>,
    pub input_refs: Vec<AttachmentRef>,
    pub depth_ref: Option<AttachmentRef>,
}

/// Execution and memory dependency between two subpasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassDependency {
    /// Source and destination subpass; `vk::SUBPASS_EXTERNAL` for outside.
    pub subpasses: [u32; 2],
    pub stages: [PipelineStages; 2],
    pub access: [AccessFlags; 2],
    pub by_region: bool,
}

/// Load/store behavior of attachments and the subpass structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RenderpassInfo {
    pub load_ops: LoadStoreFlags,
    pub stencil_load_ops: LoadStoreFlags,
    pub clear_ops: LoadStoreFlags,
    pub stencil_clear_ops: LoadStoreFlags,
    pub store_ops: LoadStoreFlags,
    pub stencil_store_ops: LoadStoreFlags,
    pub subpasses: Vec<SubpassInfo>,
    pub attachments: Vec<AttachmentInfo>,
    pub dependencies: Vec<SubpassDependency>,
}

impl RenderpassInfo {
    /// Start a description with `num_subpasses` empty subpasses.
    pub fn new(num_subpasses: usize) -> Result<Self> {
        if num_subpasses == 0 || num_subpasses > MAX_SUBPASSES {
            return Err(GpuError::InvalidArgument(format!(
                "render pass needs 1..={MAX_SUBPASSES} subpasses, got {num_subpasses}"
            )));
        }

        Ok(Self {
            subpasses: vec![SubpassInfo::default(); num_subpasses],
            ..Self::default()
        })
    }

    /// Append an attachment, returning its index.
    pub fn add_attachment(&mut self, attachment: AttachmentInfo) -> Result<u32> {
        if self.attachments.len() >= MAX_ATTACHMENTS {
            return Err(GpuError::InvalidArgument(format!(
                "render pass supports at most {MAX_ATTACHMENTS} attachments"
            )));
        }

        self.attachments.push(attachment);
        Ok(self.attachments.len() as u32 - 1)
    }

    fn subpass_mut(&mut self, subpass: usize) -> Result<&mut SubpassInfo> {
        let count = self.subpasses.len();
        self.subpasses.get_mut(subpass).ok_or_else(|| {
            GpuError::InvalidArgument(format!("subpass {subpass} out of range ({count})"))
        })
    }

    /// Write `attachment` as a color output of `subpass`.
    pub fn add_color_out(
        &mut self,
        subpass: usize,
        attachment: u32,
        layout: ImageLayout,
    ) -> Result<&mut Self> {
        let refs = &mut self.subpass_mut(subpass)?.color_refs;
        if refs.len() >= MAX_ATTACHMENTS {
            return Err(GpuError::InvalidArgument(
                "too many color outputs in subpass".into(),
            ));
        }
        refs.push(AttachmentRef {
            index: attachment,
            layout,
        });
        Ok(self)
    }

    /// Use `attachment` as the depth/stencil output of `subpass`.
    pub fn add_depth_out(
        &mut self,
        subpass: usize,
        attachment: u32,
        layout: ImageLayout,
    ) -> Result<&mut Self> {
        self.subpass_mut(subpass)?.depth_ref = Some(AttachmentRef {
            index: attachment,
            layout,
        });
        Ok(self)
    }

    /// Read `attachment` as an input attachment of `subpass`.
    pub fn add_input(&mut self, subpass: usize, attachment: u32) -> Result<&mut Self> {
        let refs = &mut self.subpass_mut(subpass)?.input_refs;
        if refs.len() >= MAX_ATTACHMENTS {
            return Err(GpuError::InvalidArgument(
                "too many inputs in subpass".into(),
            ));
        }
        refs.push(AttachmentRef {
            index: attachment,
            layout: ImageLayout::ShaderReadOnlyOptimal,
        });
        Ok(self)
    }

    /// Append subpass dependencies.
    pub fn add_dependencies(&mut self, dependencies: &[SubpassDependency]) -> Result<&mut Self> {
        if self.dependencies.len() + dependencies.len() > MAX_SUBPASS_DEPENDENCIES {
            return Err(GpuError::InvalidArgument(format!(
                "render pass supports at most {MAX_SUBPASS_DEPENDENCIES} dependencies"
            )));
        }
        self.dependencies.extend_from_slice(dependencies);
        Ok(self)
    }
}

/// Back-end properties of an attachment captured when the pass is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentSignature {
    pub format: vk::Format,
    pub samples: SampleCount,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
    pub may_alias: bool,
}

/// Cache key of a render pass.
///
/// Attachments are described by format, sample count and layouts rather
/// than by texture identity, so every swapchain image shares one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassKey {
    pub ops: [LoadStoreFlags; 6],
    pub subpasses: Vec<SubpassInfo>,
    pub attachments: Vec<AttachmentSignature>,
    pub dependencies: Vec<SubpassDependency>,
}

impl RenderPassKey {
    /// Capture `info` using `describe` to resolve each attachment's format,
    /// sample count and current layout.
    ///
    /// The initial layout is the tracked layout only for loaded attachments;
    /// cleared or discarded contents start from `Undefined`.
    pub fn resolve(
        info: &RenderpassInfo,
        mut describe: impl FnMut(Handle<Texture>) -> Option<(vk::Format, SampleCount, ImageLayout)>,
    ) -> Result<Self> {
        let attachments = info
            .attachments
            .iter()
            .enumerate()
            .map(|(index, attachment)| {
                let (format, samples, current) = describe(attachment.texture).ok_or_else(|| {
                    GpuError::InvalidHandle(format!("attachment {index} texture"))
                })?;
                let loads = (info.load_ops.has(index) && !info.clear_ops.has(index))
                    || (info.stencil_load_ops.has(index) && !info.stencil_clear_ops.has(index));

                Ok(AttachmentSignature {
                    format,
                    samples,
                    initial_layout: if loads { current } else { ImageLayout::Undefined },
                    final_layout: attachment.final_layout,
                    may_alias: attachment.may_alias,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ops: [
                info.load_ops,
                info.stencil_load_ops,
                info.clear_ops,
                info.stencil_clear_ops,
                info.store_ops,
                info.stencil_store_ops,
            ],
            subpasses: info.subpasses.clone(),
            attachments,
            dependencies: info.dependencies.clone(),
        })
    }

    /// Color outputs written by `subpass`.
    pub fn color_attachment_count(&self, subpass: u32) -> u32 {
        self.subpasses
            .get(subpass as usize)
            .map_or(0, |s| s.color_refs.len() as u32)
    }

    /// Sample count rasterized by `subpass`, taken from its first output.
    pub fn subpass_samples(&self, subpass: u32) -> SampleCount {
        self.subpasses
            .get(subpass as usize)
            .and_then(|s| s.color_refs.first().copied().or(s.depth_ref))
            .and_then(|r| self.attachments.get(r.index as usize))
            .map_or(SampleCount::X1, |a| a.samples)
    }
}

impl CacheKey for RenderPassKey {
    fn content_hash(&self) -> u64 {
        let mut hasher = ContentHasher::new();

        for ops in self.ops {
            hasher.add_u32(u32::from(ops.bits()));
        }

        hasher.add_u32(self.subpasses.len() as u32);
        for subpass in &self.subpasses {
            hasher.add_u32(subpass.color_refs.len() as u32);
            for color in &subpass.color_refs {
                color.hash_into(&mut hasher);
            }
            hasher.add_u32(subpass.input_refs.len() as u32);
            for input in &subpass.input_refs {
                input.hash_into(&mut hasher);
            }
            match subpass.depth_ref {
                Some(depth) => depth.hash_into(&mut hasher),
                None => hasher.add_u32(u32::MAX),
            }
        }

        hasher.add_u32(self.attachments.len() as u32);
        for attachment in &self.attachments {
            hasher.add_u32(attachment.format.as_raw() as u32);
            hasher.add_u32(attachment.samples.to_vk().as_raw());
            hasher.add_u32(attachment.initial_layout.ordinal());
            hasher.add_u32(attachment.final_layout.ordinal());
            hasher.add_bool(attachment.may_alias);
        }

        hasher.add_u32(self.dependencies.len() as u32);
        for dependency in &self.dependencies {
            hasher.add_u32(dependency.subpasses[0]);
            hasher.add_u32(dependency.subpasses[1]);
            hasher.add_u32(dependency.stages[0].bits());
            hasher.add_u32(dependency.stages[1].bits());
            hasher.add_u32(dependency.access[0].bits());
            hasher.add_u32(dependency.access[1].bits());
            hasher.add_bool(dependency.by_region);
        }

        hasher.finish()
    }

    fn content_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// Cached render pass object.
#[derive(Debug)]
pub struct RenderPass {
    pub(crate) header: ObjectHeader,
    pub(crate) handle: vk::RenderPass,
    pub(crate) key: RenderPassKey,
}

impl GpuObject for RenderPass {
    const KIND: ObjectKind = ObjectKind::RenderPass;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl RenderPass {
    /// Back-end handle.
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Key this pass was created from.
    pub fn key(&self) -> &RenderPassKey {
        &self.key
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            header: ObjectHeader::default(),
            handle: vk::RenderPass::null(),
            key: RenderPassKey {
                ops: [LoadStoreFlags::empty(); 6],
                subpasses: vec![SubpassInfo::default()],
                attachments: Vec::new(),
                dependencies: Vec::new(),
            },
        }
    }
}

/// Create the back-end render pass for `key`.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(device: &ash::Device, key: &RenderPassKey) -> Result<vk::RenderPass> {
    let [load, stencil_load, clear, stencil_clear, store, stencil_store] = key.ops;

    let attachments: Vec<vk::AttachmentDescription> = key
        .attachments
        .iter()
        .enumerate()
        .map(|(i, attachment)| {
            let flags = if attachment.may_alias {
                vk::AttachmentDescriptionFlags::MAY_ALIAS
            } else {
                vk::AttachmentDescriptionFlags::empty()
            };

            vk::AttachmentDescription::default()
                .flags(flags)
                .format(attachment.format)
                .samples(attachment.samples.to_vk())
                .load_op(load_op(i, load, clear))
                .store_op(store_op(i, store))
                .stencil_load_op(load_op(i, stencil_load, stencil_clear))
                .stencil_store_op(store_op(i, stencil_store))
                .initial_layout(attachment.initial_layout.to_vk())
                .final_layout(attachment.final_layout.to_vk())
        })
        .collect();

    let colors: Vec<Vec<vk::AttachmentReference>> = key
        .subpasses
        .iter()
        .map(|s| s.color_refs.iter().map(|r| r.to_vk()).collect())
        .collect();
    let inputs: Vec<Vec<vk::AttachmentReference>> = key
        .subpasses
        .iter()
        .map(|s| s.input_refs.iter().map(|r| r.to_vk()).collect())
        .collect();
    let depths: Vec<Option<vk::AttachmentReference>> = key
        .subpasses
        .iter()
        .map(|s| s.depth_ref.map(AttachmentRef::to_vk))
        .collect();

    let subpasses: Vec<vk::SubpassDescription> = (0..key.subpasses.len())
        .map(|i| {
            let description = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&colors[i])
                .input_attachments(&inputs[i]);

            match &depths[i] {
                Some(depth) => description.depth_stencil_attachment(depth),
                None => description,
            }
        })
        .collect();

    let dependencies: Vec<vk::SubpassDependency> = key
        .dependencies
        .iter()
        .map(|dependency| {
            let flags = if dependency.by_region {
                vk::DependencyFlags::BY_REGION
            } else {
                vk::DependencyFlags::empty()
            };

            vk::SubpassDependency::default()
                .src_subpass(dependency.subpasses[0])
                .dst_subpass(dependency.subpasses[1])
                .src_stage_mask(dependency.stages[0].to_vk())
                .dst_stage_mask(dependency.stages[1].to_vk())
                .src_access_mask(dependency.access[0].to_vk())
                .dst_access_mask(dependency.access[1].to_vk())
                .dependency_flags(flags)
        })
        .collect();

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = device.create_render_pass(&create_info, None)?;
    Ok(render_pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;
    use crate::resources::Texture;

    fn textures() -> (HandleTable<Texture>, Handle<Texture>, Handle<Texture>) {
        let mut table = HandleTable::new();
        let a = table.insert(Texture::detached(vk::Format::B8G8R8A8_UNORM, 640, 480));
        let b = table.insert(Texture::detached(vk::Format::B8G8R8A8_UNORM, 640, 480));
        (table, a, b)
    }

    fn single_color(texture: Handle<Texture>) -> RenderpassInfo {
        let mut info = RenderpassInfo::new(1).unwrap();
        info.clear_ops = LoadStoreFlags::ATTACHMENT_0;
        info.store_ops = LoadStoreFlags::ATTACHMENT_0;
        let index = info
            .add_attachment(AttachmentInfo {
                texture,
                final_layout: ImageLayout::PresentSrc,
                may_alias: false,
            })
            .unwrap();
        info.add_color_out(0, index, ImageLayout::ColorAttachmentOptimal)
            .unwrap();
        info
    }

    fn resolve(info: &RenderpassInfo, table: &HandleTable<Texture>) -> RenderPassKey {
        RenderPassKey::resolve(info, |handle| {
            table
                .get(handle)
                .map(|t| (t.format(), t.samples(), t.layout()))
        })
        .unwrap()
    }

    #[test]
    fn load_op_prefers_clear() {
        let both = LoadStoreFlags::ATTACHMENT_1;
        assert_eq!(load_op(1, both, both), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(
            load_op(1, both, LoadStoreFlags::empty()),
            vk::AttachmentLoadOp::LOAD
        );
        assert_eq!(
            load_op(0, both, both),
            vk::AttachmentLoadOp::DONT_CARE
        );
        assert_eq!(store_op(1, both), vk::AttachmentStoreOp::STORE);
        assert_eq!(store_op(2, both), vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn swapchain_images_share_one_pass() {
        let (table, a, b) = textures();
        let key_a = resolve(&single_color(a), &table);
        let key_b = resolve(&single_color(b), &table);
        assert!(key_a.content_eq(&key_b));
        assert_eq!(key_a.content_hash(), key_b.content_hash());
        assert_eq!(key_a.color_attachment_count(0), 1);
    }

    #[test]
    fn loaded_attachments_capture_current_layout() {
        let (mut table, a, _) = textures();
        if let Some(texture) = table.get_mut(a) {
            texture.set_layout(ImageLayout::PresentSrc);
        }

        let cleared = resolve(&single_color(a), &table);
        assert_eq!(cleared.attachments[0].initial_layout, ImageLayout::Undefined);

        let mut loading = single_color(a);
        loading.clear_ops = LoadStoreFlags::empty();
        loading.load_ops = LoadStoreFlags::ATTACHMENT_0;
        let loaded = resolve(&loading, &table);
        assert_eq!(loaded.attachments[0].initial_layout, ImageLayout::PresentSrc);
        assert_ne!(cleared.content_hash(), loaded.content_hash());
    }

    #[test]
    fn subpass_structure_changes_the_hash() {
        let (table, a, _) = textures();
        let mut info = single_color(a);
        let base = resolve(&info, &table).content_hash();
        info.add_dependencies(&[SubpassDependency {
            subpasses: [vk::SUBPASS_EXTERNAL, 0],
            stages: [PipelineStages::COLOR_ATTACHMENT_OUTPUT; 2],
            access: [AccessFlags::empty(), AccessFlags::COLOR_ATTACHMENT_WRITE],
            by_region: false,
        }])
        .unwrap();
        assert_ne!(base, resolve(&info, &table).content_hash());
    }

    #[test]
    fn limits_are_enforced() {
        assert!(RenderpassInfo::new(0).is_err());
        assert!(RenderpassInfo::new(MAX_SUBPASSES + 1).is_err());

        let (_, a, _) = textures();
        let mut info = RenderpassInfo::new(1).unwrap();
        for _ in 0..MAX_ATTACHMENTS {
            info.add_attachment(AttachmentInfo {
                texture: a,
                final_layout: ImageLayout::General,
                may_alias: false,
            })
            .unwrap();
        }
        assert!(info
            .add_attachment(AttachmentInfo {
                texture: a,
                final_layout: ImageLayout::General,
                may_alias: false,
            })
            .is_err());
        assert!(info.add_color_out(1, 0, ImageLayout::General).is_err());
    }

    #[test]
    fn unknown_texture_is_an_invalid_handle() {
        let (_, a, _) = textures();
        let empty = HandleTable::<Texture>::new();
        let result = RenderPassKey::resolve(&single_color(a), |h| {
            empty.get(h).map(|t| (t.format(), t.samples(), t.layout()))
        });
        assert!(matches!(result, Err(GpuError::InvalidHandle(_))));
    }
}
