//! Framebuffers keyed by their attachment textures.

use ash::vk;
use kestrel_core::limits::MAX_ATTACHMENTS;
use kestrel_core::ContentHasher;

use crate::cache::CacheKey;
use crate::error::{GpuError, Result};
use crate::handle::{GpuObject, Handle, ObjectHeader, ObjectKind};
use crate::renderpass::RenderPass;
use crate::resources::Texture;

/// Cache key of a framebuffer.
///
/// Attachments are cleared to `None` when their texture is destroyed, after
/// which the key matches nothing and the framebuffer ages out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferKey {
    pub renderpass: Handle<RenderPass>,
    pub attachments: Vec<Option<Handle<Texture>>>,
    pub width: u32,
    pub height: u32,
}

impl FramebufferKey {
    /// Key for `attachments` used with `renderpass`; the extent is that of
    /// the first attachment.
    pub fn new(
        renderpass: Handle<RenderPass>,
        attachments: &[Handle<Texture>],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if attachments.is_empty() || attachments.len() > MAX_ATTACHMENTS {
            return Err(GpuError::InvalidArgument(format!(
                "framebuffer needs 1..={MAX_ATTACHMENTS} attachments, got {}",
                attachments.len()
            )));
        }

        Ok(Self {
            renderpass,
            attachments: attachments.iter().copied().map(Some).collect(),
            width,
            height,
        })
    }

    /// Clear every reference to `texture`, returning whether any matched.
    pub fn forget_texture(&mut self, texture: Handle<Texture>) -> bool {
        let mut changed = false;
        for slot in &mut self.attachments {
            if *slot == Some(texture) {
                *slot = None;
                changed = true;
            }
        }
        changed
    }

    /// Whether any attachment was cleared.
    pub fn is_detached(&self) -> bool {
        self.attachments.iter().any(Option::is_none)
    }
}

impl CacheKey for FramebufferKey {
    fn content_hash(&self) -> u64 {
        let mut hasher = ContentHasher::new();
        hasher.add_u32(self.width);
        hasher.add_u32(self.height);
        hasher.add_id(self.renderpass.to_bits());
        for attachment in &self.attachments {
            hasher.add_id(attachment.map_or(0, Handle::to_bits));
        }
        hasher.finish()
    }

    fn content_eq(&self, other: &Self) -> bool {
        !self.is_detached()
            && self.renderpass == other.renderpass
            && self.attachments == other.attachments
            && (self.width, self.height) == (other.width, other.height)
    }
}

/// Cached framebuffer object.
#[derive(Debug)]
pub struct Framebuffer {
    pub(crate) header: ObjectHeader,
    pub(crate) handle: vk::Framebuffer,
    pub(crate) attachments: Vec<Handle<Texture>>,
    pub(crate) extent: vk::Extent2D,
}

impl GpuObject for Framebuffer {
    const KIND: ObjectKind = ObjectKind::Framebuffer;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl Framebuffer {
    /// Back-end handle.
    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    /// Attachment textures in order.
    pub fn attachments(&self) -> &[Handle<Texture>] {
        &self.attachments
    }

    /// Pixel extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Create a framebuffer over `views`.
///
/// # Safety
/// The device, render pass and image views must be valid.
pub unsafe fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let create_info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(views)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    let framebuffer = device.create_framebuffer(&create_info, None)?;
    Ok(framebuffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;

    fn setup() -> (Handle<RenderPass>, Handle<Texture>, Handle<Texture>) {
        let mut passes = HandleTable::new();
        let pass = passes.insert(RenderPass::detached());
        let mut textures = HandleTable::new();
        let a = textures.insert(Texture::detached(vk::Format::R8G8B8A8_UNORM, 4, 4));
        let b = textures.insert(Texture::detached(vk::Format::D32_SFLOAT, 4, 4));
        (pass, a, b)
    }

    #[test]
    fn equality_is_per_attachment_id() {
        let (pass, a, b) = setup();
        let ab = FramebufferKey::new(pass, &[a, b], 4, 4).unwrap();
        let ab2 = FramebufferKey::new(pass, &[a, b], 4, 4).unwrap();
        let ba = FramebufferKey::new(pass, &[b, a], 4, 4).unwrap();

        assert!(ab.content_eq(&ab2));
        assert_eq!(ab.content_hash(), ab2.content_hash());
        assert!(!ab.content_eq(&ba));
        assert_ne!(ab.content_hash(), ba.content_hash());
    }

    #[test]
    fn forgetting_a_texture_detaches_the_key() {
        let (pass, a, b) = setup();
        let mut key = FramebufferKey::new(pass, &[a, b], 4, 4).unwrap();
        let lookup = key.clone();

        assert!(key.forget_texture(a));
        assert!(!key.forget_texture(a));
        assert_eq!(key.attachments[0], None);
        assert!(key.is_detached());
        assert!(!key.content_eq(&lookup));
    }

    #[test]
    fn attachment_count_is_bounded() {
        let (pass, a, _) = setup();
        assert!(FramebufferKey::new(pass, &[], 4, 4).is_err());
        assert!(FramebufferKey::new(pass, &[a; MAX_ATTACHMENTS + 1], 4, 4).is_err());
    }
}
