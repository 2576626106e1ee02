//! Textures and swapchain backbuffers.

use ash::vk;
use bitflags::bitflags;

use crate::error::{GpuError, Result};
use crate::flags::{ImageLayout, SampleCount};
use crate::handle::{GpuObject, ObjectHeader, ObjectKind};
use crate::memory::MemoryAllocation;

/// Image dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureKind {
    #[default]
    D2,
    D3,
    Cube,
}

impl TextureKind {
    fn image_type(self) -> vk::ImageType {
        match self {
            Self::D2 | Self::Cube => vk::ImageType::TYPE_2D,
            Self::D3 => vk::ImageType::TYPE_3D,
        }
    }

    fn view_type(self) -> vk::ImageViewType {
        match self {
            Self::D2 => vk::ImageViewType::TYPE_2D,
            Self::D3 => vk::ImageViewType::TYPE_3D,
            Self::Cube => vk::ImageViewType::CUBE,
        }
    }

    pub(crate) fn layers(self) -> u32 {
        match self {
            Self::Cube => 6,
            Self::D2 | Self::D3 => 1,
        }
    }
}

bitflags! {
    /// How a texture is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const TRANSFER_SRC = 0x01;
        const TRANSFER_DST = 0x02;
        const SAMPLED = 0x04;
        const COLOR_ATTACHMENT = 0x10;
        const DEPTH_ATTACHMENT = 0x20;
        const INPUT_ATTACHMENT = 0x80;
    }
}

impl TextureUsage {
    /// Back-end value.
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        vk::ImageUsageFlags::from_raw(self.bits())
    }
}

/// Description of a texture to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub usage: TextureUsage,
    pub samples: SampleCount,
}

impl TextureDesc {
    /// 2D texture with a single sample.
    pub fn d2(format: vk::Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            kind: TextureKind::D2,
            format,
            width,
            height,
            depth: 1,
            usage,
            samples: SampleCount::X1,
        }
    }

    /// Set the sample count.
    pub fn with_samples(mut self, samples: SampleCount) -> Self {
        self.samples = samples;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "texture extent {}x{}x{} must be non-zero",
                self.width, self.height, self.depth
            )));
        }
        if self.kind == TextureKind::Cube && self.width != self.height {
            return Err(GpuError::InvalidArgument("cube faces must be square".into()));
        }
        if self.kind != TextureKind::D3 && self.depth != 1 {
            return Err(GpuError::InvalidArgument("only 3D textures have depth".into()));
        }
        if self.usage.is_empty() {
            return Err(GpuError::InvalidArgument("texture usage must be set".into()));
        }
        Ok(())
    }

    /// Bytes of pixel data covering every layer, if the format has a known
    /// texel size.
    pub fn data_size(&self) -> Option<u64> {
        let texel = texel_size(self.format)?;
        Some(
            u64::from(self.width)
                * u64::from(self.height)
                * u64::from(self.depth)
                * u64::from(self.kind.layers())
                * u64::from(texel),
        )
    }
}

/// Aspect covered by views of `format`.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R16G16_SFLOAT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Image, view and optional sampler with tracked layout.
#[derive(Debug)]
pub struct Texture {
    pub(crate) header: ObjectHeader,
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) sampler: vk::Sampler,
    pub(crate) allocation: Option<MemoryAllocation>,
    pub(crate) desc: TextureDesc,
    pub(crate) layout: ImageLayout,
    pub(crate) is_swapchain: bool,
}

impl GpuObject for Texture {
    const KIND: ObjectKind = ObjectKind::Texture;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl Texture {
    /// Back-end image.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// View covering every layer.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler, null for textures without `SAMPLED` usage.
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Pixel format.
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Sample count.
    pub fn samples(&self) -> SampleCount {
        self.desc.samples
    }

    /// Creation parameters.
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Width and height.
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }

    /// Layout the image is in once all recorded work completes.
    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Record a layout change performed outside the command list.
    pub fn set_layout(&mut self, layout: ImageLayout) {
        self.layout = layout;
    }

    /// Whether the image belongs to a swapchain.
    pub fn is_swapchain(&self) -> bool {
        self.is_swapchain
    }

    /// Subresource range covering the whole image.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_for_format(self.desc.format))
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(self.desc.kind.layers())
    }

    pub(crate) fn swapchain_image(
        header: ObjectHeader,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            header,
            image,
            view,
            sampler: vk::Sampler::null(),
            allocation: None,
            desc: TextureDesc::d2(
                format,
                extent.width,
                extent.height,
                TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
            ),
            layout: ImageLayout::Undefined,
            is_swapchain: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            header: ObjectHeader::default(),
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: None,
            desc: TextureDesc::d2(format, width, height, TextureUsage::COLOR_ATTACHMENT),
            layout: ImageLayout::Undefined,
            is_swapchain: false,
        }
    }
}

/// Create an image without memory.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_image(device: &ash::Device, desc: &TextureDesc) -> Result<vk::Image> {
    let flags = if desc.kind == TextureKind::Cube {
        vk::ImageCreateFlags::CUBE_COMPATIBLE
    } else {
        vk::ImageCreateFlags::empty()
    };

    let create_info = vk::ImageCreateInfo::default()
        .flags(flags)
        .image_type(desc.kind.image_type())
        .format(desc.format)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        })
        .mip_levels(1)
        .array_layers(desc.kind.layers())
        .samples(desc.samples.to_vk())
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(desc.usage.to_vk())
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = device.create_image(&create_info, None)?;
    Ok(image)
}

/// Create a view over every layer of `image`.
///
/// # Safety
/// The device and image must be valid.
pub(crate) unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    kind: TextureKind,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(kind.view_type())
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_for_format(format))
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(kind.layers()),
        );

    let view = device.create_image_view(&view_info, None)?;
    Ok(view)
}

/// Create a linear, repeating sampler.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);

    let sampler = device.create_sampler(&create_info, None)?;
    Ok(sampler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn data_size_covers_every_layer() {
        let mut desc = TextureDesc::d2(vk::Format::R8G8B8A8_UNORM, 4, 2, TextureUsage::SAMPLED);
        assert_eq!(desc.data_size(), Some(32));

        desc.kind = TextureKind::Cube;
        desc.height = 4;
        assert_eq!(desc.data_size(), Some(4 * 4 * 4 * 6));

        desc.format = vk::Format::BC1_RGB_UNORM_BLOCK;
        assert_eq!(desc.data_size(), None);
    }

    #[test]
    fn invalid_descriptions_are_rejected() {
        let base = TextureDesc::d2(vk::Format::R8_UNORM, 8, 8, TextureUsage::SAMPLED);
        assert!(base.validate().is_ok());
        assert!(TextureDesc { width: 0, ..base }.validate().is_err());
        assert!(TextureDesc { depth: 2, ..base }.validate().is_err());
        assert!(TextureDesc {
            kind: TextureKind::Cube,
            height: 4,
            ..base
        }
        .validate()
        .is_err());
        assert!(TextureDesc {
            usage: TextureUsage::empty(),
            ..base
        }
        .validate()
        .is_err());
    }

    #[test]
    fn usage_matches_vulkan_bits() {
        assert_eq!(
            (TextureUsage::SAMPLED | TextureUsage::DEPTH_ATTACHMENT).to_vk(),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
        assert_eq!(
            TextureUsage::INPUT_ATTACHMENT.to_vk(),
            vk::ImageUsageFlags::INPUT_ATTACHMENT
        );
    }
}
