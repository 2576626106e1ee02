//! Vertex input layouts.

use ash::vk;
use kestrel_core::limits::MAX_VERTEX_BINDINGS;

use crate::error::{GpuError, Result};
use crate::handle::{GpuObject, ObjectHeader, ObjectKind};

/// Vertex attribute format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    UInt4,
    UByte4,
    UByte4Norm,
    Half2,
    Half4,
}

impl VertexFormat {
    /// Back-end value.
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Float => vk::Format::R32_SFLOAT,
            Self::Float2 => vk::Format::R32G32_SFLOAT,
            Self::Float3 => vk::Format::R32G32B32_SFLOAT,
            Self::Float4 => vk::Format::R32G32B32A32_SFLOAT,
            Self::Int => vk::Format::R32_SINT,
            Self::Int2 => vk::Format::R32G32_SINT,
            Self::Int3 => vk::Format::R32G32B32_SINT,
            Self::Int4 => vk::Format::R32G32B32A32_SINT,
            Self::UInt => vk::Format::R32_UINT,
            Self::UInt4 => vk::Format::R32G32B32A32_UINT,
            Self::UByte4 => vk::Format::R8G8B8A8_UINT,
            Self::UByte4Norm => vk::Format::R8G8B8A8_UNORM,
            Self::Half2 => vk::Format::R16G16_SFLOAT,
            Self::Half4 => vk::Format::R16G16B16A16_SFLOAT,
        }
    }

    /// Size in bytes.
    pub fn size(self) -> u32 {
        match self {
            Self::Float | Self::Int | Self::UInt | Self::UByte4 | Self::UByte4Norm | Self::Half2 => 4,
            Self::Float2 | Self::Int2 | Self::Half4 => 8,
            Self::Float3 | Self::Int3 => 12,
            Self::Float4 | Self::Int4 | Self::UInt4 => 16,
        }
    }
}

/// Rate at which a binding advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

impl VertexInputRate {
    /// Back-end value.
    pub fn to_vk(self) -> vk::VertexInputRate {
        match self {
            Self::Vertex => vk::VertexInputRate::VERTEX,
            Self::Instance => vk::VertexInputRate::INSTANCE,
        }
    }
}

/// One vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

/// One attribute read from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Builder for [`VertexLayoutSet`].
#[derive(Debug, Clone, Default)]
pub struct VertexLayoutBuilder {
    bindings: Vec<VertexBinding>,
    attributes: Vec<VertexAttribute>,
}

impl VertexLayoutBuilder {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(mut self, binding: u32, stride: u32, input_rate: VertexInputRate) -> Self {
        self.bindings.push(VertexBinding {
            binding,
            stride,
            input_rate,
        });
        self
    }

    /// Add an attribute.
    pub fn attribute(mut self, location: u32, binding: u32, format: VertexFormat, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            binding,
            format,
            offset,
        });
        self
    }

    /// Validate the layout.
    pub fn build(self) -> Result<(Vec<VertexBinding>, Vec<VertexAttribute>)> {
        if self.bindings.len() > MAX_VERTEX_BINDINGS {
            return Err(GpuError::InvalidArgument(format!(
                "at most {MAX_VERTEX_BINDINGS} vertex bindings"
            )));
        }

        for (i, binding) in self.bindings.iter().enumerate() {
            if binding.binding as usize >= MAX_VERTEX_BINDINGS {
                return Err(GpuError::InvalidArgument(format!(
                    "vertex binding index {} out of range",
                    binding.binding
                )));
            }
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(GpuError::InvalidArgument(format!(
                    "vertex binding {} declared twice",
                    binding.binding
                )));
            }
        }

        for (i, attribute) in self.attributes.iter().enumerate() {
            let binding = self
                .bindings
                .iter()
                .find(|b| b.binding == attribute.binding)
                .ok_or_else(|| {
                    GpuError::InvalidArgument(format!(
                        "attribute {} reads undeclared binding {}",
                        attribute.location, attribute.binding
                    ))
                })?;
            if binding.stride != 0 && attribute.offset + attribute.format.size() > binding.stride {
                return Err(GpuError::InvalidArgument(format!(
                    "attribute {} overruns stride {}",
                    attribute.location, binding.stride
                )));
            }
            if self.attributes[..i].iter().any(|a| a.location == attribute.location) {
                return Err(GpuError::InvalidArgument(format!(
                    "attribute location {} declared twice",
                    attribute.location
                )));
            }
        }

        Ok((self.bindings, self.attributes))
    }
}

/// Vertex bindings and attributes consumed by a pipeline.
#[derive(Debug)]
pub struct VertexLayoutSet {
    pub(crate) header: ObjectHeader,
    pub(crate) bindings: Vec<VertexBinding>,
    pub(crate) attributes: Vec<VertexAttribute>,
}

impl GpuObject for VertexLayoutSet {
    const KIND: ObjectKind = ObjectKind::VertexLayoutSet;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl VertexLayoutSet {
    /// Declared bindings.
    pub fn bindings(&self) -> &[VertexBinding] {
        &self.bindings
    }

    /// Declared attributes.
    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub(crate) fn vk_bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default()
                    .binding(b.binding)
                    .stride(b.stride)
                    .input_rate(b.input_rate.to_vk())
            })
            .collect()
    }

    pub(crate) fn vk_attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(a.binding)
                    .format(a.format.to_vk())
                    .offset(a.offset)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_color_layout_builds() {
        let (bindings, attributes) = VertexLayoutBuilder::new()
            .binding(0, 24, VertexInputRate::Vertex)
            .attribute(0, 0, VertexFormat::Float3, 0)
            .attribute(1, 0, VertexFormat::Float3, 12)
            .build()
            .unwrap();

        let set = VertexLayoutSet {
            header: ObjectHeader::default(),
            bindings,
            attributes,
        };
        let vk_attributes = set.vk_attributes();
        assert_eq!(vk_attributes[1].offset, 12);
        assert_eq!(vk_attributes[1].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(set.vk_bindings()[0].stride, 24);
    }

    #[test]
    fn inconsistent_layouts_are_rejected() {
        let missing_binding = VertexLayoutBuilder::new().attribute(0, 1, VertexFormat::Float, 0);
        assert!(missing_binding.build().is_err());

        let overrun = VertexLayoutBuilder::new()
            .binding(0, 12, VertexInputRate::Vertex)
            .attribute(0, 0, VertexFormat::Float4, 0);
        assert!(overrun.build().is_err());

        let duplicate = VertexLayoutBuilder::new()
            .binding(0, 12, VertexInputRate::Vertex)
            .binding(0, 16, VertexInputRate::Instance);
        assert!(duplicate.build().is_err());

        let out_of_range =
            VertexLayoutBuilder::new().binding(MAX_VERTEX_BINDINGS as u32, 4, VertexInputRate::Vertex);
        assert!(out_of_range.build().is_err());
    }

    #[test]
    fn format_sizes_match_back_end_formats() {
        assert_eq!(VertexFormat::UByte4Norm.size(), 4);
        assert_eq!(VertexFormat::Float4.size(), 16);
        assert_eq!(VertexFormat::Half4.to_vk(), vk::Format::R16G16B16A16_SFLOAT);
    }
}
