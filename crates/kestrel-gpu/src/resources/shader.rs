//! Shader modules, programs and descriptor set layouts.

use ash::vk;
use kestrel_core::limits::{MAX_DESCRIPTOR_SETS, MAX_LAYOUT_BINDINGS, MAX_SHADER_STAGES};

use crate::error::{GpuError, Result};
use crate::flags::ShaderStages;
use crate::handle::{GpuObject, Handle, ObjectHeader, ObjectKind};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Compiled shader stage.
#[derive(Debug)]
pub struct ShaderModule {
    pub(crate) header: ObjectHeader,
    pub(crate) handle: vk::ShaderModule,
    pub(crate) stage: ShaderStages,
}

impl GpuObject for ShaderModule {
    const KIND: ObjectKind = ObjectKind::ShaderModule;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl ShaderModule {
    /// Back-end handle.
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Stage this module runs in.
    pub fn stage(&self) -> ShaderStages {
        self.stage
    }
}

/// Check that `code` looks like a SPIR-V module for a single stage.
pub(crate) fn validate_spirv(stage: ShaderStages, code: &[u32]) -> Result<()> {
    if stage.bits().count_ones() != 1 {
        return Err(GpuError::ShaderLoadFailed(format!(
            "module needs exactly one stage, got {stage:?}"
        )));
    }
    match code.first() {
        Some(&SPIRV_MAGIC) if code.len() >= 5 => Ok(()),
        Some(_) => Err(GpuError::ShaderLoadFailed("missing SPIR-V header".into())),
        None => Err(GpuError::ShaderLoadFailed("empty SPIR-V".into())),
    }
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&create_info, None)
        .map_err(|e| GpuError::ShaderLoadFailed(e.to_string()))
}

/// Descriptor types a layout binding can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    ImageSampler,
}

impl DescriptorKind {
    /// Back-end value.
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::ImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }

    pub(crate) fn tag(self) -> u32 {
        match self {
            Self::UniformBuffer => 0,
            Self::ImageSampler => 1,
        }
    }
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Descriptors needed to allocate one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorDemand {
    pub textures: u32,
    pub uniforms: u32,
}

/// Layout metadata of one descriptor set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutInfo {
    pub bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutInfo {
    /// Binding with index `binding`.
    pub fn find(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Descriptor counts per type.
    pub fn demand(&self) -> DescriptorDemand {
        self.bindings
            .iter()
            .fold(DescriptorDemand::default(), |mut demand, binding| {
                match binding.kind {
                    DescriptorKind::UniformBuffer => demand.uniforms += binding.count,
                    DescriptorKind::ImageSampler => demand.textures += binding.count,
                }
                demand
            })
    }

    fn add(&mut self, binding: LayoutBinding) -> Result<()> {
        if binding.count == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "binding {} has no descriptors",
                binding.binding
            )));
        }
        if self.find(binding.binding).is_some() {
            return Err(GpuError::InvalidArgument(format!(
                "binding {} declared twice",
                binding.binding
            )));
        }
        if self.bindings.len() >= MAX_LAYOUT_BINDINGS {
            return Err(GpuError::InvalidArgument(format!(
                "descriptor sets hold at most {MAX_LAYOUT_BINDINGS} bindings"
            )));
        }
        self.bindings.push(binding);
        Ok(())
    }
}

/// Create the back-end layout for `info`.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_set_layout(
    device: &ash::Device,
    info: &DescriptorSetLayoutInfo,
) -> Result<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = info
        .bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding.binding)
                .descriptor_type(binding.kind.to_vk())
                .descriptor_count(binding.count)
                .stage_flags(binding.stages.to_vk())
        })
        .collect();

    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    device
        .create_descriptor_set_layout(&layout_info, None)
        .map_err(|e| GpuError::ShaderLinkFailed(e.to_string()))
}

/// Collects the stages and resource bindings of a program.
#[derive(Debug, Clone, Default)]
pub struct ShaderProgramBuilder {
    pub(crate) modules: Vec<Handle<ShaderModule>>,
    sets: Vec<DescriptorSetLayoutInfo>,
    error: Option<GpuError>,
}

impl ShaderProgramBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stage.
    pub fn module(mut self, module: Handle<ShaderModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Declare `count` uniform buffers at `set`/`binding`.
    pub fn uniform_buffer(self, set: u32, binding: u32, count: u32, stages: ShaderStages) -> Self {
        self.binding(set, binding, DescriptorKind::UniformBuffer, count, stages)
    }

    /// Declare `count` combined image samplers at `set`/`binding`.
    pub fn image_sampler(self, set: u32, binding: u32, count: u32, stages: ShaderStages) -> Self {
        self.binding(set, binding, DescriptorKind::ImageSampler, count, stages)
    }

    fn binding(
        mut self,
        set: u32,
        binding: u32,
        kind: DescriptorKind,
        count: u32,
        stages: ShaderStages,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }

        let set = set as usize;
        if set >= MAX_DESCRIPTOR_SETS {
            self.error = Some(GpuError::InvalidArgument(format!(
                "programs use at most {MAX_DESCRIPTOR_SETS} descriptor sets"
            )));
            return self;
        }

        if self.sets.len() <= set {
            self.sets.resize_with(set + 1, DescriptorSetLayoutInfo::default);
        }

        let layout_binding = LayoutBinding {
            binding,
            kind,
            count,
            stages,
        };
        if let Err(err) = self.sets[set].add(layout_binding) {
            self.error = Some(err);
        }
        self
    }

    /// Validate and return the per-set layouts.
    pub(crate) fn layouts(&self) -> Result<&[DescriptorSetLayoutInfo]> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.modules.is_empty() || self.modules.len() > MAX_SHADER_STAGES {
            return Err(GpuError::InvalidArgument(format!(
                "programs need 1..={MAX_SHADER_STAGES} modules, got {}",
                self.modules.len()
            )));
        }
        Ok(&self.sets)
    }
}

/// Linked shader stages with their pipeline layout.
#[derive(Debug)]
pub struct ShaderProgram {
    pub(crate) header: ObjectHeader,
    pub(crate) modules: Vec<Handle<ShaderModule>>,
    pub(crate) stages: Vec<(ShaderStages, vk::ShaderModule)>,
    pub(crate) layouts: Vec<DescriptorSetLayoutInfo>,
    pub(crate) set_layouts: Vec<vk::DescriptorSetLayout>,
    pub(crate) pipeline_layout: vk::PipelineLayout,
}

impl GpuObject for ShaderProgram {
    const KIND: ObjectKind = ObjectKind::ShaderProgram;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl ShaderProgram {
    /// Modules attached to this program.
    pub fn modules(&self) -> &[Handle<ShaderModule>] {
        &self.modules
    }

    /// Layout metadata of set `index`.
    pub fn layout_info(&self, index: usize) -> Option<&DescriptorSetLayoutInfo> {
        self.layouts.get(index)
    }

    /// Back-end layout of set `index`.
    pub fn set_layout(&self, index: usize) -> Option<vk::DescriptorSetLayout> {
        self.set_layouts.get(index).copied()
    }

    /// Back-end pipeline layout.
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}

/// Create the pipeline layout over `set_layouts`.
///
/// # Safety
/// The device and layouts must be valid.
pub(crate) unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::ShaderLinkFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;

    fn module() -> Handle<ShaderModule> {
        let mut table = HandleTable::new();
        table.insert(ShaderModule {
            header: ObjectHeader::default(),
            handle: vk::ShaderModule::null(),
            stage: ShaderStages::VERTEX,
        })
    }

    #[test]
    fn spirv_header_is_checked() {
        let header = [SPIRV_MAGIC, 0x0001_0600, 0, 1, 0];
        assert!(validate_spirv(ShaderStages::FRAGMENT, &header).is_ok());
        assert!(validate_spirv(ShaderStages::FRAGMENT, &[]).is_err());
        assert!(validate_spirv(ShaderStages::FRAGMENT, &[1, 2, 3, 4, 5]).is_err());
        assert!(validate_spirv(ShaderStages::ALL_GRAPHICS, &header).is_err());
    }

    #[test]
    fn builder_groups_bindings_by_set() {
        let builder = ShaderProgramBuilder::new()
            .module(module())
            .uniform_buffer(0, 0, 1, ShaderStages::VERTEX)
            .image_sampler(2, 1, 4, ShaderStages::FRAGMENT)
            .uniform_buffer(2, 0, 2, ShaderStages::ALL_GRAPHICS);

        let layouts = builder.layouts().unwrap();
        assert_eq!(layouts.len(), 3);
        assert!(layouts[1].bindings.is_empty());
        assert_eq!(
            layouts[2].demand(),
            DescriptorDemand {
                textures: 4,
                uniforms: 2
            }
        );
        assert_eq!(
            layouts[2].find(1).map(|b| b.kind),
            Some(DescriptorKind::ImageSampler)
        );
    }

    #[test]
    fn builder_reports_first_error() {
        let too_many_sets = ShaderProgramBuilder::new()
            .module(module())
            .uniform_buffer(MAX_DESCRIPTOR_SETS as u32, 0, 1, ShaderStages::VERTEX);
        assert!(matches!(
            too_many_sets.layouts(),
            Err(GpuError::InvalidArgument(_))
        ));

        let duplicate = ShaderProgramBuilder::new()
            .module(module())
            .uniform_buffer(0, 3, 1, ShaderStages::VERTEX)
            .image_sampler(0, 3, 1, ShaderStages::FRAGMENT);
        assert!(duplicate.layouts().is_err());

        let mut crowded = ShaderProgramBuilder::new().module(module());
        for binding in 0..=MAX_LAYOUT_BINDINGS as u32 {
            crowded = crowded.uniform_buffer(0, binding, 1, ShaderStages::VERTEX);
        }
        assert!(crowded.layouts().is_err());

        assert!(ShaderProgramBuilder::new().layouts().is_err());
    }
}
