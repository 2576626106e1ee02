//! The GPU device and its builder.
//!
//! [`GpuDevice`] owns every back-end object:
//! - Handle tables for explicitly created resources and cached objects
//! - The object caches and the list of every cached object
//! - The memory pool, staging ring and descriptor pool chain
//! - The release queue that delays destruction past in-flight frames
//! - Window surfaces with their swapchains

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::adapter::{
    create_instance, enumerate_adapters, select_adapter, AdapterInfo, PresentTarget,
};
use crate::cache::{CachedResources, ObjectCache};
use crate::config::DeviceConfig;
use crate::descriptor_pool::DescriptorPoolChain;
use crate::descriptor_set::{
    plan_writes, write_descriptor_set, DescriptorSet, DescriptorSetInfo, DescriptorSetKey,
};
use crate::error::{GpuError, Result};
use crate::flags::{ImageLayout, ShaderStages};
use crate::frame::FrameInfo;
use crate::framebuffer::{Framebuffer, FramebufferKey};
use crate::handle::{GpuObject, Handle, HandleTable, ObjectIds, ObjectKind, RawHandle};
use crate::memory::{find_memory_type, DevicePageSource, MemoryAllocation, MemoryPool};
use crate::pipeline::Pipeline;
use crate::release::{ReleaseQueue, ReleasedObject};
use crate::renderpass::{RenderPass, RenderPassKey};
use crate::resources::{
    aspect_for_format, create_buffer, create_image, create_pipeline_layout, create_sampler,
    create_set_layout, create_shader_module, create_view, validate_spirv, Buffer, BufferDesc,
    MemoryProperties, ShaderModule, ShaderProgram, ShaderProgramBuilder, Texture, TextureDesc,
    TextureUsage, VertexLayoutBuilder, VertexLayoutSet,
};
use crate::staging::StagingRing;
use crate::state::PipelineCacheKey;
use crate::swapchain::WindowSurface;

/// Sizes of the object caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub render_passes: usize,
    pub framebuffers: usize,
    pub pipelines: usize,
    pub descriptor_sets: usize,
    /// Pipelines created since the device was built.
    pub pipeline_creations: u64,
}

/// One cache per implicitly created object kind.
#[derive(Default)]
pub(crate) struct ObjectCaches {
    pub render_passes: ObjectCache<RenderPassKey, RenderPass>,
    pub framebuffers: ObjectCache<FramebufferKey, Framebuffer>,
    pub pipelines: ObjectCache<PipelineCacheKey, Pipeline>,
    pub descriptor_sets: ObjectCache<DescriptorSetKey, DescriptorSet>,
}

/// Vulkan device with every object created through it.
pub struct GpuDevice {
    // Entry must outlive the instance.
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface_loader: Option<ash::khr::surface::Instance>,
    pub(crate) swapchain_loader: Option<ash::khr::swapchain::Device>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) adapter: AdapterInfo,
    pub(crate) device: ash::Device,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) config: DeviceConfig,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub(crate) memory: MemoryPool,
    pub(crate) staging: StagingRing,
    pub(crate) descriptor_pools: DescriptorPoolChain,
    pub(crate) release_queue: ReleaseQueue<ReleasedObject>,

    pub(crate) ids: ObjectIds,
    pub(crate) buffers: HandleTable<Buffer>,
    pub(crate) textures: HandleTable<Texture>,
    pub(crate) shader_modules: HandleTable<ShaderModule>,
    pub(crate) programs: HandleTable<ShaderProgram>,
    pub(crate) vertex_layouts: HandleTable<VertexLayoutSet>,
    pub(crate) descriptor_sets: HandleTable<DescriptorSet>,
    pub(crate) render_passes: HandleTable<RenderPass>,
    pub(crate) framebuffers: HandleTable<Framebuffer>,
    pub(crate) pipelines: HandleTable<Pipeline>,
    pub(crate) surfaces: HandleTable<WindowSurface>,

    pub(crate) caches: ObjectCaches,
    pub(crate) cached: CachedResources,
    pub(crate) frame: FrameInfo,
    pub(crate) pipeline_creations: u64,
}

impl GpuDevice {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the selected adapter.
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// Get the configuration the device was built with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Get the graphics queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Frame counter, slot index and in-flight limit.
    pub fn frame_info(&self) -> FrameInfo {
        self.frame
    }

    /// Sizes of the object caches.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            render_passes: self.caches.render_passes.len(),
            framebuffers: self.caches.framebuffers.len(),
            pipelines: self.caches.pipelines.len(),
            descriptor_sets: self.caches.descriptor_sets.len(),
            pipeline_creations: self.pipeline_creations,
        }
    }

    /// Objects waiting in the release queue.
    pub fn pending_releases(&self) -> usize {
        self.release_queue.len()
    }

    /// Look up a buffer.
    pub fn buffer(&self, handle: Handle<Buffer>) -> Option<&Buffer> {
        self.buffers.get(handle)
    }

    /// Look up a buffer mutably, e.g. to write a mapped buffer.
    pub fn buffer_mut(&mut self, handle: Handle<Buffer>) -> Option<&mut Buffer> {
        self.buffers.get_mut(handle)
    }

    /// Look up a texture.
    pub fn texture(&self, handle: Handle<Texture>) -> Option<&Texture> {
        self.textures.get(handle)
    }

    /// Look up a shader program.
    pub fn program(&self, handle: Handle<ShaderProgram>) -> Option<&ShaderProgram> {
        self.programs.get(handle)
    }

    /// Look up a window surface.
    pub fn surface(&self, handle: Handle<WindowSurface>) -> Option<&WindowSurface> {
        self.surfaces.get(handle)
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    fn issue<T: GpuObject>(&mut self) -> crate::handle::ObjectHeader {
        let mut header = self.ids.issue(T::KIND);
        header.last_frame_used = self.frame.stamp();
        header
    }

    fn allocate_memory(
        &mut self,
        requirements: vk::MemoryRequirements,
        memory: MemoryProperties,
    ) -> Result<MemoryAllocation> {
        let host_visible = memory.contains(MemoryProperties::HOST_VISIBLE);
        let required = memory & (MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE);
        let memory_type = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            required.to_vk(),
            memory.to_vk(),
        )
        .ok_or(GpuError::OutOfDeviceMemory)?;

        self.memory.alloc(
            &mut DevicePageSource::new(&self.device),
            requirements.size,
            requirements.alignment,
            memory_type,
            host_visible,
        )
    }

    /// Create a buffer, optionally filled with `data`.
    ///
    /// Host-visible buffers are persistently mapped and written directly;
    /// device-local ones are filled through the staging ring.
    pub fn create_buffer(&mut self, desc: &BufferDesc, data: Option<&[u8]>) -> Result<Handle<Buffer>> {
        desc.validate()?;
        if let Some(data) = data {
            if data.len() as u64 > desc.size {
                return Err(GpuError::InvalidArgument(format!(
                    "{} bytes of data for a {} byte buffer",
                    data.len(),
                    desc.size
                )));
            }
        }

        let buffer = unsafe { create_buffer(&self.device, desc)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocate_memory(requirements, desc.memory) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory, allocation.offset)?;
        }

        let header = self.issue::<Buffer>();
        let handle = self.buffers.insert(Buffer {
            header,
            handle: buffer,
            allocation,
            desc: *desc,
        });

        if let Some(data) = data {
            self.upload_buffer(handle, 0, data)?;
        }
        Ok(handle)
    }

    /// Write `data` into `buffer` at `offset`, directly when mapped and
    /// through the staging ring otherwise.
    pub fn upload_buffer(&mut self, buffer: Handle<Buffer>, offset: u64, data: &[u8]) -> Result<()> {
        let target = self
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{buffer:?}")))?;
        if target.is_mapped() {
            return target.write_bytes(offset, data);
        }
        if offset + data.len() as u64 > target.size() {
            return Err(GpuError::InvalidArgument(format!(
                "upload of {} bytes at {offset} overruns a {} byte buffer",
                data.len(),
                target.size()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let dst = target.handle;
        unsafe {
            let region = self.staging.stage(&self.device, data.len() as u64, 16)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), region.host.as_ptr(), data.len());
            let copy = vk::BufferCopy {
                src_offset: region.offset,
                dst_offset: offset,
                size: data.len() as u64,
            };
            self.device
                .cmd_copy_buffer(region.cmd, region.buffer, dst, &[copy]);
        }
        Ok(())
    }

    /// Create a texture, optionally uploading `pixels` covering every layer.
    ///
    /// Uploaded textures end in `ShaderReadOnlyOptimal` when sampled and in
    /// `TransferDstOptimal` otherwise.
    pub fn create_texture(&mut self, desc: &TextureDesc, pixels: Option<&[u8]>) -> Result<Handle<Texture>> {
        desc.validate()?;
        let mut desc = *desc;
        if let Some(pixels) = pixels {
            let expected = desc.data_size().ok_or_else(|| {
                GpuError::InvalidArgument(format!("cannot upload to format {:?}", desc.format))
            })?;
            if pixels.len() as u64 != expected {
                return Err(GpuError::InvalidArgument(format!(
                    "expected {expected} bytes of pixels, got {}",
                    pixels.len()
                )));
            }
            desc.usage |= TextureUsage::TRANSFER_DST;
        }

        let image = unsafe { create_image(&self.device, &desc)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate_memory(requirements, MemoryProperties::DEVICE_LOCAL) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let (view, sampler) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory, allocation.offset)?;
            let view = create_view(&self.device, image, desc.kind, desc.format)?;
            let sampler = if desc.usage.contains(TextureUsage::SAMPLED) {
                create_sampler(&self.device)?
            } else {
                vk::Sampler::null()
            };
            (view, sampler)
        };

        let header = self.issue::<Texture>();
        let mut texture = Texture {
            header,
            image,
            view,
            sampler,
            allocation: Some(allocation),
            desc,
            layout: ImageLayout::Undefined,
            is_swapchain: false,
        };

        if let Some(pixels) = pixels {
            let final_layout = if desc.usage.contains(TextureUsage::SAMPLED) {
                ImageLayout::ShaderReadOnlyOptimal
            } else {
                ImageLayout::TransferDstOptimal
            };
            unsafe { self.stage_pixels(&texture, pixels, final_layout)? };
            texture.layout = final_layout;
        }

        Ok(self.textures.insert(texture))
    }

    unsafe fn stage_pixels(&mut self, texture: &Texture, pixels: &[u8], final_layout: ImageLayout) -> Result<()> {
        let region = self.staging.stage(&self.device, pixels.len() as u64, 16)?;
        std::ptr::copy_nonoverlapping(pixels.as_ptr(), region.host.as_ptr(), pixels.len());

        let range = texture.full_range();
        let to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.image)
            .subresource_range(range);
        self.device.cmd_pipeline_barrier(
            region.cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        let desc = texture.desc;
        let copy = vk::BufferImageCopy::default()
            .buffer_offset(region.offset)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect_for_format(desc.format))
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(desc.kind.layers()),
            )
            .image_extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            });
        self.device.cmd_copy_buffer_to_image(
            region.cmd,
            region.buffer,
            texture.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy],
        );

        if final_layout != ImageLayout::TransferDstOptimal {
            let to_final = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(final_layout.to_vk())
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(texture.image)
                .subresource_range(range);
            self.device.cmd_pipeline_barrier(
                region.cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_final],
            );
        }
        Ok(())
    }

    /// Submit pending uploads and wait for them. Frames flush uploads on
    /// their own; this is for work outside a frame.
    pub fn flush_uploads(&mut self) -> Result<()> {
        unsafe {
            self.staging.flush(&self.device)?;
            self.device.queue_wait_idle(self.queue)?;
        }
        Ok(())
    }

    /// Create a shader module for `stage` from SPIR-V words.
    pub fn create_shader_module(&mut self, stage: ShaderStages, code: &[u32]) -> Result<Handle<ShaderModule>> {
        validate_spirv(stage, code)?;
        let module = unsafe { create_shader_module(&self.device, code)? };
        let header = self.issue::<ShaderModule>();
        Ok(self.shader_modules.insert(ShaderModule {
            header,
            handle: module,
            stage,
        }))
    }

    /// Link the modules and bindings collected by `builder`.
    pub fn create_program(&mut self, builder: &ShaderProgramBuilder) -> Result<Handle<ShaderProgram>> {
        let layouts = builder.layouts()?.to_vec();

        let mut stages = Vec::with_capacity(builder.modules.len());
        for &module in &builder.modules {
            let module = self
                .shader_modules
                .get(module)
                .ok_or_else(|| GpuError::InvalidHandle(format!("{module:?}")))?;
            if stages.iter().any(|&(stage, _)| stage == module.stage) {
                return Err(GpuError::ShaderLinkFailed(format!(
                    "stage {:?} attached twice",
                    module.stage
                )));
            }
            stages.push((module.stage, module.handle));
        }

        let mut set_layouts = Vec::with_capacity(layouts.len());
        let mut created = Ok(vk::PipelineLayout::null());
        for info in &layouts {
            match unsafe { create_set_layout(&self.device, info) } {
                Ok(layout) => set_layouts.push(layout),
                Err(err) => {
                    created = Err(err);
                    break;
                }
            }
        }
        if created.is_ok() {
            created = unsafe { create_pipeline_layout(&self.device, &set_layouts) };
        }
        let pipeline_layout = match created {
            Ok(layout) => layout,
            Err(err) => {
                for layout in set_layouts {
                    unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                }
                return Err(err);
            }
        };

        let header = self.issue::<ShaderProgram>();
        Ok(self.programs.insert(ShaderProgram {
            header,
            modules: builder.modules.clone(),
            stages,
            layouts,
            set_layouts,
            pipeline_layout,
        }))
    }

    /// Register a vertex input layout.
    pub fn create_vertex_layout(&mut self, builder: VertexLayoutBuilder) -> Result<Handle<VertexLayoutSet>> {
        let (bindings, attributes) = builder.build()?;
        let header = self.issue::<VertexLayoutSet>();
        Ok(self.vertex_layouts.insert(VertexLayoutSet {
            header,
            bindings,
            attributes,
        }))
    }

    /// Allocate and write a retained descriptor set for set `set_index` of
    /// `program`. Retained sets live until released.
    pub fn create_descriptor_set(
        &mut self,
        program: Handle<ShaderProgram>,
        set_index: usize,
        info: DescriptorSetInfo,
    ) -> Result<Handle<DescriptorSet>> {
        let program = self
            .programs
            .get(program)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{program:?}")))?;
        let layout_info = program
            .layout_info(set_index)
            .ok_or_else(|| GpuError::InvalidArgument(format!("program has no set {set_index}")))?;
        let layout = program.set_layouts[set_index];
        let demand = layout_info.demand();
        let key = DescriptorSetKey::new(info, layout_info)?;

        let planned = plan_writes(
            &key.info,
            |t| self.textures.get(t).map(|t| (t.view, t.sampler)),
            |b| self.buffers.get(b).map(|b| b.handle),
        )?;

        let (set, link) = unsafe { self.descriptor_pools.allocate(&self.device, layout, &demand)? };
        unsafe { write_descriptor_set(&self.device, set, &planned) };

        let header = self.issue::<DescriptorSet>();
        Ok(self.descriptor_sets.insert(DescriptorSet {
            header,
            handle: set,
            link,
        }))
    }

    /// Detach an object from its table and cache.
    ///
    /// Destroyed textures are cleared from every framebuffer key that
    /// references them.
    pub(crate) fn detach(&mut self, raw: RawHandle) -> Option<ReleasedObject> {
        fn typed<T: GpuObject>(raw: RawHandle) -> Option<Handle<T>> {
            Handle::from_raw(raw)
        }

        match raw.kind() {
            ObjectKind::Buffer => self.buffers.remove(typed(raw)?).map(ReleasedObject::from),
            ObjectKind::Texture => {
                let handle = typed::<Texture>(raw)?;
                let texture = self.textures.remove(handle)?;
                for key in self.caches.framebuffers.keys_mut() {
                    key.forget_texture(handle);
                }
                Some(texture.into())
            }
            ObjectKind::ShaderModule => self
                .shader_modules
                .remove(typed(raw)?)
                .map(|module| ReleasedObject::ShaderModule(module.handle)),
            ObjectKind::ShaderProgram => self.programs.remove(typed(raw)?).map(ReleasedObject::from),
            ObjectKind::VertexLayoutSet => {
                self.vertex_layouts.remove(typed(raw)?);
                None
            }
            ObjectKind::RenderPass => {
                let pass = self.caches.render_passes.evict(&mut self.render_passes, typed(raw)?)?;
                Some(ReleasedObject::RenderPass(pass.handle))
            }
            ObjectKind::Framebuffer => {
                let framebuffer = self.caches.framebuffers.evict(&mut self.framebuffers, typed(raw)?)?;
                Some(ReleasedObject::Framebuffer(framebuffer.handle))
            }
            ObjectKind::Pipeline => {
                let pipeline = self.caches.pipelines.evict(&mut self.pipelines, typed(raw)?)?;
                Some(ReleasedObject::Pipeline(pipeline.handle))
            }
            ObjectKind::DescriptorSet => {
                let set = self.caches.descriptor_sets.evict(&mut self.descriptor_sets, typed(raw)?)?;
                Some(ReleasedObject::DescriptorSet { link: set.link })
            }
            ObjectKind::CommandList | ObjectKind::WindowSurface => None,
        }
    }

    /// Schedule destruction of `handle` once no in-flight frame can use it.
    pub fn release(&mut self, handle: impl Into<RawHandle>) -> Result<()> {
        let raw = handle.into();
        match raw.kind() {
            ObjectKind::CommandList | ObjectKind::WindowSurface => {
                return Err(GpuError::InvalidArgument(format!(
                    "{:?} objects are not released through release()",
                    raw.kind()
                )));
            }
            ObjectKind::Texture => {
                let texture = Handle::<Texture>::from_raw(raw).and_then(|h| self.textures.get(h));
                if texture.is_some_and(Texture::is_swapchain) {
                    return Err(GpuError::InvalidArgument(
                        "swapchain images belong to their surface".into(),
                    ));
                }
            }
            _ => {}
        }

        if raw.kind() == ObjectKind::VertexLayoutSet {
            return Handle::<VertexLayoutSet>::from_raw(raw)
                .and_then(|h| self.vertex_layouts.remove(h))
                .map(|_| ())
                .ok_or_else(|| GpuError::InvalidHandle(format!("{raw:?}")));
        }

        let object = self
            .detach(raw)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{raw:?}")))?;
        self.release_queue.push(object, self.frame.count);
        Ok(())
    }

    /// Destroy a window surface and its swapchain right away.
    pub fn destroy_surface(&mut self, handle: Handle<WindowSurface>) -> Result<()> {
        let mut surface = self
            .surfaces
            .remove(handle)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle:?}")))?;
        self.wait_idle()?;
        unsafe { self.destroy_surface_objects(&mut surface) }
    }

    unsafe fn destroy_surface_objects(&mut self, surface: &mut WindowSurface) -> Result<()> {
        let (Some(surface_loader), Some(swapchain_loader)) =
            (self.surface_loader.clone(), self.swapchain_loader.clone())
        else {
            return Ok(());
        };

        let mut released = Vec::new();
        surface.teardown(&self.device, &swapchain_loader, |backbuffer| {
            released.push(backbuffer);
        })?;
        self.destroy_backbuffers(released);
        surface.destroy(&self.device, &surface_loader);
        Ok(())
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for mut surface in self.surfaces.drain() {
                if let Err(err) = self.destroy_surface_objects(&mut surface) {
                    tracing::warn!("Failed to tear down surface: {err}");
                }
            }

            for object in self.release_queue.drain_all() {
                object.destroy(&self.device, &mut self.memory, &mut self.descriptor_pools);
            }

            // Everything still alive, newest first.
            let mut live: Vec<(u64, ReleasedObject)> = Vec::new();
            live.extend(self.descriptor_sets.drain().into_iter().map(|s| {
                (s.header.id, ReleasedObject::DescriptorSet { link: s.link })
            }));
            live.extend(
                self.pipelines
                    .drain()
                    .into_iter()
                    .map(|p| (p.header.id, ReleasedObject::Pipeline(p.handle))),
            );
            live.extend(
                self.framebuffers
                    .drain()
                    .into_iter()
                    .map(|f| (f.header.id, ReleasedObject::Framebuffer(f.handle))),
            );
            live.extend(
                self.render_passes
                    .drain()
                    .into_iter()
                    .map(|r| (r.header.id, ReleasedObject::RenderPass(r.handle))),
            );
            live.extend(
                self.programs
                    .drain()
                    .into_iter()
                    .map(|p| (p.header.id, ReleasedObject::from(p))),
            );
            live.extend(
                self.shader_modules
                    .drain()
                    .into_iter()
                    .map(|m| (m.header.id, ReleasedObject::ShaderModule(m.handle))),
            );
            live.extend(
                self.textures
                    .drain()
                    .into_iter()
                    .map(|t| (t.header.id, ReleasedObject::from(t))),
            );
            live.extend(
                self.buffers
                    .drain()
                    .into_iter()
                    .map(|b| (b.header.id, ReleasedObject::from(b))),
            );
            live.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, object) in live {
                object.destroy(&self.device, &mut self.memory, &mut self.descriptor_pools);
            }

            self.staging.destroy(&self.device, &mut self.memory);
            self.descriptor_pools.destroy_all(&self.device);
            self.memory.shutdown(&mut DevicePageSource::new(&self.device));

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::info!("GPU device destroyed");
    }
}

/// Builder for creating a [`GpuDevice`].
pub struct GpuDeviceBuilder {
    app_name: String,
    enable_validation: bool,
    config: DeviceConfig,
}

impl Default for GpuDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Kestrel".to_string(),
            enable_validation: cfg!(debug_assertions),
            config: DeviceConfig::default(),
        }
    }
}

impl GpuDeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Replace the device configuration.
    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a device without presentation support.
    pub fn build_headless(self) -> Result<GpuDevice> {
        self.config.validate()?;
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::LoaderUnavailable(e.to_string()))?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation, false)? };
        unsafe { self.finish(entry, instance, None) }
    }

    /// Build a device that presents to `window`, returning the window's
    /// surface. `width` and `height` are the window's inner size in pixels.
    pub fn build_with_window<W>(
        self,
        window: &W,
        width: u32,
        height: u32,
    ) -> Result<(GpuDevice, Handle<WindowSurface>)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        self.config.validate()?;
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::LoaderUnavailable(e.to_string()))?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation, true)? };

        let display = window
            .display_handle()
            .map_err(|e| GpuError::InvalidArgument(format!("display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::InvalidArgument(format!("window handle: {e}")))?;
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display.as_raw(), window_handle.as_raw(), None)
                .map_err(GpuError::from_vk)?
        };

        let mut device = unsafe { self.finish(entry, instance, Some(surface))? };
        let header = device.ids.issue(ObjectKind::WindowSurface);
        let window_surface = unsafe {
            WindowSurface::new(
                &device.device,
                header,
                surface,
                device.queue_family,
                vk::Extent2D { width, height },
            )?
        };
        let handle = device.surfaces.insert(window_surface);
        Ok((device, handle))
    }

    unsafe fn finish(
        self,
        entry: ash::Entry,
        instance: ash::Instance,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<GpuDevice> {
        let surface_loader = surface.map(|_| ash::khr::surface::Instance::new(&entry, &instance));
        let target = surface
            .zip(surface_loader.as_ref())
            .map(|(surface, loader)| PresentTarget { loader, surface });

        let mut adapters = enumerate_adapters(&instance, target.as_ref())?;
        let index = select_adapter(
            &adapters.iter().map(|(_, info)| info.clone()).collect::<Vec<_>>(),
            self.config.adapter_preference,
            surface.is_some(),
        )?;
        let (physical_device, adapter) = adapters.swap_remove(index);
        let queue_family = adapter
            .graphics_family(surface.is_some())
            .ok_or(GpuError::NoCompatibleDevice)?;
        tracing::info!("Selected GPU: {}", adapter.summary());

        let supported = instance.get_physical_device_features(physical_device);
        let features = enabled_features(&supported);
        let extensions = device_extensions(surface.is_some());
        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();
        let queue_priority = [1.0_f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priority)];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);
        let device = instance.create_device(physical_device, &create_info, None)?;
        let queue = device.get_device_queue(queue_family, 0);

        let swapchain_loader = surface.map(|_| ash::khr::swapchain::Device::new(&instance, &device));
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let properties = instance.get_physical_device_properties(physical_device);

        let config = self.config;
        let mut memory = MemoryPool::new(config.memory_page_size);
        let staging = StagingRing::new(
            &device,
            &mut memory,
            &memory_properties,
            queue_family,
            queue,
            config.frames_in_flight,
            config.staging_bytes_per_frame,
            properties.limits.non_coherent_atom_size,
        )?;

        tracing::info!(
            "GPU device ready: {} frames in flight, GC after {} frames",
            config.frames_in_flight,
            config.gc_frame_threshold
        );

        Ok(GpuDevice {
            entry,
            instance,
            surface_loader,
            swapchain_loader,
            physical_device,
            adapter,
            device,
            queue_family,
            queue,
            memory_properties,
            memory,
            staging,
            descriptor_pools: DescriptorPoolChain::new(config.descriptor_pool_capacity),
            release_queue: ReleaseQueue::new(config.frames_in_flight),
            ids: ObjectIds::default(),
            buffers: HandleTable::new(),
            textures: HandleTable::new(),
            shader_modules: HandleTable::new(),
            programs: HandleTable::new(),
            vertex_layouts: HandleTable::new(),
            descriptor_sets: HandleTable::new(),
            render_passes: HandleTable::new(),
            framebuffers: HandleTable::new(),
            pipelines: HandleTable::new(),
            surfaces: HandleTable::new(),
            caches: ObjectCaches::default(),
            cached: CachedResources::new(),
            frame: FrameInfo::new(config.frames_in_flight),
            pipeline_creations: 0,
            config,
        })
    }
}

/// Device extensions to enable.
fn device_extensions(with_swapchain: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if with_swapchain {
        extensions.push(ash::khr::swapchain::NAME);
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME);
    extensions
}

/// Optional features the packed pipeline state can reach, limited to what
/// the adapter supports.
pub(crate) fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        depth_clamp: supported.depth_clamp,
        depth_bounds: supported.depth_bounds,
        depth_bias_clamp: supported.depth_bias_clamp,
        wide_lines: supported.wide_lines,
        fill_mode_non_solid: supported.fill_mode_non_solid,
        logic_op: supported.logic_op,
        sample_rate_shading: supported.sample_rate_shading,
        alpha_to_one: supported.alpha_to_one,
        independent_blend: supported.independent_blend,
        dual_src_blend: supported.dual_src_blend,
        sampler_anisotropy: supported.sampler_anisotropy,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_supported_features_are_enabled() {
        let supported = vk::PhysicalDeviceFeatures {
            depth_clamp: vk::TRUE,
            wide_lines: vk::TRUE,
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        let enabled = enabled_features(&supported);
        assert_eq!(enabled.depth_clamp, vk::TRUE);
        assert_eq!(enabled.wide_lines, vk::TRUE);
        assert_eq!(enabled.logic_op, vk::FALSE);
        assert_eq!(enabled.geometry_shader, vk::FALSE);
    }

    #[test]
    fn swapchain_extension_only_with_a_window() {
        assert!(device_extensions(true).contains(&ash::khr::swapchain::NAME));
        assert!(!device_extensions(false).contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    #[ignore = "needs a Vulkan device"]
    fn headless_device_creates_and_releases_resources() {
        use crate::resources::BufferUsage;

        let mut device = GpuDeviceBuilder::new()
            .app_name("kestrel-tests")
            .build_headless()
            .unwrap();

        let buffer = device
            .create_buffer(&BufferDesc::host(64, BufferUsage::UNIFORM), Some(&[7; 16]))
            .unwrap();
        let texture = device
            .create_texture(
                &TextureDesc::d2(
                    vk::Format::R8G8B8A8_UNORM,
                    2,
                    2,
                    TextureUsage::SAMPLED,
                ),
                Some(&[255; 16]),
            )
            .unwrap();
        device.flush_uploads().unwrap();
        assert_eq!(
            device.texture(texture).unwrap().layout(),
            ImageLayout::ShaderReadOnlyOptimal
        );

        device.release(buffer).unwrap();
        device.release(texture).unwrap();
        assert_eq!(device.pending_releases(), 2);
        assert!(matches!(
            device.release(buffer),
            Err(GpuError::InvalidHandle(_))
        ));
    }
}
