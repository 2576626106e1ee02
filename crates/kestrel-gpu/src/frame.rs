//! Frame orchestration.
//!
//! A frame on a window surface runs:
//! 1. [`GpuDevice::begin_frame`] recreates a retired swapchain, waits on the
//!    frame slot's fence, acquires an image and destroys released objects
//!    whose frames have retired
//! 2. One [`CommandList`](crate::CommandList) is requested, recorded and
//!    submitted
//! 3. [`GpuDevice::end_frame`] presents, collects cached objects that went
//!    unused and advances the frame counter

use ash::vk;

use crate::cache::CachedResources;
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::flags::ImageLayout;
use crate::handle::{GpuObject, Handle, HandleTable, ObjectKind, RawHandle};
use crate::resources::Texture;
use crate::swapchain::{SwapchainState, WindowSurface};

/// Frame counter and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Slot of the current frame, `count % max_in_flight`.
    pub index: usize,
    /// Frames ended since the device was built.
    pub count: u64,
    pub max_in_flight: usize,
}

impl FrameInfo {
    /// Frame zero with `max_in_flight` slots.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            index: 0,
            count: 0,
            max_in_flight,
        }
    }

    /// Move to the next frame.
    pub fn advance(&mut self) {
        self.count += 1;
        self.index = (self.count % self.max_in_flight as u64) as usize;
    }

    /// Value stored as an object's last-used frame.
    pub(crate) fn stamp(&self) -> u32 {
        self.count as u32
    }
}

/// Swapchain work done by `begin_frame` before it acquires an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapchainStep {
    /// Wait for the slot fences and destroy the swapchain.
    Retire,
    /// Create the swapchain; the frame is skipped if the extent is zero.
    Create,
}

fn swapchain_steps(state: SwapchainState) -> &'static [SwapchainStep] {
    match state {
        SwapchainState::NeedsDelete => &[SwapchainStep::Retire, SwapchainStep::Create],
        SwapchainState::NeedsCreate => &[SwapchainStep::Create],
        SwapchainState::Valid => &[],
    }
}

fn last_used<T: GpuObject>(table: &HandleTable<T>, raw: RawHandle) -> Option<u32> {
    Handle::from_raw(raw)
        .and_then(|handle| table.get(handle))
        .map(|object| object.header().last_frame_used)
}

impl GpuDevice {
    fn loaders(&self) -> Result<(ash::khr::surface::Instance, ash::khr::swapchain::Device)> {
        self.surface_loader
            .clone()
            .zip(self.swapchain_loader.clone())
            .ok_or_else(|| GpuError::InvalidArgument("device was built without a window".into()))
    }

    /// Start a frame on `surface`.
    ///
    /// A swapchain marked for deletion is retired and recreated in the same
    /// call. Returns `false` when no image could be acquired: the surface
    /// has a zero extent, or the acquire reported the swapchain out of date.
    /// Skip rendering and try again next frame.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self, surface: Handle<WindowSurface>) -> Result<bool> {
        let (surface_loader, swapchain_loader) = self.loaders()?;
        let state = self
            .surfaces
            .get(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?
            .state();

        for step in swapchain_steps(state) {
            match step {
                SwapchainStep::Retire => self.retire_swapchain(surface, &swapchain_loader)?,
                SwapchainStep::Create => {
                    if !self.create_swapchain(surface, &surface_loader, &swapchain_loader)? {
                        return Ok(false);
                    }
                }
            }
        }

        let frame_index = self.frame.index;
        let window = self
            .surfaces
            .get_mut(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?;
        let Some(target) = (unsafe { window.acquire(&self.device, &swapchain_loader, frame_index)? })
        else {
            return Ok(false);
        };

        // The slot fence has signaled, so everything queued
        // `max_in_flight` frames ago is idle.
        let destroyed = self.release_queue.process(self.frame.count, |object| unsafe {
            object.destroy(&self.device, &mut self.memory, &mut self.descriptor_pools);
        });
        if destroyed > 0 {
            tracing::debug!("Destroyed {} released objects", destroyed);
        }

        if let Some(backbuffer) = self.textures.get_mut(target.backbuffer) {
            backbuffer.layout = ImageLayout::Undefined;
        }
        Ok(true)
    }

    /// Present the frame on `surface`, collect unused cached objects and
    /// advance the frame counter.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(&mut self, surface: Handle<WindowSurface>) -> Result<()> {
        let (_, swapchain_loader) = self.loaders()?;
        let window = self
            .surfaces
            .get_mut(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?;
        if window.acquired.is_none() {
            return Ok(());
        }

        unsafe {
            self.staging.flush(&self.device)?;
            window.present(&self.device, &swapchain_loader, self.queue)?;
        }

        self.collect_garbage();
        self.frame.advance();
        Ok(())
    }

    /// Report a new surface size. The swapchain is recreated by the next
    /// [`begin_frame`](Self::begin_frame).
    pub fn resize_surface(&mut self, surface: Handle<WindowSurface>, width: u32, height: u32) -> Result<()> {
        self.surfaces
            .get_mut(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?
            .request_extent(vk::Extent2D { width, height });
        Ok(())
    }

    /// Move every cached object that went unused for the configured number
    /// of frames to the release queue.
    pub(crate) fn collect_garbage(&mut self) {
        let mut cached = std::mem::replace(&mut self.cached, CachedResources::new());
        let stale = cached.collect_stale(self.frame.count, self.config.gc_frame_threshold, |raw| {
            self.last_frame_used(raw)
        });
        self.cached = cached;

        if stale.is_empty() {
            return;
        }
        tracing::debug!("Collecting {} unused cached objects", stale.len());
        for raw in stale {
            if let Some(object) = self.detach(raw) {
                self.release_queue.push(object, self.frame.count);
            }
        }
    }

    fn last_frame_used(&self, raw: RawHandle) -> Option<u32> {
        match raw.kind() {
            ObjectKind::RenderPass => last_used(&self.render_passes, raw),
            ObjectKind::Framebuffer => last_used(&self.framebuffers, raw),
            ObjectKind::Pipeline => last_used(&self.pipelines, raw),
            ObjectKind::DescriptorSet => last_used(&self.descriptor_sets, raw),
            _ => None,
        }
    }

    fn create_swapchain(
        &mut self,
        surface: Handle<WindowSurface>,
        surface_loader: &ash::khr::surface::Instance,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) -> Result<bool> {
        let frames_in_flight = self.frame.max_in_flight;
        let vsync = self.config.vsync;
        let Self {
            surfaces,
            ids,
            textures,
            device,
            physical_device,
            ..
        } = self;

        let window = surfaces
            .get_mut(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?;
        let created = unsafe {
            window.create(
                device,
                surface_loader,
                swapchain_loader,
                *physical_device,
                frames_in_flight,
                vsync,
                |image, view, format, extent| {
                    let header = ids.issue(ObjectKind::Texture);
                    textures.insert(Texture::swapchain_image(header, image, view, format, extent))
                },
            )?
        };

        if created {
            let extent = window.extent();
            tracing::info!(
                "Swapchain created: {}x{}, {:?}, {} images",
                extent.width,
                extent.height,
                window.format(),
                window.backbuffers.len()
            );
        }
        Ok(created)
    }

    fn retire_swapchain(
        &mut self,
        surface: Handle<WindowSurface>,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) -> Result<()> {
        let window = self
            .surfaces
            .get_mut(surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{surface:?}")))?;
        let mut retired = Vec::new();
        unsafe {
            window.teardown(&self.device, swapchain_loader, |backbuffer| retired.push(backbuffer))?;
        }
        tracing::info!("Swapchain retired, {} backbuffers destroyed", retired.len());
        self.destroy_backbuffers(retired);
        Ok(())
    }

    /// Destroy swapchain textures after the device went idle. Framebuffer
    /// keys referencing them are cleared.
    pub(crate) fn destroy_backbuffers(&mut self, backbuffers: Vec<Handle<Texture>>) {
        for backbuffer in backbuffers {
            if let Some(object) = self.detach(backbuffer.into()) {
                unsafe {
                    object.destroy(&self.device, &mut self.memory, &mut self.descriptor_pools);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ObjectIds;
    use crate::renderpass::RenderPass;

    #[test]
    fn frame_index_wraps_at_max_in_flight() {
        let mut frame = FrameInfo::new(3);
        let indices: Vec<usize> = (0..7)
            .map(|_| {
                frame.advance();
                frame.index
            })
            .collect();
        assert_eq!(indices, [1, 2, 0, 1, 2, 0, 1]);
        assert_eq!(frame.count, 7);
    }

    #[test]
    fn single_slot_always_uses_index_zero() {
        let mut frame = FrameInfo::new(1);
        frame.advance();
        frame.advance();
        assert_eq!(frame.index, 0);
        assert_eq!(frame.stamp(), 2);
    }

    #[test]
    fn retired_swapchains_are_recreated_in_the_same_frame() {
        assert_eq!(
            swapchain_steps(SwapchainState::NeedsDelete),
            [SwapchainStep::Retire, SwapchainStep::Create]
        );
        assert_eq!(swapchain_steps(SwapchainState::NeedsCreate), [SwapchainStep::Create]);
        assert!(swapchain_steps(SwapchainState::Valid).is_empty());
    }

    #[test]
    fn last_used_reads_the_header_stamp() {
        let mut ids = ObjectIds::default();
        let mut table = HandleTable::new();
        let mut pass = RenderPass::detached();
        pass.header = ids.issue(ObjectKind::RenderPass);
        pass.header.last_frame_used = 42;
        let handle = table.insert(pass);

        assert_eq!(last_used(&table, handle.into()), Some(42));
        table.remove(handle);
        assert_eq!(last_used(&table, handle.into()), None);
    }
}
