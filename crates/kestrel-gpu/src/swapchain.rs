//! Window surfaces and their swapchains.
//!
//! A [`WindowSurface`] owns the swapchain plus everything recycled per frame
//! slot: command buffers, in-flight fences and the image-available and
//! render-done semaphores. Its life cycle is a small state machine:
//! - `NeedsCreate`: nothing exists; creation waits for a non-zero extent
//! - `Valid`: frames can be acquired and presented
//! - `NeedsDelete`: acquire or present reported the swapchain stale, or the
//!   window was resized; the next frame tears everything down

use ash::vk;

use crate::error::{GpuError, Result};
use crate::handle::{GpuObject, Handle, ObjectHeader, ObjectKind};
use crate::resources::{create_view, Texture, TextureKind};
use crate::sync::{wait_for_fence, FrameSync};

/// Swapchain life cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    NeedsCreate,
    Valid,
    NeedsDelete,
}

/// How an acquire or present call went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl SwapchainStatus {
    /// Classify an acquire or present result. Errors other than out-of-date
    /// are surfaced.
    pub fn classify<T>(result: std::result::Result<(T, bool), vk::Result>) -> Result<(Option<T>, Self)> {
        match result {
            Ok((value, false)) => Ok((Some(value), Self::Optimal)),
            Ok((value, true)) => Ok((Some(value), Self::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((None, Self::OutOfDate)),
            Err(err) => Err(GpuError::from_vk(err)),
        }
    }
}

impl SwapchainState {
    /// State after an acquire or present reported `status`.
    pub fn after(self, status: SwapchainStatus) -> Self {
        match status {
            SwapchainStatus::Optimal => self,
            SwapchainStatus::Suboptimal | SwapchainStatus::OutOfDate => Self::NeedsDelete,
        }
    }
}

/// Pick BGRA8 UNORM with the sRGB non-linear color space if offered,
/// otherwise the first advertised format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    match available {
        [] => None,
        [only] if only.format == vk::Format::UNDEFINED => Some(preferred),
        _ => Some(
            available
                .iter()
                .copied()
                .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
                .unwrap_or(available[0]),
        ),
    }
}

/// Mailbox, then immediate, then FIFO. FIFO when `vsync`.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's fixed extent, or `requested` clamped to its limits.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: requested.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: requested.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more image than the minimum, within the surface's maximum.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Fence of the frame that last rendered to each swapchain image.
#[derive(Debug, Default)]
pub struct InFlightImages {
    fences: Vec<Option<vk::Fence>>,
}

impl InFlightImages {
    /// Track `count` images, none in flight.
    pub fn new(count: usize) -> Self {
        Self {
            fences: vec![None; count],
        }
    }

    /// Record that `fence` now guards `image`, returning the fence that
    /// must signal first if another frame still uses the image.
    pub fn claim(&mut self, image: u32, fence: vk::Fence) -> Option<vk::Fence> {
        let slot = self.fences.get_mut(image as usize)?;
        let previous = slot.replace(fence);
        previous.filter(|&prev| prev != fence)
    }

    /// Forget every image.
    pub fn clear(&mut self) {
        self.fences.clear();
    }
}

/// What the current frame renders into.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub cmd: vk::CommandBuffer,
    pub sync: FrameSync,
    pub image_index: u32,
    pub backbuffer: Handle<Texture>,
}

/// A window's surface, swapchain and per-frame resources.
pub struct WindowSurface {
    pub(crate) header: ObjectHeader,
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) state: SwapchainState,
    pub(crate) swapchain: vk::SwapchainKHR,
    pub(crate) format: vk::SurfaceFormatKHR,
    pub(crate) extent: vk::Extent2D,
    pub(crate) requested_extent: vk::Extent2D,
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) cmds: Vec<vk::CommandBuffer>,
    pub(crate) frames: Vec<FrameSync>,
    pub(crate) backbuffers: Vec<Handle<Texture>>,
    pub(crate) in_flight: InFlightImages,
    pub(crate) acquired: Option<FrameTarget>,
    pub(crate) recording: bool,
    pub(crate) submitted: bool,
}

impl GpuObject for WindowSurface {
    const KIND: ObjectKind = ObjectKind::WindowSurface;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl WindowSurface {
    /// Wrap `surface`; the swapchain is created by the first frame.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        header: ObjectHeader,
        surface: vk::SurfaceKHR,
        queue_family: u32,
        requested_extent: vk::Extent2D,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = device.create_command_pool(&pool_info, None)?;

        Ok(Self {
            header,
            surface,
            state: SwapchainState::NeedsCreate,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            requested_extent,
            command_pool,
            cmds: Vec::new(),
            frames: Vec::new(),
            backbuffers: Vec::new(),
            in_flight: InFlightImages::default(),
            acquired: None,
            recording: false,
            submitted: false,
        })
    }

    /// Current life cycle state.
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// Extent of the current swapchain.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Format of the swapchain images.
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.backbuffers.len()
    }

    /// Backbuffer acquired for the current frame.
    pub fn backbuffer(&self) -> Option<Handle<Texture>> {
        self.acquired.map(|target| target.backbuffer)
    }

    /// Ask for a new extent. A change retires the current swapchain.
    pub(crate) fn request_extent(&mut self, extent: vk::Extent2D) {
        if (extent.width, extent.height)
            == (self.requested_extent.width, self.requested_extent.height)
        {
            return;
        }
        self.requested_extent = extent;
        if self.state == SwapchainState::Valid {
            self.state = SwapchainState::NeedsDelete;
        }
    }

    /// Create the swapchain and per-frame resources.
    ///
    /// Returns `false` without creating anything while the surface extent is
    /// zero. `make_backbuffer` wraps each swapchain image and its view.
    ///
    /// # Safety
    /// The device, loaders and physical device must be the ones `self` was
    /// created with.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn create(
        &mut self,
        device: &ash::Device,
        surface_loader: &ash::khr::surface::Instance,
        swapchain_loader: &ash::khr::swapchain::Device,
        physical_device: vk::PhysicalDevice,
        frames_in_flight: usize,
        vsync: bool,
        mut make_backbuffer: impl FnMut(vk::Image, vk::ImageView, vk::Format, vk::Extent2D) -> Handle<Texture>,
    ) -> Result<bool> {
        let capabilities =
            surface_loader.get_physical_device_surface_capabilities(physical_device, self.surface)?;
        let extent = calculate_extent(&capabilities, self.requested_extent);
        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }

        let formats =
            surface_loader.get_physical_device_surface_formats(physical_device, self.surface)?;
        let format = select_surface_format(&formats).ok_or(GpuError::SurfaceLost)?;
        let present_modes = surface_loader
            .get_physical_device_surface_present_modes(physical_device, self.surface)?;
        let present_mode = select_present_mode(&present_modes, vsync);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count(&capabilities))
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(GpuError::from_vk)?;
        let images = swapchain_loader.get_swapchain_images(swapchain)?;

        self.swapchain = swapchain;
        self.format = format;
        self.extent = extent;

        for image in &images {
            let view = create_view(device, *image, TextureKind::D2, format.format)?;
            self.backbuffers
                .push(make_backbuffer(*image, view, format.format, extent));
        }
        self.in_flight = InFlightImages::new(images.len());

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        self.cmds = device.allocate_command_buffers(&alloc_info)?;
        for _ in 0..frames_in_flight {
            self.frames.push(FrameSync::new(device)?);
        }

        self.state = SwapchainState::Valid;
        tracing::info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            images.len()
        );
        Ok(true)
    }

    /// Destroy the swapchain and per-frame resources after every frame
    /// retired: command buffers, fences and semaphores, then the backbuffers
    /// through `destroy_backbuffer`, then the swapchain.
    ///
    /// # Safety
    /// The device and loader must be the ones `self` was created with.
    pub(crate) unsafe fn teardown(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        mut destroy_backbuffer: impl FnMut(Handle<Texture>),
    ) -> Result<()> {
        let fences: Vec<vk::Fence> = self.frames.iter().map(|f| f.in_flight).collect();
        if !fences.is_empty() {
            device.wait_for_fences(&fences, true, u64::MAX)?;
        }
        // Semaphores may still be referenced by a pending present.
        device.device_wait_idle()?;

        if !self.cmds.is_empty() {
            device.free_command_buffers(self.command_pool, &self.cmds);
            self.cmds.clear();
        }
        for sync in self.frames.drain(..) {
            sync.destroy(device);
        }
        for backbuffer in self.backbuffers.drain(..) {
            destroy_backbuffer(backbuffer);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }

        self.in_flight.clear();
        self.acquired = None;
        self.recording = false;
        self.submitted = false;
        self.state = SwapchainState::NeedsCreate;
        Ok(())
    }

    /// Wait for `frame_index`'s slot and acquire the next image.
    ///
    /// Returns `None` and retires the swapchain when it no longer matches
    /// the surface.
    ///
    /// # Safety
    /// The swapchain must be `Valid`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub(crate) unsafe fn acquire(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        frame_index: usize,
    ) -> Result<Option<FrameTarget>> {
        let sync = self.frames[frame_index];
        let cmd = self.cmds[frame_index];
        wait_for_fence(device, sync.in_flight)?;

        let result = swapchain_loader.acquire_next_image(
            self.swapchain,
            u64::MAX,
            sync.image_available,
            vk::Fence::null(),
        );
        let (image_index, status) = SwapchainStatus::classify(result)?;
        self.state = self.state.after(status);
        let Some(image_index) = image_index.filter(|_| status == SwapchainStatus::Optimal) else {
            tracing::warn!("Swapchain {:?} on acquire, recreating", status);
            return Ok(None);
        };

        if let Some(previous) = self.in_flight.claim(image_index, sync.in_flight) {
            wait_for_fence(device, previous)?;
        }
        device.reset_fences(&[sync.in_flight])?;

        let target = FrameTarget {
            cmd,
            sync,
            image_index,
            backbuffer: self.backbuffers[image_index as usize],
        };
        self.acquired = Some(target);
        self.recording = false;
        self.submitted = false;
        Ok(Some(target))
    }

    /// Present the acquired image. A frame that never submitted still
    /// signals its semaphores and fence through an empty submission.
    ///
    /// # Safety
    /// The queue must belong to the device `self` was created with.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub(crate) unsafe fn present(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
    ) -> Result<()> {
        let Some(target) = self.acquired.take() else {
            return Ok(());
        };

        if !self.submitted {
            let wait = [target.sync.image_available];
            let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal = [target.sync.render_done];
            let submit = vk::SubmitInfo::default()
                .wait_semaphores(&wait)
                .wait_dst_stage_mask(&stages)
                .signal_semaphores(&signal);
            device.queue_submit(queue, &[submit], target.sync.in_flight)?;
            self.submitted = true;
        }

        let wait = [target.sync.render_done];
        let swapchains = [self.swapchain];
        let indices = [target.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = swapchain_loader
            .queue_present(queue, &present_info)
            .map(|suboptimal| ((), suboptimal));
        let (_, status) = SwapchainStatus::classify(result)?;
        if status != SwapchainStatus::Optimal {
            tracing::warn!("Swapchain {:?} on present, recreating", status);
        }
        self.state = self.state.after(status);
        Ok(())
    }

    /// Destroy the command pool and the surface. The swapchain must have been
    /// torn down.
    ///
    /// # Safety
    /// Nothing created from the surface may be in use.
    pub(crate) unsafe fn destroy(
        &mut self,
        device: &ash::Device,
        surface_loader: &ash::khr::surface::Instance,
    ) {
        device.destroy_command_pool(self.command_pool, None);
        surface_loader.destroy_surface(self.surface, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle as _;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn surface_format_prefers_bgra_unorm_srgb() {
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&available).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let available = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = select_surface_format(&available).unwrap();
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn undefined_only_format_means_free_choice() {
        let available = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = select_surface_format(&available).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn present_mode_order() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&all[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&all[..1], false), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_follows_the_surface_or_clamps_the_request() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        let request = vk::Extent2D {
            width: 4000,
            height: 0,
        };
        assert_eq!(calculate_extent(&caps, request).width, 800);

        caps.current_extent.width = u32::MAX;
        let clamped = calculate_extent(&caps, request);
        assert_eq!((clamped.width, clamped.height), (1024, 1));

        assert_eq!(image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(image_count(&caps), 3);
    }

    #[test]
    fn stale_results_retire_the_swapchain() {
        let (_, status) = SwapchainStatus::classify(Ok((1u32, true))).unwrap();
        assert_eq!(status, SwapchainStatus::Suboptimal);
        assert_eq!(SwapchainState::Valid.after(status), SwapchainState::NeedsDelete);

        let (index, status) =
            SwapchainStatus::classify::<u32>(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
        assert_eq!((index, status), (None, SwapchainStatus::OutOfDate));

        let (index, status) = SwapchainStatus::classify(Ok((2u32, false))).unwrap();
        assert_eq!(index, Some(2));
        assert_eq!(SwapchainState::Valid.after(status), SwapchainState::Valid);
    }

    #[test]
    fn surface_loss_is_surfaced() {
        assert!(matches!(
            SwapchainStatus::classify::<u32>(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(GpuError::SurfaceLost)
        ));
    }

    #[test]
    fn reused_images_wait_on_their_previous_fence() {
        let fence_a = vk::Fence::from_raw(1);
        let fence_b = vk::Fence::from_raw(2);
        let mut images = InFlightImages::new(2);

        assert_eq!(images.claim(0, fence_a), None);
        assert_eq!(images.claim(1, fence_b), None);
        assert_eq!(images.claim(0, fence_b), Some(fence_a));
        assert_eq!(images.claim(0, fence_b), None);
        assert_eq!(images.claim(5, fence_a), None);
    }
}
