//! Staging ring for host-to-device uploads.
//!
//! A fixed number of host-visible frames are filled in turn. When a request
//! does not fit into the current frame, the frame is flushed: its command
//! buffer is closed, its mapped range made visible and the work submitted
//! with the frame's fence. A frame that comes around again while still
//! submitted is recycled after its fence signals.
//!
//! [`StagingCursor`] plans the steps of a request without changing its
//! state. Each step is applied only once the back-end performed it, so a
//! failed submit never leaves a frame marked as submitted.

use std::ptr::NonNull;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::memory::{align_up, find_memory_type, DevicePageSource, MemoryAllocation, MemoryPool};

/// Work the ring must perform before a reservation can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingStep {
    /// Close and submit the frame.
    Flush(usize),
    /// Wait for the frame's fence, reset it and reopen its command buffer.
    Recycle(usize),
}

/// Where a reservation lands and what must happen first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub steps: Vec<StagingStep>,
    pub frame: usize,
    pub offset: u64,
    /// End of the reserved bytes within the frame.
    pub end: u64,
}

/// Bookkeeping of the ring independent of the back-end.
#[derive(Debug, Clone)]
pub struct StagingCursor {
    budget: u64,
    index: usize,
    used: Vec<u64>,
    submitted: Vec<bool>,
}

impl StagingCursor {
    /// Track `frames` frames of `budget` bytes each.
    pub fn new(frames: usize, budget: u64) -> Self {
        let frames = frames.max(1);
        Self {
            budget,
            index: 0,
            used: vec![0; frames],
            submitted: vec![false; frames],
        }
    }

    /// Frame currently being filled.
    pub fn current(&self) -> usize {
        self.index
    }

    /// Bytes used in `frame`.
    pub fn used(&self, frame: usize) -> u64 {
        self.used.get(frame).copied().unwrap_or(0)
    }

    /// Whether `frame` was submitted and not yet recycled.
    pub fn is_submitted(&self, frame: usize) -> bool {
        self.submitted.get(frame).copied().unwrap_or(false)
    }

    /// Plan a reservation of `size` bytes aligned to `alignment`.
    pub fn plan(&self, size: u64, alignment: u64) -> Result<Reservation> {
        if size > self.budget {
            return Err(GpuError::StagingTooLarge {
                requested: size,
                budget: self.budget,
            });
        }

        let mut steps = Vec::new();
        let mut index = self.index;
        let mut used = self.used[index];
        if self.submitted[index] {
            steps.push(StagingStep::Recycle(index));
            used = 0;
        }

        let mut offset = align_up(used, alignment);
        if offset + size > self.budget {
            let flushed = index;
            steps.push(StagingStep::Flush(flushed));
            index = (index + 1) % self.used.len();
            if index == flushed || self.submitted[index] {
                steps.push(StagingStep::Recycle(index));
            }
            offset = 0;
        }

        Ok(Reservation {
            steps,
            frame: index,
            offset,
            end: offset + size,
        })
    }

    /// Record that `step` was performed.
    pub fn apply(&mut self, step: StagingStep) {
        match step {
            StagingStep::Flush(frame) => {
                self.submitted[frame] = true;
                self.index = (frame + 1) % self.used.len();
            }
            StagingStep::Recycle(frame) => {
                self.submitted[frame] = false;
                self.used[frame] = 0;
                self.index = frame;
            }
        }
    }

    /// Take the bytes of a reservation whose steps were all applied.
    pub fn place(&mut self, reservation: &Reservation) {
        self.index = reservation.frame;
        self.used[reservation.frame] = reservation.end;
    }

    /// Plan, apply and place a reservation in one go.
    pub fn reserve(&mut self, size: u64, alignment: u64) -> Result<Reservation> {
        let reservation = self.plan(size, alignment)?;
        for &step in &reservation.steps {
            self.apply(step);
        }
        self.place(&reservation);
        Ok(reservation)
    }

    /// Step closing the current frame if it holds unsubmitted work.
    pub fn pending_flush(&self) -> Option<StagingStep> {
        if self.submitted[self.index] || self.used[self.index] == 0 {
            return None;
        }
        Some(StagingStep::Flush(self.index))
    }
}

/// Memory handed out by [`StagingRing::stage`].
#[derive(Debug, Clone, Copy)]
pub struct StagingRegion {
    /// Host pointer to write the upload to.
    pub host: NonNull<u8>,
    /// Command buffer to record the copy out of the staging buffer into.
    pub cmd: vk::CommandBuffer,
    /// Staging buffer.
    pub buffer: vk::Buffer,
    /// Offset of the region inside `buffer`.
    pub offset: u64,
}

struct StagingFrame {
    buffer: vk::Buffer,
    allocation: MemoryAllocation,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

/// N-buffered host-visible upload buffers with fences.
pub struct StagingRing {
    cursor: StagingCursor,
    frames: Vec<StagingFrame>,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    atom_size: u64,
}

impl StagingRing {
    /// Create `frames` staging frames of `budget` bytes each.
    ///
    /// # Safety
    /// The device and queue must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        memory: &mut MemoryPool,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        queue_family: u32,
        queue: vk::Queue,
        frames: usize,
        budget: u64,
        atom_size: u64,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = device.create_command_pool(&pool_info, None)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames as u32);
        let cmds = device.allocate_command_buffers(&alloc_info)?;

        let mut ring = Self {
            cursor: StagingCursor::new(frames, budget),
            frames: Vec::with_capacity(frames),
            command_pool,
            queue,
            atom_size: atom_size.max(1),
        };

        let buffer_size = align_up(budget, ring.atom_size);
        for cmd in cmds {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(buffer_size)
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = device.create_buffer(&buffer_info, None)?;
            let requirements = device.get_buffer_memory_requirements(buffer);

            let memory_type = find_memory_type(
                memory_properties,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or(GpuError::OutOfDeviceMemory)?;

            let allocation = memory.alloc(
                &mut DevicePageSource::new(device),
                requirements.size.max(buffer_size),
                requirements.alignment.max(ring.atom_size),
                memory_type,
                true,
            )?;
            device.bind_buffer_memory(buffer, allocation.memory, allocation.offset)?;

            let fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;
            begin(device, cmd)?;

            ring.frames.push(StagingFrame {
                buffer,
                allocation,
                cmd,
                fence,
            });
        }

        tracing::debug!(
            "Staging ring ready: {frames} frames of {} KiB",
            budget / 1024
        );
        Ok(ring)
    }

    /// Reserve `size` bytes for an upload.
    ///
    /// # Safety
    /// The device must be the one the ring was created with.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn stage(
        &mut self,
        device: &ash::Device,
        size: u64,
        alignment: u64,
    ) -> Result<StagingRegion> {
        let reservation = self.cursor.plan(size, alignment)?;
        for &step in &reservation.steps {
            self.perform(device, step)?;
            self.cursor.apply(step);
        }
        self.cursor.place(&reservation);

        let frame = &self.frames[reservation.frame];
        let base = frame.allocation.mapped.ok_or(GpuError::MappingFailed)?;

        Ok(StagingRegion {
            host: NonNull::new_unchecked(base.as_ptr().add(reservation.offset as usize)),
            cmd: frame.cmd,
            buffer: frame.buffer,
            offset: reservation.offset,
        })
    }

    /// Submit pending uploads. Called before graphics work is submitted.
    ///
    /// # Safety
    /// The device must be the one the ring was created with.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn flush(&mut self, device: &ash::Device) -> Result<()> {
        if let Some(step) = self.cursor.pending_flush() {
            self.perform(device, step)?;
            self.cursor.apply(step);
        }
        Ok(())
    }

    unsafe fn perform(&mut self, device: &ash::Device, step: StagingStep) -> Result<()> {
        match step {
            StagingStep::Flush(index) => {
                let used = self.cursor.used(index);
                let frame = &self.frames[index];

                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(
                        vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                            | vk::AccessFlags::INDEX_READ
                            | vk::AccessFlags::UNIFORM_READ
                            | vk::AccessFlags::SHADER_READ,
                    );
                device.cmd_pipeline_barrier(
                    frame.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::VERTEX_INPUT
                        | vk::PipelineStageFlags::VERTEX_SHADER
                        | vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                device.end_command_buffer(frame.cmd)?;

                let range = vk::MappedMemoryRange::default()
                    .memory(frame.allocation.memory)
                    .offset(frame.allocation.offset)
                    .size(align_up(used, self.atom_size).min(frame.allocation.size));
                device.flush_mapped_memory_ranges(&[range])?;

                let cmds = [frame.cmd];
                let submit = vk::SubmitInfo::default().command_buffers(&cmds);
                device.queue_submit(self.queue, &[submit], frame.fence)?;
            }
            StagingStep::Recycle(index) => {
                let frame = &self.frames[index];
                device.wait_for_fences(&[frame.fence], true, u64::MAX)?;
                device.reset_fences(&[frame.fence])?;
                device.reset_command_buffer(frame.cmd, vk::CommandBufferResetFlags::empty())?;
                begin(device, frame.cmd)?;
            }
        }
        Ok(())
    }

    /// Destroy every frame.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, memory: &mut MemoryPool) {
        for frame in self.frames.drain(..) {
            device.destroy_fence(frame.fence, None);
            device.destroy_buffer(frame.buffer, None);
            memory.free(&frame.allocation);
        }
        device.destroy_command_pool(self.command_pool, None);
    }
}

unsafe fn begin(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_pack_into_the_current_frame() {
        let mut cursor = StagingCursor::new(3, 256);
        let a = cursor.reserve(10, 1).unwrap();
        let b = cursor.reserve(16, 16).unwrap();
        assert_eq!((a.frame, a.offset), (0, 0));
        assert_eq!((b.frame, b.offset), (0, 16));
        assert!(b.steps.is_empty());
        assert_eq!(cursor.used(0), 32);
    }

    #[test]
    fn overflow_flushes_and_advances() {
        let mut cursor = StagingCursor::new(2, 100);
        cursor.reserve(60, 1).unwrap();
        let next = cursor.reserve(60, 1).unwrap();
        assert_eq!(next.steps, vec![StagingStep::Flush(0)]);
        assert_eq!((next.frame, next.offset), (1, 0));
        assert!(cursor.is_submitted(0));
    }

    #[test]
    fn wrapping_onto_a_submitted_frame_recycles_it() {
        let mut cursor = StagingCursor::new(2, 100);
        cursor.reserve(60, 1).unwrap();
        cursor.reserve(60, 1).unwrap();
        let third = cursor.reserve(60, 1).unwrap();
        assert_eq!(
            third.steps,
            vec![StagingStep::Flush(1), StagingStep::Recycle(0)]
        );
        assert_eq!((third.frame, third.offset), (0, 0));
        assert!(!cursor.is_submitted(0));
        assert_eq!(cursor.used(0), 60);
    }

    #[test]
    fn explicit_flush_defers_the_recycle() {
        let mut cursor = StagingCursor::new(1, 64);
        assert_eq!(cursor.pending_flush(), None);

        cursor.reserve(8, 1).unwrap();
        let flush = cursor.pending_flush();
        assert_eq!(flush, Some(StagingStep::Flush(0)));
        cursor.apply(StagingStep::Flush(0));
        assert_eq!(cursor.pending_flush(), None);

        let again = cursor.reserve(8, 1).unwrap();
        assert_eq!(again.steps, vec![StagingStep::Recycle(0)]);
        assert_eq!(again.offset, 0);
    }

    #[test]
    fn oversized_requests_fail() {
        let mut cursor = StagingCursor::new(3, 64);
        assert_eq!(
            cursor.reserve(65, 1),
            Err(GpuError::StagingTooLarge {
                requested: 65,
                budget: 64
            })
        );
        let exact = cursor.reserve(64, 1).unwrap();
        assert_eq!(exact.offset, 0);
    }

    #[test]
    fn alignment_padding_can_force_a_flush() {
        let mut cursor = StagingCursor::new(2, 64);
        cursor.reserve(33, 1).unwrap();
        let aligned = cursor.reserve(16, 32).unwrap();
        assert_eq!(aligned.steps, vec![StagingStep::Flush(0)]);
        assert_eq!(aligned.frame, 1);
    }

    #[test]
    fn single_frame_overflow_recycles_the_flushed_frame() {
        let mut cursor = StagingCursor::new(1, 64);
        cursor.reserve(40, 1).unwrap();
        let next = cursor.reserve(40, 1).unwrap();
        assert_eq!(next.steps, vec![StagingStep::Flush(0), StagingStep::Recycle(0)]);
        assert_eq!((next.frame, next.offset), (0, 0));
        assert_eq!(cursor.used(0), 40);
    }

    #[test]
    fn abandoned_flush_leaves_the_frame_unsubmitted() {
        let mut cursor = StagingCursor::new(2, 100);
        cursor.reserve(60, 1).unwrap();

        // The submit failed, so none of the planned steps are applied.
        let failed = cursor.plan(60, 1).unwrap();
        assert_eq!(failed.steps, vec![StagingStep::Flush(0)]);
        assert!(!cursor.is_submitted(0));
        assert_eq!(cursor.current(), 0);

        // Retrying flushes again instead of waiting on an idle fence.
        let retry = cursor.plan(60, 1).unwrap();
        assert_eq!(retry.steps, vec![StagingStep::Flush(0)]);
        assert!(!retry.steps.contains(&StagingStep::Recycle(0)));
    }
}
