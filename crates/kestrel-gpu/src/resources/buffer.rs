//! Device buffers.

use ash::vk;
use bitflags::bitflags;

use crate::error::{GpuError, Result};
use crate::handle::{GpuObject, ObjectHeader, ObjectKind};
use crate::memory::MemoryAllocation;

bitflags! {
    /// How a buffer is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0001;
        const TRANSFER_DST = 0x0002;
        const UNIFORM = 0x0010;
        const STORAGE = 0x0020;
        const INDEX = 0x0040;
        const VERTEX = 0x0080;
    }
}

impl BufferUsage {
    /// Back-end value.
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        vk::BufferUsageFlags::from_raw(self.bits())
    }
}

bitflags! {
    /// Memory properties requested for a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 0x01;
        const HOST_VISIBLE = 0x02;
        const HOST_COHERENT = 0x04;
        const HOST_CACHED = 0x08;
    }
}

impl MemoryProperties {
    /// Back-end value.
    pub fn to_vk(self) -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::from_raw(self.bits())
    }
}

/// Index element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    /// Back-end value.
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            Self::U16 => vk::IndexType::UINT16,
            Self::U32 => vk::IndexType::UINT32,
        }
    }

    /// Size of one index in bytes.
    pub fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Description of a buffer to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryProperties,
}

impl BufferDesc {
    /// Host-visible, coherent buffer written directly by the CPU.
    pub fn host(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            memory: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
        }
    }

    /// Device-local buffer filled through the staging ring.
    pub fn device(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage: usage | BufferUsage::TRANSFER_DST,
            memory: MemoryProperties::DEVICE_LOCAL,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(GpuError::InvalidArgument("buffer size must be non-zero".into()));
        }
        if self.usage.is_empty() {
            return Err(GpuError::InvalidArgument("buffer usage must be set".into()));
        }
        Ok(())
    }
}

/// Device buffer with its memory.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) header: ObjectHeader,
    pub(crate) handle: vk::Buffer,
    pub(crate) allocation: MemoryAllocation,
    pub(crate) desc: BufferDesc,
}

impl GpuObject for Buffer {
    const KIND: ObjectKind = ObjectKind::Buffer;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl Buffer {
    /// Back-end handle.
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Creation parameters.
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Whether the CPU can write the buffer directly.
    pub fn is_mapped(&self) -> bool {
        self.allocation.mapped.is_some()
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// Only valid for host-visible buffers. The caller must make sure the GPU
    /// is not reading the range being written.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mapped = self.allocation.mapped.ok_or_else(|| {
            GpuError::InvalidArgument("buffer is not host visible".into())
        })?;

        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > self.desc.size) {
            return Err(GpuError::InvalidArgument(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.desc.size
            )));
        }

        // SAFETY: the range was bounds-checked against the allocation, which
        // stays mapped for the buffer's lifetime.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }

    /// Copy a slice of plain values into the buffer at `offset`.
    pub fn write<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    #[cfg(test)]
    pub(crate) fn detached(size: u64, mapped: Option<std::ptr::NonNull<u8>>) -> Self {
        Self {
            header: ObjectHeader::default(),
            handle: vk::Buffer::null(),
            allocation: MemoryAllocation {
                page: 0,
                memory_type: 0,
                memory: vk::DeviceMemory::null(),
                offset: 0,
                size,
                mapped,
            },
            desc: BufferDesc::host(size, BufferUsage::VERTEX),
        }
    }
}

/// Create a buffer object without memory.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_buffer(device: &ash::Device, desc: &BufferDesc) -> Result<vk::Buffer> {
    let create_info = vk::BufferCreateInfo::default()
        .size(desc.size)
        .usage(desc.usage.to_vk())
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = device.create_buffer(&create_info, None)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    #[test]
    fn write_bytes_lands_at_offset() {
        let mut backing = vec![0u8; 16];
        let mut buffer = Buffer::detached(16, NonNull::new(backing.as_mut_ptr()));
        buffer.write_bytes(4, &[1, 2, 3]).unwrap();
        buffer.write::<u16>(8, &[0x0201]).unwrap();
        assert_eq!(&backing[..10], &[0, 0, 0, 0, 1, 2, 3, 0, 1, 2]);
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let mut backing = vec![0u8; 8];
        let mut buffer = Buffer::detached(8, NonNull::new(backing.as_mut_ptr()));
        assert!(matches!(
            buffer.write_bytes(6, &[0; 4]),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(buffer.write_bytes(u64::MAX, &[0]).is_err());
    }

    #[test]
    fn unmapped_buffers_cannot_be_written() {
        let mut buffer = Buffer::detached(8, None);
        assert!(!buffer.is_mapped());
        assert!(buffer.write_bytes(0, &[1]).is_err());
    }

    #[test]
    fn descriptions_validate_and_convert() {
        assert!(BufferDesc::host(0, BufferUsage::VERTEX).validate().is_err());
        assert!(BufferDesc::host(4, BufferUsage::empty()).validate().is_err());

        let desc = BufferDesc::device(64, BufferUsage::INDEX);
        assert!(desc.usage.contains(BufferUsage::TRANSFER_DST));
        assert_eq!(
            desc.usage.to_vk(),
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            MemoryProperties::HOST_VISIBLE.to_vk(),
            vk::MemoryPropertyFlags::HOST_VISIBLE
        );
        assert_eq!(IndexType::U16.size(), 2);
    }
}
