//! Sub-allocating device memory pool.
//!
//! Device memory is allocated in pages, one list of pages per memory type.
//! Each page keeps a sorted free list of `(offset, size)` ranges; requests
//! are served first-fit and freed ranges coalesce with their neighbours.

use std::ptr::NonNull;

use ash::vk;

use crate::error::{GpuError, Result};

/// Round `value` up to a multiple of `alignment` (a power of two, or 0/1).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// [`align_up`] that reports overflow instead of wrapping.
pub fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        Some(value)
    } else {
        Some(value.checked_add(alignment - 1)? & !(alignment - 1))
    }
}

/// Sorted, coalesced free ranges of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeRanges {
    ranges: Vec<(u64, u64)>,
}

impl FreeRanges {
    /// A fully free range of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self {
            ranges: vec![(0, size)],
        }
    }

    /// First-fit allocation returning the aligned offset.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (index, offset) = self.ranges.iter().enumerate().find_map(|(i, &(start, len))| {
            let aligned = checked_align_up(start, alignment)?;
            (aligned.checked_add(size)? <= start + len).then_some((i, aligned))
        })?;

        let (start, len) = self.ranges[index];
        let end = start + len;
        let head = (start, offset - start);
        let tail = (offset + size, end - offset - size);

        match (head.1 > 0, tail.1 > 0) {
            (true, true) => {
                self.ranges[index] = head;
                self.ranges.insert(index + 1, tail);
            }
            (true, false) => self.ranges[index] = head,
            (false, true) => self.ranges[index] = tail,
            (false, false) => {
                self.ranges.remove(index);
            }
        }

        Some(offset)
    }

    /// Return `[offset, offset + size)` to the free list.
    pub fn free(&mut self, offset: u64, size: u64) {
        let index = self.ranges.partition_point(|&(start, _)| start < offset);
        self.ranges.insert(index, (offset, size));

        if index + 1 < self.ranges.len() {
            let (start, len) = self.ranges[index];
            let (next_start, next_len) = self.ranges[index + 1];
            if start + len == next_start {
                self.ranges[index].1 += next_len;
                self.ranges.remove(index + 1);
            }
        }

        if index > 0 {
            let (prev_start, prev_len) = self.ranges[index - 1];
            let (start, len) = self.ranges[index];
            if prev_start + prev_len == start {
                self.ranges[index - 1].1 += len;
                self.ranges.remove(index);
            }
        }
    }

    /// Free ranges in offset order.
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Total free bytes.
    pub fn total_free(&self) -> u64 {
        self.ranges.iter().map(|&(_, len)| len).sum()
    }
}

/// Device memory backing one page.
#[derive(Debug, Clone, Copy)]
pub struct PageMemory {
    pub memory: vk::DeviceMemory,
    pub mapped: Option<NonNull<u8>>,
}

/// Where pages come from.
pub trait PageSource {
    /// Allocate a page of `size` bytes, mapping it when `map` is set.
    fn allocate_page(&mut self, memory_type: u32, size: u64, map: bool) -> Result<PageMemory>;

    /// Release a page.
    fn free_page(&mut self, page: PageMemory);
}

/// A sub-allocation handed out by [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocation {
    pub page: u64,
    pub memory_type: u32,
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer refers to persistently mapped device memory
// owned by the pool; access is coordinated by the owning device.
unsafe impl Send for MemoryAllocation {}

struct Page {
    id: u64,
    memory: PageMemory,
    size: u64,
    free: FreeRanges,
}

// SAFETY: see `MemoryAllocation`.
unsafe impl Send for Page {}

/// Per-memory-type page pool.
pub struct MemoryPool {
    pages: Vec<Vec<Page>>,
    page_size: u64,
    next_page_id: u64,
}

impl MemoryPool {
    /// Create a pool whose pages are at least `page_size` bytes.
    pub fn new(page_size: u64) -> Self {
        Self {
            pages: (0..vk::MAX_MEMORY_TYPES).map(|_| Vec::new()).collect(),
            page_size,
            next_page_id: 0,
        }
    }

    /// Sub-allocate `size` bytes aligned to `alignment` from `memory_type`.
    pub fn alloc(
        &mut self,
        source: &mut impl PageSource,
        size: u64,
        alignment: u64,
        memory_type: u32,
        map_persistently: bool,
    ) -> Result<MemoryAllocation> {
        if size == 0 {
            return Err(GpuError::InvalidArgument("zero-sized allocation".into()));
        }

        let pages = self
            .pages
            .get_mut(memory_type as usize)
            .ok_or_else(|| GpuError::InvalidArgument(format!("memory type {memory_type}")))?;

        for page in pages.iter_mut() {
            if map_persistently && page.memory.mapped.is_none() {
                continue;
            }
            if let Some(offset) = page.free.allocate(size, alignment) {
                return Ok(Self::suballocation(page, memory_type, offset, size));
            }
        }

        let needed = checked_align_up(size, alignment).ok_or(GpuError::OutOfDeviceMemory)?;
        let page_size = self.page_size.max(needed);
        let memory = source
            .allocate_page(memory_type, page_size, map_persistently)
            .map_err(|err| match err {
                GpuError::MappingFailed => GpuError::MappingFailed,
                _ => GpuError::OutOfDeviceMemory,
            })?;

        tracing::debug!(
            "Memory pool grew by {} KiB on type {memory_type}",
            page_size / 1024
        );

        let mut page = Page {
            id: self.next_page_id,
            memory,
            size: page_size,
            free: FreeRanges::new(page_size),
        };
        self.next_page_id += 1;

        let offset = page
            .free
            .allocate(size, alignment)
            .ok_or(GpuError::OutOfDeviceMemory)?;
        let allocation = Self::suballocation(&page, memory_type, offset, size);
        pages.push(page);
        Ok(allocation)
    }

    fn suballocation(page: &Page, memory_type: u32, offset: u64, size: u64) -> MemoryAllocation {
        MemoryAllocation {
            page: page.id,
            memory_type,
            memory: page.memory.memory,
            offset,
            size,
            // SAFETY: offset + size lies within the mapped page.
            mapped: page
                .memory
                .mapped
                .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }),
        }
    }

    /// Return an allocation's range to its page.
    pub fn free(&mut self, allocation: &MemoryAllocation) {
        let page = self
            .pages
            .get_mut(allocation.memory_type as usize)
            .and_then(|pages| pages.iter_mut().find(|page| page.id == allocation.page));

        match page {
            Some(page) => page.free.free(allocation.offset, allocation.size),
            None => tracing::warn!("Freed allocation from unknown page {}", allocation.page),
        }
    }

    /// Number of live pages across all memory types.
    pub fn page_count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// Bytes still free in pages of `memory_type`.
    pub fn free_bytes(&self, memory_type: u32) -> u64 {
        self.pages
            .get(memory_type as usize)
            .map_or(0, |pages| pages.iter().map(|p| p.free.total_free()).sum())
    }

    /// Release every page.
    pub fn shutdown(&mut self, source: &mut impl PageSource) {
        for pages in &mut self.pages {
            for page in pages.drain(..) {
                if page.free.total_free() != page.size {
                    tracing::warn!(
                        "Releasing page {} with {} bytes still allocated",
                        page.id,
                        page.size - page.free.total_free()
                    );
                }
                source.free_page(page.memory);
            }
        }
    }
}

/// Pages allocated straight from a Vulkan device.
pub struct DevicePageSource<'a> {
    device: &'a ash::Device,
}

impl<'a> DevicePageSource<'a> {
    /// Wrap a device.
    pub fn new(device: &'a ash::Device) -> Self {
        Self { device }
    }
}

impl PageSource for DevicePageSource<'_> {
    fn allocate_page(&mut self, memory_type: u32, size: u64, map: bool) -> Result<PageMemory> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };

        let mapped = if map {
            let pointer = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match pointer.ok().and_then(|p| NonNull::new(p.cast::<u8>())) {
                Some(pointer) => Some(pointer),
                None => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(GpuError::MappingFailed);
                }
            }
        } else {
            None
        };

        Ok(PageMemory { memory, mapped })
    }

    fn free_page(&mut self, page: PageMemory) {
        unsafe {
            if page.mapped.is_some() {
                self.device.unmap_memory(page.memory);
            }
            self.device.free_memory(page.memory, None);
        }
    }
}

/// Pick a memory type allowed by `type_bits`, preferring `preferred` flags
/// and falling back to `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let matching = |flags: vk::MemoryPropertyFlags| {
        (0..properties.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
    };

    matching(required | preferred).or_else(|| matching(required))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Default)]
    struct FakeSource {
        next: u64,
        fail: bool,
        freed: usize,
        backing: Vec<Vec<u8>>,
    }

    impl PageSource for FakeSource {
        fn allocate_page(&mut self, _memory_type: u32, size: u64, map: bool) -> Result<PageMemory> {
            if self.fail {
                return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            self.next += 1;
            let mapped = if map {
                self.backing.push(vec![0; size as usize]);
                self.backing.last_mut().and_then(|b| NonNull::new(b.as_mut_ptr()))
            } else {
                None
            };
            Ok(PageMemory {
                memory: vk::DeviceMemory::from_raw(self.next),
                mapped,
            })
        }

        fn free_page(&mut self, _page: PageMemory) {
            self.freed += 1;
        }
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn first_fit_splits_and_coalesces() {
        let mut free = FreeRanges::new(1024);
        let a = free.allocate(100, 1).unwrap();
        let b = free.allocate(100, 1).unwrap();
        let c = free.allocate(100, 1).unwrap();
        assert_eq!((a, b, c), (0, 100, 200));

        free.free(b, 100);
        assert_eq!(free.ranges(), &[(100, 100), (300, 724)]);

        free.free(a, 100);
        assert_eq!(free.ranges(), &[(0, 200), (300, 724)]);

        free.free(c, 100);
        assert_eq!(free.ranges(), &[(0, 1024)]);
    }

    #[test]
    fn alignment_leaves_leading_gap_free() {
        let mut free = FreeRanges::new(1024);
        free.allocate(10, 1).unwrap();
        let aligned = free.allocate(64, 256).unwrap();
        assert_eq!(aligned, 256);
        assert_eq!(free.ranges(), &[(10, 246), (320, 704)]);
    }

    #[test]
    fn freed_range_is_immediately_reusable() {
        let mut free = FreeRanges::new(512);
        let a = free.allocate(128, 64).unwrap();
        let _b = free.allocate(384, 64).unwrap();
        assert!(free.allocate(64, 64).is_none());

        free.free(a, 128);
        assert_eq!(free.allocate(128, 64), Some(a));
    }

    #[test]
    fn allocations_never_overlap() {
        let mut free = FreeRanges::new(4096);
        let mut live = Vec::new();
        for (i, size) in [100u64, 33, 512, 7, 64, 900].into_iter().enumerate() {
            let alignment = 1 << (i % 4 + 2);
            let offset = free.allocate(size, alignment).unwrap();
            assert_eq!(offset % alignment, 0);
            live.push((offset, size));
        }
        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn pool_grows_one_page_at_a_time() {
        let mut source = FakeSource::default();
        let mut pool = MemoryPool::new(1024);

        let a = pool.alloc(&mut source, 600, 16, 2, false).unwrap();
        let b = pool.alloc(&mut source, 300, 16, 2, false).unwrap();
        assert_eq!(a.page, b.page);
        assert_eq!(pool.page_count(), 1);

        let c = pool.alloc(&mut source, 600, 16, 2, false).unwrap();
        assert_ne!(c.page, a.page);
        assert_eq!(pool.page_count(), 2);

        pool.free(&a);
        let d = pool.alloc(&mut source, 500, 16, 2, false).unwrap();
        assert_eq!(d.page, a.page);
        assert_eq!(d.offset, 0);
    }

    #[test]
    fn oversized_requests_get_their_own_page() {
        let mut source = FakeSource::default();
        let mut pool = MemoryPool::new(1024);
        let big = pool.alloc(&mut source, 5000, 256, 0, false).unwrap();
        assert_eq!(big.offset, 0);
        assert_eq!(pool.free_bytes(0), align_up(5000, 256) - 5000);
    }

    #[test]
    fn mapped_allocations_point_into_the_page() {
        let mut source = FakeSource::default();
        let mut pool = MemoryPool::new(256);
        let a = pool.alloc(&mut source, 16, 16, 1, true).unwrap();
        let b = pool.alloc(&mut source, 16, 16, 1, true).unwrap();
        let (pa, pb) = (a.mapped.unwrap(), b.mapped.unwrap());
        assert_eq!(pb.as_ptr() as usize - pa.as_ptr() as usize, 16);

        let unmapped = pool.alloc(&mut source, 16, 16, 1, false).unwrap();
        assert_eq!(unmapped.page, a.page);
    }

    #[test]
    fn failed_growth_reports_out_of_device_memory() {
        let mut source = FakeSource {
            fail: true,
            ..FakeSource::default()
        };
        let mut pool = MemoryPool::new(256);
        assert_eq!(
            pool.alloc(&mut source, 64, 1, 0, false),
            Err(GpuError::OutOfDeviceMemory)
        );
        assert!(matches!(
            pool.alloc(&mut source, 0, 1, 0, false),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn huge_requests_fail_instead_of_wrapping() {
        let mut free = FreeRanges::new(1024);
        free.allocate(10, 1).unwrap();
        assert_eq!(free.allocate(u64::MAX - 4, 1), None);
        assert_eq!(free.allocate(16, u64::MAX / 2 + 1), None);
        assert_eq!(free.ranges(), &[(10, 1014)]);

        let mut source = FakeSource::default();
        let mut pool = MemoryPool::new(1024);
        pool.alloc(&mut source, 10, 1, 0, false).unwrap();
        assert_eq!(
            pool.alloc(&mut source, u64::MAX - 8, 256, 0, false),
            Err(GpuError::OutOfDeviceMemory)
        );
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn shutdown_releases_every_page() {
        let mut source = FakeSource::default();
        let mut pool = MemoryPool::new(128);
        pool.alloc(&mut source, 100, 1, 0, false).unwrap();
        pool.alloc(&mut source, 100, 1, 3, false).unwrap();
        pool.shutdown(&mut source);
        assert_eq!(source.freed, 2);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn memory_type_prefers_then_requires() {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&properties, 0b11, host, local), Some(1));
        assert_eq!(find_memory_type(&properties, 0b01, host, local), Some(0));
        assert_eq!(find_memory_type(&properties, 0b01, local, local), None);
    }
}
