// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA-safe memory owned by drivers, such as descriptor rings and command
//! blocks that the CPU and the device share for their whole life.

use crate::DmaError;
use crate::host::AllocError;
use crate::host::CacheRange;
use crate::host::PAGE_SIZE;
use crate::host::PhysRange;
use crate::host::page_offset;
use crate::host::round_up_to_page;
use crate::tag::DmaTag;
use bitfield_struct::bitfield;

/// Options for allocating and mapping DMA memory.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MemoryFlags {
    /// Fail instead of waiting for memory or kernel address space.
    pub no_wait: bool,
    /// Map the memory uncached, so maps loaded from it are coherent and
    /// syncs only drain the write buffer.
    pub coherent: bool,
    #[bits(6)]
    _reserved: u8,
}

fn assert_page_aligned(ranges: &[PhysRange]) {
    assert!(
        ranges
            .iter()
            .all(|r| page_offset(r.start) == 0 && page_offset(r.len) == 0),
        "dma memory ranges are not page aligned"
    );
}

impl DmaTag {
    /// Allocates `size` bytes (rounded up to whole pages) that the device can
    /// reach, in at most `max_ranges` physically contiguous runs.
    ///
    /// Windows are tried in order; identity tags allocate from anywhere. The
    /// runs start on an `alignment` multiple (at least a page) and none
    /// crosses a multiple of a nonzero `boundary`.
    pub fn alloc_memory(
        &self,
        size: u64,
        alignment: u64,
        boundary: u64,
        max_ranges: usize,
        flags: MemoryFlags,
    ) -> Result<Vec<PhysRange>, DmaError> {
        assert!(size != 0, "empty dma memory allocation");
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        assert!(
            boundary == 0 || boundary.is_power_of_two(),
            "boundary must be a power of two"
        );

        let size = round_up_to_page(size);
        let ranges = self
            .allocate_reachable(
                size,
                alignment.max(PAGE_SIZE),
                boundary,
                max_ranges,
                !flags.no_wait(),
            )
            .map_err(|err| {
                tracing::warn!(
                    size,
                    error = &err as &dyn std::error::Error,
                    "failed to allocate dma memory"
                );
                DmaError::OutOfMemory(err)
            })?;
        tracing::debug!(size, ranges = ranges.len(), "allocated dma memory");
        Ok(ranges)
    }

    /// Frees memory from [`Self::alloc_memory`]. Any kernel mapping must be
    /// removed first.
    pub fn free_memory(&self, ranges: &[PhysRange]) {
        assert_page_aligned(ranges);
        self.host().allocator.free(ranges);
        tracing::debug!(ranges = ranges.len(), "freed dma memory");
    }

    /// Maps `ranges` contiguously into the kernel, returning the address of
    /// the first byte. `size` is the length of the mapping and must cover
    /// every range.
    ///
    /// With [`MemoryFlags::coherent`] the mapping is uncached, and lines left
    /// in the cache by earlier cached mappings of the same pages are written
    /// back and discarded.
    pub fn map_memory(
        &self,
        ranges: &[PhysRange],
        size: u64,
        flags: MemoryFlags,
    ) -> Result<u64, DmaError> {
        assert_page_aligned(ranges);
        let size = round_up_to_page(size);
        let total: u64 = ranges.iter().map(|r| r.len).sum();
        assert!(
            total <= size,
            "dma memory ranges of {total:#x} bytes exceed the {size:#x} byte mapping"
        );

        let host = self.host();
        let Some(va) = host.mapper.map(ranges, !flags.coherent(), !flags.no_wait()) else {
            tracing::warn!(size, "failed to map dma memory");
            return Err(DmaError::OutOfMemory(AllocError::MapFailed));
        };

        if flags.coherent() {
            let mut offset = 0;
            for range in ranges {
                host.cache.writeback_invalidate(CacheRange {
                    va: va + offset,
                    pa: range.start,
                    len: range.len,
                });
                offset += range.len;
            }
            host.cache.drain_write_buffer();
        }

        tracing::debug!(size, va, coherent = flags.coherent(), "mapped dma memory");
        Ok(va)
    }

    /// Removes a mapping created by [`Self::map_memory`].
    pub fn unmap_memory(&self, va: u64, size: u64) {
        assert_eq!(page_offset(va), 0, "unaligned dma memory mapping {va:#x}");
        self.host().mapper.unmap(va, round_up_to_page(size));
        tracing::debug!(va, size, "unmapped dma memory");
    }

    /// Returns the page frame at byte `offset` into `ranges`, for mapping the
    /// memory into a user address space, or `None` past the end.
    pub fn memory_page_frame(&self, ranges: &[PhysRange], offset: u64) -> Option<u64> {
        assert_page_aligned(ranges);
        assert_eq!(page_offset(offset), 0, "unaligned dma memory offset {offset:#x}");

        let mut offset = offset;
        for range in ranges {
            if offset < range.len {
                return Some((range.start + offset) / PAGE_SIZE);
            }
            offset -= range.len;
        }
        None
    }
}
