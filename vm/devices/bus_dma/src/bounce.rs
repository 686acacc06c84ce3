// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Staging ("bounce") buffers for buffers a device cannot reach.

use crate::DmaError;
use crate::host::AddressSpace;
use crate::host::AllocError;
use crate::host::PAGE_SIZE;
use crate::host::PhysRange;
use crate::host::round_up_to_page;
use crate::segment::SegmentList;
use crate::tag::DmaTag;
use crate::walk::Walker;
use bitfield_struct::bitfield;

/// The bounce state of a map.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct BounceFlags {
    /// Loads that cannot be mapped directly fall back to staging.
    pub might_bounce: bool,
    /// Every load goes through staging.
    pub always_bounce: bool,
    /// A staging buffer is allocated.
    pub has_staging: bool,
    /// The current load is relayed through the staging buffer.
    pub is_bouncing: bool,
    #[bits(4)]
    _reserved: u8,
}

/// Device-reachable memory mapped into the kernel.
#[derive(Debug)]
pub(crate) struct StagingBuffer {
    ranges: Vec<PhysRange>,
    pub va: u64,
    pub len: u64,
}

/// Per-map bounce state.
#[derive(Debug)]
pub(crate) struct BounceCookie {
    flags: BounceFlags,
    staging: Option<StagingBuffer>,
}

impl BounceCookie {
    pub fn new(always_bounce: bool) -> Self {
        Self {
            flags: BounceFlags::new()
                .with_might_bounce(true)
                .with_always_bounce(always_bounce),
            staging: None,
        }
    }

    pub fn flags(&self) -> BounceFlags {
        self.flags
    }

    pub fn staging(&self) -> Option<&StagingBuffer> {
        self.staging.as_ref()
    }

    pub fn is_bouncing(&self) -> bool {
        self.flags.is_bouncing()
    }

    pub fn set_bouncing(&mut self, bouncing: bool) {
        self.flags.set_is_bouncing(bouncing);
    }

    /// Makes sure a staging buffer of at least `size` bytes exists, returning
    /// its kernel virtual address.
    fn allocate(
        &mut self,
        tag: &DmaTag,
        boundary: u64,
        max_ranges: usize,
        size: u64,
        allow_block: bool,
    ) -> Result<u64, DmaError> {
        let size = round_up_to_page(size);
        if let Some(staging) = &self.staging {
            if staging.len >= size {
                return Ok(staging.va);
            }
            tracing::debug!(
                old = staging.len,
                new = size,
                "staging buffer too small, reallocating"
            );
            self.release(tag);
        }

        let host = tag.host();
        let ranges = tag
            .allocate_reachable(size, PAGE_SIZE, boundary, max_ranges, allow_block)
            .map_err(|err| {
                tracing::warn!(
                    size,
                    error = &err as &dyn std::error::Error,
                    "failed to allocate staging buffer"
                );
                DmaError::OutOfMemory(err)
            })?;
        let Some(va) = host.mapper.map(&ranges, true, allow_block) else {
            host.allocator.free(&ranges);
            tracing::warn!(size, "failed to map staging buffer");
            return Err(DmaError::OutOfMemory(AllocError::MapFailed));
        };
        tracing::debug!(size, va, ranges = ranges.len(), "allocated staging buffer");
        self.staging = Some(StagingBuffer {
            ranges,
            va,
            len: size,
        });
        self.flags.set_has_staging(true);
        Ok(va)
    }

    /// Unmaps and frees the staging buffer, if any.
    pub fn release(&mut self, tag: &DmaTag) {
        if let Some(staging) = self.staging.take() {
            let host = tag.host();
            host.mapper.unmap(staging.va, staging.len);
            host.allocator.free(&staging.ranges);
            tracing::debug!(len = staging.len, "released staging buffer");
        }
        self.flags.set_has_staging(false);
        self.flags.set_is_bouncing(false);
    }
}

/// Loads `segments` with a staging buffer standing in for a `len` byte
/// buffer, returning whether the staging memory is coherent.
pub(crate) fn load_staged(
    tag: &DmaTag,
    segments: &mut SegmentList,
    cookie: &mut BounceCookie,
    len: u64,
    allow_block: bool,
) -> Result<bool, DmaError> {
    segments.clear();
    let va = cookie.allocate(
        tag,
        segments.boundary(),
        segments.max_segments(),
        len,
        allow_block,
    )?;

    let mut walker = Walker::new(tag, segments);
    walker.flat(AddressSpace::KERNEL, va, len)?;
    let coherent = walker.coherent();
    cookie.set_bouncing(true);
    Ok(coherent)
}

#[cfg(test)]
mod tests {
    use super::BounceCookie;
    use super::load_staged;
    use crate::DmaError;
    use crate::DmaTag;
    use crate::host::AllocError;
    use crate::host::PAGE_SIZE;
    use crate::segment::SegmentList;
    use crate::test_helpers::LOW_RAM;
    use crate::test_helpers::WINDOW;
    use crate::test_helpers::system;
    use crate::test_helpers::windowed_tag;

    #[test]
    fn staging_comes_from_window() {
        let system = system();
        let tag = windowed_tag(&system, true);
        let free = system.free_page_count();

        let mut cookie = BounceCookie::new(false);
        let mut segments = SegmentList::new(4, 0x10000, 0);
        load_staged(&tag, &mut segments, &mut cookie, 0x1800, true).unwrap();

        let flags = cookie.flags();
        assert!(flags.might_bounce() && flags.has_staging() && flags.is_bouncing());
        let staging = cookie.staging().unwrap();
        assert_eq!(staging.len, 2 * PAGE_SIZE);
        assert_eq!(system.free_page_count(), free - 2);
        for seg in segments.as_slice() {
            assert!(WINDOW.contains_bus(seg.bus_address));
            let pa = seg.bus_address - WINDOW.bus_base;
            assert!(pa >= LOW_RAM.start && pa < LOW_RAM.end());
        }
        assert_eq!(segments.as_slice().iter().map(|s| s.len).sum::<u64>(), 0x1800);

        cookie.release(&tag);
        assert!(!cookie.flags().has_staging());
        assert_eq!(system.free_page_count(), free);
        cookie.release(&tag);
    }

    #[test]
    fn staging_is_reused_or_grown() {
        let system = system();
        let tag = windowed_tag(&system, true);
        let mut cookie = BounceCookie::new(false);
        let mut segments = SegmentList::new(8, 0x10000, 0);

        load_staged(&tag, &mut segments, &mut cookie, 2 * PAGE_SIZE, true).unwrap();
        let first = cookie.staging().unwrap().va;
        load_staged(&tag, &mut segments, &mut cookie, PAGE_SIZE, true).unwrap();
        assert_eq!(cookie.staging().unwrap().va, first);
        assert_eq!(cookie.staging().unwrap().len, 2 * PAGE_SIZE);

        load_staged(&tag, &mut segments, &mut cookie, 3 * PAGE_SIZE, true).unwrap();
        assert_eq!(cookie.staging().unwrap().len, 3 * PAGE_SIZE);
        cookie.release(&tag);
    }

    #[test]
    fn exhausted_allocator() {
        let system = system();
        let tag = windowed_tag(&system, true);
        system.set_allocation_failure(true);

        let mut cookie = BounceCookie::new(false);
        let mut segments = SegmentList::new(4, 0x10000, 0);
        let err = load_staged(&tag, &mut segments, &mut cookie, 0x100, false).unwrap_err();
        assert!(matches!(
            err,
            DmaError::OutOfMemory(AllocError::Exhausted { .. })
        ));
        assert!(!cookie.flags().has_staging());
        assert!(!cookie.is_bouncing());
    }

    #[test]
    fn identity_tag_stages_anywhere() {
        let system = system();
        let tag = DmaTag::with_staging(system.host(), Vec::new(), None);
        let mut cookie = BounceCookie::new(true);
        let mut segments = SegmentList::new(4, 0x10000, 0);
        load_staged(&tag, &mut segments, &mut cookie, PAGE_SIZE, true).unwrap();
        assert!(cookie.flags().always_bounce());
        assert_eq!(segments.as_slice().len(), 1);
        cookie.release(&tag);
    }
}
