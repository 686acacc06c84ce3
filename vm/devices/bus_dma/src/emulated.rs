// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory host for exercising DMA mappings without hardware.
//!
//! [`EmulatedSystem`] implements every host trait over sparse simulated
//! physical memory and per-address-space page tables. Cache maintenance is
//! recorded rather than performed, so tests can check exactly which
//! operations a sync issued.

use crate::host::AddressSpace;
use crate::host::AddressTranslator;
use crate::host::AllocError;
use crate::host::AllocRequest;
use crate::host::CacheController;
use crate::host::CacheRange;
use crate::host::DmaHost;
use crate::host::KernelMapper;
use crate::host::MemoryAccess;
use crate::host::MemoryAccessError;
use crate::host::PAGE_SIZE;
use crate::host::PhysRange;
use crate::host::PhysicalAllocator;
use crate::host::Translation;
use crate::host::page_offset;
use crate::host::round_up_to_page;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Kernel virtual addresses handed out for staging buffers start here.
const KERNEL_MAP_BASE: u64 = 0xffff_8000_0000_0000;

/// A recorded cache maintenance operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheOp {
    /// [`CacheController::invalidate`].
    Invalidate(CacheRange),
    /// [`CacheController::writeback`].
    Writeback(CacheRange),
    /// [`CacheController::writeback_invalidate`].
    WritebackInvalidate(CacheRange),
    /// [`CacheController::drain_write_buffer`].
    Drain,
}

#[derive(Debug, Copy, Clone)]
struct Pte {
    pfn: u64,
    cacheable: bool,
}

#[derive(Debug)]
struct State {
    ram: Vec<PhysRange>,
    pages: HashMap<u64, Box<[u8]>>,
    free: BTreeSet<u64>,
    mappings: HashMap<(AddressSpace, u64), Pte>,
    next_kernel_va: u64,
    idle_spaces: HashSet<AddressSpace>,
    fail_allocations: bool,
    cache_ops: Vec<CacheOp>,
}

impl State {
    fn is_ram(&self, pfn: u64) -> bool {
        let pa = pfn * PAGE_SIZE;
        self.ram.iter().any(|r| pa >= r.start && pa < r.end())
    }

    fn page_mut(&mut self, pfn: u64) -> &mut [u8] {
        self.pages
            .entry(pfn)
            .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice())
    }

    /// Splits `va..va + len` into `(pfn, page offset, length, buffer offset)`
    /// pieces, failing if any page is unmapped.
    fn translate_range(
        &self,
        space: AddressSpace,
        va: u64,
        len: usize,
    ) -> Result<Vec<(u64, usize, usize, usize)>, MemoryAccessError> {
        let mut pieces = Vec::new();
        let mut done = 0;
        while done < len {
            let cur = va + done as u64;
            let pte = self
                .mappings
                .get(&(space, cur / PAGE_SIZE))
                .ok_or(MemoryAccessError { space, va, len })?;
            let offset = page_offset(cur) as usize;
            let n = (len - done).min(PAGE_SIZE as usize - offset);
            pieces.push((pte.pfn, offset, n, done));
            done += n;
        }
        Ok(pieces)
    }

    /// Splits a physical range the same way, failing outside RAM.
    fn physical_range(&self, pa: u64, len: usize) -> anyhow::Result<Vec<(u64, usize, usize, usize)>> {
        let mut pieces = Vec::new();
        let mut done = 0;
        while done < len {
            let cur = pa + done as u64;
            let pfn = cur / PAGE_SIZE;
            anyhow::ensure!(self.is_ram(pfn), "physical address {cur:#x} is not ram");
            let offset = page_offset(cur) as usize;
            let n = (len - done).min(PAGE_SIZE as usize - offset);
            pieces.push((pfn, offset, n, done));
            done += n;
        }
        Ok(pieces)
    }

    fn log(&mut self, op: CacheOp) {
        self.cache_ops.push(op);
    }
}

/// A simulated machine: physical memory, page tables, a page allocator and a
/// recording cache controller.
#[derive(Debug)]
pub struct EmulatedSystem {
    line_size: u64,
    state: Mutex<State>,
}

impl EmulatedSystem {
    /// Creates a system without memory whose data cache has `line_size` byte
    /// lines.
    pub fn new(line_size: u64) -> Arc<Self> {
        assert!(line_size.is_power_of_two(), "cache line size must be a power of two");
        Arc::new(Self {
            line_size,
            state: Mutex::new(State {
                ram: Vec::new(),
                pages: HashMap::new(),
                free: BTreeSet::new(),
                mappings: HashMap::new(),
                next_kernel_va: KERNEL_MAP_BASE,
                idle_spaces: HashSet::new(),
                fail_allocations: false,
                cache_ops: Vec::new(),
            }),
        })
    }

    /// Bundles the system as the host of a DMA tag.
    pub fn host(self: &Arc<Self>) -> DmaHost {
        DmaHost::new(
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
        )
    }

    /// Adds page-aligned physical memory, all of it free for allocation.
    pub fn add_ram(&self, range: PhysRange) -> anyhow::Result<()> {
        anyhow::ensure!(
            page_offset(range.start) == 0 && page_offset(range.len) == 0 && range.len != 0,
            "ram range {:#x}+{:#x} is not page aligned",
            range.start,
            range.len
        );
        let mut state = self.state.lock();
        if let Some(other) = state
            .ram
            .iter()
            .find(|r| range.start < r.end() && r.start < range.end())
        {
            anyhow::bail!(
                "ram range {:#x}+{:#x} overlaps {:#x}+{:#x}",
                range.start,
                range.len,
                other.start,
                other.len
            );
        }
        state.ram.push(range);
        state
            .free
            .extend(range.start / PAGE_SIZE..range.end() / PAGE_SIZE);
        Ok(())
    }

    /// Maps the physical pages `pfns` at the page-aligned `va` in `space`.
    /// The pages are no longer handed out by the allocator.
    pub fn map_pages(
        &self,
        space: AddressSpace,
        va: u64,
        pfns: &[u64],
        cacheable: bool,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(page_offset(va) == 0, "va {va:#x} is not page aligned");
        let mut state = self.state.lock();
        for &pfn in pfns {
            anyhow::ensure!(state.is_ram(pfn), "pfn {pfn:#x} is not ram");
        }
        for (i, &pfn) in pfns.iter().enumerate() {
            state.free.remove(&pfn);
            state
                .mappings
                .insert((space, va / PAGE_SIZE + i as u64), Pte { pfn, cacheable });
        }
        Ok(())
    }

    /// Maps `pfns` cacheable at a fresh kernel address, returning it.
    pub fn map_pages_kernel(&self, pfns: &[u64]) -> anyhow::Result<u64> {
        self.map_kernel(pfns, true)
    }

    fn map_kernel(&self, pfns: &[u64], cacheable: bool) -> anyhow::Result<u64> {
        let va = {
            let mut state = self.state.lock();
            let va = state.next_kernel_va;
            state.next_kernel_va += (pfns.len() as u64 + 1) * PAGE_SIZE;
            va
        };
        self.map_pages(AddressSpace::KERNEL, va, pfns, cacheable)?;
        Ok(va)
    }

    /// Returns the cache operations recorded since the last
    /// [`Self::clear_cache_ops`].
    pub fn cache_ops(&self) -> Vec<CacheOp> {
        self.state.lock().cache_ops.clone()
    }

    /// Forgets the recorded cache operations.
    pub fn clear_cache_ops(&self) {
        self.state.lock().cache_ops.clear();
    }

    /// Sets whether `space` has run with the data cache enabled since the
    /// last full flush.
    pub fn set_cache_activity(&self, space: AddressSpace, active: bool) {
        let mut state = self.state.lock();
        if active {
            state.idle_spaces.remove(&space);
        } else {
            state.idle_spaces.insert(space);
        }
    }

    /// Makes every subsequent allocation fail with
    /// [`AllocError::Exhausted`].
    pub fn set_allocation_failure(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    /// The number of pages available to the allocator.
    pub fn free_page_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Reads physical memory, as a device would.
    pub fn physical_read(&self, pa: u64, data: &mut [u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for (pfn, offset, n, at) in state.physical_range(pa, data.len())? {
            data[at..at + n].copy_from_slice(&state.page_mut(pfn)[offset..offset + n]);
        }
        Ok(())
    }

    /// Writes physical memory, as a device would.
    pub fn physical_write(&self, pa: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for (pfn, offset, n, at) in state.physical_range(pa, data.len())? {
            state.page_mut(pfn)[offset..offset + n].copy_from_slice(&data[at..at + n]);
        }
        Ok(())
    }

    /// Reads a plain-data value from virtual memory.
    pub fn read_plain<T: IntoBytes + FromBytes>(
        &self,
        space: AddressSpace,
        va: u64,
    ) -> anyhow::Result<T> {
        let mut value = T::new_zeroed();
        self.read(space, va, value.as_mut_bytes())
            .with_context(|| format!("reading {}", std::any::type_name::<T>()))?;
        Ok(value)
    }

    /// Writes a plain-data value to virtual memory.
    pub fn write_plain<T: IntoBytes + Immutable + ?Sized>(
        &self,
        space: AddressSpace,
        va: u64,
        value: &T,
    ) -> anyhow::Result<()> {
        self.write(space, va, value.as_bytes())
            .with_context(|| format!("writing {}", std::any::type_name::<T>()))?;
        Ok(())
    }

    /// Finds `pages` free pages starting at a multiple of `align` pages,
    /// inside pfns `lo..hi`.
    fn find_run(state: &State, pages: u64, align: u64, lo: u64, hi: u64) -> Option<u64> {
        if lo >= hi {
            return None;
        }
        let mut start = None;
        let mut len = 0;
        let mut next = 0;
        for &pfn in state.free.range(lo..hi) {
            if start.is_some() && pfn == next {
                len += 1;
            } else if pfn % align == 0 {
                start = Some(pfn);
                len = 1;
            } else {
                start = None;
                len = 0;
            }
            next = pfn + 1;
            if len == pages {
                return start;
            }
        }
        None
    }
}

impl AddressTranslator for EmulatedSystem {
    fn translate(&self, space: AddressSpace, va: u64) -> Option<Translation> {
        let state = self.state.lock();
        state
            .mappings
            .get(&(space, va / PAGE_SIZE))
            .map(|pte| Translation {
                pa: pte.pfn * PAGE_SIZE + page_offset(va),
                cacheable: pte.cacheable,
            })
    }

    fn has_cache_activity(&self, space: AddressSpace) -> bool {
        !self.state.lock().idle_spaces.contains(&space)
    }
}

impl PhysicalAllocator for EmulatedSystem {
    fn allocate(&self, request: &AllocRequest) -> Result<Vec<PhysRange>, AllocError> {
        let size = round_up_to_page(request.size);
        let mut state = self.state.lock();
        if state.fail_allocations || size == 0 {
            return Err(AllocError::Exhausted { size });
        }

        let (lo, hi) = request.window.map_or((0, u64::MAX), |w| {
            (round_up_to_page(w.start) / PAGE_SIZE, w.end() / PAGE_SIZE)
        });
        let pages = size / PAGE_SIZE;
        let align = (request.alignment / PAGE_SIZE).max(1);
        let Some(first) = Self::find_run(&state, pages, align, lo, hi) else {
            return Err(AllocError::Exhausted { size });
        };

        // One physically contiguous run, split wherever it crosses a boundary
        // multiple.
        let mut ranges = Vec::new();
        let mut pa = first * PAGE_SIZE;
        let end = pa + size;
        while pa < end {
            let mut len = end - pa;
            if request.boundary != 0 {
                let next = (pa + request.boundary) & !(request.boundary - 1);
                len = len.min(next - pa);
            }
            ranges.push(PhysRange { start: pa, len });
            pa += len;
        }
        if ranges.len() > request.max_ranges {
            return Err(AllocError::TooFragmented {
                size,
                max_ranges: request.max_ranges,
            });
        }

        for pfn in first..first + pages {
            state.free.remove(&pfn);
        }
        Ok(ranges)
    }

    fn free(&self, ranges: &[PhysRange]) {
        let mut state = self.state.lock();
        for range in ranges {
            state
                .free
                .extend(range.start / PAGE_SIZE..range.end() / PAGE_SIZE);
        }
    }
}

impl KernelMapper for EmulatedSystem {
    fn map(&self, ranges: &[PhysRange], cacheable: bool, _allow_block: bool) -> Option<u64> {
        let pfns: Vec<u64> = ranges
            .iter()
            .flat_map(|r| r.start / PAGE_SIZE..r.end() / PAGE_SIZE)
            .collect();
        self.map_kernel(&pfns, cacheable).ok()
    }

    fn unmap(&self, va: u64, len: u64) {
        let mut state = self.state.lock();
        for vpn in va / PAGE_SIZE..round_up_to_page(va + len) / PAGE_SIZE {
            state.mappings.remove(&(AddressSpace::KERNEL, vpn));
        }
    }
}

impl MemoryAccess for EmulatedSystem {
    fn read(&self, space: AddressSpace, va: u64, data: &mut [u8]) -> Result<(), MemoryAccessError> {
        let mut state = self.state.lock();
        for (pfn, offset, n, at) in state.translate_range(space, va, data.len())? {
            data[at..at + n].copy_from_slice(&state.page_mut(pfn)[offset..offset + n]);
        }
        Ok(())
    }

    fn write(&self, space: AddressSpace, va: u64, data: &[u8]) -> Result<(), MemoryAccessError> {
        let mut state = self.state.lock();
        for (pfn, offset, n, at) in state.translate_range(space, va, data.len())? {
            state.page_mut(pfn)[offset..offset + n].copy_from_slice(&data[at..at + n]);
        }
        Ok(())
    }
}

impl CacheController for EmulatedSystem {
    fn line_size(&self) -> u64 {
        self.line_size
    }

    fn invalidate(&self, range: CacheRange) {
        self.state.lock().log(CacheOp::Invalidate(range));
    }

    fn writeback(&self, range: CacheRange) {
        self.state.lock().log(CacheOp::Writeback(range));
    }

    fn writeback_invalidate(&self, range: CacheRange) {
        self.state.lock().log(CacheOp::WritebackInvalidate(range));
    }

    fn drain_write_buffer(&self) {
        self.state.lock().log(CacheOp::Drain);
    }
}

#[cfg(test)]
mod tests {
    use super::EmulatedSystem;
    use crate::host::AddressSpace;
    use crate::host::AllocError;
    use crate::host::AllocRequest;
    use crate::host::MemoryAccess;
    use crate::host::PAGE_SIZE;
    use crate::host::PhysRange;
    use crate::host::PhysicalAllocator;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    const SPACE: AddressSpace = AddressSpace(2);

    fn system() -> std::sync::Arc<EmulatedSystem> {
        let system = EmulatedSystem::new(64);
        system
            .add_ram(PhysRange {
                start: 0x1_0000,
                len: 16 * PAGE_SIZE,
            })
            .unwrap();
        system
    }

    fn request(size: u64) -> AllocRequest {
        AllocRequest {
            size,
            alignment: PAGE_SIZE,
            boundary: 0,
            window: None,
            max_ranges: 4,
            allow_block: true,
        }
    }

    #[test]
    fn overlapping_ram_is_rejected() {
        let system = system();
        assert!(
            system
                .add_ram(PhysRange {
                    start: 0x1_8000,
                    len: PAGE_SIZE,
                })
                .is_err()
        );
        assert!(
            system
                .add_ram(PhysRange {
                    start: 0x100,
                    len: PAGE_SIZE,
                })
                .is_err()
        );
    }

    #[test]
    fn virtual_access_spans_pages() {
        let system = system();
        system.map_pages(SPACE, 0x7000, &[0x13, 0x11], true).unwrap();
        let data: Vec<u8> = (0..0x20).collect();
        system.write(SPACE, 0x7ff0, &data).unwrap();

        let mut first = [0; 0x10];
        system.physical_read(0x13ff0, &mut first).unwrap();
        assert_eq!(&first, &data[..0x10]);
        let mut second = [0; 0x10];
        system.physical_read(0x11000, &mut second).unwrap();
        assert_eq!(&second, &data[0x10..]);

        let mut buf = [0; 0x20];
        assert!(system.read(SPACE, 0x8ff0, &mut buf).is_err());
    }

    #[test]
    fn plain_values() {
        #[repr(C)]
        #[derive(Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
        struct Descriptor {
            address: u64,
            len: u32,
            flags: u32,
        }

        let system = system();
        system.map_pages(SPACE, 0x3000, &[0x10], false).unwrap();
        let desc = Descriptor {
            address: 0x1234_5678,
            len: 0x200,
            flags: 3,
        };
        system.write_plain(SPACE, 0x3008, &desc).unwrap();
        assert_eq!(system.read_plain::<Descriptor>(SPACE, 0x3008).unwrap(), desc);
        assert!(system.read_plain::<u64>(SPACE, 0x9000).is_err());
    }

    #[test]
    fn allocation_honors_window_and_alignment() {
        let system = system();
        let ranges = system
            .allocate(&AllocRequest {
                alignment: 4 * PAGE_SIZE,
                window: Some(PhysRange {
                    start: 0x1_5000,
                    len: 8 * PAGE_SIZE,
                }),
                ..request(2 * PAGE_SIZE)
            })
            .unwrap();
        assert_eq!(
            ranges,
            vec![PhysRange {
                start: 0x1_8000,
                len: 2 * PAGE_SIZE,
            }]
        );
        assert_eq!(system.free_page_count(), 14);

        system.free(&ranges);
        assert_eq!(system.free_page_count(), 16);
    }

    #[test]
    fn allocation_splits_at_boundary() {
        let system = system();
        let ranges = system
            .allocate(&AllocRequest {
                boundary: 2 * PAGE_SIZE,
                ..request(3 * PAGE_SIZE)
            })
            .unwrap();
        assert_eq!(
            ranges,
            vec![
                PhysRange {
                    start: 0x1_0000,
                    len: 2 * PAGE_SIZE,
                },
                PhysRange {
                    start: 0x1_2000,
                    len: PAGE_SIZE,
                },
            ]
        );

        assert!(matches!(
            system.allocate(&AllocRequest {
                boundary: PAGE_SIZE,
                max_ranges: 2,
                ..request(3 * PAGE_SIZE)
            }),
            Err(AllocError::TooFragmented { max_ranges: 2, .. })
        ));
    }

    #[test]
    fn exhaustion() {
        let system = system();
        assert!(matches!(
            system.allocate(&request(17 * PAGE_SIZE)),
            Err(AllocError::Exhausted { .. })
        ));
        system.set_allocation_failure(true);
        assert!(system.allocate(&request(PAGE_SIZE)).is_err());
        system.set_allocation_failure(false);
        assert!(system.allocate(&request(PAGE_SIZE)).is_ok());
    }
}
