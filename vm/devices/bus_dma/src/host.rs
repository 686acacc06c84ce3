// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host environment interfaces consumed by the DMA core.
//!
//! The core never touches page tables, cache instructions or physical memory
//! directly. The embedder provides those through the traits here, bundled
//! into a [`DmaHost`] that is attached to each tag.

use crate::metrics::DmaCounters;
use crate::metrics::DmaMetrics;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// The page size used for translation and staging allocations.
pub const PAGE_SIZE: u64 = 4096;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Rounds `n` up to the next page boundary.
pub const fn round_up_to_page(n: u64) -> u64 {
    (n + PAGE_MASK) & !PAGE_MASK
}

/// Rounds `n` down to a page boundary.
pub const fn trunc_page(n: u64) -> u64 {
    n & !PAGE_MASK
}

/// Returns the offset of `n` within its page.
pub const fn page_offset(n: u64) -> u64 {
    n & PAGE_MASK
}

/// A virtual address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpace(pub u32);

impl AddressSpace {
    /// The kernel address space. Staging buffers and packet chains live here.
    pub const KERNEL: Self = Self(0);

    /// Returns true for the kernel address space.
    pub fn is_kernel(&self) -> bool {
        *self == Self::KERNEL
    }
}

/// The result of translating one virtual address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// The physical address of the translated byte.
    pub pa: u64,
    /// Whether the page is mapped cacheable.
    pub cacheable: bool,
}

/// Translates virtual addresses into physical ones.
pub trait AddressTranslator: Send + Sync {
    /// Translates `va` in `space`, returning `None` if it is not mapped.
    fn translate(&self, space: AddressSpace, va: u64) -> Option<Translation>;

    /// Returns false if `space` has not run with the data cache enabled since
    /// the last full cache flush, in which case no cache maintenance is needed
    /// for its buffers.
    fn has_cache_activity(&self, space: AddressSpace) -> bool {
        let _ = space;
        true
    }
}

/// A run of physical memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysRange {
    /// The first physical address.
    pub start: u64,
    /// The length in bytes.
    pub len: u64,
}

impl PhysRange {
    /// The address one past the end of the run.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// A request for physical memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    /// The number of bytes, a multiple of [`PAGE_SIZE`].
    pub size: u64,
    /// The required alignment of the first page.
    pub alignment: u64,
    /// If nonzero, no returned run may cross a multiple of this value.
    pub boundary: u64,
    /// The physical window the memory must come from, or `None` for any
    /// memory.
    pub window: Option<PhysRange>,
    /// The maximum number of discontiguous runs the caller can accept.
    pub max_ranges: usize,
    /// Whether the allocator may wait for memory to become available.
    pub allow_block: bool,
}

/// Errors from staging memory allocation.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Not enough free memory satisfies the request.
    #[error("no physical memory available for {size:#x} bytes")]
    Exhausted {
        /// The requested size.
        size: u64,
    },
    /// Free memory exists but is split into more runs than allowed.
    #[error("free memory for {size:#x} bytes spans more than {max_ranges} runs")]
    TooFragmented {
        /// The requested size.
        size: u64,
        /// The run limit.
        max_ranges: usize,
    },
    /// The memory could not be mapped into the kernel address space.
    #[error("failed to map dma memory into the kernel")]
    MapFailed,
}

/// Allocates and frees physical pages.
pub trait PhysicalAllocator: Send + Sync {
    /// Allocates memory satisfying `request`, returning its runs in address
    /// order.
    fn allocate(&self, request: &AllocRequest) -> Result<Vec<PhysRange>, AllocError>;

    /// Frees memory previously returned by [`Self::allocate`].
    fn free(&self, ranges: &[PhysRange]);
}

/// Maps physical memory into the kernel address space.
pub trait KernelMapper: Send + Sync {
    /// Maps `ranges` contiguously, returning the kernel virtual address of the
    /// first byte. Uncached mappings are used for memory shared coherently
    /// with a device.
    fn map(&self, ranges: &[PhysRange], cacheable: bool, allow_block: bool) -> Option<u64>;

    /// Removes a mapping created by [`Self::map`].
    fn unmap(&self, va: u64, len: u64);
}

/// An error accessing virtual memory.
#[derive(Debug, Error)]
#[error("failed to access {len:#x} bytes at {va:#x} in {space:?}")]
pub struct MemoryAccessError {
    /// The address space accessed.
    pub space: AddressSpace,
    /// The first address of the access.
    pub va: u64,
    /// The length of the access.
    pub len: usize,
}

/// Byte access to virtual memory, used to relay data through staging
/// buffers.
pub trait MemoryAccess: Send + Sync {
    /// Reads `data.len()` bytes at `va`.
    fn read(&self, space: AddressSpace, va: u64, data: &mut [u8]) -> Result<(), MemoryAccessError>;

    /// Writes `data` at `va`.
    fn write(&self, space: AddressSpace, va: u64, data: &[u8]) -> Result<(), MemoryAccessError>;
}

/// A range for cache maintenance, given both virtually (for virtually indexed
/// caches) and physically (for outer caches).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheRange {
    /// The first virtual address.
    pub va: u64,
    /// The physical address of `va`.
    pub pa: u64,
    /// The length in bytes.
    pub len: u64,
}

/// Data cache maintenance primitives.
pub trait CacheController: Send + Sync {
    /// The data cache line size, a power of two.
    fn line_size(&self) -> u64;
    /// Discards cached lines without writing them back.
    fn invalidate(&self, range: CacheRange);
    /// Writes dirty lines back to memory.
    fn writeback(&self, range: CacheRange);
    /// Writes dirty lines back and then discards them.
    fn writeback_invalidate(&self, range: CacheRange);
    /// Waits for buffered writes to reach memory.
    fn drain_write_buffer(&self);
}

/// The host collaborators used by a tag and every map created from it.
#[derive(Clone)]
pub struct DmaHost {
    /// Virtual to physical translation.
    pub translator: Arc<dyn AddressTranslator>,
    /// Physical page allocation for staging buffers.
    pub allocator: Arc<dyn PhysicalAllocator>,
    /// Kernel mappings for staging buffers.
    pub mapper: Arc<dyn KernelMapper>,
    /// Byte access for bounce copies.
    pub memory: Arc<dyn MemoryAccess>,
    /// Cache maintenance.
    pub cache: Arc<dyn CacheController>,
    /// Event counters.
    pub metrics: Arc<dyn DmaMetrics>,
}

impl DmaHost {
    /// Bundles the collaborators, counting events into a fresh
    /// [`DmaCounters`].
    pub fn new(
        translator: Arc<dyn AddressTranslator>,
        allocator: Arc<dyn PhysicalAllocator>,
        mapper: Arc<dyn KernelMapper>,
        memory: Arc<dyn MemoryAccess>,
        cache: Arc<dyn CacheController>,
    ) -> Self {
        Self {
            translator,
            allocator,
            mapper,
            memory,
            cache,
            metrics: Arc::new(DmaCounters::new()),
        }
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(self, metrics: Arc<dyn DmaMetrics>) -> Self {
        Self { metrics, ..self }
    }
}

impl Debug for DmaHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaHost").finish_non_exhaustive()
    }
}
