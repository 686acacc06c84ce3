// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bus DMA mapping for device drivers.
//!
//! A [`DmaTag`] describes what a device can reach: an ordered table of
//! address windows translating system physical addresses into bus addresses,
//! and whether transfers may be relayed through staging memory. A [`DmaMap`]
//! is created against a tag with fixed segment limits, then loaded with a
//! flat buffer, an I/O vector or a packet chain. Loading produces the list of
//! bus-addressable [`DmaSegment`]s to program into the device. Around each
//! device access the driver calls [`DmaMap::sync`], which performs the cache
//! maintenance the transfer direction needs and copies data through the
//! staging buffer when the map is bouncing.
//!
//! Tags also hand out DMA-safe memory for structures the driver shares with
//! the device, such as descriptor rings ([`DmaTag::alloc_memory`]). Mapped
//! with [`MemoryFlags::coherent`], such memory needs no cache maintenance.
//!
//! Everything that touches real hardware or page tables is supplied by the
//! embedder through the traits in [`host`]. The [`emulated`] module provides
//! an in-memory implementation of all of them.

#![forbid(unsafe_code)]

mod bounce;
mod buffer;
pub mod emulated;
pub mod host;
mod map;
mod memory;
pub mod metrics;
mod segment;
mod sync;
mod tag;
mod walk;

pub use bounce::BounceFlags;
pub use buffer::BufferKind;
pub use buffer::FlatBuffer;
pub use buffer::IoVec;
pub use buffer::IoVector;
pub use buffer::PacketBacking;
pub use buffer::PacketChain;
pub use buffer::PacketNode;
pub use map::DmaMap;
pub use map::LoadFlags;
pub use map::MapLimits;
pub use memory::MemoryFlags;
pub use segment::DmaSegment;
pub use sync::SyncOps;
pub use tag::DmaRange;
pub use tag::DmaTag;
pub use tag::StagingDecision;
pub use tag::StagingPredicate;
pub use tag::destroy_tag;

use host::AddressSpace;
use host::AllocError;
use host::MemoryAccessError;
use thiserror::Error;

/// Errors returned when loading or syncing a DMA map.
///
/// Every load error leaves the map empty, so the caller may retry with
/// different parameters. Caller bugs (mixing pre and post sync operations,
/// syncing an unloaded map, syncing past the mapped length) are not reported
/// here; they panic.
#[derive(Debug, Error)]
pub enum DmaError {
    /// A physical address is not covered by any of the tag's windows, and the
    /// map cannot bounce.
    #[error("physical address {0:#x} is not reachable through any dma window")]
    AddressOutOfRange(u64),
    /// The transfer needs more segments than the map allows.
    #[error("transfer needs more than {max} segments")]
    TooManySegments {
        /// The map's segment limit.
        max: usize,
    },
    /// The transfer is longer than the map's capacity.
    #[error("transfer of {len:#x} bytes exceeds map capacity of {capacity:#x} bytes")]
    BufferTooLarge {
        /// The requested transfer length.
        len: u64,
        /// The map's capacity.
        capacity: u64,
    },
    /// A device-to-memory transfer targets a read-only packet buffer.
    #[error("device write targets a read-only packet buffer")]
    ReadOnlyViolation,
    /// Staging memory could not be allocated or mapped.
    #[error("unable to allocate staging memory")]
    OutOfMemory(#[source] AllocError),
    /// Loading pre-segmented raw memory is not implemented.
    #[error("loading pre-segmented raw memory is not supported")]
    UnsupportedOperation,
    /// A page of the buffer has no physical backing.
    #[error("virtual address {va:#x} is not mapped in {space:?}")]
    NotMapped {
        /// The address space of the buffer.
        space: AddressSpace,
        /// The untranslatable virtual address.
        va: u64,
    },
    /// Copying between the caller's buffer and the staging buffer failed.
    #[error("failed to copy through the staging buffer")]
    Copy(#[source] MemoryAccessError),
}
