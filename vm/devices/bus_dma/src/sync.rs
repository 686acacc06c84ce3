// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache maintenance around device transfers.

use crate::buffer::Fragment;
use crate::host::CacheController;
use crate::host::CacheRange;
use crate::host::page_offset;
use crate::segment::DmaSegment;
use crate::tag::DmaTag;
use bitfield_struct::bitfield;
use std::ops::BitOr;

/// The operations requested from [`DmaMap::sync`](crate::DmaMap::sync).
///
/// "Read" means the device writes memory that the CPU will read; "write"
/// means the device reads memory the CPU wrote. Pre operations run before the
/// device is started, post operations after it completes. A single call may
/// not mix the two.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct SyncOps {
    /// Prepare for the device to write memory.
    pub pre_read: bool,
    /// Prepare for the device to read memory.
    pub pre_write: bool,
    /// Finish a device write to memory.
    pub post_read: bool,
    /// Finish a device read from memory.
    pub post_write: bool,
    #[bits(4)]
    _reserved: u8,
}

impl SyncOps {
    /// Before a device-to-memory transfer.
    pub const PRE_READ: Self = Self::new().with_pre_read(true);
    /// Before a memory-to-device transfer.
    pub const PRE_WRITE: Self = Self::new().with_pre_write(true);
    /// After a device-to-memory transfer.
    pub const POST_READ: Self = Self::new().with_post_read(true);
    /// After a memory-to-device transfer.
    pub const POST_WRITE: Self = Self::new().with_post_write(true);

    /// Returns true if any pre operation is requested.
    pub fn is_pre(&self) -> bool {
        self.pre_read() || self.pre_write()
    }

    /// Returns true if any post operation is requested.
    pub fn is_post(&self) -> bool {
        self.post_read() || self.post_write()
    }
}

impl BitOr for SyncOps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

/// Maintains one virtually and physically contiguous range.
fn sync_range(
    cache: &dyn CacheController,
    va: u64,
    pa: u64,
    len: u64,
    ops: SyncOps,
    read_only: bool,
) {
    debug_assert_eq!(page_offset(va), page_offset(pa));
    tracing::trace!(va, pa, len, ?ops, read_only, "sync range");

    if ops.pre_read() && ops.pre_write() && !read_only {
        cache.writeback_invalidate(CacheRange { va, pa, len });
    } else if ops.pre_read() {
        // Partial lines at either end may share a line with unrelated dirty
        // data, so they are written back before being discarded.
        let line = cache.line_size();
        let mask = line - 1;
        let (mut va, mut pa, mut len) = (va, pa, len);

        let head = va & mask;
        if head != 0 {
            va -= head;
            pa -= head;
            len += head;
            cache.writeback_invalidate(CacheRange { va, pa, len: line });
            if len <= line {
                return;
            }
            va += line;
            pa += line;
            len -= line;
        }

        let tail = len & mask;
        len -= tail;
        if len != 0 {
            cache.invalidate(CacheRange { va, pa, len });
        }
        if tail != 0 {
            cache.writeback_invalidate(CacheRange {
                va: va + len,
                pa: pa + len,
                len: line,
            });
        }
    } else if ops.pre_write() {
        cache.writeback(CacheRange { va, pa, len });
    }
}

/// Applies `ops` to the buffer `fragments`, walking them in lockstep with
/// the loaded `segments` to pair each virtual range with its physical one.
///
/// The fragments must be in transfer order and their offsets are relative to
/// the start of the segment list.
pub(crate) fn sync_fragments(
    tag: &DmaTag,
    segments: &[DmaSegment],
    fragments: impl IntoIterator<Item = Fragment>,
    ops: SyncOps,
) {
    let cache = &*tag.host().cache;
    let mut segs = segments.iter();
    let mut seg = segs.next();
    let mut seg_start = 0;

    for frag in fragments {
        let end = frag.offset + frag.len;
        let mut pos = frag.offset;
        while pos < end {
            let current = loop {
                let Some(s) = seg else {
                    panic!("sync offset {pos:#x} is past the loaded segments");
                };
                if pos < seg_start + s.len {
                    break s;
                }
                seg_start += s.len;
                seg = segs.next();
            };

            let seg_offset = pos - seg_start;
            let (pa, window_left) = tag.bus_to_system_run(current.bus_address + seg_offset);
            let len = (end - pos)
                .min(current.len - seg_offset)
                .min(window_left);
            sync_range(
                cache,
                frag.va + (pos - frag.offset),
                pa,
                len,
                ops,
                frag.read_only,
            );
            pos += len;
        }
    }
}
