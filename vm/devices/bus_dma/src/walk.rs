// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Buffer walkers: decomposing buffers into physical chunks.

use crate::DmaError;
use crate::buffer::IoVector;
use crate::buffer::LoadedBuffer;
use crate::buffer::PacketBacking;
use crate::buffer::PacketChain;
use crate::host::AddressSpace;
use crate::host::PAGE_SIZE;
use crate::host::page_offset;
use crate::segment::SegmentList;
use crate::tag::DmaTag;

/// Feeds the physical chunks of a buffer into a segment list, tracking
/// whether every page seen so far is mapped uncached.
pub(crate) struct Walker<'a> {
    tag: &'a DmaTag,
    segments: &'a mut SegmentList,
    coherent: bool,
}

impl<'a> Walker<'a> {
    pub fn new(tag: &'a DmaTag, segments: &'a mut SegmentList) -> Self {
        Self {
            tag,
            segments,
            coherent: true,
        }
    }

    /// Whether the walked memory needs no cache maintenance.
    pub fn coherent(&self) -> bool {
        self.coherent
    }

    pub fn walk(&mut self, buffer: &LoadedBuffer) -> Result<(), DmaError> {
        match buffer {
            LoadedBuffer::Flat(buf) => self.flat(buf.space, buf.va, buf.len),
            LoadedBuffer::PacketChain(chain) => self.packet_chain(chain),
            LoadedBuffer::IoVector(iov) => self.io_vector(iov),
        }
    }

    /// Walks `va..va + len` in `space` one page at a time.
    pub fn flat(&mut self, space: AddressSpace, mut va: u64, mut len: u64) -> Result<(), DmaError> {
        // Mapping attributes are only known for kernel memory.
        if !space.is_kernel() {
            self.coherent = false;
        }

        let tag = self.tag;
        let translator = &tag.host().translator;
        while len > 0 {
            let translation = translator
                .translate(space, va)
                .ok_or(DmaError::NotMapped { space, va })?;
            if translation.cacheable {
                self.coherent = false;
            }
            let chunk = len.min(PAGE_SIZE - page_offset(va));
            self.segments.append_chunk(tag, translation.pa, chunk)?;
            va += chunk;
            len -= chunk;
        }
        Ok(())
    }

    fn packet_chain(&mut self, chain: &PacketChain) -> Result<(), DmaError> {
        self.coherent = false;

        for node in chain.nodes.iter().filter(|n| n.len != 0) {
            match &node.backing {
                PacketBacking::Contiguous { pa } => {
                    self.segments.append_chunk(self.tag, *pa, node.len)?;
                }
                PacketBacking::Pages { pages, offset } => {
                    assert!(*offset < PAGE_SIZE, "packet data offset past first page");
                    let mut offset = *offset;
                    let mut remaining = node.len;
                    for &page in pages {
                        if remaining == 0 {
                            break;
                        }
                        let chunk = remaining.min(PAGE_SIZE - offset);
                        self.segments
                            .append_chunk(self.tag, page + offset, chunk)?;
                        remaining -= chunk;
                        offset = 0;
                    }
                    assert_eq!(remaining, 0, "packet node longer than its pages");
                }
                PacketBacking::Virtual => {
                    self.flat(AddressSpace::KERNEL, node.va, node.len)?;
                }
            }
        }
        Ok(())
    }

    fn io_vector(&mut self, iov: &IoVector) -> Result<(), DmaError> {
        let mut resid = iov.resid;
        for v in &iov.iov {
            if resid == 0 {
                break;
            }
            let len = v.len.min(resid);
            self.flat(iov.space, v.base, len)?;
            resid -= len;
        }
        Ok(())
    }
}
