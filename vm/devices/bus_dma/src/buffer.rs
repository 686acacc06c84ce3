// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Descriptions of the buffers a map can be loaded with.

use crate::DmaError;
use crate::host::AddressSpace;
use crate::host::MemoryAccess;

/// A virtually contiguous buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlatBuffer {
    /// The address space the buffer lives in.
    pub space: AddressSpace,
    /// The virtual address of the first byte.
    pub va: u64,
    /// The length in bytes.
    pub len: u64,
}

/// One entry of an [`IoVector`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoVec {
    /// The virtual address of the first byte.
    pub base: u64,
    /// The length in bytes.
    pub len: u64,
}

/// A scatter/gather list of virtual ranges in one address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoVector {
    /// The address space of every entry.
    pub space: AddressSpace,
    /// The entries, in transfer order.
    pub iov: Vec<IoVec>,
    /// The number of bytes to transfer, starting from the first entry.
    pub resid: u64,
}

impl IoVector {
    /// Creates a vector transferring every byte of `iov`.
    pub fn new(space: AddressSpace, iov: Vec<IoVec>) -> Self {
        let resid = iov.iter().map(|v| v.len).sum();
        Self { space, iov, resid }
    }

    /// The transfer length.
    pub fn len(&self) -> u64 {
        self.resid.min(self.iov.iter().map(|v| v.len).sum())
    }

    /// Returns true if nothing would be transferred.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the data of a packet node is backed by physical memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBacking {
    /// One physically contiguous block starting at `pa`.
    Contiguous {
        /// The physical address of the node's first data byte.
        pa: u64,
    },
    /// A list of physical pages. The data starts `offset` bytes into the
    /// first page and continues at the start of each following page.
    ///
    /// Loading panics if `offset` is not less than a page or if the pages
    /// cannot hold the node's data.
    Pages {
        /// Page-aligned physical addresses.
        pages: Vec<u64>,
        /// The data offset inside the first page.
        offset: u64,
    },
    /// Only the kernel virtual address is known.
    Virtual,
}

/// One node of a [`PacketChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketNode {
    /// The kernel virtual address of the node's data.
    pub va: u64,
    /// The data length. Empty nodes are skipped.
    pub len: u64,
    /// The data is mapped read-only and must not be the target of a device
    /// write.
    pub read_only: bool,
    /// The physical backing.
    pub backing: PacketBacking,
}

impl PacketNode {
    /// A writable node with the given backing.
    pub fn new(va: u64, len: u64, backing: PacketBacking) -> Self {
        Self {
            va,
            len,
            read_only: false,
            backing,
        }
    }

    /// Marks the node read-only.
    pub fn read_only(self) -> Self {
        Self {
            read_only: true,
            ..self
        }
    }
}

/// A chain of packet buffer nodes in the kernel address space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketChain {
    /// The nodes, in transfer order.
    pub nodes: Vec<PacketNode>,
}

impl PacketChain {
    /// Creates a chain from its nodes.
    pub fn new(nodes: Vec<PacketNode>) -> Self {
        Self { nodes }
    }

    /// The total data length of the chain.
    pub fn len(&self) -> u64 {
        self.nodes.iter().map(|n| n.len).sum()
    }

    /// Returns true if the chain carries no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a non-empty node is read-only.
    pub fn has_read_only_data(&self) -> bool {
        self.nodes.iter().any(|n| n.len != 0 && n.read_only)
    }
}

/// The kind of buffer a map currently holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferKind {
    /// The map is not loaded.
    None,
    /// A [`FlatBuffer`].
    Flat,
    /// A [`PacketChain`].
    PacketChain,
    /// An [`IoVector`].
    IoVector,
    /// Pre-segmented raw memory. Kept so the kinds cover every buffer a
    /// driver can describe; no map reports it, since
    /// [`DmaMap::load_raw`](crate::DmaMap::load_raw) always fails.
    Raw,
}

/// The caller's buffer, remembered by a loaded map for syncs and bounce
/// copies.
#[derive(Debug, Clone)]
pub(crate) enum LoadedBuffer {
    Flat(FlatBuffer),
    PacketChain(PacketChain),
    IoVector(IoVector),
}

/// A virtually contiguous piece of a loaded buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Fragment {
    /// The offset of the piece within the whole transfer.
    pub offset: u64,
    pub space: AddressSpace,
    pub va: u64,
    pub len: u64,
    pub read_only: bool,
}

impl Fragment {
    /// A piece of the kernel-mapped staging buffer at `base`.
    pub fn staging(base: u64, offset: u64, len: u64) -> Self {
        Self {
            offset,
            space: AddressSpace::KERNEL,
            va: base + offset,
            len,
            read_only: false,
        }
    }
}

impl LoadedBuffer {
    pub fn len(&self) -> u64 {
        match self {
            LoadedBuffer::Flat(buf) => buf.len,
            LoadedBuffer::PacketChain(chain) => chain.len(),
            LoadedBuffer::IoVector(iov) => iov.len(),
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            LoadedBuffer::Flat(_) => BufferKind::Flat,
            LoadedBuffer::PacketChain(_) => BufferKind::PacketChain,
            LoadedBuffer::IoVector(_) => BufferKind::IoVector,
        }
    }

    pub fn space(&self) -> AddressSpace {
        match self {
            LoadedBuffer::Flat(buf) => buf.space,
            LoadedBuffer::PacketChain(_) => AddressSpace::KERNEL,
            LoadedBuffer::IoVector(iov) => iov.space,
        }
    }

    fn pieces(&self) -> Vec<Fragment> {
        let mut pieces: Vec<Fragment> = Vec::new();
        let mut push = |space, va, len, read_only| {
            let offset = pieces.last().map_or(0, |p| p.offset + p.len);
            pieces.push(Fragment {
                offset,
                space,
                va,
                len,
                read_only,
            });
        };
        match self {
            LoadedBuffer::Flat(buf) => push(buf.space, buf.va, buf.len, false),
            LoadedBuffer::PacketChain(chain) => {
                for node in chain.nodes.iter().filter(|n| n.len != 0) {
                    push(AddressSpace::KERNEL, node.va, node.len, node.read_only);
                }
            }
            LoadedBuffer::IoVector(iov) => {
                let mut resid = iov.resid;
                for v in &iov.iov {
                    if resid == 0 {
                        break;
                    }
                    let len = v.len.min(resid);
                    if len != 0 {
                        push(iov.space, v.base, len, false);
                    }
                    resid -= len;
                }
            }
        }
        pieces
    }

    /// The pieces of the buffer covering `offset..offset + len`, clipped to
    /// that window, in transfer order.
    pub fn fragments(&self, offset: u64, len: u64) -> impl Iterator<Item = Fragment> {
        let end = offset + len;
        self.pieces().into_iter().filter_map(move |p| {
            let start = p.offset.max(offset);
            let stop = (p.offset + p.len).min(end);
            (start < stop).then(|| Fragment {
                offset: start,
                va: p.va + (start - p.offset),
                len: stop - start,
                ..p
            })
        })
    }

    /// Copies `offset..offset + len` of the buffer to the same offsets of the
    /// kernel-mapped linear buffer at `linear_va`.
    pub fn copy_to_linear(
        &self,
        memory: &dyn MemoryAccess,
        offset: u64,
        len: u64,
        linear_va: u64,
    ) -> Result<(), DmaError> {
        let mut data = Vec::new();
        for frag in self.fragments(offset, len) {
            data.resize(frag.len as usize, 0);
            memory
                .read(frag.space, frag.va, &mut data)
                .map_err(DmaError::Copy)?;
            memory
                .write(AddressSpace::KERNEL, linear_va + frag.offset, &data)
                .map_err(DmaError::Copy)?;
        }
        Ok(())
    }

    /// Copies `offset..offset + len` of the kernel-mapped linear buffer at
    /// `linear_va` back into the buffer.
    pub fn copy_from_linear(
        &self,
        memory: &dyn MemoryAccess,
        offset: u64,
        len: u64,
        linear_va: u64,
    ) -> Result<(), DmaError> {
        let mut data = Vec::new();
        for frag in self.fragments(offset, len) {
            data.resize(frag.len as usize, 0);
            memory
                .read(AddressSpace::KERNEL, linear_va + frag.offset, &mut data)
                .map_err(DmaError::Copy)?;
            memory
                .write(frag.space, frag.va, &data)
                .map_err(DmaError::Copy)?;
        }
        Ok(())
    }
}
