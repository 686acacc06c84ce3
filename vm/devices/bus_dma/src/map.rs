// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA maps: the per-transfer mapping state of a device.

use crate::DmaError;
use crate::bounce;
use crate::bounce::BounceCookie;
use crate::bounce::BounceFlags;
use crate::buffer::BufferKind;
use crate::buffer::FlatBuffer;
use crate::buffer::Fragment;
use crate::buffer::IoVector;
use crate::buffer::LoadedBuffer;
use crate::buffer::PacketChain;
use crate::host::AddressSpace;
use crate::metrics::DmaCounter;
use crate::segment::DmaSegment;
use crate::segment::SegmentList;
use crate::sync::SyncOps;
use crate::sync::sync_fragments;
use crate::tag::DmaTag;
use crate::tag::StagingDecision;
use crate::walk::Walker;
use bitfield_struct::bitfield;
use std::sync::Arc;

/// The fixed constraints of a map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapLimits {
    /// The maximum number of segments a load may produce.
    pub max_segments: usize,
    /// The maximum length of one segment.
    pub max_segment_size: u64,
    /// If nonzero, a power of two that no segment may cross a multiple of.
    pub boundary: u64,
    /// The maximum transfer length.
    pub capacity: u64,
}

/// Flags for the load operations.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct LoadFlags {
    /// The device will write the buffer.
    pub read: bool,
    /// The device will read the buffer.
    pub write: bool,
    /// Staging allocation must fail rather than wait for memory.
    pub no_wait: bool,
    #[bits(5)]
    _reserved: u8,
}

/// The mapping of one transfer buffer for a device.
///
/// A map is created empty against a [`DmaTag`], loaded with a buffer,
/// synced around each device access and unloaded before it is loaded again.
/// Every load error leaves the map empty.
#[derive(Debug)]
pub struct DmaMap {
    tag: Arc<DmaTag>,
    limits: MapLimits,
    segments: SegmentList,
    buffer: Option<LoadedBuffer>,
    mapsize: u64,
    coherent: bool,
    bounce: Option<BounceCookie>,
}

impl DmaMap {
    /// Creates an empty map.
    ///
    /// The map can bounce if the tag supports staging and either has address
    /// windows or its staging predicate asks for it.
    pub fn new(tag: &Arc<DmaTag>, limits: MapLimits) -> Self {
        assert!(limits.max_segments > 0, "map needs at least one segment");
        assert!(limits.max_segment_size > 0, "zero maximum segment size");
        assert!(
            limits.boundary == 0 || limits.boundary.is_power_of_two(),
            "boundary {:#x} is not a power of two",
            limits.boundary
        );

        let bounce = match tag.staging_decision(&limits) {
            StagingDecision::Never => None,
            StagingDecision::IfUnreachable => Some(BounceCookie::new(false)),
            StagingDecision::Always => Some(BounceCookie::new(true)),
        };

        let metrics = &tag.host().metrics;
        if bounce.is_some() {
            metrics.increment(DmaCounter::BouncedCreates);
        } else {
            metrics.increment(DmaCounter::Creates);
        }
        tracing::debug!(
            ?limits,
            bounce = ?bounce.as_ref().map(|c| c.flags()),
            "created dma map"
        );

        Self {
            tag: tag.clone(),
            limits,
            segments: SegmentList::new(
                limits.max_segments,
                limits.max_segment_size,
                limits.boundary,
            ),
            buffer: None,
            mapsize: 0,
            coherent: false,
            bounce,
        }
    }

    /// The tag the map was created against.
    pub fn tag(&self) -> &Arc<DmaTag> {
        &self.tag
    }

    /// The limits the map was created with.
    pub fn limits(&self) -> &MapLimits {
        &self.limits
    }

    /// Lowers the per-segment length limit for subsequent loads.
    ///
    /// Panics if `size` is zero or larger than the limit the map was created
    /// with.
    pub fn set_max_segment_size(&mut self, size: u64) {
        assert!(
            size > 0 && size <= self.limits.max_segment_size,
            "segment size {size:#x} outside 1..={:#x}",
            self.limits.max_segment_size
        );
        self.segments.set_max_segment_size(size);
    }

    /// The bus segments of the current load.
    pub fn segments(&self) -> &[DmaSegment] {
        self.segments.as_slice()
    }

    /// The kind of buffer currently loaded.
    pub fn kind(&self) -> BufferKind {
        self.buffer.as_ref().map_or(BufferKind::None, |b| b.kind())
    }

    /// The length of the current load.
    pub fn mapsize(&self) -> u64 {
        self.mapsize
    }

    /// Returns true if a buffer is loaded.
    pub fn is_loaded(&self) -> bool {
        self.buffer.is_some()
    }

    /// Returns true if the loaded memory needs no cache maintenance.
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Returns true if the current load is relayed through a staging buffer.
    pub fn is_bouncing(&self) -> bool {
        self.bounce.as_ref().is_some_and(|c| c.is_bouncing())
    }

    /// The bounce state, or `None` if the map can never bounce.
    pub fn bounce_flags(&self) -> Option<BounceFlags> {
        self.bounce.as_ref().map(|c| c.flags())
    }

    /// The length of the allocated staging buffer, or zero.
    pub fn staging_len(&self) -> u64 {
        self.bounce
            .as_ref()
            .and_then(|c| c.staging())
            .map_or(0, |s| s.len)
    }

    /// Loads a virtually contiguous buffer.
    pub fn load_flat(&mut self, buffer: FlatBuffer, flags: LoadFlags) -> Result<(), DmaError> {
        self.load(LoadedBuffer::Flat(buffer), flags)
    }

    /// Loads a packet chain.
    ///
    /// Fails with [`DmaError::ReadOnlyViolation`] if `flags` has `read` set
    /// and a non-empty node is read-only, whether or not the load would
    /// bounce.
    ///
    /// Panics if a [`PacketBacking::Pages`](crate::PacketBacking::Pages)
    /// node has an offset of a page or more, or is longer than its pages.
    pub fn load_packet_chain(
        &mut self,
        chain: PacketChain,
        flags: LoadFlags,
    ) -> Result<(), DmaError> {
        self.load(LoadedBuffer::PacketChain(chain), flags)
    }

    /// Loads an I/O vector, transferring its residual count.
    pub fn load_io_vector(&mut self, iov: IoVector, flags: LoadFlags) -> Result<(), DmaError> {
        self.load(LoadedBuffer::IoVector(iov), flags)
    }

    /// Loading pre-segmented raw memory is not supported. The map is left
    /// empty.
    pub fn load_raw(
        &mut self,
        segments: &[DmaSegment],
        size: u64,
        flags: LoadFlags,
    ) -> Result<(), DmaError> {
        let _ = (segments, size, flags);
        self.reset();
        Err(DmaError::UnsupportedOperation)
    }

    fn load(&mut self, buffer: LoadedBuffer, flags: LoadFlags) -> Result<(), DmaError> {
        self.reset();

        let len = buffer.len();
        if len > self.limits.capacity {
            return Err(DmaError::BufferTooLarge {
                len,
                capacity: self.limits.capacity,
            });
        }
        if len == 0 {
            return Ok(());
        }
        if flags.read()
            && let LoadedBuffer::PacketChain(chain) = &buffer
            && chain.has_read_only_data()
        {
            tracing::debug!(len, "device write into read-only packet chain");
            return Err(DmaError::ReadOnlyViolation);
        }

        let allow_block = !flags.no_wait();
        let result = match self.bounce.as_mut() {
            Some(cookie) if cookie.flags().always_bounce() => {
                bounce::load_staged(&self.tag, &mut self.segments, cookie, len, allow_block)
            }
            cookie => {
                let walked = {
                    let mut walker = Walker::new(&self.tag, &mut self.segments);
                    walker.walk(&buffer).map(|()| walker.coherent())
                };
                match (walked, cookie) {
                    (Err(DmaError::AddressOutOfRange(pa)), Some(cookie)) => {
                        tracing::debug!(pa, len, "buffer unreachable by device, bouncing");
                        bounce::load_staged(&self.tag, &mut self.segments, cookie, len, allow_block)
                    }
                    (walked, _) => walked,
                }
            }
        };

        match result {
            Ok(coherent) => {
                self.coherent = coherent;
                self.mapsize = len;
                let kind = buffer.kind();
                self.buffer = Some(buffer);

                let bouncing = self.is_bouncing();
                self.tag.host().metrics.increment(if bouncing {
                    DmaCounter::BouncedLoads
                } else {
                    DmaCounter::Loads
                });
                tracing::debug!(
                    ?kind,
                    len,
                    segments = self.segments.as_slice().len(),
                    coherent,
                    bouncing,
                    "loaded dma map"
                );
                Ok(())
            }
            Err(err) => {
                self.segments.clear();
                if let Some(cookie) = &mut self.bounce {
                    cookie.set_bouncing(false);
                }
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    len,
                    "dma map load failed"
                );
                Err(err)
            }
        }
    }

    /// Returns the map to the empty state, keeping any staging buffer for
    /// the next load.
    fn reset(&mut self) {
        if self.buffer.take().is_some() {
            let counter = if self.is_bouncing() {
                DmaCounter::BouncedUnloads
            } else {
                DmaCounter::Unloads
            };
            self.tag.host().metrics.increment(counter);
        }
        if let Some(cookie) = &mut self.bounce {
            cookie.set_bouncing(false);
        }
        self.segments.clear();
        self.mapsize = 0;
        self.coherent = false;
    }

    /// Unloads the map. Unloading an empty map does nothing.
    pub fn unload(&mut self) {
        if self.is_loaded() {
            tracing::debug!(len = self.mapsize, "unloaded dma map");
        }
        self.reset();
    }

    /// Destroys the map, releasing any staging memory.
    pub fn destroy(self) {
        drop(self);
    }

    /// Prepares for or completes a device transfer of `offset..offset + len`
    /// of the loaded buffer.
    ///
    /// Pre operations write back or invalidate the CPU caches as the
    /// direction requires and, for a bouncing map, copy the caller's data into
    /// the staging buffer. Post operations copy device-written data from the
    /// staging buffer back to the caller's buffer.
    ///
    /// Panics if `ops` mixes pre and post operations, the map is not loaded,
    /// `len` is zero or the range extends past the loaded length.
    pub fn sync(&mut self, offset: u64, len: u64, ops: SyncOps) -> Result<(), DmaError> {
        assert!(
            !(ops.is_pre() && ops.is_post()),
            "cannot mix pre and post sync operations: {ops:?}"
        );
        let Some(buffer) = &self.buffer else {
            panic!("sync of an unloaded dma map");
        };
        assert!(
            len != 0 && offset < self.mapsize && len <= self.mapsize - offset,
            "sync of {offset:#x}+{len:#x} outside map size {:#x}",
            self.mapsize
        );

        let host = self.tag.host();
        let staging_va = match &self.bounce {
            Some(cookie) if cookie.is_bouncing() => cookie.staging().map(|s| s.va),
            _ => None,
        };

        if staging_va.is_none() && !ops.is_pre() {
            return Ok(());
        }

        if let Some(staging_va) = staging_va
            && ops.pre_write()
        {
            host.metrics.increment(DmaCounter::WriteBounces);
            buffer.copy_to_linear(&*host.memory, offset, len, staging_va)?;
        }

        match staging_va {
            None if self.coherent => {
                host.cache.drain_write_buffer();
                return Ok(());
            }
            Some(_) if self.coherent || !ops.is_pre() => {}
            _ => {
                let space = match staging_va {
                    Some(_) => AddressSpace::KERNEL,
                    None => buffer.space(),
                };
                if !space.is_kernel() && !host.translator.has_cache_activity(space) {
                    tracing::trace!(?space, "no cache activity, skipping sync");
                    return Ok(());
                }

                let segments = self.segments.as_slice();
                match staging_va {
                    Some(va) => sync_fragments(
                        &self.tag,
                        segments,
                        [Fragment::staging(va, offset, len)],
                        ops,
                    ),
                    None => sync_fragments(&self.tag, segments, buffer.fragments(offset, len), ops),
                }
                host.cache.drain_write_buffer();
            }
        }

        if let Some(staging_va) = staging_va
            && ops.post_read()
        {
            host.metrics.increment(DmaCounter::ReadBounces);
            buffer.copy_from_linear(&*host.memory, offset, len, staging_va)?;
        }
        Ok(())
    }
}

impl Drop for DmaMap {
    fn drop(&mut self) {
        self.reset();
        let counter = match &mut self.bounce {
            Some(cookie) => {
                cookie.release(&self.tag);
                DmaCounter::BouncedDestroys
            }
            None => DmaCounter::Destroys,
        };
        self.tag.host().metrics.increment(counter);
    }
}
