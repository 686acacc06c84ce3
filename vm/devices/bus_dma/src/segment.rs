// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Building the bus segment list of a map from physical chunks.

use crate::DmaError;
use crate::tag::DmaTag;

/// One contiguous bus-addressable run of a loaded map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaSegment {
    /// The bus address of the first byte.
    pub bus_address: u64,
    /// The length in bytes.
    pub len: u64,
}

impl DmaSegment {
    /// The bus address one past the end of the segment.
    pub fn end(&self) -> u64 {
        self.bus_address + self.len
    }
}

/// The segments of a map, with the limits every append must respect.
#[derive(Debug)]
pub(crate) struct SegmentList {
    segments: Vec<DmaSegment>,
    max_segments: usize,
    max_segment_size: u64,
    boundary: u64,
}

impl SegmentList {
    pub fn new(max_segments: usize, max_segment_size: u64, boundary: u64) -> Self {
        Self {
            segments: Vec::with_capacity(max_segments),
            max_segments,
            max_segment_size,
            boundary,
        }
    }

    pub fn as_slice(&self) -> &[DmaSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    pub fn set_max_segment_size(&mut self, size: u64) {
        self.max_segment_size = size;
    }

    /// Adds the physical chunk `pa..pa + size` to the list.
    ///
    /// The chunk is translated through the tag's windows and split at boundary
    /// multiples. A piece that continues the last segment on the bus fills it
    /// up to the segment size limit before a new segment is started, so the
    /// result does not depend on how the caller splits its chunks. On error
    /// the list may hold a partial load; the caller must clear it.
    pub fn append_chunk(&mut self, tag: &DmaTag, mut pa: u64, mut size: u64) -> Result<(), DmaError> {
        let bmask = if self.boundary > 0 {
            !(self.boundary - 1)
        } else {
            0
        };

        while size > 0 {
            let mut chunk = size.min(self.max_segment_size);

            let bus = if tag.is_identity() {
                pa
            } else {
                let range = tag
                    .find_system(pa)
                    .ok_or(DmaError::AddressOutOfRange(pa))?;
                chunk = chunk.min(range.system_end() - pa);
                pa - range.system_base + range.bus_base
            };

            if self.boundary > 0 {
                let next = bus.wrapping_add(self.boundary) & bmask;
                chunk = chunk.min(next.wrapping_sub(bus));
            }

            match self.segments.last_mut() {
                Some(last)
                    if last.end() == bus
                        && last.len < self.max_segment_size
                        && (self.boundary == 0
                            || last.bus_address & bmask == bus & bmask) =>
                {
                    chunk = chunk.min(self.max_segment_size - last.len);
                    last.len += chunk;
                }
                _ => {
                    if self.segments.len() >= self.max_segments {
                        return Err(DmaError::TooManySegments {
                            max: self.max_segments,
                        });
                    }
                    self.segments.push(DmaSegment {
                        bus_address: bus,
                        len: chunk,
                    });
                }
            }

            tracing::trace!(pa, bus, chunk, segments = self.segments.len(), "appended chunk");
            pa += chunk;
            size -= chunk;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DmaSegment;
    use super::SegmentList;
    use crate::DmaError;
    use crate::DmaTag;
    use crate::host::PAGE_SIZE;
    use crate::test_helpers::system;
    use crate::test_helpers::windowed_tag;
    use std::sync::Arc;

    fn identity_tag() -> Arc<DmaTag> {
        DmaTag::new(system().host(), Vec::new())
    }

    fn check_invariants(list: &SegmentList, max_segment_size: u64, boundary: u64) {
        let segs = list.as_slice();
        assert!(segs.len() <= list.max_segments());
        for seg in segs {
            assert!(seg.len > 0 && seg.len <= max_segment_size);
            if boundary > 0 {
                assert_eq!(seg.bus_address / boundary, (seg.end() - 1) / boundary);
            }
        }
    }

    #[test]
    fn contiguous_pages_coalesce() {
        let tag = windowed_tag(&system(), false);
        let mut list = SegmentList::new(4, 0x10000, 0);
        for i in 0..3 {
            list.append_chunk(&tag, 0x10_0000 + i * PAGE_SIZE, PAGE_SIZE)
                .unwrap();
        }
        assert_eq!(
            list.as_slice(),
            &[DmaSegment {
                bus_address: 0x8010_0000,
                len: 3 * PAGE_SIZE,
            }]
        );
    }

    #[test]
    fn gap_starts_new_segment() {
        let tag = windowed_tag(&system(), false);
        let mut list = SegmentList::new(4, 0x10000, 0);
        list.append_chunk(&tag, 0x10_0000, PAGE_SIZE).unwrap();
        list.append_chunk(&tag, 0x10_2000, PAGE_SIZE).unwrap();
        list.append_chunk(&tag, 0x10_3000, PAGE_SIZE).unwrap();
        assert_eq!(
            list.as_slice(),
            &[
                DmaSegment {
                    bus_address: 0x8010_0000,
                    len: PAGE_SIZE,
                },
                DmaSegment {
                    bus_address: 0x8010_2000,
                    len: 2 * PAGE_SIZE,
                },
            ]
        );
    }

    #[test]
    fn outside_window_fails() {
        let tag = windowed_tag(&system(), false);
        let mut list = SegmentList::new(4, 0x10000, 0);
        assert!(matches!(
            list.append_chunk(&tag, 0x1000_0000, PAGE_SIZE),
            Err(DmaError::AddressOutOfRange(0x1000_0000))
        ));
    }

    #[test]
    fn chunk_crossing_window_end_is_looked_up_again() {
        let tag = windowed_tag(&system(), false);
        let mut list = SegmentList::new(4, 0x10000, 0);
        let err = list.append_chunk(&tag, 0xfff_f800, PAGE_SIZE).unwrap_err();
        assert!(matches!(err, DmaError::AddressOutOfRange(0x1000_0000)));
        assert_eq!(
            list.as_slice(),
            &[DmaSegment {
                bus_address: 0x8fff_f800,
                len: 0x800,
            }]
        );
    }

    #[test]
    fn boundary_splits_segments() {
        let tag = identity_tag();
        let boundary = 0x2000;
        let mut list = SegmentList::new(8, 0x10000, boundary);
        list.append_chunk(&tag, 0x1800, 0x3000).unwrap();
        assert_eq!(
            list.as_slice(),
            &[
                DmaSegment {
                    bus_address: 0x1800,
                    len: 0x800,
                },
                DmaSegment {
                    bus_address: 0x2000,
                    len: 0x2000,
                },
                DmaSegment {
                    bus_address: 0x4000,
                    len: 0x800,
                },
            ]
        );
        check_invariants(&list, 0x10000, boundary);
    }

    #[test]
    fn max_segment_size_splits() {
        let tag = identity_tag();
        let mut list = SegmentList::new(8, 0x1800, 0);
        list.append_chunk(&tag, 0x1000, PAGE_SIZE).unwrap();
        list.append_chunk(&tag, 0x2000, PAGE_SIZE).unwrap();
        list.append_chunk(&tag, 0x3000, 0x2000).unwrap();
        assert_eq!(
            list.as_slice(),
            &[
                DmaSegment {
                    bus_address: 0x1000,
                    len: 0x1800,
                },
                DmaSegment {
                    bus_address: 0x2800,
                    len: 0x1800,
                },
                DmaSegment {
                    bus_address: 0x4000,
                    len: 0x1000,
                },
            ]
        );
        check_invariants(&list, 0x1800, 0);
    }

    #[test]
    fn segment_limit() {
        let tag = identity_tag();
        let mut list = SegmentList::new(1, 0x10000, 0);
        list.append_chunk(&tag, 0x1000, PAGE_SIZE).unwrap();
        assert!(matches!(
            list.append_chunk(&tag, 0x3000, PAGE_SIZE),
            Err(DmaError::TooManySegments { max: 1 })
        ));
    }

    #[test]
    fn split_chunks_match_single_chunk() {
        let tag = identity_tag();
        for (a, b) in [(0x100, 0x2f00), (0x1000, 0x2000), (0x2fff, 0x1)] {
            let mut whole = SegmentList::new(8, 0x1000, 0x4000);
            whole.append_chunk(&tag, 0x3800, a + b).unwrap();

            let mut split = SegmentList::new(8, 0x1000, 0x4000);
            split.append_chunk(&tag, 0x3800, a).unwrap();
            split.append_chunk(&tag, 0x3800 + a, b).unwrap();

            assert_eq!(whole.as_slice(), split.as_slice(), "split at {a:#x}");
            check_invariants(&split, 0x1000, 0x4000);
        }
    }

    #[test]
    fn union_of_segments_covers_request() {
        let tag = identity_tag();
        let chunks = [
            (0x1000, 0x800),
            (0x1800, 0x1800),
            (0x8000, 0x3000),
            (0x20000, 0x10),
        ];
        let mut list = SegmentList::new(16, 0x2000, 0x4000);
        for (pa, len) in chunks {
            list.append_chunk(&tag, pa, len).unwrap();
        }
        check_invariants(&list, 0x2000, 0x4000);

        let mut covered = Vec::new();
        for seg in list.as_slice() {
            match covered.last_mut() {
                Some((_, end)) if *end == seg.bus_address => *end = seg.end(),
                _ => covered.push((seg.bus_address, seg.end())),
            }
        }
        assert_eq!(covered, vec![(0x1000, 0x3000), (0x8000, 0xb000), (0x20000, 0x20010)]);
    }
}
