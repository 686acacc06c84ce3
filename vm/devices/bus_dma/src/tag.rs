// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA tags: the address windows and staging policy of a device.

use crate::DmaError;
use crate::host::AllocError;
use crate::host::AllocRequest;
use crate::host::DmaHost;
use crate::host::PAGE_SIZE;
use crate::host::PhysRange;
use crate::host::round_up_to_page;
use crate::host::trunc_page;
use crate::map::MapLimits;
use std::fmt::Debug;
use std::sync::Arc;

/// A window of system physical memory and where it appears on the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaRange {
    /// The first system physical address of the window.
    pub system_base: u64,
    /// The bus address `system_base` appears at.
    pub bus_base: u64,
    /// The window length in bytes.
    pub len: u64,
}

impl DmaRange {
    /// The system address one past the end of the window. A window reaching
    /// the top of the address space ends at `u64::MAX`.
    pub fn system_end(&self) -> u64 {
        self.system_base.saturating_add(self.len)
    }

    /// Returns true if system address `pa` is inside the window.
    pub fn contains_system(&self, pa: u64) -> bool {
        pa >= self.system_base && pa - self.system_base < self.len
    }

    /// Returns true if bus address `addr` is inside the window.
    pub fn contains_bus(&self, addr: u64) -> bool {
        addr >= self.bus_base && addr - self.bus_base < self.len
    }

    fn last_system(&self) -> u64 {
        self.system_base.saturating_add(self.len - 1)
    }
}

/// How a map should use staging buffers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StagingDecision {
    /// Never bounce.
    Never,
    /// Bounce only when part of a buffer is outside every window.
    IfUnreachable,
    /// Bounce every load.
    Always,
}

/// Decides, per map, whether staging buffers may be needed.
pub trait StagingPredicate: Send + Sync {
    /// Returns the staging decision for a map with `limits`.
    fn staging_needed(&self, limits: &MapLimits) -> StagingDecision;
}

/// The DMA constraints of a device.
///
/// Tags are immutable and shared through [`Arc`]; the strong count is the
/// tag's reference count. Maps hold a reference for their whole life.
pub struct DmaTag {
    ranges: Arc<[DmaRange]>,
    staging_capable: bool,
    predicate: Option<Arc<dyn StagingPredicate>>,
    host: DmaHost,
}

impl Debug for DmaTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaTag")
            .field("ranges", &self.ranges)
            .field("staging_capable", &self.staging_capable)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl DmaTag {
    /// Creates a tag that never bounces. An empty `ranges` means the bus sees
    /// system memory unchanged.
    pub fn new(host: DmaHost, ranges: Vec<DmaRange>) -> Arc<Self> {
        Arc::new(Self {
            ranges: ranges.into(),
            staging_capable: false,
            predicate: None,
            host,
        })
    }

    /// Creates a tag that may bounce. Maps bounce on demand when `ranges` is
    /// non-empty; `predicate` can additionally request staging for maps on any
    /// tag, or force it.
    pub fn with_staging(
        host: DmaHost,
        ranges: Vec<DmaRange>,
        predicate: Option<Arc<dyn StagingPredicate>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ranges: ranges.into(),
            staging_capable: true,
            predicate,
            host,
        })
    }

    /// The translation windows, in lookup order.
    pub fn ranges(&self) -> &[DmaRange] {
        &self.ranges
    }

    /// Returns true if the bus sees system memory unchanged.
    pub fn is_identity(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns true if maps on this tag may use staging buffers.
    pub fn staging_capable(&self) -> bool {
        self.staging_capable
    }

    /// The host collaborators.
    pub fn host(&self) -> &DmaHost {
        &self.host
    }

    /// The first window containing system address `pa`.
    pub(crate) fn find_system(&self, pa: u64) -> Option<&DmaRange> {
        self.ranges.iter().find(|r| r.contains_system(pa))
    }

    /// Translates a bus address of a loaded segment back to a system address,
    /// also returning how many bytes from `addr` stay inside the same window.
    pub(crate) fn bus_to_system_run(&self, addr: u64) -> (u64, u64) {
        if self.is_identity() {
            return (addr, u64::MAX - addr);
        }
        match self.ranges.iter().find(|r| r.contains_bus(addr)) {
            Some(range) => (
                addr - range.bus_base + range.system_base,
                range.len - (addr - range.bus_base),
            ),
            None => panic!("bus address {addr:#x} is not in any dma window"),
        }
    }

    pub(crate) fn staging_decision(&self, limits: &MapLimits) -> StagingDecision {
        if !self.staging_capable {
            return StagingDecision::Never;
        }
        let decision = self
            .predicate
            .as_ref()
            .map_or(StagingDecision::Never, |p| p.staging_needed(limits));
        if decision == StagingDecision::Never && !self.is_identity() {
            StagingDecision::IfUnreachable
        } else {
            decision
        }
    }

    /// The physical windows device memory may be allocated from, in order of
    /// preference. `None` means anywhere.
    pub(crate) fn reachable_windows(&self) -> Vec<Option<PhysRange>> {
        if self.is_identity() {
            return vec![None];
        }
        self.ranges
            .iter()
            .filter(|r| r.len != 0)
            .filter_map(|r| {
                let start = round_up_to_page(r.system_base);
                let end = trunc_page(r.system_end());
                (end > start).then(|| {
                    Some(PhysRange {
                        start,
                        len: end - start,
                    })
                })
            })
            .collect()
    }

    /// Allocates `size` bytes the device can reach from the first window that
    /// satisfies the request.
    pub(crate) fn allocate_reachable(
        &self,
        size: u64,
        alignment: u64,
        boundary: u64,
        max_ranges: usize,
        allow_block: bool,
    ) -> Result<Vec<PhysRange>, AllocError> {
        let mut last_err = AllocError::Exhausted { size };
        for window in self.reachable_windows() {
            let request = AllocRequest {
                size,
                alignment,
                boundary,
                window,
                max_ranges,
                allow_block,
            };
            match self.host.allocator.allocate(&request) {
                Ok(ranges) => return Ok(ranges),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Derives a tag restricted to system addresses `min_addr..=max_addr`.
    ///
    /// If the bounds already fit inside a single window, this returns another
    /// reference to the same tag. Otherwise a new tag is built from the
    /// intersecting windows, clipped to the bounds.
    pub fn derive_subtag(
        self: &Arc<Self>,
        min_addr: u64,
        max_addr: u64,
    ) -> Result<Arc<Self>, DmaError> {
        assert!(min_addr <= max_addr, "inverted subregion bounds");

        let ranges: Vec<DmaRange> = if self.is_identity() {
            vec![DmaRange {
                system_base: min_addr,
                bus_base: min_addr,
                len: (max_addr - min_addr).saturating_add(1),
            }]
        } else {
            if self.ranges.iter().any(|r| {
                r.len != 0 && r.system_base <= min_addr && max_addr <= r.last_system()
            }) {
                tracing::debug!(min_addr, max_addr, "subregion shares parent tag");
                return Ok(self.clone());
            }

            self.ranges
                .iter()
                .filter(|r| r.len != 0 && min_addr <= r.last_system() && max_addr >= r.system_base)
                .map(|r| {
                    let mut clipped = *r;
                    if clipped.system_base < min_addr {
                        let diff = min_addr - clipped.system_base;
                        clipped.system_base += diff;
                        clipped.bus_base += diff;
                        clipped.len -= diff;
                    }
                    if max_addr < clipped.last_system() {
                        clipped.len = max_addr + 1 - clipped.system_base;
                    }
                    clipped
                })
                .collect()
        };

        if ranges.is_empty() {
            return Err(DmaError::AddressOutOfRange(min_addr));
        }

        tracing::debug!(min_addr, max_addr, ?ranges, "derived subregion tag");
        Ok(Arc::new(Self {
            ranges: ranges.into(),
            staging_capable: self.staging_capable,
            predicate: self.predicate.clone(),
            host: self.host.clone(),
        }))
    }

    /// Returns the page-rounded part of `pa..pa + size` that overlaps the
    /// first window it meets, or `None` for identity tags and disjoint
    /// regions.
    pub fn intersect(&self, pa: u64, size: u64) -> Option<PhysRange> {
        let end = pa.saturating_add(size);
        self.ranges.iter().find_map(|r| {
            if r.contains_system(pa) {
                Some(PhysRange {
                    start: trunc_page(pa),
                    len: round_up_to_page(end.min(r.system_end()) - pa),
                })
            } else if pa < r.system_base && r.system_base < end {
                Some(PhysRange {
                    start: trunc_page(r.system_base),
                    len: round_up_to_page((end - r.system_base).min(r.len)),
                })
            } else {
                None
            }
        })
    }

    /// The number of live references to this tag.
    pub fn reference_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }
}

/// Releases one reference to `tag`. The tag's storage is freed with its last
/// reference, so a root tag stays alive while its creator holds it.
pub fn destroy_tag(tag: Arc<DmaTag>) {
    drop(tag);
}

const _: () = assert!(PAGE_SIZE.is_power_of_two());

#[cfg(test)]
mod tests {
    use super::DmaRange;
    use super::DmaTag;
    use super::StagingDecision;
    use super::StagingPredicate;
    use super::destroy_tag;
    use crate::DmaError;
    use crate::host::PhysRange;
    use crate::map::MapLimits;
    use crate::test_helpers::WINDOW;
    use crate::test_helpers::system;
    use crate::test_helpers::windowed_tag;
    use std::sync::Arc;

    fn limits() -> MapLimits {
        MapLimits {
            max_segments: 4,
            max_segment_size: 0x10000,
            boundary: 0,
            capacity: 0x10000,
        }
    }

    #[test]
    fn subset_shares_parent() {
        let system = system();
        let tag = windowed_tag(&system, true);
        assert_eq!(tag.reference_count(), 1);

        let sub = tag.derive_subtag(0x1000, 0xfff_ffff).unwrap();
        assert!(Arc::ptr_eq(&tag, &sub));
        assert_eq!(tag.reference_count(), 2);

        destroy_tag(sub);
        assert_eq!(tag.reference_count(), 1);
    }

    #[test]
    fn clipped_subregion_is_new_tag() {
        let system = system();
        let tag = DmaTag::with_staging(
            system.host(),
            vec![
                DmaRange {
                    system_base: 0,
                    bus_base: 0x8000_0000,
                    len: 0x10_0000,
                },
                DmaRange {
                    system_base: 0x20_0000,
                    bus_base: 0x9000_0000,
                    len: 0x10_0000,
                },
            ],
            None,
        );

        let sub = tag.derive_subtag(0x8_0000, 0x27_ffff).unwrap();
        assert!(!Arc::ptr_eq(&tag, &sub));
        assert_eq!(tag.reference_count(), 1);
        assert_eq!(sub.reference_count(), 1);
        assert!(sub.staging_capable());
        assert_eq!(
            sub.ranges(),
            &[
                DmaRange {
                    system_base: 0x8_0000,
                    bus_base: 0x8008_0000,
                    len: 0x8_0000,
                },
                DmaRange {
                    system_base: 0x20_0000,
                    bus_base: 0x9000_0000,
                    len: 0x8_0000,
                },
            ]
        );
    }

    #[test]
    fn identity_subregion() {
        let system = system();
        let tag = DmaTag::new(system.host(), Vec::new());
        let sub = tag.derive_subtag(0, 0xffff_ffff).unwrap();
        assert_eq!(
            sub.ranges(),
            &[DmaRange {
                system_base: 0,
                bus_base: 0,
                len: 0x1_0000_0000,
            }]
        );
        assert!(!sub.is_identity());
    }

    #[test]
    fn unbounded_identity_subregion() {
        let system = system();
        let tag = DmaTag::new(system.host(), Vec::new());
        let sub = tag.derive_subtag(0x1000, u64::MAX).unwrap();
        let range = sub.ranges()[0];
        assert_eq!(range.system_base, 0x1000);
        assert_eq!(range.system_end(), u64::MAX);
        assert!(range.contains_system(u64::MAX - 1));
        assert!(!range.contains_system(0xfff));
        assert_eq!(sub.find_system(0x10_0000), Some(&range));
        assert_eq!(
            sub.bus_to_system_run(0x10_0000),
            (0x10_0000, u64::MAX - 0x10_0000 + 1)
        );
        assert_eq!(
            sub.intersect(u64::MAX - 0x7ff, 0x1000),
            Some(PhysRange {
                start: 0xffff_ffff_ffff_f000,
                len: 0x1000,
            })
        );
    }

    #[test]
    fn window_at_top_of_bus() {
        let system = system();
        let tag = DmaTag::new(
            system.host(),
            vec![DmaRange {
                system_base: 0,
                bus_base: 0xffff_ffff_0000_0000,
                len: 0x1_0000_0000,
            }],
        );
        assert_eq!(
            tag.bus_to_system_run(0xffff_ffff_8000_0000),
            (0x8000_0000, 0x8000_0000)
        );
        assert_eq!(tag.bus_to_system_run(u64::MAX), (0xffff_ffff, 1));
    }

    #[test]
    fn disjoint_subregion_fails() {
        let system = system();
        let tag = windowed_tag(&system, false);
        assert!(matches!(
            tag.derive_subtag(0x2000_0000, 0x3000_0000),
            Err(DmaError::AddressOutOfRange(0x2000_0000))
        ));
    }

    #[test]
    fn bus_translation() {
        let system = system();
        let tag = windowed_tag(&system, false);
        assert_eq!(tag.find_system(0x1234), Some(&WINDOW));
        assert_eq!(tag.find_system(0x1000_0000), None);
        assert_eq!(
            tag.bus_to_system_run(0x8000_1234),
            (0x1234, 0x1000_0000 - 0x1234)
        );

        let identity = DmaTag::new(system.host(), Vec::new());
        assert_eq!(identity.bus_to_system_run(0x1234).0, 0x1234);
    }

    #[test]
    #[should_panic(expected = "not in any dma window")]
    fn bus_translation_outside_window() {
        let system = system();
        let tag = windowed_tag(&system, false);
        tag.bus_to_system_run(0x1234);
    }

    #[test]
    fn staging_decisions() {
        struct Always;
        impl StagingPredicate for Always {
            fn staging_needed(&self, _limits: &MapLimits) -> StagingDecision {
                StagingDecision::Always
            }
        }

        let system = system();
        assert_eq!(
            windowed_tag(&system, false).staging_decision(&limits()),
            StagingDecision::Never
        );
        assert_eq!(
            windowed_tag(&system, true).staging_decision(&limits()),
            StagingDecision::IfUnreachable
        );
        assert_eq!(
            DmaTag::with_staging(system.host(), Vec::new(), None).staging_decision(&limits()),
            StagingDecision::Never
        );
        assert_eq!(
            DmaTag::with_staging(system.host(), Vec::new(), Some(Arc::new(Always)))
                .staging_decision(&limits()),
            StagingDecision::Always
        );
    }

    #[test]
    fn reachable_windows_are_page_aligned() {
        let system = system();
        let tag = DmaTag::with_staging(
            system.host(),
            vec![
                DmaRange {
                    system_base: 0x800,
                    bus_base: 0,
                    len: 0x2800,
                },
                DmaRange {
                    system_base: 0x10000,
                    bus_base: 0x10000,
                    len: 0,
                },
            ],
            None,
        );
        assert_eq!(
            tag.reachable_windows(),
            vec![Some(PhysRange {
                start: 0x1000,
                len: 0x2000,
            })]
        );
        assert_eq!(
            DmaTag::new(system.host(), Vec::new()).reachable_windows(),
            vec![None]
        );
    }

    #[test]
    fn region_intersection() {
        let system = system();
        let tag = windowed_tag(&system, false);
        assert_eq!(
            tag.intersect(0xfff_f800, 0x1000),
            Some(PhysRange {
                start: 0xfff_f000,
                len: 0x1000,
            })
        );
        assert_eq!(tag.intersect(0x1000_0000, 0x1000), None);
        assert_eq!(DmaTag::new(system.host(), Vec::new()).intersect(0, 1), None);
    }
}
