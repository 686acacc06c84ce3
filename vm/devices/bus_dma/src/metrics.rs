// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event counters for map lifecycle and bounce activity.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A countable DMA event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaCounter {
    /// A map was created without bounce support.
    Creates,
    /// A map was created with bounce support.
    BouncedCreates,
    /// A load mapped the caller's buffer directly.
    Loads,
    /// A load went through a staging buffer.
    BouncedLoads,
    /// Data was copied from the staging buffer to the caller's buffer.
    ReadBounces,
    /// Data was copied from the caller's buffer to the staging buffer.
    WriteBounces,
    /// A directly mapped load was unloaded.
    Unloads,
    /// A bouncing load was unloaded.
    BouncedUnloads,
    /// A map without bounce support was destroyed.
    Destroys,
    /// A map with bounce support was destroyed.
    BouncedDestroys,
}

impl DmaCounter {
    /// Every counter, in declaration order.
    pub const ALL: [DmaCounter; 10] = [
        DmaCounter::Creates,
        DmaCounter::BouncedCreates,
        DmaCounter::Loads,
        DmaCounter::BouncedLoads,
        DmaCounter::ReadBounces,
        DmaCounter::WriteBounces,
        DmaCounter::Unloads,
        DmaCounter::BouncedUnloads,
        DmaCounter::Destroys,
        DmaCounter::BouncedDestroys,
    ];

    /// A short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            DmaCounter::Creates => "creates",
            DmaCounter::BouncedCreates => "bounced creates",
            DmaCounter::Loads => "loads",
            DmaCounter::BouncedLoads => "bounced loads",
            DmaCounter::ReadBounces => "read bounces",
            DmaCounter::WriteBounces => "write bounces",
            DmaCounter::Unloads => "unloads",
            DmaCounter::BouncedUnloads => "bounced unloads",
            DmaCounter::Destroys => "destroys",
            DmaCounter::BouncedDestroys => "bounced destroys",
        }
    }
}

/// A sink for [`DmaCounter`] events.
pub trait DmaMetrics: Send + Sync {
    /// Records one occurrence of `counter`.
    fn increment(&self, counter: DmaCounter);
}

/// Atomic in-memory counters.
#[derive(Debug, Default)]
pub struct DmaCounters {
    counts: [AtomicU64; DmaCounter::ALL.len()],
}

impl DmaCounters {
    /// Creates a set of zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of `counter`.
    pub fn get(&self, counter: DmaCounter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }

    /// Returns every counter with its name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        DmaCounter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }
}

impl DmaMetrics for DmaCounters {
    fn increment(&self, counter: DmaCounter) {
        self.counts[counter as usize].fetch_add(1, Ordering::Relaxed);
    }
}
