//! Running allocation statistics: counters, size histogram, top locations.

use std::collections::HashMap;

use crate::aggregate::{LocationKey, LocationStats};
use crate::records::{Allocation, AllocatorKind};

/// Number of power-of-two size buckets (covers every `u64` size).
pub const HISTOGRAM_BUCKETS: usize = 64;

#[derive(Debug)]
pub struct AllocationStatsAggregator {
    total_allocations: u64,
    total_bytes: u64,
    current_bytes: u64,
    peak_bytes: u64,
    live_sizes: HashMap<u64, u64>,
    size_histogram: [u64; HISTOGRAM_BUCKETS],
    by_allocator: HashMap<AllocatorKind, u64>,
    by_location: HashMap<LocationKey, LocationStats>,
}

impl AllocationStatsAggregator {
    pub fn new() -> Self {
        Self {
            total_allocations: 0,
            total_bytes: 0,
            current_bytes: 0,
            peak_bytes: 0,
            live_sizes: HashMap::new(),
            size_histogram: [0; HISTOGRAM_BUCKETS],
            by_allocator: HashMap::new(),
            by_location: HashMap::new(),
        }
    }

    pub fn process_allocation(&mut self, allocation: &Allocation) {
        *self.by_allocator.entry(allocation.allocator).or_insert(0) += 1;
        if allocation.allocator.is_free() {
            if let Some(size) = self.live_sizes.remove(&allocation.address) {
                self.current_bytes -= size;
            }
            return;
        }
        if allocation.size == 0 {
            return;
        }
        self.total_allocations += 1;
        self.total_bytes += allocation.size;
        self.size_histogram[bucket_for(allocation.size)] += 1;
        self.by_location
            .entry(LocationKey::of(allocation, false))
            .or_default()
            .add(allocation.size);

        if let Some(previous) = self.live_sizes.insert(allocation.address, allocation.size) {
            self.current_bytes -= previous;
        }
        self.current_bytes += allocation.size;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    pub fn size_histogram(&self) -> &[u64; HISTOGRAM_BUCKETS] {
        &self.size_histogram
    }

    pub fn count_for_allocator(&self, allocator: AllocatorKind) -> u64 {
        self.by_allocator.get(&allocator).copied().unwrap_or(0)
    }

    /// The `n` locations with the most allocated bytes, descending.
    pub fn top_locations_by_size(&self, n: usize) -> Vec<(LocationKey, LocationStats)> {
        self.top_by(n, |stats| stats.total_bytes)
    }

    /// The `n` locations with the most allocations, descending.
    pub fn top_locations_by_count(&self, n: usize) -> Vec<(LocationKey, LocationStats)> {
        self.top_by(n, |stats| stats.count)
    }

    fn top_by(
        &self,
        n: usize,
        weight: impl Fn(&LocationStats) -> u64,
    ) -> Vec<(LocationKey, LocationStats)> {
        let mut entries: Vec<_> = self
            .by_location
            .iter()
            .map(|(key, stats)| (*key, *stats))
            .collect();
        entries.sort_by_key(|(_, stats)| std::cmp::Reverse(weight(stats)));
        entries.truncate(n);
        entries
    }
}

impl Default for AllocationStatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_for(size: u64) -> usize {
    (63 - size.leading_zeros() as usize).min(HISTOGRAM_BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{alloc, free};

    #[test]
    fn counters_track_totals_and_peak() {
        let mut stats = AllocationStatsAggregator::new();
        stats.process_allocation(&alloc(1, 0xA, 100, 1));
        stats.process_allocation(&alloc(1, 0xB, 200, 1));
        stats.process_allocation(&free(1, 0xA));
        stats.process_allocation(&alloc(1, 0xC, 50, 2));

        assert_eq!(stats.total_allocations(), 3);
        assert_eq!(stats.total_bytes(), 350);
        assert_eq!(stats.peak_bytes(), 300);
        assert_eq!(stats.count_for_allocator(AllocatorKind::Malloc), 3);
        assert_eq!(stats.count_for_allocator(AllocatorKind::Free), 1);
    }

    #[test]
    fn histogram_buckets_are_powers_of_two() {
        let mut stats = AllocationStatsAggregator::new();
        stats.process_allocation(&alloc(1, 0x1, 1, 0)); // bucket 0
        stats.process_allocation(&alloc(1, 0x2, 2, 0)); // bucket 1
        stats.process_allocation(&alloc(1, 0x3, 3, 0)); // bucket 1
        stats.process_allocation(&alloc(1, 0x4, 1024, 0)); // bucket 10

        let histogram = stats.size_histogram();
        assert_eq!(histogram[0], 1);
        assert_eq!(histogram[1], 2);
        assert_eq!(histogram[10], 1);
    }

    #[test]
    fn top_locations_rank_by_the_requested_weight() {
        let mut stats = AllocationStatsAggregator::new();
        // Location 1: many small allocations. Location 2: one huge.
        for index in 0..10u64 {
            stats.process_allocation(&alloc(1, 0x100 + index, 8, 1));
        }
        stats.process_allocation(&alloc(1, 0x500, 1 << 20, 2));

        let by_size = stats.top_locations_by_size(1);
        assert_eq!(by_size[0].0.frame_id, 2);
        let by_count = stats.top_locations_by_count(1);
        assert_eq!(by_count[0].0.frame_id, 1);
        assert_eq!(by_count[0].1.count, 10);
    }
}
