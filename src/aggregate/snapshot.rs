//! Resident-set aggregation: who currently owns the heap.

use std::collections::HashMap;

use crate::aggregate::{LocationKey, LocationStats};
use crate::records::Allocation;

/// Maintains the live `address → Allocation` map and reduces it to
/// per-location statistics on demand.
#[derive(Debug, Default)]
pub struct SnapshotAllocationAggregator {
    live: HashMap<u64, Allocation>,
}

impl SnapshotAllocationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_allocation(&mut self, allocation: &Allocation) {
        if allocation.allocator.is_free() {
            self.live.remove(&allocation.address);
        } else if allocation.size > 0 {
            self.live.insert(allocation.address, allocation.clone());
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Current residents keyed by location.
    pub fn snapshot(&self, merge_threads: bool) -> HashMap<LocationKey, LocationStats> {
        reduce(self.live.values(), merge_threads)
    }
}

fn reduce<'a>(
    allocations: impl Iterator<Item = &'a Allocation>,
    merge_threads: bool,
) -> HashMap<LocationKey, LocationStats> {
    let mut reduced: HashMap<LocationKey, LocationStats> = HashMap::new();
    for allocation in allocations {
        reduced
            .entry(LocationKey::of(allocation, merge_threads))
            .or_default()
            .add(allocation.size);
    }
    reduced
}

/// Like [`SnapshotAllocationAggregator`], but additionally retains a copy of
/// the live map taken at every strict increase of live bytes past the
/// previous maximum, so the high-water-mark view can be reproduced after the
/// stream ends.
#[derive(Debug, Default)]
pub struct StreamingAllocationAggregator {
    live: HashMap<u64, Allocation>,
    current_bytes: u64,
    peak_bytes: u64,
    peak_live: HashMap<u64, Allocation>,
}

impl StreamingAllocationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_allocation(&mut self, allocation: &Allocation) {
        if allocation.allocator.is_free() {
            if let Some(freed) = self.live.remove(&allocation.address) {
                self.current_bytes -= freed.size;
            }
            return;
        }
        if allocation.size == 0 {
            return;
        }
        if let Some(previous) = self.live.insert(allocation.address, allocation.clone()) {
            self.current_bytes -= previous.size;
        }
        self.current_bytes += allocation.size;
        if self.current_bytes > self.peak_bytes {
            self.peak_bytes = self.current_bytes;
            self.peak_live = self.live.clone();
        }
    }

    /// Residual live bytes: `sum(allocations) - sum(matching frees)`.
    pub fn residual_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    /// Residents at the high-water mark.
    pub fn high_watermark_snapshot(
        &self,
        merge_threads: bool,
    ) -> HashMap<LocationKey, LocationStats> {
        reduce(self.peak_live.values(), merge_threads)
    }

    /// Allocations never freed: the leak report.
    pub fn leaks(&self, merge_threads: bool) -> HashMap<LocationKey, LocationStats> {
        reduce(self.live.values(), merge_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{alloc, free};

    #[test]
    fn snapshot_groups_residents_by_location() {
        let mut aggregator = SnapshotAllocationAggregator::new();
        // Push f1, allocate 100 at A, push f2, allocate 200 at B, pop, free A.
        aggregator.process_allocation(&alloc(1, 0xA, 100, 1));
        aggregator.process_allocation(&alloc(1, 0xB, 200, 2));
        aggregator.process_allocation(&free(1, 0xA));

        let snapshot = aggregator.snapshot(false);
        assert_eq!(snapshot.len(), 1);
        let stats = snapshot
            .get(&LocationKey {
                frame_id: 2,
                native_frame_id: 0,
                tid: 1,
            })
            .expect("surviving location");
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, 200);
    }

    #[test]
    fn merge_threads_collapses_the_thread_component() {
        let mut aggregator = SnapshotAllocationAggregator::new();
        aggregator.process_allocation(&alloc(1, 0xA, 100, 7));
        aggregator.process_allocation(&alloc(2, 0xB, 50, 7));

        assert_eq!(aggregator.snapshot(false).len(), 2);
        let merged = aggregator.snapshot(true);
        assert_eq!(merged.len(), 1);
        let stats = merged
            .get(&LocationKey {
                frame_id: 7,
                native_frame_id: 0,
                tid: 0,
            })
            .expect("merged location");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_bytes, 150);
    }

    #[test]
    fn conservation_holds_over_a_closed_stream() {
        let mut aggregator = StreamingAllocationAggregator::new();
        let sizes = [100u64, 250, 4096, 8, 64];
        for (index, size) in sizes.iter().enumerate() {
            aggregator.process_allocation(&alloc(1, 0x1000 + index as u64, *size, 0));
        }
        aggregator.process_allocation(&free(1, 0x1001));
        aggregator.process_allocation(&free(1, 0x1003));

        let expected: u64 = sizes.iter().sum::<u64>() - 250 - 8;
        assert_eq!(aggregator.residual_bytes(), expected);
    }

    #[test]
    fn watermark_snapshot_reflects_the_peak_not_the_end() {
        let mut aggregator = StreamingAllocationAggregator::new();
        aggregator.process_allocation(&alloc(1, 0xA, 300, 1));
        aggregator.process_allocation(&alloc(1, 0xB, 200, 2));
        aggregator.process_allocation(&free(1, 0xA));
        aggregator.process_allocation(&free(1, 0xB));

        assert_eq!(aggregator.peak_bytes(), 500);
        let peak = aggregator.high_watermark_snapshot(false);
        assert_eq!(peak.len(), 2);
        assert!(aggregator.leaks(false).is_empty());
        assert_eq!(aggregator.residual_bytes(), 0);
    }
}
