//! Detection of temporary allocations: freed within a bounded window of
//! events after they were made, on the same thread.

use std::collections::{HashMap, VecDeque};

use crate::aggregate::{LocationKey, LocationStats};
use crate::records::{Allocation, ThreadId};

pub struct TemporaryAllocationsAggregator {
    max_items: usize,
    recent: HashMap<ThreadId, VecDeque<Allocation>>,
    temporaries: HashMap<LocationKey, LocationStats>,
}

impl TemporaryAllocationsAggregator {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            recent: HashMap::new(),
            temporaries: HashMap::new(),
        }
    }

    pub fn process_allocation(&mut self, allocation: &Allocation) {
        let window = self.recent.entry(allocation.tid).or_default();
        if allocation.allocator.is_free() {
            if let Some(position) = window
                .iter()
                .position(|candidate| candidate.address == allocation.address)
            {
                let matched = window.remove(position).expect("position in window");
                self.temporaries
                    .entry(LocationKey::of(&matched, false))
                    .or_default()
                    .add(matched.size);
            }
            return;
        }
        if allocation.size == 0 {
            return;
        }
        window.push_back(allocation.clone());
        if window.len() > self.max_items {
            window.pop_front();
        }
    }

    pub fn temporaries(&self, merge_threads: bool) -> HashMap<LocationKey, LocationStats> {
        if !merge_threads {
            return self.temporaries.clone();
        }
        let mut merged: HashMap<LocationKey, LocationStats> = HashMap::new();
        for (key, stats) in &self.temporaries {
            let entry = merged
                .entry(LocationKey { tid: 0, ..*key })
                .or_default();
            entry.count += stats.count;
            entry.total_bytes += stats.total_bytes;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{alloc, free};

    #[test]
    fn alternating_alloc_free_pairs_are_all_temporary() {
        // Ten events: five alloc/free pairs of the same size, gap one.
        let mut aggregator = TemporaryAllocationsAggregator::new(2);
        for index in 0..5u64 {
            aggregator.process_allocation(&alloc(1, 0x100 + index, 64, 9));
            aggregator.process_allocation(&free(1, 0x100 + index));
        }
        let temporaries = aggregator.temporaries(false);
        let stats = temporaries
            .get(&LocationKey {
                frame_id: 9,
                native_frame_id: 0,
                tid: 1,
            })
            .expect("temporary location");
        assert_eq!(stats.count, 5);
        assert_eq!(stats.total_bytes, 5 * 64);
    }

    #[test]
    fn allocations_outliving_the_window_are_not_temporary() {
        let mut aggregator = TemporaryAllocationsAggregator::new(2);
        aggregator.process_allocation(&alloc(1, 0xA, 10, 1));
        aggregator.process_allocation(&alloc(1, 0xB, 10, 1));
        aggregator.process_allocation(&alloc(1, 0xC, 10, 1)); // 0xA slides out
        aggregator.process_allocation(&free(1, 0xA));
        assert!(aggregator.temporaries(false).is_empty());
    }

    #[test]
    fn windows_are_per_thread() {
        let mut aggregator = TemporaryAllocationsAggregator::new(4);
        aggregator.process_allocation(&alloc(1, 0xA, 10, 1));
        // A free observed on another thread does not match thread 1's window.
        aggregator.process_allocation(&free(2, 0xA));
        assert!(aggregator.temporaries(false).is_empty());

        aggregator.process_allocation(&free(1, 0xA));
        assert_eq!(aggregator.temporaries(false).len(), 1);
    }

    #[test]
    fn merge_threads_sums_across_tids() {
        let mut aggregator = TemporaryAllocationsAggregator::new(4);
        for tid in [1u64, 2] {
            aggregator.process_allocation(&alloc(tid, 0xA0 + tid, 32, 3));
            aggregator.process_allocation(&free(tid, 0xA0 + tid));
        }
        assert_eq!(aggregator.temporaries(false).len(), 2);
        let merged = aggregator.temporaries(true);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.values().next().expect("entry").count, 2);
    }
}
