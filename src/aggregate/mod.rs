//! Streaming aggregation over allocation events.
//!
//! Every engine consumes [`Allocation`]s in stream order; free events are
//! recognized by their allocator kind and carry size zero. Aggregates are
//! grouped under a [`LocationKey`].

mod high_watermark;
mod snapshot;
mod stats;
mod temporary;

pub use high_watermark::HighWatermarkFinder;
pub use snapshot::{SnapshotAllocationAggregator, StreamingAllocationAggregator};
pub use stats::AllocationStatsAggregator;
pub use temporary::TemporaryAllocationsAggregator;

use crate::records::{Allocation, FrameId, ThreadId};

/// Grouping key for aggregate views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub frame_id: FrameId,
    pub native_frame_id: FrameId,
    pub tid: ThreadId,
}

impl LocationKey {
    /// Key of an allocation; `merge_threads` collapses the thread id to 0.
    pub fn of(allocation: &Allocation, merge_threads: bool) -> Self {
        Self {
            frame_id: allocation.frame_id,
            native_frame_id: allocation.native_frame_id,
            tid: if merge_threads { 0 } else { allocation.tid },
        }
    }
}

/// Count/byte totals accumulated under one location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationStats {
    pub count: u64,
    pub total_bytes: u64,
}

impl LocationStats {
    pub(crate) fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.total_bytes += bytes;
    }
}

/// Order a reduced snapshot for presentation: biggest byte totals first,
/// ties broken by count then key for determinism.
pub fn sorted_entries(
    entries: std::collections::HashMap<LocationKey, LocationStats>,
) -> Vec<(LocationKey, LocationStats)> {
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by(|(key_a, stats_a), (key_b, stats_b)| {
        stats_b
            .total_bytes
            .cmp(&stats_a.total_bytes)
            .then(stats_b.count.cmp(&stats_a.count))
            .then(key_a.frame_id.cmp(&key_b.frame_id))
            .then(key_a.tid.cmp(&key_b.tid))
    });
    entries
}
