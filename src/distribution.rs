//! Segment distribution planner (C5): a thread-safe FIFO of
//! `(peer, [segment_id...])` assignments produced by the upload engine and
//! drained by its sender loop.
//!
//! Grounded in the reference node's pattern of guarding small in-memory
//! collections behind a single `RwLock` with a narrow public surface (see
//! `quorum_manager.rs`'s peer-reliability map, `concurrent_chunks.rs`'s
//! shared progress counters). A `VecDeque` is sufficient: the planner's only
//! job is to decouple planning from the retry-aware sending loop while
//! keeping per-peer fan-out in strict insertion order, so a lock-free queue
//! would be solving a problem this component doesn't have.

use std::collections::VecDeque;
use std::sync::RwLock;

use libp2p::PeerId;

/// One planned handoff: a peer and the segments it should receive.
#[derive(Debug, Clone)]
pub struct SegmentDistributionItem {
    pub peer: PeerId,
    pub segment_ids: Vec<String>,
}

/// FIFO queue of distribution items. Cheap to clone (shares the lock).
#[derive(Clone)]
pub struct DistributionPlanner {
    queue: std::sync::Arc<RwLock<VecDeque<SegmentDistributionItem>>>,
}

impl DistributionPlanner {
    pub fn new() -> Self {
        Self {
            queue: std::sync::Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn add_distribution(&self, item: SegmentDistributionItem) {
        self.queue.write().unwrap().push_back(item);
    }

    pub fn pop_next(&self) -> Option<SegmentDistributionItem> {
        self.queue.write().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.write().unwrap().clear();
    }
}

impl Default for DistributionPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved_per_peer() {
        let planner = DistributionPlanner::new();
        let peer = PeerId::random();
        planner.add_distribution(SegmentDistributionItem {
            peer,
            segment_ids: vec!["seg-0".to_string()],
        });
        planner.add_distribution(SegmentDistributionItem {
            peer,
            segment_ids: vec!["seg-1".to_string()],
        });

        let first = planner.pop_next().unwrap();
        let second = planner.pop_next().unwrap();
        assert_eq!(first.segment_ids[0], "seg-0");
        assert_eq!(second.segment_ids[0], "seg-1");
        assert!(planner.pop_next().is_none());
    }

    #[test]
    fn len_and_clear() {
        let planner = DistributionPlanner::new();
        planner.add_distribution(SegmentDistributionItem {
            peer: PeerId::random(),
            segment_ids: vec!["seg-0".to_string()],
        });
        assert_eq!(planner.len(), 1);
        planner.clear();
        assert!(planner.is_empty());
    }
}
