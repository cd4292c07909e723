//! Per-pool record of applied event ids
//!
//! Bounded: once a pool holds `capacity` ids the oldest is evicted. Replays
//! older than the window are no longer recognized; the feed only redelivers
//! recent events.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core_types::PoolId;

/// Default number of ids remembered per pool
pub const DEFAULT_DEDUP_CAPACITY: usize = 100_000;

#[derive(Debug, Default)]
struct PoolSeen {
    ids: FxHashSet<String>,
    order: VecDeque<String>,
}

/// Not internally synchronized: owners keep it inside their own critical
/// section so dedup and the guarded mutation are one atomic step.
#[derive(Debug)]
pub struct EventDeduplicator {
    capacity: usize,
    pools: FxHashMap<PoolId, PoolSeen>,
}

impl EventDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pools: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn contains(&self, pool_id: PoolId, unique_id: &str) -> bool {
        self.pools
            .get(&pool_id)
            .is_some_and(|p| p.ids.contains(unique_id))
    }

    /// Record an id. Returns `false` if it was already present.
    pub fn record(&mut self, pool_id: PoolId, unique_id: &str) -> bool {
        let pool = self.pools.entry(pool_id).or_default();
        if !pool.ids.insert(unique_id.to_string()) {
            return false;
        }
        pool.order.push_back(unique_id.to_string());
        while pool.order.len() > self.capacity {
            if let Some(oldest) = pool.order.pop_front() {
                pool.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn clear_pool(&mut self, pool_id: PoolId) {
        self.pools.remove(&pool_id);
    }

    pub fn len(&self, pool_id: PoolId) -> usize {
        self.pools.get(&pool_id).map_or(0, |p| p.ids.len())
    }

    pub fn is_empty(&self, pool_id: PoolId) -> bool {
        self.len(pool_id) == 0
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_duplicate() {
        let mut dedup = EventDeduplicator::new(10);
        assert!(dedup.record(1, "t1:1"));
        assert!(!dedup.record(1, "t1:1"));
        assert!(dedup.contains(1, "t1:1"));
        // Scoped per pool
        assert!(!dedup.contains(2, "t1:1"));
        assert!(dedup.record(2, "t1:1"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut dedup = EventDeduplicator::new(2);
        dedup.record(1, "a");
        dedup.record(1, "b");
        dedup.record(1, "c");
        assert_eq!(dedup.len(1), 2);
        assert!(!dedup.contains(1, "a"));
        assert!(dedup.contains(1, "b"));
        assert!(dedup.contains(1, "c"));
    }

    #[test]
    fn test_clear_pool() {
        let mut dedup = EventDeduplicator::default();
        dedup.record(1, "a");
        dedup.clear_pool(1);
        assert!(dedup.is_empty(1));
        assert!(dedup.record(1, "a"));
    }
}
