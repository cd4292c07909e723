//! Read-through cache for just-buffered records
//!
//! Entries expire `ttl` after their last write. Expired entries are invisible
//! to `get` and swept out periodically on insert.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Default time-to-live of cached records (30 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Inserts between two expiry sweeps
const SWEEP_EVERY: u64 = 1024;

struct CacheState<K, V> {
    entries: FxHashMap<K, (V, Instant)>,
    inserts: u64,
}

pub struct RecordCache<K, V> {
    ttl: Duration,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> RecordCache<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState {
                entries: FxHashMap::default(),
                inserts: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            Some((value, written)) if written.elapsed() < self.ttl => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let mut state = self.lock();
        state.entries.insert(key, (value, Instant::now()));
        state.inserts += 1;
        if state.inserts % SWEEP_EVERY == 0 {
            let ttl = self.ttl;
            state.entries.retain(|_, (_, written)| written.elapsed() < ttl);
        }
    }

    pub fn remove(&self, key: &K) {
        self.lock().entries.remove(key);
    }

    /// Drop every entry whose key matches `pred`
    pub fn remove_where(&self, pred: impl Fn(&K) -> bool) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|k, _| !pred(k));
        before - state.entries.len()
    }

    /// Remove expired entries now; returns how many were dropped
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, (_, written)| written.elapsed() < ttl);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for RecordCache<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache: RecordCache<u64, &str> = RecordCache::new(Duration::from_secs(60));
        cache.insert(1, "a");
        assert_eq!(cache.get(&1), Some("a"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_refreshes_ttl() {
        let cache: RecordCache<u64, u32> = RecordCache::new(Duration::from_secs(60));
        cache.insert(1, 1);
        tokio::time::advance(Duration::from_secs(40)).await;
        cache.insert(1, 2);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(cache.get(&1), Some(2));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.evict_expired(), 1);
    }

    #[test]
    fn test_remove_where() {
        let cache: RecordCache<(u64, u64), ()> = RecordCache::default();
        cache.insert((1, 1), ());
        cache.insert((1, 2), ());
        cache.insert((2, 1), ());
        assert_eq!(cache.remove_where(|(pool, _)| *pool == 1), 2);
        assert_eq!(cache.len(), 1);
        cache.remove(&(2, 1));
        assert!(cache.is_empty());
    }
}
