//! In-process depth store
//!
//! All pools live behind one mutex; each call is a single critical section,
//! so dedup check, increment and dust removal cannot interleave. Aggregates
//! share the Redis backend's bound ([`money::MAX_QTY_UNITS`]); a call that
//! would pass it is rejected before any id is recorded.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use super::{
    DUST_THRESHOLD, DepthApplyResult, DepthDelta, DepthError, DepthKey, DepthSnapshot,
    DepthStore, EventDeduplicator, PriceLevel, depth_change, merge_groups, plan_groups,
};
use crate::core_types::PoolId;
use crate::models::Side;
use crate::money;
use crate::precision::{self, Precision};

/// bucket -> aggregated quantity (ascending by price)
type Levels = BTreeMap<Decimal, Decimal>;

#[derive(Debug, Default)]
struct MemoryState {
    books: FxHashMap<DepthKey, Levels>,
    dedup: EventDeduplicator,
}

#[derive(Debug)]
pub struct MemoryDepthStore {
    state: Mutex<MemoryState>,
}

impl MemoryDepthStore {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                books: FxHashMap::default(),
                dedup: EventDeduplicator::new(dedup_capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Poisoning is recoverable: each level update is a single map write
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of retained levels for (pool, side, precision)
    pub fn level_count(&self, key: DepthKey) -> usize {
        self.lock().books.get(&key).map_or(0, |l| l.len())
    }
}

impl Default for MemoryDepthStore {
    fn default() -> Self {
        Self::new(super::dedup::DEFAULT_DEDUP_CAPACITY)
    }
}

#[async_trait]
impl DepthStore for MemoryDepthStore {
    async fn apply_deltas(
        &self,
        pool_id: PoolId,
        deltas: &[DepthDelta],
    ) -> Result<DepthApplyResult, DepthError> {
        let groups = plan_groups(deltas)?;
        let mut state = self.lock();

        let mut result = DepthApplyResult::default();
        let mut fresh = Vec::with_capacity(groups.len());
        for group in &groups {
            match &group.unique_id {
                Some(id) if state.dedup.contains(pool_id, id) => {
                    result.duplicates.push(id.clone());
                }
                _ => fresh.push(group),
            }
        }
        let merged = merge_groups(fresh.iter().copied());

        // Bound check first: a rejected call leaves no id recorded and no level touched
        for (level, delta) in &merged {
            let key = DepthKey::new(pool_id, level.side, level.precision);
            let current = state
                .books
                .get(&key)
                .and_then(|levels| levels.get(&level.bucket))
                .copied()
                .unwrap_or(Decimal::ZERO);
            if money::qty_to_units(current + *delta).is_err() {
                return Err(DepthError::LevelLimit {
                    key: key.to_string(),
                    bucket: precision::format_bucket(level.bucket, level.precision),
                });
            }
        }
        for group in &fresh {
            if let Some(id) = &group.unique_id {
                state.dedup.record(pool_id, id);
            }
        }

        for (level, delta) in merged {
            let key = DepthKey::new(pool_id, level.side, level.precision);
            let levels = state.books.entry(key).or_default();
            let entry = levels.entry(level.bucket).or_insert(Decimal::ZERO);
            *entry += delta;
            let new_qty = *entry;

            if new_qty <= DUST_THRESHOLD {
                levels.remove(&level.bucket);
                if new_qty < Decimal::ZERO {
                    tracing::warn!(
                        pool_id,
                        key = %key,
                        bucket = %level.bucket,
                        aggregate = %new_qty,
                        "Depth aggregate went negative, level removed"
                    );
                }
            }

            result.changes.push(depth_change(
                pool_id,
                level.side,
                level.precision,
                precision::format_bucket(level.bucket, level.precision),
                new_qty,
            ));
        }

        Ok(result)
    }

    async fn mark_processed(&self, pool_id: PoolId, unique_id: &str) -> Result<bool, DepthError> {
        Ok(self.lock().dedup.record(pool_id, unique_id))
    }

    async fn snapshot(
        &self,
        pool_id: PoolId,
        precision: Precision,
        limit: usize,
    ) -> Result<DepthSnapshot, DepthError> {
        let state = self.lock();
        let render = |(bucket, qty): (&Decimal, &Decimal)| -> PriceLevel {
            (
                precision::format_bucket(*bucket, precision),
                money::format_qty(*qty),
            )
        };

        let bids = state
            .books
            .get(&DepthKey::new(pool_id, Side::Buy, precision))
            .map(|levels| {
                levels
                    .iter()
                    .rev()
                    .filter(|(_, q)| **q > DUST_THRESHOLD)
                    .take(limit)
                    .map(render)
                    .collect()
            })
            .unwrap_or_default();

        let asks = state
            .books
            .get(&DepthKey::new(pool_id, Side::Sell, precision))
            .map(|levels| {
                levels
                    .iter()
                    .filter(|(_, q)| **q > DUST_THRESHOLD)
                    .take(limit)
                    .map(render)
                    .collect()
            })
            .unwrap_or_default();

        Ok(DepthSnapshot { bids, asks })
    }

    async fn clear_pool(&self, pool_id: PoolId) -> Result<(), DepthError> {
        let mut state = self.lock();
        state.books.retain(|key, _| key.pool_id != pool_id);
        state.dedup.clear_pool(pool_id);
        Ok(())
    }

    async fn clear_levels(&self, pool_id: PoolId) -> Result<(), DepthError> {
        self.lock().books.retain(|key, _| key.pool_id != pool_id);
        Ok(())
    }

    async fn clean_stale(
        &self,
        pool_id: PoolId,
        last_trade_price: Decimal,
        last_trade_side: Side,
    ) -> Result<usize, DepthError> {
        let stale_side = last_trade_side.opposite();
        let mut state = self.lock();
        let mut removed = 0;

        for prec in Precision::all() {
            let Some(levels) = state.books.get_mut(&DepthKey::new(pool_id, stale_side, prec))
            else {
                continue;
            };
            let before = levels.len();
            match stale_side {
                Side::Sell => levels.retain(|bucket, _| *bucket > last_trade_price),
                Side::Buy => levels.retain(|bucket, _| *bucket < last_trade_price),
            }
            removed += before - levels.len();
        }

        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
