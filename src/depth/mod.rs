//! Multi-precision depth store
//!
//! Mirrors the resting order book as aggregated quantity per
//! (pool, side, precision, bucket). Every delta fans out to all supported
//! precisions so any display precision is a direct read.
//!
//! Two interchangeable backends implement [`DepthStore`]:
//! - [`MemoryDepthStore`]: in-process, one mutex critical section per call
//! - [`RedisDepthStore`]: shared, one Lua script per call (server-side atomicity)

pub mod dedup;
pub mod key;
pub mod memory;
pub mod redis_store;

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::{PoolId, UniqueId};
use crate::models::{DepthChange, Side};
use crate::money::{self, MoneyError};
use crate::precision::{self, Precision};

pub use dedup::EventDeduplicator;
pub use key::DepthKey;
pub use memory::MemoryDepthStore;
pub use redis_store::RedisDepthStore;

/// Aggregates at or below this magnitude are removed (1e-8)
pub const DUST_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, money::QTY_SCALE);

/// Default number of levels per side returned by a snapshot
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 100;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum DepthError {
    #[error("Unsupported precision: {0}")]
    UnsupportedPrecision(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(PoolId),

    #[error("Quantity conversion failed: {0}")]
    Money(#[from] MoneyError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Depth level {key}[{bucket}] would exceed the quantity limit")]
    LevelLimit { key: String, bucket: String },

    #[error("Corrupt depth entry {key}[{field}] = {value}")]
    Corrupt {
        key: String,
        field: String,
        value: String,
    },
}

// ============================================================================
// Contract types
// ============================================================================

/// One signed quantity change at a raw price.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDelta {
    pub side: Side,
    pub price: Decimal,
    pub qty_delta: Decimal,
    /// Identity of the originating event. Deltas sharing an id already
    /// recorded for the pool are skipped.
    pub unique_id: Option<UniqueId>,
}

impl DepthDelta {
    pub fn new(side: Side, price: Decimal, qty_delta: Decimal, unique_id: Option<UniqueId>) -> Self {
        Self {
            side,
            price,
            qty_delta,
            unique_id,
        }
    }
}

/// Outcome of one [`DepthStore::apply_deltas`] call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepthApplyResult {
    /// One entry per touched (bucket, precision)
    pub changes: Vec<DepthChange>,
    /// Unique ids skipped because they were already processed
    pub duplicates: Vec<UniqueId>,
}

impl DepthApplyResult {
    pub fn is_duplicate(&self, unique_id: &str) -> bool {
        self.duplicates.iter().any(|d| d == unique_id)
    }
}

/// Price level as rendered strings: (price, quantity)
pub type PriceLevel = (String, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepthSnapshot {
    /// Highest price first
    pub bids: Vec<PriceLevel>,
    /// Lowest price first
    pub asks: Vec<PriceLevel>,
}

// ============================================================================
// DepthStore trait
// ============================================================================

#[async_trait]
pub trait DepthStore: Send + Sync {
    /// Apply signed deltas atomically across every precision.
    async fn apply_deltas(
        &self,
        pool_id: PoolId,
        deltas: &[DepthDelta],
    ) -> Result<DepthApplyResult, DepthError>;

    /// Record an event id that produces no depth delta.
    ///
    /// Returns `false` when the id was already recorded (duplicate).
    async fn mark_processed(&self, pool_id: PoolId, unique_id: &str) -> Result<bool, DepthError>;

    /// Positive aggregates at `precision`, at most `limit` levels per side.
    async fn snapshot(
        &self,
        pool_id: PoolId,
        precision: Precision,
        limit: usize,
    ) -> Result<DepthSnapshot, DepthError>;

    /// Remove every bucket, precision and dedup record of a pool
    async fn clear_pool(&self, pool_id: PoolId) -> Result<(), DepthError>;

    /// Remove every bucket of a pool at all precisions, keeping processed ids
    /// so redelivered events stay no-ops against a rebuilt book.
    async fn clear_levels(&self, pool_id: PoolId) -> Result<(), DepthError>;

    /// Remove resting buckets that crossed past `last_trade_price`.
    ///
    /// Last trade Buy removes ask buckets at or below the price; Sell removes
    /// bid buckets at or above it. Returns the number of buckets removed.
    async fn clean_stale(
        &self,
        pool_id: PoolId,
        last_trade_price: Decimal,
        last_trade_side: Side,
    ) -> Result<usize, DepthError>;

    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// Delta planning (shared by both backends)
// ============================================================================

/// Aggregation key of one bucket at one precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LevelKey {
    pub side: Side,
    pub precision: Precision,
    pub bucket: Decimal,
}

/// Deltas of one event, pre-summed per (side, precision, bucket)
#[derive(Debug, Clone)]
pub(crate) struct DeltaGroup {
    pub unique_id: Option<UniqueId>,
    pub levels: BTreeMap<LevelKey, Decimal>,
}

/// Group deltas by unique id (first-appearance order), fan out each delta to
/// all precisions and pre-sum entries landing on the same bucket.
///
/// Deltas without an id share one group. Quantities are truncated to the
/// stored resolution; entries that net to zero are dropped. Any delta or
/// pre-summed level beyond [`money::MAX_QTY_UNITS`] rejects the whole call,
/// on every backend.
pub(crate) fn plan_groups(deltas: &[DepthDelta]) -> Result<Vec<DeltaGroup>, DepthError> {
    let mut groups: Vec<DeltaGroup> = Vec::new();

    for delta in deltas {
        let qty = money::normalize_qty(delta.qty_delta);
        if qty.is_zero() {
            continue;
        }
        money::qty_to_units(qty)?;

        let pos = match groups.iter().position(|g| g.unique_id == delta.unique_id) {
            Some(pos) => pos,
            None => {
                groups.push(DeltaGroup {
                    unique_id: delta.unique_id.clone(),
                    levels: BTreeMap::new(),
                });
                groups.len() - 1
            }
        };

        let levels = &mut groups[pos].levels;
        for (prec, bucket) in precision::bucket_all(delta.price, delta.side) {
            *levels
                .entry(LevelKey {
                    side: delta.side,
                    precision: prec,
                    bucket,
                })
                .or_insert(Decimal::ZERO) += qty;
        }
    }

    // Events whose deltas all cancelled out still need their id recorded
    for delta in deltas {
        if delta.unique_id.is_some() && !groups.iter().any(|g| g.unique_id == delta.unique_id) {
            groups.push(DeltaGroup {
                unique_id: delta.unique_id.clone(),
                levels: BTreeMap::new(),
            });
        }
    }

    for group in &mut groups {
        group.levels.retain(|_, qty| !qty.is_zero());
        for qty in group.levels.values() {
            money::qty_to_units(*qty)?;
        }
    }
    Ok(groups)
}

/// Sum the surviving groups into one delta per level
pub(crate) fn merge_groups<'a>(
    groups: impl IntoIterator<Item = &'a DeltaGroup>,
) -> BTreeMap<LevelKey, Decimal> {
    let mut merged = BTreeMap::new();
    for group in groups {
        for (key, qty) in &group.levels {
            *merged.entry(*key).or_insert(Decimal::ZERO) += *qty;
        }
    }
    merged.retain(|_, qty: &mut Decimal| !qty.is_zero());
    merged
}

/// Build the projection emitted for one touched level
pub(crate) fn depth_change(
    pool_id: PoolId,
    side: Side,
    precision: Precision,
    price: String,
    new_qty: Decimal,
) -> DepthChange {
    let quantity = if new_qty <= DUST_THRESHOLD {
        "0".to_string()
    } else {
        money::format_qty(new_qty)
    };
    DepthChange {
        pool_id,
        side,
        precision: precision.as_str().to_string(),
        price,
        quantity,
    }
}

/// Resolve an optional precision string, defaulting to the finest step
pub fn resolve_precision(raw: Option<&str>) -> Result<Precision, DepthError> {
    match raw {
        None => Ok(Precision::finest()),
        Some(s) => Precision::parse(s).ok_or_else(|| DepthError::UnsupportedPrecision(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::SUPPORTED_PRECISIONS;
    use rust_decimal_macros::dec;

    fn buy(price: Decimal, qty: Decimal, id: Option<&str>) -> DepthDelta {
        DepthDelta::new(Side::Buy, price, qty, id.map(String::from))
    }

    #[test]
    fn test_dust_threshold_value() {
        assert_eq!(DUST_THRESHOLD, dec!(0.00000001));
    }

    #[test]
    fn test_plan_groups_by_unique_id() {
        let deltas = vec![
            buy(dec!(100), dec!(1), Some("a")),
            buy(dec!(101), dec!(2), Some("b")),
            buy(dec!(100), dec!(3), Some("a")),
        ];
        let groups = plan_groups(&deltas).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].unique_id.as_deref(), Some("a"));
        // Every delta fans out to every precision
        assert_eq!(groups[0].levels.len(), SUPPORTED_PRECISIONS.len());

        let finest = LevelKey {
            side: Side::Buy,
            precision: Precision::finest(),
            bucket: dec!(100),
        };
        assert_eq!(groups[0].levels[&finest], dec!(4));
    }

    #[test]
    fn test_plan_groups_presums_same_bucket() {
        let deltas = vec![
            buy(dec!(100.00), dec!(5), None),
            buy(dec!(100.004), dec!(1), None),
        ];
        let groups = plan_groups(&deltas).unwrap();
        assert_eq!(groups.len(), 1);
        let cent = LevelKey {
            side: Side::Buy,
            precision: Precision::parse("0.01").unwrap(),
            bucket: dec!(100.00),
        };
        assert_eq!(groups[0].levels[&cent], dec!(6));
    }

    #[test]
    fn test_plan_groups_keeps_id_of_net_zero_event() {
        let deltas = vec![
            buy(dec!(100), dec!(1), Some("x")),
            buy(dec!(100), dec!(-1), Some("x")),
        ];
        let groups = plan_groups(&deltas).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].levels.is_empty());
    }

    #[test]
    fn test_plan_groups_rejects_quantity_beyond_limit() {
        let limit = money::units_to_qty(money::MAX_QTY_UNITS);
        assert!(plan_groups(&[buy(dec!(100), limit, Some("a"))]).is_ok());
        assert!(matches!(
            plan_groups(&[buy(dec!(100), limit + dec!(1), Some("a"))]),
            Err(DepthError::Money(MoneyError::Overflow))
        ));
        // Two in-range deltas of one event summing past the limit
        assert!(matches!(
            plan_groups(&[buy(dec!(100), limit, Some("a")), buy(dec!(100), dec!(1), Some("a"))]),
            Err(DepthError::Money(MoneyError::Overflow))
        ));
    }

    #[test]
    fn test_merge_groups_sums_across_events() {
        let deltas = vec![
            buy(dec!(100), dec!(1), Some("a")),
            buy(dec!(100), dec!(2), Some("b")),
        ];
        let groups = plan_groups(&deltas).unwrap();
        let merged = merge_groups(&groups);
        let finest = LevelKey {
            side: Side::Buy,
            precision: Precision::finest(),
            bucket: dec!(100),
        };
        assert_eq!(merged[&finest], dec!(3));
    }

    #[test]
    fn test_resolve_precision() {
        assert_eq!(resolve_precision(None).unwrap(), Precision::finest());
        assert_eq!(resolve_precision(Some("1")).unwrap().as_str(), "1");
        assert!(matches!(
            resolve_precision(Some("0.3")),
            Err(DepthError::UnsupportedPrecision(_))
        ));
    }
}
