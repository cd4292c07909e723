//! Structured depth keys
//!
//! (pool, side, precision) is carried as a typed key everywhere; it is only
//! rendered to a string at the Redis boundary.

use std::fmt;

use crate::core_types::PoolId;
use crate::models::Side;
use crate::precision::Precision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepthKey {
    pub pool_id: PoolId,
    pub side: Side,
    pub precision: Precision,
}

impl DepthKey {
    pub fn new(pool_id: PoolId, side: Side, precision: Precision) -> Self {
        Self {
            pool_id,
            side,
            precision,
        }
    }

    /// Every key of a pool: both sides at every precision
    pub fn all_for_pool(pool_id: PoolId) -> impl Iterator<Item = DepthKey> {
        [Side::Buy, Side::Sell]
            .into_iter()
            .flat_map(move |side| Precision::all().map(move |p| DepthKey::new(pool_id, side, p)))
    }

    /// Redis hash name, e.g. `depth:7:bids:0.01`
    pub fn redis_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            prefix,
            self.pool_id,
            side_segment(self.side),
            self.precision.as_str()
        )
    }
}

impl fmt::Display for DepthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.pool_id,
            side_segment(self.side),
            self.precision
        )
    }
}

/// Redis sorted set holding the pool's processed event ids
pub fn processed_key(prefix: &str, pool_id: PoolId) -> String {
    format!("{}:{}:processed", prefix, pool_id)
}

#[inline]
fn side_segment(side: Side) -> &'static str {
    match side {
        Side::Buy => "bids",
        Side::Sell => "asks",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::SUPPORTED_PRECISIONS;

    #[test]
    fn test_redis_key_rendering() {
        let key = DepthKey::new(7, Side::Buy, Precision::parse("0.01").unwrap());
        assert_eq!(key.redis_key("depth"), "depth:7:bids:0.01");
        assert_eq!(processed_key("depth", 7), "depth:7:processed");
        assert_eq!(key.to_string(), "7/bids/0.01");
    }

    #[test]
    fn test_all_for_pool_covers_both_sides() {
        let keys: Vec<DepthKey> = DepthKey::all_for_pool(3).collect();
        assert_eq!(keys.len(), 2 * SUPPORTED_PRECISIONS.len());
        assert!(keys.iter().all(|k| k.pool_id == 3));
        assert_eq!(keys.iter().filter(|k| k.side == Side::Sell).count(), SUPPORTED_PRECISIONS.len());
    }
}
