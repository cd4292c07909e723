//! Pool registry - per-pool precision configuration
//!
//! Loaded once at startup from `AppConfig::pools` and shared read-only.

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::PoolId;
use crate::money::{self, MoneyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_id: PoolId,
    /// Display name, e.g. "BTC_USDT"
    pub symbol: String,
    pub base_symbol: String,
    pub quote_symbol: String,
    /// On-chain price scale: raw price = price × 10^price_precision
    pub price_precision: u32,
    pub base_precision: u32,
    pub quote_precision: u32,
}

impl PoolConfig {
    /// Convert the raw scaled on-chain price to `Decimal`
    ///
    /// Example: 8500000 with price_precision=2 → Decimal(85000.00)
    #[inline]
    pub fn price_from_raw(&self, raw: u64) -> Result<Decimal, MoneyError> {
        money::scaled_price(raw, self.price_precision)
    }
}

#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: FxHashMap<PoolId, PoolConfig>,
}

impl PoolRegistry {
    pub fn new(pools: impl IntoIterator<Item = PoolConfig>) -> Self {
        let pools = pools.into_iter().map(|p| (p.pool_id, p)).collect();
        Self { pools }
    }

    #[inline]
    pub fn get(&self, pool_id: PoolId) -> Option<&PoolConfig> {
        self.pools.get(&pool_id)
    }

    pub fn contains(&self, pool_id: PoolId) -> bool {
        self.pools.contains_key(&pool_id)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_usdt() -> PoolConfig {
        PoolConfig {
            pool_id: 1,
            symbol: "BTC_USDT".into(),
            base_symbol: "BTC".into(),
            quote_symbol: "USDT".into(),
            price_precision: 2,
            base_precision: 8,
            quote_precision: 6,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PoolRegistry::new([btc_usdt()]);
        assert_eq!(registry.pool_count(), 1);
        assert!(registry.contains(1));
        assert!(registry.get(2).is_none());
        assert_eq!(registry.get(1).unwrap().symbol, "BTC_USDT");
    }

    #[test]
    fn test_price_from_raw() {
        let pool = btc_usdt();
        assert_eq!(pool.price_from_raw(8500000).unwrap(), dec!(85000.00));
    }
}
