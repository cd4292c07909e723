// Market depth query service
//
// Serves snapshot reads from the shared DepthStore

use std::sync::Arc;

use serde::Serialize;

use crate::core_types::PoolId;
use crate::depth::{DEFAULT_SNAPSHOT_LIMIT, DepthError, DepthStore, PriceLevel, resolve_precision};
use crate::pools::PoolRegistry;

/// Largest number of levels per side a caller may request
pub const MAX_SNAPSHOT_LIMIT: usize = 1000;

/// Depth response: levels as `[price, quantity]` string pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthView {
    pub pool_id: PoolId,
    pub precision: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

pub struct DepthQueryService {
    store: Arc<dyn DepthStore>,
    pools: Arc<PoolRegistry>,
}

impl DepthQueryService {
    pub fn new(store: Arc<dyn DepthStore>, pools: Arc<PoolRegistry>) -> Self {
        Self { store, pools }
    }

    /// Current depth of a pool.
    ///
    /// `precision` defaults to the finest step, `limit` to 100 (capped at 1000).
    pub async fn get_depth(
        &self,
        pool_id: PoolId,
        precision: Option<&str>,
        limit: Option<usize>,
    ) -> Result<DepthView, DepthError> {
        if !self.pools.contains(pool_id) {
            return Err(DepthError::UnknownPool(pool_id));
        }
        let precision = resolve_precision(precision)?;
        let limit = limit.unwrap_or(DEFAULT_SNAPSHOT_LIMIT).clamp(1, MAX_SNAPSHOT_LIMIT);

        let snapshot = self.store.snapshot(pool_id, precision, limit).await?;
        Ok(DepthView {
            pool_id,
            precision: precision.as_str().to_string(),
            bids: snapshot.bids,
            asks: snapshot.asks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::{DepthDelta, MemoryDepthStore};
    use crate::models::Side;
    use crate::pools::PoolConfig;
    use rust_decimal::Decimal;

    fn service() -> (DepthQueryService, Arc<MemoryDepthStore>) {
        let store = Arc::new(MemoryDepthStore::default());
        let pools = Arc::new(PoolRegistry::new([PoolConfig {
            pool_id: 1,
            symbol: "BTC_USDT".into(),
            base_symbol: "BTC".into(),
            quote_symbol: "USDT".into(),
            price_precision: 2,
            base_precision: 8,
            quote_precision: 6,
        }]));
        (DepthQueryService::new(store.clone(), pools), store)
    }

    #[tokio::test]
    async fn test_defaults_to_finest_precision() {
        let (svc, store) = service();
        store
            .apply_deltas(1, &[DepthDelta::new(Side::Sell, Decimal::new(10001, 2), Decimal::ONE, None)])
            .await
            .unwrap();

        let view = svc.get_depth(1, None, None).await.unwrap();
        assert_eq!(view.precision, "0.00000001");
        assert_eq!(view.asks, vec![("100.01000000".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_limit_is_applied_and_capped() {
        let (svc, store) = service();
        let deltas: Vec<DepthDelta> = (1..=5)
            .map(|p| DepthDelta::new(Side::Buy, Decimal::from(p), Decimal::ONE, None))
            .collect();
        store.apply_deltas(1, &deltas).await.unwrap();

        let view = svc.get_depth(1, Some("1"), Some(2)).await.unwrap();
        assert_eq!(view.bids.len(), 2);
        assert_eq!(view.bids[0].0, "5");

        let view = svc.get_depth(1, Some("1"), Some(1_000_000)).await.unwrap();
        assert_eq!(view.bids.len(), 5);
    }

    #[tokio::test]
    async fn test_rejects_unknown_pool_and_precision() {
        let (svc, _) = service();
        assert!(matches!(
            svc.get_depth(1, Some("0.5"), None).await,
            Err(DepthError::UnsupportedPrecision(_))
        ));
        assert!(matches!(
            svc.get_depth(2, None, None).await,
            Err(DepthError::UnknownPool(2))
        ));
    }
}
