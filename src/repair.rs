//! Pool repair
//!
//! Rebuilds one pool from an authoritative snapshot of its resting orders:
//! the open-order repository is replaced and depth is re-derived purely from
//! the rebuilt set. This is the recovery path for dropped flush batches and
//! missed events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::buffer::OpenOrderBuffer;
use crate::core_types::{BlockNum, OrderId, PoolId};
use crate::depth::{DepthDelta, DepthError, DepthStore};
use crate::models::{OpenOrder, OrderStatus, Side};
use crate::money;
use crate::pools::{PoolConfig, PoolRegistry};

/// Deltas per `apply_deltas` call while rebuilding depth
const REBUILD_CHUNK: usize = 256;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Unknown pool: {0}")]
    UnknownPool(PoolId),

    #[error("Snapshot fetch failed: {0}")]
    Snapshot(anyhow::Error),

    #[error("Open order repository failed: {0}")]
    Repository(anyhow::Error),

    #[error(transparent)]
    Depth(#[from] DepthError),
}

// ============================================================
// SNAPSHOT SOURCES
// ============================================================

#[async_trait]
pub trait ChainSnapshotSource: Send + Sync {
    /// Every order currently resting in the pool on-chain
    async fn open_orders(&self, pool: &PoolConfig) -> anyhow::Result<Vec<OpenOrder>>;
}

/// One resting order as served by the snapshot endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotOrder {
    pub order_id: OrderId,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub trader: String,
    pub side: String,
    /// Raw price scaled by the pool's price precision
    pub price: u64,
    /// Remaining quantity, asset string
    pub quantity: String,
    #[serde(default)]
    pub executed_quantity: Option<String>,
    #[serde(default)]
    pub created_trx_id: String,
    #[serde(default)]
    pub created_block: BlockNum,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl SnapshotOrder {
    pub fn into_open_order(self, pool: &PoolConfig, now: DateTime<Utc>) -> anyhow::Result<OpenOrder> {
        let side = Side::parse(&self.side)
            .ok_or_else(|| anyhow::anyhow!("invalid side {:?} on order {}", self.side, self.order_id))?;
        let remaining = money::parse_asset_value(&self.quantity)?;
        let executed_qty = match self.executed_quantity.as_deref() {
            Some(raw) => money::parse_asset_value(raw)?,
            None => Decimal::ZERO,
        };
        let created_at = self.created_at.unwrap_or(now);
        Ok(OpenOrder {
            pool_id: pool.pool_id,
            order_id: self.order_id,
            client_order_id: self.client_order_id.filter(|s| !s.is_empty()),
            trader: self.trader,
            side,
            price: pool.price_from_raw(self.price)?,
            original_qty: remaining + executed_qty,
            executed_qty,
            status: OrderStatus::from_executed(executed_qty),
            is_market: false,
            created_trx_id: self.created_trx_id,
            created_block: self.created_block,
            created_at,
            updated_at: now,
        })
    }
}

/// Fetches `GET {base_url}/pools/{pool_id}/orders` (JSON array of [`SnapshotOrder`])
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChainSnapshotSource for HttpSnapshotSource {
    async fn open_orders(&self, pool: &PoolConfig) -> anyhow::Result<Vec<OpenOrder>> {
        let url = format!("{}/pools/{}/orders", self.base_url, pool.pool_id);
        let rows: Vec<SnapshotOrder> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let now = Utc::now();
        rows.into_iter()
            .map(|row| row.into_open_order(pool, now))
            .collect()
    }
}

/// Fixed snapshot, for tests and manual recovery
#[derive(Default)]
pub struct StaticSnapshotSource {
    orders: std::sync::Mutex<Vec<OpenOrder>>,
}

impl StaticSnapshotSource {
    pub fn new(orders: Vec<OpenOrder>) -> Self {
        Self {
            orders: std::sync::Mutex::new(orders),
        }
    }

    pub fn set(&self, orders: Vec<OpenOrder>) {
        *self.orders.lock().unwrap_or_else(|e| e.into_inner()) = orders;
    }
}

#[async_trait]
impl ChainSnapshotSource for StaticSnapshotSource {
    async fn open_orders(&self, pool: &PoolConfig) -> anyhow::Result<Vec<OpenOrder>> {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        Ok(orders
            .iter()
            .filter(|o| o.pool_id == pool.pool_id)
            .cloned()
            .collect())
    }
}

// ============================================================
// SERVICE
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    pub pool_id: PoolId,
    pub orders: usize,
    pub skipped: usize,
    pub depth_changes: usize,
}

pub struct RepairService {
    depth: Arc<dyn DepthStore>,
    open_orders: Arc<OpenOrderBuffer>,
    pools: Arc<PoolRegistry>,
    source: Arc<dyn ChainSnapshotSource>,
}

impl RepairService {
    pub fn new(
        depth: Arc<dyn DepthStore>,
        open_orders: Arc<OpenOrderBuffer>,
        pools: Arc<PoolRegistry>,
        source: Arc<dyn ChainSnapshotSource>,
    ) -> Self {
        Self {
            depth,
            open_orders,
            pools,
            source,
        }
    }

    /// Point-in-time rebuild of one pool.
    ///
    /// Events processed while the repair runs are not reconciled against the
    /// snapshot; run it while the pool is quiet or re-run afterwards.
    pub async fn repair_pool(&self, pool_id: PoolId) -> Result<RepairReport, RepairError> {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or(RepairError::UnknownPool(pool_id))?;

        let fetched = self
            .source
            .open_orders(pool)
            .await
            .map_err(RepairError::Snapshot)?;
        let total = fetched.len();
        let orders: Vec<OpenOrder> = fetched
            .into_iter()
            .filter(|o| o.pool_id == pool_id && o.remaining_qty() > Decimal::ZERO)
            .collect();
        let skipped = total - orders.len();
        if skipped > 0 {
            warn!(pool_id, skipped, "Snapshot orders without remaining quantity ignored");
        }

        // Buffered mutations must land before the replace, not after it
        self.open_orders.flush().await;
        self.open_orders
            .repository()
            .replace_pool(pool_id, orders.clone())
            .await
            .map_err(RepairError::Repository)?;
        let invalidated = self.open_orders.invalidate_pool(pool_id);

        self.depth.clear_levels(pool_id).await?;
        let deltas: Vec<DepthDelta> = orders
            .iter()
            .map(|o| DepthDelta::new(o.side, o.price, o.remaining_qty(), None))
            .collect();
        let mut depth_changes = 0;
        for chunk in deltas.chunks(REBUILD_CHUNK) {
            depth_changes += self.depth.apply_deltas(pool_id, chunk).await?.changes.len();
        }

        info!(
            pool_id,
            orders = orders.len(),
            invalidated,
            depth_changes,
            backend = self.depth.backend_name(),
            "Pool repaired"
        );
        Ok(RepairReport {
            pool_id,
            orders: orders.len(),
            skipped,
            depth_changes,
        })
    }

    /// Drop buckets that crossed past the last trade price
    pub async fn clean_stale(
        &self,
        pool_id: PoolId,
        last_trade_price: Decimal,
        last_trade_side: Side,
    ) -> Result<usize, RepairError> {
        if !self.pools.contains(pool_id) {
            return Err(RepairError::UnknownPool(pool_id));
        }
        let removed = self
            .depth
            .clean_stale(pool_id, last_trade_price, last_trade_side)
            .await?;
        info!(
            pool_id,
            price = %last_trade_price,
            side = last_trade_side.as_str(),
            removed,
            "Stale depth cleaned"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::depth::MemoryDepthStore;
    use crate::persistence::{MemoryOpenOrderRepository, OpenOrderRepository};
    use crate::precision::Precision;
    use rust_decimal_macros::dec;

    fn pool() -> PoolConfig {
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

    fn order(order_id: u64, side: Side, price: Decimal, original: Decimal, executed: Decimal) -> OpenOrder {
        let now = Utc::now();
        OpenOrder {
            pool_id: 1,
            order_id,
            client_order_id: None,
            trader: "alice".into(),
            side,
            price,
            original_qty: original,
            executed_qty: executed,
            status: OrderStatus::from_executed(executed),
            is_market: false,
            created_trx_id: "t".into(),
            created_block: 1,
            created_at: now,
            updated_at: now,
        }
    }

    struct Fixture {
        service: RepairService,
        depth: Arc<MemoryDepthStore>,
        repo: Arc<MemoryOpenOrderRepository>,
        buffer: Arc<OpenOrderBuffer>,
        source: Arc<StaticSnapshotSource>,
    }

    fn fixture() -> Fixture {
        let depth = Arc::new(MemoryDepthStore::default());
        let repo = Arc::new(MemoryOpenOrderRepository::default());
        let buffer = Arc::new(OpenOrderBuffer::spawn(
            BufferConfig::new(100, 60_000, 4),
            Duration::from_secs(60),
            repo.clone(),
        ));
        let source = Arc::new(StaticSnapshotSource::default());
        let service = RepairService::new(
            depth.clone(),
            buffer.clone(),
            Arc::new(PoolRegistry::new([pool()])),
            source.clone(),
        );
        Fixture {
            service,
            depth,
            repo,
            buffer,
            source,
        }
    }

    #[tokio::test]
    async fn test_repair_rebuilds_depth_from_snapshot() {
        let f = fixture();
        // Drifted state: a phantom bucket and a stray open order
        f.depth
            .apply_deltas(1, &[DepthDelta::new(Side::Buy, dec!(90), dec!(9), None)])
            .await
            .unwrap();
        f.buffer.insert(order(99, Side::Buy, dec!(90), dec!(9), dec!(0))).await;

        f.source.set(vec![
            order(1, Side::Buy, dec!(100.00), dec!(5), dec!(2)),
            order(2, Side::Sell, dec!(101.00), dec!(1), dec!(0)),
            order(3, Side::Sell, dec!(102.00), dec!(1), dec!(1)),
        ]);
        let report = f.service.repair_pool(1).await.unwrap();
        assert_eq!(report.orders, 2);
        assert_eq!(report.skipped, 1);

        let snap = f.depth.snapshot(1, Precision::parse("0.01").unwrap(), 10).await.unwrap();
        assert_eq!(snap.bids, vec![("100.00".to_string(), "3".to_string())]);
        assert_eq!(snap.asks, vec![("101.00".to_string(), "1".to_string())]);

        assert_eq!(f.repo.list_pool(1).await.unwrap().len(), 2);
        let stray = order(99, Side::Buy, dec!(90), dec!(9), dec!(0)).key();
        assert!(f.buffer.get(stray).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repair_keeps_processed_event_ids() {
        let f = fixture();
        let fill = [DepthDelta::new(Side::Buy, dec!(100.00), dec!(-2), Some("m1:10".into()))];
        f.depth.apply_deltas(1, &fill).await.unwrap();

        f.source.set(vec![order(1, Side::Buy, dec!(100.00), dec!(5), dec!(2))]);
        f.service.repair_pool(1).await.unwrap();

        let replay = f.depth.apply_deltas(1, &fill).await.unwrap();
        assert!(replay.is_duplicate("m1:10"));
        let snap = f.depth.snapshot(1, Precision::parse("0.01").unwrap(), 10).await.unwrap();
        assert_eq!(snap.bids, vec![("100.00".to_string(), "3".to_string())]);
    }

    #[tokio::test]
    async fn test_repair_unknown_pool() {
        let f = fixture();
        assert!(matches!(
            f.service.repair_pool(42).await,
            Err(RepairError::UnknownPool(42))
        ));
    }

    #[tokio::test]
    async fn test_clean_stale_forwards_to_store() {
        let f = fixture();
        f.depth
            .apply_deltas(1, &[
                DepthDelta::new(Side::Sell, dec!(100), dec!(1), None),
                DepthDelta::new(Side::Sell, dec!(105), dec!(1), None),
            ])
            .await
            .unwrap();
        let removed = f.service.clean_stale(1, dec!(101), Side::Buy).await.unwrap();
        assert!(removed > 0);
        let snap = f.depth.snapshot(1, Precision::parse("1").unwrap(), 10).await.unwrap();
        assert_eq!(snap.asks, vec![("105".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_snapshot_order_conversion() {
        let row: SnapshotOrder = serde_json::from_value(serde_json::json!({
            "order_id": 5, "trader": "bob", "side": "ask", "price": 10050,
            "quantity": "0.50000000 BTC", "executed_quantity": "0.25000000 BTC"
        }))
        .unwrap();
        let order = row.into_open_order(&pool(), Utc::now()).unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.price, dec!(100.50));
        assert_eq!(order.original_qty, dec!(0.75));
        assert_eq!(order.remaining_qty(), dec!(0.5));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
    }
}
