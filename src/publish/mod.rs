//! Downstream fan-out of materialized changes
//!
//! Every message is a `{"type": ..., "data": ...}` envelope consumed by the
//! external push layer.

pub mod broadcast;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::buffer::BatchSink;
use crate::core_types::{OrderId, PoolId};
use crate::market::kline::Kline;
use crate::models::{DepthChange, HistoryOrder, OpenOrder, OrderStatus, Side, Trade};

pub use broadcast::BroadcastPublisher;
pub use redis::RedisPublisher;

// ============================================================
// ENVELOPE
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEnvelope {
    OrderUpdate(OrderUpdate),
    TradeUpdate(Trade),
    DepthUpdate(DepthUpdate),
    KlineUpdate(Kline),
}

impl PushEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            PushEnvelope::OrderUpdate(_) => "order_update",
            PushEnvelope::TradeUpdate(_) => "trade_update",
            PushEnvelope::DepthUpdate(_) => "depth_update",
            PushEnvelope::KlineUpdate(_) => "kline_update",
        }
    }

    pub fn pool_id(&self) -> PoolId {
        match self {
            PushEnvelope::OrderUpdate(u) => u.pool_id,
            PushEnvelope::TradeUpdate(t) => t.pool_id,
            PushEnvelope::DepthUpdate(d) => d.pool_id,
            PushEnvelope::KlineUpdate(k) => k.pool_id,
        }
    }
}

/// Order state change, for both live and terminal orders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub pool_id: PoolId,
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub side: Side,
    pub price: Decimal,
    pub original_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    pub time: DateTime<Utc>,
}

impl From<&OpenOrder> for OrderUpdate {
    fn from(o: &OpenOrder) -> Self {
        Self {
            pool_id: o.pool_id,
            order_id: o.order_id,
            client_order_id: o.client_order_id.clone(),
            trader: o.trader.clone(),
            side: o.side,
            price: o.price,
            original_qty: o.original_qty,
            executed_qty: o.executed_qty,
            status: o.status,
            time: o.updated_at,
        }
    }
}

impl From<&HistoryOrder> for OrderUpdate {
    fn from(o: &HistoryOrder) -> Self {
        Self {
            pool_id: o.pool_id,
            order_id: o.order_id,
            client_order_id: o.client_order_id.clone(),
            trader: o.trader.clone(),
            side: o.side,
            price: o.price,
            original_qty: o.original_qty,
            executed_qty: o.executed_qty,
            status: o.status,
            time: o.closed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub pool_id: PoolId,
    pub changes: Vec<DepthChange>,
}

// ============================================================
// PUBLISHER
// ============================================================

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: &PushEnvelope) -> anyhow::Result<()>;
}

/// Publish, logging instead of propagating failures
pub async fn publish_logged(publisher: &dyn Publisher, envelope: &PushEnvelope) {
    if let Err(e) = publisher.publish(envelope).await {
        tracing::warn!(
            kind = envelope.kind(),
            pool_id = envelope.pool_id(),
            error = %e,
            "Publish failed"
        );
    }
}

// ============================================================
// DEPTH CHANGE SINK
// ============================================================

/// Flush target of the depth-change buffer: one `depth_update` per pool per
/// batch, keeping only the latest change of each level.
pub struct DepthUpdateSink {
    publisher: Arc<dyn Publisher>,
}

impl DepthUpdateSink {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

/// Latest change per (pool, side, precision, price), pools in first-seen order
fn coalesce(batch: Vec<DepthChange>) -> Vec<DepthUpdate> {
    let mut updates: Vec<DepthUpdate> = Vec::new();
    let mut slots: FxHashMap<(PoolId, Side, String, String), (usize, usize)> = FxHashMap::default();

    for change in batch {
        let level = (
            change.pool_id,
            change.side,
            change.precision.clone(),
            change.price.clone(),
        );
        if let Some(&(u, c)) = slots.get(&level) {
            updates[u].changes[c] = change;
            continue;
        }
        let u = match updates.iter().position(|d| d.pool_id == change.pool_id) {
            Some(u) => u,
            None => {
                updates.push(DepthUpdate {
                    pool_id: change.pool_id,
                    changes: Vec::new(),
                });
                updates.len() - 1
            }
        };
        slots.insert(level, (u, updates[u].changes.len()));
        updates[u].changes.push(change);
    }
    updates
}

#[async_trait]
impl BatchSink<DepthChange> for DepthUpdateSink {
    async fn write_batch(&self, batch: Vec<DepthChange>) -> anyhow::Result<()> {
        for update in coalesce(batch) {
            self.publisher
                .publish(&PushEnvelope::DepthUpdate(update))
                .await?;
        }
        Ok(())
    }
}
