//! History order inserts (TDengine)

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::tdengine::{TDengineClient, micros, next_ts_micros, quote};
use super::{side_code, status_code};
use crate::buffer::BatchSink;
use crate::core_types::PoolId;
use crate::models::HistoryOrder;

fn row(order: &HistoryOrder) -> String {
    let (cancel_trx, cancel_block, canceled_qty) = match &order.cancel {
        Some(c) => (quote(&c.trx_id), c.block_num.to_string(), quote(&c.canceled_qty.to_string())),
        None => ("NULL".to_string(), "NULL".to_string(), "NULL".to_string()),
    };
    format!(
        "({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
        next_ts_micros(),
        order.order_id,
        quote(order.client_order_id.as_deref().unwrap_or("")),
        quote(&order.trader),
        side_code(order.side),
        quote(&order.price.to_string()),
        quote(&order.original_qty.to_string()),
        quote(&order.executed_qty.to_string()),
        status_code(order.status),
        order.is_market,
        quote(&order.created_trx_id),
        order.created_block,
        micros(order.created_at),
        micros(order.closed_at),
        cancel_trx,
        cancel_block,
        canceled_qty
    )
}

/// One multi-table INSERT for the whole batch, subtables auto-created
pub fn batch_insert_sql(orders: &[HistoryOrder]) -> Option<String> {
    if orders.is_empty() {
        return None;
    }
    let mut by_pool: FxHashMap<PoolId, Vec<&HistoryOrder>> = FxHashMap::default();
    for order in orders {
        by_pool.entry(order.pool_id).or_default().push(order);
    }

    let mut sql = String::from("INSERT INTO ");
    for (pool_id, orders) in by_pool {
        sql.push_str(&format!(
            "ho_{} USING history_orders TAGS ({}) VALUES ",
            pool_id, pool_id
        ));
        for order in orders {
            sql.push_str(&row(order));
            sql.push(' ');
        }
    }
    Some(sql)
}

pub struct HistoryOrderSink {
    client: Arc<TDengineClient>,
}

impl HistoryOrderSink {
    pub fn new(client: Arc<TDengineClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BatchSink<HistoryOrder> for HistoryOrderSink {
    async fn write_batch(&self, batch: Vec<HistoryOrder>) -> Result<()> {
        let Some(sql) = batch_insert_sql(&batch) else {
            return Ok(());
        };
        self.client
            .exec(&sql)
            .await
            .map_err(|e| anyhow::anyhow!("Batch history insert failed: {}", e))?;
        tracing::debug!("Batch inserted {} history orders", batch.len());
        Ok(())
    }
}
