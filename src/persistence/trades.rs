use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::side_code;
use super::tdengine::{TDengineClient, micros, next_ts_micros, quote};
use crate::buffer::BatchSink;
use crate::core_types::PoolId;
use crate::models::Trade;

fn row(trade: &Trade) -> String {
    format!(
        "({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
        next_ts_micros(),
        quote(&trade.trx_id),
        trade.block_num,
        trade.global_sequence,
        trade.maker_order_id,
        quote(&trade.maker),
        trade.taker_order_id,
        quote(&trade.taker),
        side_code(trade.side),
        quote(&trade.price.to_string()),
        quote(&trade.base_qty.to_string()),
        quote(&trade.quote_qty.to_string()),
        quote(&trade.maker_fee.to_string()),
        quote(&trade.taker_fee.to_string()),
        micros(trade.time)
    )
}

/// Batch insert trades: one statement, one subtable per pool
pub fn batch_insert_sql(trades: &[Trade]) -> Option<String> {
    if trades.is_empty() {
        return None;
    }
    let mut by_pool: FxHashMap<PoolId, Vec<&Trade>> = FxHashMap::default();
    for trade in trades {
        by_pool.entry(trade.pool_id).or_default().push(trade);
    }

    let mut sql = String::from("INSERT INTO ");
    for (pool_id, trades) in by_pool {
        sql.push_str(&format!("tr_{} USING trades TAGS ({}) VALUES ", pool_id, pool_id));
        for trade in trades {
            sql.push_str(&row(trade));
            sql.push(' ');
        }
    }
    Some(sql)
}

pub struct TradeSink {
    client: Arc<TDengineClient>,
}

impl TradeSink {
    pub fn new(client: Arc<TDengineClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BatchSink<Trade> for TradeSink {
    async fn write_batch(&self, batch: Vec<Trade>) -> Result<()> {
        let Some(sql) = batch_insert_sql(&batch) else {
            return Ok(());
        };
        self.client
            .exec(&sql)
            .await
            .map_err(|e| anyhow::anyhow!("Batch trade insert failed: {}", e))?;
        tracing::debug!("Batch inserted {} trades", batch.len());
        Ok(())
    }
}
