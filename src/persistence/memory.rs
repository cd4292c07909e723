//! In-memory backing stores (tests and `storage.backend = memory`)

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::OpenOrderRepository;
use crate::buffer::{BatchSink, OpenOrderMutation};
use crate::core_types::{OrderId, PoolId};
use crate::models::{OpenOrder, OpenOrderKey};

/// Append-only sink keeping every written record
#[derive(Debug)]
pub struct MemorySink<T> {
    records: Mutex<Vec<T>>,
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> Vec<T> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BatchSink<T> for MemorySink<T> {
    async fn write_batch(&self, batch: Vec<T>) -> Result<()> {
        self.lock().extend(batch);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryOpenOrderRepository {
    orders: Mutex<FxHashMap<(PoolId, OrderId), OpenOrder>>,
}

impl MemoryOpenOrderRepository {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<(PoolId, OrderId), OpenOrder>> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OpenOrderRepository for MemoryOpenOrderRepository {
    async fn get(&self, key: OpenOrderKey) -> Result<Option<OpenOrder>> {
        Ok(self
            .lock()
            .get(&(key.pool_id, key.order_id))
            .filter(|o| o.side == key.side)
            .cloned())
    }

    async fn apply_batch(&self, batch: Vec<OpenOrderMutation>) -> Result<()> {
        let mut orders = self.lock();
        for mutation in batch {
            match mutation {
                OpenOrderMutation::Insert(o) | OpenOrderMutation::Update(o) => {
                    orders.insert((o.pool_id, o.order_id), o);
                }
                OpenOrderMutation::Delete(key) => {
                    orders.remove(&(key.pool_id, key.order_id));
                }
            }
        }
        Ok(())
    }

    async fn replace_pool(&self, pool_id: PoolId, replacement: Vec<OpenOrder>) -> Result<()> {
        let mut orders = self.lock();
        orders.retain(|(pool, _), _| *pool != pool_id);
        for o in replacement {
            orders.insert((o.pool_id, o.order_id), o);
        }
        Ok(())
    }

    async fn list_pool(&self, pool_id: PoolId) -> Result<Vec<OpenOrder>> {
        let mut listed: Vec<OpenOrder> = self
            .lock()
            .values()
            .filter(|o| o.pool_id == pool_id)
            .cloned()
            .collect();
        listed.sort_by_key(|o| o.order_id);
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(pool_id: PoolId, order_id: OrderId) -> OpenOrder {
        let now = Utc::now();
        OpenOrder {
            pool_id,
            order_id,
            client_order_id: None,
            trader: "alice".into(),
            side: Side::Sell,
            price: dec!(10),
            original_qty: dec!(1),
            executed_qty: dec!(0),
            status: OrderStatus::Open,
            is_market: false,
            created_trx_id: "t".into(),
            created_block: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_get_requires_matching_side() {
        let repo = MemoryOpenOrderRepository::default();
        repo.apply_batch(vec![OpenOrderMutation::Insert(order(1, 1))])
            .await
            .unwrap();
        let mut key = order(1, 1).key();
        assert!(repo.get(key).await.unwrap().is_some());
        key.side = Side::Buy;
        assert!(repo.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_pool_is_scoped() {
        let repo = MemoryOpenOrderRepository::default();
        repo.apply_batch(vec![
            OpenOrderMutation::Insert(order(1, 1)),
            OpenOrderMutation::Insert(order(2, 1)),
        ])
        .await
        .unwrap();
        repo.replace_pool(1, vec![order(1, 5), order(1, 6)]).await.unwrap();

        let pool1: Vec<OrderId> = repo.list_pool(1).await.unwrap().iter().map(|o| o.order_id).collect();
        assert_eq!(pool1, vec![5, 6]);
        assert_eq!(repo.list_pool(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_appends() {
        let sink: MemorySink<u32> = MemorySink::default();
        sink.write_batch(vec![1, 2]).await.unwrap();
        sink.write_batch(vec![3]).await.unwrap();
        assert_eq!(sink.records(), vec![1, 2, 3]);
    }
}
