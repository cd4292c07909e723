//! Open-order write buffer with read-through visibility
//!
//! Inserts, updates and deletes share one ordered buffer so the repository
//! sees mutations in processing order. The cache holds the latest buffered
//! state per order; a `None` entry is a tombstone for a buffered delete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{BatchSink, BufferConfig, BufferStatsSnapshot, RecordCache, WriteBuffer};
use crate::core_types::PoolId;
use crate::models::{OpenOrder, OpenOrderKey};
use crate::persistence::OpenOrderRepository;

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOrderMutation {
    Insert(OpenOrder),
    Update(OpenOrder),
    Delete(OpenOrderKey),
}

impl OpenOrderMutation {
    pub fn key(&self) -> OpenOrderKey {
        match self {
            OpenOrderMutation::Insert(o) | OpenOrderMutation::Update(o) => o.key(),
            OpenOrderMutation::Delete(key) => *key,
        }
    }
}

/// Forwards mutation batches to the repository
struct RepositorySink(Arc<dyn OpenOrderRepository>);

#[async_trait]
impl BatchSink<OpenOrderMutation> for RepositorySink {
    async fn write_batch(&self, batch: Vec<OpenOrderMutation>) -> anyhow::Result<()> {
        self.0.apply_batch(batch).await
    }
}

pub struct OpenOrderBuffer {
    buffer: WriteBuffer<OpenOrderMutation>,
    cache: RecordCache<OpenOrderKey, Option<OpenOrder>>,
    repo: Arc<dyn OpenOrderRepository>,
}

impl OpenOrderBuffer {
    pub fn spawn(config: BufferConfig, cache_ttl: Duration, repo: Arc<dyn OpenOrderRepository>) -> Self {
        let sink = Arc::new(RepositorySink(repo.clone()));
        Self {
            buffer: WriteBuffer::spawn("open_orders", config, sink),
            cache: RecordCache::new(cache_ttl),
            repo,
        }
    }

    pub async fn insert(&self, order: OpenOrder) {
        self.cache.insert(order.key(), Some(order.clone()));
        self.buffer.add(OpenOrderMutation::Insert(order)).await;
    }

    pub async fn update(&self, order: OpenOrder) {
        self.cache.insert(order.key(), Some(order.clone()));
        self.buffer.add(OpenOrderMutation::Update(order)).await;
    }

    pub async fn delete(&self, key: OpenOrderKey) {
        self.cache.insert(key, None);
        self.buffer.add(OpenOrderMutation::Delete(key)).await;
    }

    /// Latest known state: buffered first, then the repository.
    pub async fn get(&self, key: OpenOrderKey) -> anyhow::Result<Option<OpenOrder>> {
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        self.repo.get(key).await
    }

    /// Forget every cached entry of a pool (after a repository replace)
    pub fn invalidate_pool(&self, pool_id: PoolId) -> usize {
        self.cache.remove_where(|k| k.pool_id == pool_id)
    }

    pub async fn flush(&self) {
        self.buffer.flush().await;
    }

    pub async fn shutdown(&self) {
        self.buffer.shutdown().await;
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.buffer.stats()
    }

    pub fn repository(&self) -> &Arc<dyn OpenOrderRepository> {
        &self.repo
    }
}
