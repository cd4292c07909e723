//! Event ingestion loops
//!
//! One [`Ingestor`] task per subscription pulls batches from an
//! [`EventSource`], runs each action through the processor in delivery
//! order, then acknowledges the batch. Acking after processing gives
//! at-least-once delivery; the depth store's dedup makes replays no-ops.

pub mod channel;
pub mod redis_stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::events::ChainAction;
use crate::processor::OrderLifecycleProcessor;

pub use channel::ChannelSource;
pub use redis_stream::RedisStreamSource;

/// Pause after a failed read before polling the source again
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(500);

// ============================================================
// SHUTDOWN
// ============================================================

/// Shared stop flag for all ingestion loops
#[derive(Debug)]
pub struct ShutdownSignal {
    pub shutdown: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// SOURCE
// ============================================================

/// One delivered entry. `action` is `None` when the entry could not be
/// parsed; it is still acknowledged so it is not redelivered forever.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub action: Option<ChainAction>,
}

#[async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &str;

    /// Next batch in delivery order. May return an empty batch after a
    /// bounded wait so the caller can observe shutdown.
    async fn next_batch(&mut self) -> anyhow::Result<Vec<Delivery>>;

    /// Acknowledge processed entries
    async fn ack(&mut self, ids: &[String]) -> anyhow::Result<()>;

    /// No further entries will ever arrive
    fn is_exhausted(&self) -> bool {
        false
    }
}

// ============================================================
// INGESTOR
// ============================================================

#[derive(Debug, Default)]
pub struct IngestStats {
    pub delivered: AtomicU64,
    pub unparseable: AtomicU64,
    pub source_errors: AtomicU64,
    pub ack_failures: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            unparseable: self.unparseable.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub delivered: u64,
    pub unparseable: u64,
    pub source_errors: u64,
    pub ack_failures: u64,
}

impl std::fmt::Display for IngestStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ingest Stats: delivered={}, unparseable={}, source_errors={}, ack_failures={}",
            self.delivered, self.unparseable, self.source_errors, self.ack_failures
        )
    }
}

pub struct Ingestor {
    processor: Arc<OrderLifecycleProcessor>,
    shutdown: Arc<ShutdownSignal>,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(processor: Arc<OrderLifecycleProcessor>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            processor,
            shutdown,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Run until shutdown is requested or the source is exhausted.
    ///
    /// The batch in hand is always processed and acked before the loop
    /// checks the shutdown flag again.
    pub async fn run<S: EventSource>(&self, mut source: S) {
        info!(source = source.name(), "Ingestion started");

        loop {
            if self.shutdown.is_shutdown_requested() {
                info!(source = source.name(), "Shutdown requested, ingestion stopping");
                break;
            }
            if source.is_exhausted() {
                info!(source = source.name(), "Source exhausted, ingestion stopping");
                break;
            }

            let batch = match source.next_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    self.stats.source_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(source = source.name(), error = %e, "Source read failed");
                    tokio::time::sleep(SOURCE_RETRY_DELAY).await;
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let mut ids = Vec::with_capacity(batch.len());
            for delivery in batch {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                match &delivery.action {
                    Some(action) => {
                        self.processor.handle_action(action).await;
                    }
                    None => {
                        self.stats.unparseable.fetch_add(1, Ordering::Relaxed);
                    }
                }
                ids.push(delivery.id);
            }

            if let Err(e) = source.ack(&ids).await {
                self.stats.ack_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    source = source.name(),
                    count = ids.len(),
                    error = %e,
                    "Ack failed, batch will be redelivered"
                );
            }
        }

        info!(source = source.name(), "{}", self.stats.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Services;
    use crate::config::AppConfig;
    use crate::depth::DepthStore;
    use crate::pools::PoolConfig;
    use crate::precision::Precision;
    use serde_json::json;

    fn config() -> AppConfig {
        AppConfig {
            pools: vec![PoolConfig {
                pool_id: 1,
                symbol: "BTC_USDT".into(),
                base_symbol: "BTC".into(),
                quote_symbol: "USDT".into(),
                price_precision: 2,
                base_precision: 8,
                quote_precision: 6,
            }],
            ..AppConfig::default()
        }
    }

    fn place(seq: u64) -> ChainAction {
        ChainAction {
            trx_id: format!("t{}", seq),
            block_num: seq,
            block_time: "2024-05-01T00:00:00".into(),
            global_sequence: seq,
            action: "logplace".into(),
            data: json!({
                "pool_id": 1, "order_id": seq, "trader": "alice", "side": "sell",
                "price": 10100, "quantity": "1.00000000 BTC", "inserted": true
            }),
        }
    }

    #[tokio::test]
    async fn test_ingestor_drains_until_exhausted() {
        let services = Services::memory(&config());
        let (tx, source) = ChannelSource::new("test", 16, 8);

        tx.send(place(1)).await.unwrap();
        tx.send(place(2)).await.unwrap();
        // Redelivery of the first entry
        tx.send(place(1)).await.unwrap();
        drop(tx);

        let ingestor = Ingestor::new(services.processor.clone(), Arc::new(ShutdownSignal::new()));
        ingestor.run(source).await;

        let stats = services.processor.stats();
        assert_eq!(stats.places, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(ingestor.stats().snapshot().delivered, 3);

        let snap = services
            .depth
            .snapshot(1, Precision::parse("1").unwrap(), 10)
            .await
            .unwrap();
        assert_eq!(snap.asks, vec![("101".to_string(), "2".to_string())]);
        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingestor_stops_on_shutdown() {
        let services = Services::memory(&config());
        let (_tx, source) = ChannelSource::new("idle", 16, 8);
        let shutdown = Arc::new(ShutdownSignal::new());
        let ingestor = Ingestor::new(services.processor.clone(), shutdown.clone());

        shutdown.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), ingestor.run(source))
            .await
            .unwrap();
        services.shutdown().await;
    }
}
