//! Service graph, built once at startup
//!
//! Every component takes its collaborators as trait objects; `Services`
//! picks the concrete backends from [`AppConfig`] and wires them together.

use std::sync::Arc;

use tracing::info;

use crate::buffer::{BatchSink, OpenOrderBuffer, WriteBuffer};
use crate::config::{AppConfig, DepthBackend, PublishBackend, StorageBackend};
use crate::depth::{DepthStore, MemoryDepthStore, RedisDepthStore};
use crate::ingest::ShutdownSignal;
use crate::market::{DepthQueryService, KlineAggregator};
use crate::models::{DepthChange, HistoryOrder, Trade};
use crate::persistence::{
    HistoryOrderSink, MemoryOpenOrderRepository, MemorySink, OpenOrderRepository,
    PgOpenOrderRepository, TDengineClient, TradeSink,
};
use crate::pools::PoolRegistry;
use crate::processor::{OrderLifecycleProcessor, ProcessorOutputs};
use crate::publish::{BroadcastPublisher, DepthUpdateSink, Publisher, RedisPublisher};
use crate::repair::{ChainSnapshotSource, HttpSnapshotSource, RepairService, StaticSnapshotSource};

/// Concrete in-memory stores behind a [`Services::memory_with_backends`] graph
pub struct MemoryBackends {
    pub open_orders: Arc<MemoryOpenOrderRepository>,
    pub history_orders: Arc<MemorySink<HistoryOrder>>,
    pub trades: Arc<MemorySink<Trade>>,
    pub snapshot: Arc<StaticSnapshotSource>,
}

struct Backends {
    depth: Arc<dyn DepthStore>,
    publisher: Arc<dyn Publisher>,
    broadcast: Option<Arc<BroadcastPublisher>>,
    open_orders: Arc<dyn OpenOrderRepository>,
    history_orders: Arc<dyn BatchSink<HistoryOrder>>,
    trades: Arc<dyn BatchSink<Trade>>,
    snapshot: Option<Arc<dyn ChainSnapshotSource>>,
}

pub struct Services {
    pub pools: Arc<PoolRegistry>,
    pub depth: Arc<dyn DepthStore>,
    pub publisher: Arc<dyn Publisher>,
    /// Set when publishing in-process; subscribe here for pushes
    pub broadcast: Option<Arc<BroadcastPublisher>>,
    pub open_orders: Arc<OpenOrderBuffer>,
    pub history_orders: Arc<WriteBuffer<HistoryOrder>>,
    pub trades: Arc<WriteBuffer<Trade>>,
    pub depth_changes: Arc<WriteBuffer<DepthChange>>,
    pub klines: Arc<KlineAggregator>,
    pub processor: Arc<OrderLifecycleProcessor>,
    pub depth_query: DepthQueryService,
    /// Present when a snapshot source is configured
    pub repair: Option<RepairService>,
    pub shutdown: Arc<ShutdownSignal>,
}

impl Services {
    /// Connect the configured backends and build the graph
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let depth: Arc<dyn DepthStore> = match config.depth.backend {
            DepthBackend::Memory => Arc::new(MemoryDepthStore::new(config.depth.dedup_capacity)),
            DepthBackend::Redis => {
                let store = RedisDepthStore::connect(
                    &config.depth.redis_url,
                    config.depth.key_prefix.clone(),
                    config.depth.dedup_capacity,
                )
                .await?;
                info!(redis_url = %config.depth.redis_url, "Redis depth store connected");
                Arc::new(store)
            }
        };

        let (publisher, broadcast) = match config.publish.backend {
            PublishBackend::Broadcast => {
                let b = Arc::new(BroadcastPublisher::new(config.publish.capacity));
                (b.clone() as Arc<dyn Publisher>, Some(b))
            }
            PublishBackend::Redis => {
                let p = RedisPublisher::connect(
                    &config.publish.redis_url,
                    config.publish.channel_prefix.clone(),
                )
                .await?;
                (Arc::new(p) as Arc<dyn Publisher>, None)
            }
        };

        let (open_orders, history_orders, trades): (
            Arc<dyn OpenOrderRepository>,
            Arc<dyn BatchSink<HistoryOrder>>,
            Arc<dyn BatchSink<Trade>>,
        ) = match config.storage.backend {
            StorageBackend::Memory => (
                Arc::new(MemoryOpenOrderRepository::default()),
                Arc::new(MemorySink::default()),
                Arc::new(MemorySink::default()),
            ),
            StorageBackend::Database => {
                let pg = PgOpenOrderRepository::connect(&config.storage.postgres_url).await?;
                pg.init_schema().await?;
                let td = Arc::new(TDengineClient::connect(&config.storage.tdengine_dsn).await?);
                td.init_schema().await?;
                (
                    Arc::new(pg),
                    Arc::new(HistoryOrderSink::new(td.clone())),
                    Arc::new(TradeSink::new(td)),
                )
            }
        };

        let snapshot: Option<Arc<dyn ChainSnapshotSource>> = match config.repair.snapshot_url.as_deref() {
            Some(url) => Some(Arc::new(HttpSnapshotSource::new(url)?)),
            None => None,
        };

        let services = Self::assemble(
            config,
            Backends {
                depth,
                publisher,
                broadcast,
                open_orders,
                history_orders,
                trades,
                snapshot,
            },
        );
        info!(
            pools = services.pools.pool_count(),
            depth = services.depth.backend_name(),
            storage = ?config.storage.backend,
            publish = ?config.publish.backend,
            repair = services.repair.is_some(),
            "Services built"
        );
        Ok(services)
    }

    /// All-in-memory graph with a static snapshot source
    pub fn memory(config: &AppConfig) -> Self {
        Self::memory_with_backends(config).0
    }

    pub fn memory_with_backends(config: &AppConfig) -> (Self, MemoryBackends) {
        let backends = MemoryBackends {
            open_orders: Arc::new(MemoryOpenOrderRepository::default()),
            history_orders: Arc::new(MemorySink::default()),
            trades: Arc::new(MemorySink::default()),
            snapshot: Arc::new(StaticSnapshotSource::default()),
        };
        let broadcast = Arc::new(BroadcastPublisher::new(config.publish.capacity));
        let services = Self::assemble(
            config,
            Backends {
                depth: Arc::new(MemoryDepthStore::new(config.depth.dedup_capacity)),
                publisher: broadcast.clone(),
                broadcast: Some(broadcast),
                open_orders: backends.open_orders.clone(),
                history_orders: backends.history_orders.clone(),
                trades: backends.trades.clone(),
                snapshot: Some(backends.snapshot.clone()),
            },
        );
        (services, backends)
    }

    fn assemble(config: &AppConfig, b: Backends) -> Self {
        let pools = Arc::new(PoolRegistry::new(config.pools.iter().cloned()));
        let buffers = &config.buffers;

        let open_orders = Arc::new(OpenOrderBuffer::spawn(
            buffers.open_orders,
            config.cache_ttl(),
            b.open_orders,
        ));
        let history_orders = Arc::new(WriteBuffer::spawn(
            "history_orders",
            buffers.history_orders,
            b.history_orders,
        ));
        let trades = Arc::new(WriteBuffer::spawn("trades", buffers.trades, b.trades));
        let depth_changes = Arc::new(WriteBuffer::spawn(
            "depth_changes",
            buffers.depth,
            Arc::new(DepthUpdateSink::new(b.publisher.clone())),
        ));
        let klines = Arc::new(KlineAggregator::new());

        let processor = Arc::new(OrderLifecycleProcessor::new(
            b.depth.clone(),
            pools.clone(),
            ProcessorOutputs {
                open_orders: open_orders.clone(),
                history_orders: history_orders.clone(),
                trades: trades.clone(),
                depth_changes: depth_changes.clone(),
            },
            b.publisher.clone(),
            klines.clone(),
        ));

        let depth_query = DepthQueryService::new(b.depth.clone(), pools.clone());
        let repair = b.snapshot.map(|source| {
            RepairService::new(b.depth.clone(), open_orders.clone(), pools.clone(), source)
        });

        Self {
            pools,
            depth: b.depth,
            publisher: b.publisher,
            broadcast: b.broadcast,
            open_orders,
            history_orders,
            trades,
            depth_changes,
            klines,
            processor,
            depth_query,
            repair,
            shutdown: Arc::new(ShutdownSignal::new()),
        }
    }

    /// Push every pending record to its sink and wait for the writes
    pub async fn flush_all(&self) {
        self.depth_changes.flush().await;
        self.open_orders.flush().await;
        self.history_orders.flush().await;
        self.trades.flush().await;
    }

    /// Drain every buffer and stop the flush workers
    pub async fn shutdown(&self) {
        self.shutdown.request_shutdown();
        // Open-order deletes land before the matching history rows
        self.open_orders.shutdown().await;
        self.history_orders.shutdown().await;
        self.trades.shutdown().await;
        self.depth_changes.shutdown().await;
        self.log_stats();
    }

    pub fn log_stats(&self) {
        info!("{}", self.processor.stats());
        info!("Buffer open_orders: {}", self.open_orders.stats());
        info!("Buffer history_orders: {}", self.history_orders.stats());
        info!("Buffer trades: {}", self.trades.stats());
        info!("Buffer depth_changes: {}", self.depth_changes.stats());
    }
}
