//! Order lifecycle processor
//!
//! Consumes decoded Place / Match / Cancel events for all pools and turns
//! them into:
//! - synchronous depth deltas (the idempotency gate: a duplicate stops here)
//! - buffered open-order mutations, history-order inserts and trades
//! - depth, order, trade and kline pushes
//!
//! Events of one pool must arrive in (block, in-block ordinal) order. Replays
//! are absorbed by the depth store's per-event dedup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::buffer::{OpenOrderBuffer, WriteBuffer};
use crate::core_types::{BlockNum, PoolId, SeqNum};
use crate::depth::{DepthDelta, DepthError, DepthStore};
use crate::events::{
    CancelEvent, ChainAction, ChainEvent, DecodedEvent, EventMeta, MatchEvent, PlaceEvent,
    decode_action,
};
use crate::market::KlineAggregator;
use crate::models::{
    CancelInfo, DepthChange, HistoryOrder, OpenOrder, OpenOrderKey, OrderStatus, Trade,
};
use crate::pools::PoolRegistry;
use crate::publish::{OrderUpdate, PushEnvelope, Publisher, publish_logged};

// ============================================================
// STATS
// ============================================================

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub places: AtomicU64,
    pub matches: AtomicU64,
    pub cancels: AtomicU64,
    /// Redelivered events skipped by dedup
    pub duplicates: AtomicU64,
    /// Undecodable payloads
    pub rejected: AtomicU64,
    /// Events aborted by a depth store error
    pub failed: AtomicU64,
    /// Match or cancel referencing an order not found open
    pub unknown_orders: AtomicU64,
}

impl ProcessorStats {
    #[inline]
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            places: self.places.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown_orders: self.unknown_orders.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub places: u64,
    pub matches: u64,
    pub cancels: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub failed: u64,
    pub unknown_orders: u64,
}

impl std::fmt::Display for ProcessorStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processor Stats: place={}, match={}, cancel={}, duplicates={}, rejected={}, failed={}, unknown_orders={}",
            self.places,
            self.matches,
            self.cancels,
            self.duplicates,
            self.rejected,
            self.failed,
            self.unknown_orders
        )
    }
}

/// Result of feeding one event to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Already processed; nothing changed
    Duplicate,
    /// Malformed payload, dropped
    Rejected,
    /// Depth store unavailable; event logged as failed
    Failed,
}

// ============================================================
// PROCESSOR
// ============================================================

/// Buffered outputs of the processor
pub struct ProcessorOutputs {
    pub open_orders: Arc<OpenOrderBuffer>,
    pub history_orders: Arc<WriteBuffer<HistoryOrder>>,
    pub trades: Arc<WriteBuffer<Trade>>,
    pub depth_changes: Arc<WriteBuffer<DepthChange>>,
}

pub struct OrderLifecycleProcessor {
    depth: Arc<dyn DepthStore>,
    pools: Arc<PoolRegistry>,
    outputs: ProcessorOutputs,
    publisher: Arc<dyn Publisher>,
    klines: Arc<KlineAggregator>,
    /// Last applied (block, global sequence) per pool
    positions: Mutex<FxHashMap<PoolId, (BlockNum, SeqNum)>>,
    stats: ProcessorStats,
}

impl OrderLifecycleProcessor {
    pub fn new(
        depth: Arc<dyn DepthStore>,
        pools: Arc<PoolRegistry>,
        outputs: ProcessorOutputs,
        publisher: Arc<dyn Publisher>,
        klines: Arc<KlineAggregator>,
    ) -> Self {
        Self {
            depth,
            pools,
            outputs,
            publisher,
            klines,
            positions: Mutex::new(FxHashMap::default()),
            stats: ProcessorStats::default(),
        }
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Decode and process one raw chain action.
    pub async fn handle_action(&self, action: &ChainAction) -> EventOutcome {
        match decode_action(action, &self.pools) {
            Ok(event) => self.process(event).await,
            Err(e) => {
                ProcessorStats::incr(&self.stats.rejected);
                warn!(
                    trx_id = %action.trx_id,
                    action = %action.action,
                    global_sequence = action.global_sequence,
                    error = %e,
                    "Dropping undecodable action"
                );
                EventOutcome::Rejected
            }
        }
    }

    /// Process one decoded event to completion.
    pub async fn process(&self, event: DecodedEvent) -> EventOutcome {
        let DecodedEvent {
            meta,
            pool_id,
            event,
        } = event;
        self.track_position(pool_id, &meta);
        let kind = event.kind();

        let result = match event {
            ChainEvent::Place(place) => {
                ProcessorStats::incr(&self.stats.places);
                self.on_place(pool_id, &meta, place).await
            }
            ChainEvent::Match(m) => {
                ProcessorStats::incr(&self.stats.matches);
                self.on_match(pool_id, &meta, m).await
            }
            ChainEvent::Cancel(cancel) => {
                ProcessorStats::incr(&self.stats.cancels);
                self.on_cancel(pool_id, &meta, cancel).await
            }
        };

        match result {
            Ok(EventOutcome::Duplicate) => {
                ProcessorStats::incr(&self.stats.duplicates);
                debug!(pool_id, unique_id = %meta.unique_id, kind, "Duplicate event skipped");
                EventOutcome::Duplicate
            }
            Ok(outcome) => outcome,
            Err(e) => {
                ProcessorStats::incr(&self.stats.failed);
                error!(
                    pool_id,
                    trx_id = %meta.trx_id,
                    unique_id = %meta.unique_id,
                    kind,
                    error = %e,
                    "Event failed at depth update"
                );
                EventOutcome::Failed
            }
        }
    }

    fn track_position(&self, pool_id: PoolId, meta: &EventMeta) {
        let position = (meta.block_num, meta.global_sequence);
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = positions.get(&pool_id).copied() {
            if position <= last {
                debug!(
                    pool_id,
                    block_num = meta.block_num,
                    global_sequence = meta.global_sequence,
                    last_block = last.0,
                    last_sequence = last.1,
                    "Event at or behind last applied position"
                );
                return;
            }
        }
        positions.insert(pool_id, position);
    }

    /// Apply one delta under the event's id; `false` means duplicate.
    async fn apply_depth(
        &self,
        pool_id: PoolId,
        meta: &EventMeta,
        delta: DepthDelta,
    ) -> Result<bool, DepthError> {
        let result = self.depth.apply_deltas(pool_id, &[delta]).await?;
        if result.is_duplicate(&meta.unique_id) {
            return Ok(false);
        }
        for change in result.changes {
            self.outputs.depth_changes.add(change).await;
        }
        Ok(true)
    }

    async fn push(&self, envelope: PushEnvelope) {
        publish_logged(self.publisher.as_ref(), &envelope).await;
    }

    async fn record_history(&self, history: HistoryOrder) {
        self.push(PushEnvelope::OrderUpdate(OrderUpdate::from(&history))).await;
        self.outputs.history_orders.add(history).await;
    }

    // --------------------------------------------------------
    // Place
    // --------------------------------------------------------

    async fn on_place(
        &self,
        pool_id: PoolId,
        meta: &EventMeta,
        place: PlaceEvent,
    ) -> Result<EventOutcome, DepthError> {
        let original_qty = place.original_qty();

        if !place.inserted {
            // Resolved at placement: the accompanying matches already moved depth
            if !self.depth.mark_processed(pool_id, &meta.unique_id).await? {
                return Ok(EventOutcome::Duplicate);
            }
            let filled = place.placed_qty.is_zero() && place.executed_qty > Decimal::ZERO;
            let (status, cancel) = if filled {
                (OrderStatus::Filled, None)
            } else {
                let discarded = CancelInfo {
                    trx_id: meta.trx_id.clone(),
                    block_num: meta.block_num,
                    canceled_qty: place.placed_qty,
                };
                (OrderStatus::Cancelled, Some(discarded))
            };
            let history = HistoryOrder {
                pool_id,
                order_id: place.order_id,
                client_order_id: place.client_order_id,
                trader: place.trader,
                side: place.side,
                price: place.price,
                original_qty,
                executed_qty: place.executed_qty,
                status,
                is_market: place.is_market,
                created_trx_id: meta.trx_id.clone(),
                created_block: meta.block_num,
                created_at: meta.block_time,
                closed_at: meta.block_time,
                cancel,
            };
            debug!(pool_id, order_id = history.order_id, status = status.as_str(), "Order resolved at placement");
            self.record_history(history).await;
            return Ok(EventOutcome::Applied);
        }

        let delta = DepthDelta::new(
            place.side,
            place.price,
            place.placed_qty,
            Some(meta.unique_id.clone()),
        );
        if !self.apply_depth(pool_id, meta, delta).await? {
            return Ok(EventOutcome::Duplicate);
        }

        let order = OpenOrder {
            pool_id,
            order_id: place.order_id,
            client_order_id: place.client_order_id,
            trader: place.trader,
            side: place.side,
            price: place.price,
            original_qty,
            executed_qty: place.executed_qty,
            status: OrderStatus::from_executed(place.executed_qty),
            is_market: place.is_market,
            created_trx_id: meta.trx_id.clone(),
            created_block: meta.block_num,
            created_at: meta.block_time,
            updated_at: meta.block_time,
        };
        self.push(PushEnvelope::OrderUpdate(OrderUpdate::from(&order))).await;
        self.outputs.open_orders.insert(order).await;
        Ok(EventOutcome::Applied)
    }

    // --------------------------------------------------------
    // Match
    // --------------------------------------------------------

    async fn on_match(
        &self,
        pool_id: PoolId,
        meta: &EventMeta,
        m: MatchEvent,
    ) -> Result<EventOutcome, DepthError> {
        let maker_side = m.maker_side();
        let delta = DepthDelta::new(
            maker_side,
            m.price,
            -m.base_qty,
            Some(meta.unique_id.clone()),
        );
        if !self.apply_depth(pool_id, meta, delta).await? {
            return Ok(EventOutcome::Duplicate);
        }

        let trade = Trade {
            pool_id,
            trx_id: meta.trx_id.clone(),
            block_num: meta.block_num,
            global_sequence: meta.global_sequence,
            maker_order_id: m.maker_order_id,
            maker: m.maker.clone(),
            taker_order_id: m.taker_order_id,
            taker: m.taker.clone(),
            side: m.taker_side,
            price: m.price,
            base_qty: m.base_qty,
            quote_qty: m.quote_qty,
            maker_fee: m.maker_fee,
            taker_fee: m.taker_fee,
            time: meta.block_time,
        };
        for kline in self.klines.on_trade(&trade) {
            self.push(PushEnvelope::KlineUpdate(kline)).await;
        }
        self.push(PushEnvelope::TradeUpdate(trade.clone())).await;
        self.outputs.trades.add(trade).await;

        let key = OpenOrderKey {
            pool_id,
            order_id: m.maker_order_id,
            side: maker_side,
        };
        let mut maker = match self.outputs.open_orders.get(key).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                ProcessorStats::incr(&self.stats.unknown_orders);
                warn!(
                    pool_id,
                    order_id = m.maker_order_id,
                    trx_id = %meta.trx_id,
                    "Match for unknown maker order, trade recorded only"
                );
                return Ok(EventOutcome::Applied);
            }
            Err(e) => {
                ProcessorStats::incr(&self.stats.failed);
                error!(
                    pool_id,
                    order_id = m.maker_order_id,
                    trx_id = %meta.trx_id,
                    error = %e,
                    "Maker lookup failed, trade recorded without order update"
                );
                return Ok(EventOutcome::Failed);
            }
        };

        maker.apply_fill(m.base_qty, m.maker_new_status, meta.block_time);
        if m.maker_remains_in_book {
            if maker.status.is_terminal() {
                maker.status = OrderStatus::from_executed(maker.executed_qty);
            }
            self.push(PushEnvelope::OrderUpdate(OrderUpdate::from(&maker))).await;
            self.outputs.open_orders.update(maker).await;
        } else {
            let status = match maker.status {
                OrderStatus::Cancelled => OrderStatus::Cancelled,
                _ => OrderStatus::Filled,
            };
            self.outputs.open_orders.delete(key).await;
            self.record_history(maker.into_history(status, meta.block_time, None))
                .await;
        }
        Ok(EventOutcome::Applied)
    }

    // --------------------------------------------------------
    // Cancel
    // --------------------------------------------------------

    async fn on_cancel(
        &self,
        pool_id: PoolId,
        meta: &EventMeta,
        cancel: CancelEvent,
    ) -> Result<EventOutcome, DepthError> {
        let delta = DepthDelta::new(
            cancel.side,
            cancel.price,
            -cancel.canceled_qty,
            Some(meta.unique_id.clone()),
        );
        if !self.apply_depth(pool_id, meta, delta).await? {
            return Ok(EventOutcome::Duplicate);
        }

        let key = OpenOrderKey {
            pool_id,
            order_id: cancel.order_id,
            side: cancel.side,
        };
        let info = CancelInfo {
            trx_id: meta.trx_id.clone(),
            block_num: meta.block_num,
            canceled_qty: cancel.canceled_qty,
        };

        let (known, lookup_failed) = match self.outputs.open_orders.get(key).await {
            Ok(found) => (found, false),
            Err(e) => {
                error!(pool_id, order_id = cancel.order_id, error = %e, "Open order lookup failed");
                (None, true)
            }
        };
        // Delete unconditionally: harmless when absent, clears a row the
        // failed lookup could not see
        self.outputs.open_orders.delete(key).await;

        let history = match known {
            Some(order) => order.into_history(OrderStatus::Cancelled, meta.block_time, Some(info)),
            None => {
                if !lookup_failed {
                    ProcessorStats::incr(&self.stats.unknown_orders);
                    warn!(
                        pool_id,
                        order_id = cancel.order_id,
                        trx_id = %meta.trx_id,
                        "Cancel for unknown order, history built from payload"
                    );
                }
                let executed_qty = cancel.executed_qty.unwrap_or(Decimal::ZERO);
                HistoryOrder {
                    pool_id,
                    order_id: cancel.order_id,
                    client_order_id: cancel.client_order_id,
                    trader: cancel.trader,
                    side: cancel.side,
                    price: cancel.price,
                    original_qty: cancel.canceled_qty + executed_qty,
                    executed_qty,
                    status: OrderStatus::Cancelled,
                    is_market: false,
                    created_trx_id: String::new(),
                    created_block: 0,
                    created_at: meta.block_time,
                    closed_at: meta.block_time,
                    cancel: Some(info),
                }
            }
        };
        self.record_history(history).await;
        if lookup_failed {
            ProcessorStats::incr(&self.stats.failed);
            return Ok(EventOutcome::Failed);
        }
        Ok(EventOutcome::Applied)
    }
}
