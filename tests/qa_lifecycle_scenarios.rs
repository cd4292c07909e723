//! End-to-end lifecycle scenarios on the in-memory service graph

use dex_mirror::app::{MemoryBackends, Services};
use dex_mirror::config::AppConfig;
use dex_mirror::events::ChainAction;
use dex_mirror::models::{OpenOrderKey, OrderStatus, Side};
use dex_mirror::persistence::OpenOrderRepository;
use dex_mirror::pools::PoolConfig;
use dex_mirror::processor::EventOutcome;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

fn setup() -> (Services, MemoryBackends) {
    let config = AppConfig {
        pools: vec![PoolConfig {
            pool_id: 1,
            symbol: "BTC_USDT".into(),
            base_symbol: "BTC".into(),
            quote_symbol: "USDT".into(),
            price_precision: 3,
            base_precision: 8,
            quote_precision: 6,
        }],
        ..AppConfig::default()
    };
    Services::memory_with_backends(&config)
}

fn action(trx_id: &str, seq: u64, name: &str, data: Value) -> ChainAction {
    ChainAction {
        trx_id: trx_id.into(),
        block_num: seq,
        block_time: "2024-05-01T08:30:00.500".into(),
        global_sequence: seq,
        action: name.into(),
        data,
    }
}

/// Resting limit order; price is raw (3 decimals)
fn place(order_id: u64, side: &str, price: u64, qty: &str) -> ChainAction {
    action(
        &format!("place-{}", order_id),
        order_id,
        "logplace",
        json!({
            "pool_id": 1, "order_id": order_id, "trader": "maker1", "side": side,
            "price": price, "quantity": format!("{} BTC", qty), "inserted": true
        }),
    )
}

fn fill(seq: u64, maker_order_id: u64, taker_side: &str, price: u64, qty: &str, remains: bool) -> ChainAction {
    action(
        &format!("match-{}", seq),
        seq,
        "logmatch",
        json!({
            "pool_id": 1, "maker_order_id": maker_order_id, "maker": "maker1",
            "taker_order_id": 1000 + seq, "taker": "taker1", "taker_side": taker_side,
            "price": price, "base_quantity": format!("{} BTC", qty),
            "quote_quantity": "0.000000 USDT", "maker_remains_in_book": remains
        }),
    )
}

fn cancel(seq: u64, order_id: u64, side: &str, price: u64, qty: &str) -> ChainAction {
    action(
        &format!("cancel-{}", seq),
        seq,
        "logcancel",
        json!({
            "pool_id": 1, "order_id": order_id, "trader": "maker1", "side": side,
            "price": price, "canceled_quantity": format!("{} BTC", qty)
        }),
    )
}

fn levels(raw: &[(&str, &str)]) -> Vec<(String, String)> {
    raw.iter().map(|(p, q)| (p.to_string(), q.to_string())).collect()
}

#[tokio::test]
async fn qa_tc_place_match_cancel() {
    let (services, stores) = setup();
    let p = &services.processor;
    let q = &services.depth_query;

    // Setup: Buy 5 @ 100.00
    assert_eq!(p.handle_action(&place(1, "buy", 100_000, "5.00000000")).await, EventOutcome::Applied);
    let view = q.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(view.bids, levels(&[("100.00", "5")]));

    // Action: taker sells 2 into it
    assert_eq!(p.handle_action(&fill(10, 1, "sell", 100_000, "2.00000000", true)).await, EventOutcome::Applied);
    let view = q.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(view.bids, levels(&[("100.00", "3")]));

    // Action: cancel the remaining 3
    assert_eq!(p.handle_action(&cancel(20, 1, "buy", 100_000, "3.00000000")).await, EventOutcome::Applied);
    let view = q.get_depth(1, Some("0.01"), None).await.unwrap();
    assert!(view.bids.is_empty());

    // Verify: order moved to history as a partially filled cancel
    services.flush_all().await;
    assert!(stores.open_orders.is_empty());
    let history = stores.history_orders.records();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].order_id, 1);
    assert_eq!(history[0].status, OrderStatus::Cancelled);
    assert_eq!(history[0].executed_qty, dec!(2));
    assert_eq!(history[0].original_qty, dec!(5));
    assert_eq!(history[0].cancel.as_ref().unwrap().canceled_qty, dec!(3));
    assert_eq!(stores.trades.len(), 1);

    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_redelivered_match_is_noop() {
    let (services, stores) = setup();
    let p = &services.processor;

    p.handle_action(&place(1, "buy", 100_000, "5.00000000")).await;
    let m = fill(10, 1, "sell", 100_000, "2.00000000", true);
    assert_eq!(p.handle_action(&m).await, EventOutcome::Applied);

    // Same (trx_id, global_sequence) delivered again
    assert_eq!(p.handle_action(&m).await, EventOutcome::Duplicate);

    let view = services.depth_query.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(view.bids, levels(&[("100.00", "3")]));

    services.flush_all().await;
    assert_eq!(stores.trades.len(), 1, "Redelivery must not duplicate the trade");
    let key = OpenOrderKey { pool_id: 1, order_id: 1, side: Side::Buy };
    let open = stores.open_orders.get(key).await.unwrap().unwrap();
    assert_eq!(open.executed_qty, dec!(2));

    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_coarse_precision_bucketing() {
    let (services, _stores) = setup();
    let p = &services.processor;
    let q = &services.depth_query;

    // Two bids, 100.000 and 100.004, share the 0.01 bucket (floor)
    p.handle_action(&place(1, "buy", 100_000, "1.00000000")).await;
    p.handle_action(&place(2, "buy", 100_004, "2.00000000")).await;
    // An ask at 100.004 rounds away from the spread (ceil)
    p.handle_action(&place(3, "sell", 100_004, "0.50000000")).await;

    let cents = q.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(cents.bids, levels(&[("100.00", "3")]));
    assert_eq!(cents.asks, levels(&[("100.01", "0.5")]));

    let mills = q.get_depth(1, Some("0.001"), None).await.unwrap();
    assert_eq!(mills.bids, levels(&[("100.004", "2"), ("100.000", "1")]));

    let whole = q.get_depth(1, Some("1"), None).await.unwrap();
    assert_eq!(whole.bids, levels(&[("100", "3")]));
    assert_eq!(whole.asks, levels(&[("101", "0.5")]));

    // Default precision is the finest step
    let finest = q.get_depth(1, None, Some(1)).await.unwrap();
    assert_eq!(finest.precision, "0.00000001");
    assert_eq!(finest.bids, levels(&[("100.00400000", "2")]));

    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_unsupported_precision_rejected() {
    let (services, _stores) = setup();
    let err = services.depth_query.get_depth(1, Some("0.05"), None).await;
    assert!(matches!(err, Err(dex_mirror::DepthError::UnsupportedPrecision(_))));
    let err = services.depth_query.get_depth(9, None, None).await;
    assert!(matches!(err, Err(dex_mirror::DepthError::UnknownPool(9))));
    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_order_never_open_and_history() {
    let (services, stores) = setup();
    let p = &services.processor;
    let key = OpenOrderKey { pool_id: 1, order_id: 1, side: Side::Sell };

    p.handle_action(&place(1, "sell", 101_000, "1.00000000")).await;
    services.flush_all().await;
    assert!(stores.open_orders.get(key).await.unwrap().is_some());

    // Fully filled: leaves the book
    p.handle_action(&fill(10, 1, "buy", 101_000, "1.00000000", false)).await;

    // Before any flush the buffered delete already hides the order
    assert!(services.open_orders.get(key).await.unwrap().is_none());

    services.flush_all().await;
    assert!(stores.open_orders.get(key).await.unwrap().is_none());
    let history = stores.history_orders.records();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, OrderStatus::Filled);
    assert_eq!(history[0].executed_qty, dec!(1));

    let view = services.depth_query.get_depth(1, Some("0.001"), None).await.unwrap();
    assert!(view.asks.is_empty());

    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_every_record_flushed_once() {
    let (services, stores) = setup();
    let p = &services.processor;

    // Trades against an unknown maker still reach the trade store
    for seq in 1..=2_500u64 {
        p.handle_action(&fill(seq, 77, "buy", 100_000, "0.00010000", true)).await;
    }
    services.shutdown().await;

    let trades = stores.trades.records();
    assert_eq!(trades.len(), 2_500);
    let mut seqs: Vec<u64> = trades.iter().map(|t| t.global_sequence).collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), 2_500);
}

#[tokio::test]
async fn qa_tc_repair_restores_drifted_depth() {
    let (services, stores) = setup();
    let p = &services.processor;

    p.handle_action(&place(1, "buy", 99_000, "4.00000000")).await;
    p.handle_action(&place(2, "sell", 101_000, "2.00000000")).await;
    p.handle_action(&fill(10, 1, "sell", 99_000, "1.00000000", true)).await;
    services.flush_all().await;

    let before = services.depth_query.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(before.bids, levels(&[("99.00", "3")]));

    // Simulate a missed cancel: the chain no longer has order 2
    let authoritative: Vec<_> = stores
        .open_orders
        .list_pool(1)
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.order_id != 2)
        .collect();
    stores.snapshot.set(authoritative);

    let repair = services.repair.as_ref().unwrap();
    let report = repair.repair_pool(1).await.unwrap();
    assert_eq!(report.orders, 1);

    let after = services.depth_query.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(after.bids, before.bids);
    assert!(after.asks.is_empty());

    // The missed cancel's order is gone from reads too
    let key = OpenOrderKey { pool_id: 1, order_id: 2, side: Side::Sell };
    assert!(services.open_orders.get(key).await.unwrap().is_none());

    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_redelivery_after_repair_is_noop() {
    let (services, stores) = setup();
    let p = &services.processor;

    p.handle_action(&place(1, "buy", 100_000, "5.00000000")).await;
    let m = fill(10, 1, "sell", 100_000, "2.00000000", true);
    assert_eq!(p.handle_action(&m).await, EventOutcome::Applied);
    services.flush_all().await;

    // Chain agrees with the mirror: 3 left on order 1
    stores.snapshot.set(stores.open_orders.list_pool(1).await.unwrap());
    services.repair.as_ref().unwrap().repair_pool(1).await.unwrap();
    let repaired = services.depth_query.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(repaired.bids, levels(&[("100.00", "3")]));

    // The feed redelivers a match already reflected in the snapshot
    assert_eq!(p.handle_action(&m).await, EventOutcome::Duplicate);
    let place_again = place(1, "buy", 100_000, "5.00000000");
    assert_eq!(p.handle_action(&place_again).await, EventOutcome::Duplicate);

    let view = services.depth_query.get_depth(1, Some("0.01"), None).await.unwrap();
    assert_eq!(view.bids, repaired.bids);

    services.flush_all().await;
    let key = OpenOrderKey { pool_id: 1, order_id: 1, side: Side::Buy };
    let open = stores.open_orders.get(key).await.unwrap().unwrap();
    assert_eq!(open.executed_qty, dec!(2));
    assert_eq!(stores.trades.len(), 1);

    services.shutdown().await;
}

#[tokio::test]
async fn qa_tc_pushes_reach_subscribers() {
    let (services, _stores) = setup();
    let mut rx = services.broadcast.as_ref().unwrap().subscribe();
    let p = &services.processor;

    p.handle_action(&place(1, "buy", 100_000, "5.00000000")).await;
    p.handle_action(&fill(10, 1, "sell", 100_000, "2.00000000", true)).await;
    services.flush_all().await;

    let mut kinds = Vec::new();
    while let Ok(env) = rx.try_recv() {
        kinds.push(env.kind());
    }
    for expected in ["order_update", "trade_update", "kline_update", "depth_update"] {
        assert!(kinds.contains(&expected), "missing {} in {:?}", expected, kinds);
    }

    services.shutdown().await;
}
