//! K-Line aggregation
//!
//! Live OHLCV candles per pool and interval, updated on every trade and
//! published as `kline_update`. Candles are aligned to UTC interval
//! boundaries; a trade older than the current candle is ignored.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::PoolId;
use crate::models::Trade;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

/// Supported K-Line intervals
pub const KLINE_INTERVALS: [KlineInterval; 6] = [
    KlineInterval::M1,
    KlineInterval::M5,
    KlineInterval::M15,
    KlineInterval::M30,
    KlineInterval::H1,
    KlineInterval::D1,
];

impl KlineInterval {
    pub fn seconds(self) -> i64 {
        match self {
            KlineInterval::M1 => 60,
            KlineInterval::M5 => 300,
            KlineInterval::M15 => 900,
            KlineInterval::M30 => 1800,
            KlineInterval::H1 => 3600,
            KlineInterval::D1 => 86400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KlineInterval::M1 => "1m",
            KlineInterval::M5 => "5m",
            KlineInterval::M15 => "15m",
            KlineInterval::M30 => "30m",
            KlineInterval::H1 => "1h",
            KlineInterval::D1 => "1d",
        }
    }

    /// Start of the candle containing `t`
    pub fn open_time(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let start = secs - secs.rem_euclid(self.seconds());
        DateTime::from_timestamp(start, 0).unwrap_or(t)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub pool_id: PoolId,
    pub interval: KlineInterval,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Base asset volume
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
}

impl Kline {
    fn from_trade(trade: &Trade, interval: KlineInterval, open_time: DateTime<Utc>) -> Self {
        Self {
            pool_id: trade.pool_id,
            interval,
            open_time,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.base_qty,
            quote_volume: trade.quote_qty,
            trade_count: 1,
        }
    }

    fn absorb(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.base_qty;
        self.quote_volume += trade.quote_qty;
        self.trade_count += 1;
    }
}

#[derive(Default)]
pub struct KlineAggregator {
    current: Mutex<FxHashMap<(PoolId, KlineInterval), Kline>>,
}

impl KlineAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<(PoolId, KlineInterval), Kline>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold a trade into every interval; returns the updated candles.
    pub fn on_trade(&self, trade: &Trade) -> Vec<Kline> {
        let mut current = self.lock();
        let mut updated = Vec::with_capacity(KLINE_INTERVALS.len());

        for interval in KLINE_INTERVALS {
            let open_time = interval.open_time(trade.time);
            let key = (trade.pool_id, interval);
            match current.get(&key).map(|k| k.open_time.cmp(&open_time)) {
                Some(Ordering::Equal) => {
                    if let Some(kline) = current.get_mut(&key) {
                        kline.absorb(trade);
                        updated.push(kline.clone());
                    }
                }
                Some(Ordering::Greater) => {
                    tracing::debug!(
                        pool_id = trade.pool_id,
                        interval = interval.as_str(),
                        trx_id = %trade.trx_id,
                        "Late trade for closed candle ignored"
                    );
                }
                _ => {
                    let kline = Kline::from_trade(trade, interval, open_time);
                    updated.push(kline.clone());
                    current.insert(key, kline);
                }
            }
        }
        updated
    }

    pub fn current(&self, pool_id: PoolId, interval: KlineInterval) -> Option<Kline> {
        self.lock().get(&(pool_id, interval)).cloned()
    }
}
