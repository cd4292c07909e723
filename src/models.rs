// models.rs - Mirrored order, trade and depth record types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{BlockNum, OrderId, PoolId, SeqNum};

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a taker trades against (maker side)
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Parse the chain's side encoding ("buy"/"sell", "bid"/"ask", 0/1)
    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "bid" | "0" => Some(Side::Buy),
            "sell" | "ask" | "1" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order status of a mirrored order.
///
/// `Open` and `PartiallyFilled` are live (OpenOrder), `Filled` and
/// `Cancelled` are terminal (HistoryOrder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }

    /// Live status derived from executed quantity
    pub fn from_executed(executed: Decimal) -> OrderStatus {
        if executed > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<OrderStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "new" => Some(OrderStatus::Open),
            "partially_filled" | "partial" | "partiallyfilled" => {
                Some(OrderStatus::PartiallyFilled)
            }
            "filled" => Some(OrderStatus::Filled),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Natural identity of a resting order.
///
/// Side is part of the key so cache readers can locate the order without a
/// second lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenOrderKey {
    pub pool_id: PoolId,
    pub order_id: OrderId,
    pub side: Side,
}

// ============================================================
// OPEN ORDER (mutable, resting in the book)
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub pool_id: PoolId,
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub side: Side,
    pub price: Decimal,
    pub original_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    pub is_market: bool,
    pub created_trx_id: String,
    pub created_block: BlockNum,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OpenOrder {
    #[inline]
    pub fn key(&self) -> OpenOrderKey {
        OpenOrderKey {
            pool_id: self.pool_id,
            order_id: self.order_id,
            side: self.side,
        }
    }

    /// Remaining quantity resting in the book
    #[inline]
    pub fn remaining_qty(&self) -> Decimal {
        (self.original_qty - self.executed_qty).max(Decimal::ZERO)
    }

    /// Record a fill against this order and refresh its status.
    ///
    /// `new_status` is the status reported on-chain; when absent it is
    /// derived from the remaining quantity.
    pub fn apply_fill(
        &mut self,
        base_qty: Decimal,
        new_status: Option<OrderStatus>,
        at: DateTime<Utc>,
    ) {
        self.executed_qty += base_qty;
        self.status = match new_status {
            Some(status) => status,
            None if self.remaining_qty().is_zero() => OrderStatus::Filled,
            None => OrderStatus::PartiallyFilled,
        };
        self.updated_at = at;
    }

    /// Migrate to a terminal history record
    pub fn into_history(
        self,
        status: OrderStatus,
        closed_at: DateTime<Utc>,
        cancel: Option<CancelInfo>,
    ) -> HistoryOrder {
        HistoryOrder {
            pool_id: self.pool_id,
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            trader: self.trader,
            side: self.side,
            price: self.price,
            original_qty: self.original_qty,
            executed_qty: self.executed_qty,
            status,
            is_market: self.is_market,
            created_trx_id: self.created_trx_id,
            created_block: self.created_block,
            created_at: self.created_at,
            closed_at,
            cancel,
        }
    }
}

// ============================================================
// HISTORY ORDER (immutable, terminal)
// ============================================================

/// Cancellation metadata attached to a cancelled history order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelInfo {
    pub trx_id: String,
    pub block_num: BlockNum,
    pub canceled_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryOrder {
    pub pool_id: PoolId,
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub side: Side,
    pub price: Decimal,
    pub original_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    pub is_market: bool,
    pub created_trx_id: String,
    pub created_block: BlockNum,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub cancel: Option<CancelInfo>,
}

impl HistoryOrder {
    /// Cancelled after part of the order had already traded
    pub fn is_partially_filled_cancel(&self) -> bool {
        self.status == OrderStatus::Cancelled && self.executed_qty > Decimal::ZERO
    }
}

// ============================================================
// TRADE (immutable)
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub pool_id: PoolId,
    pub trx_id: String,
    pub block_num: BlockNum,
    pub global_sequence: SeqNum,
    pub maker_order_id: OrderId,
    pub maker: String,
    pub taker_order_id: OrderId,
    pub taker: String,
    /// Taker side; the maker rests on the opposite side
    pub side: Side,
    pub price: Decimal,
    pub base_qty: Decimal,
    pub quote_qty: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub time: DateTime<Utc>,
}

// ============================================================
// DEPTH CHANGE (transient projection)
// ============================================================

/// New aggregate of one (bucket, precision) pair after a delta application.
///
/// `quantity` is truncated to the display scale; `"0"` means the level was
/// removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthChange {
    pub pool_id: PoolId,
    pub side: Side,
    pub precision: String,
    pub price: String,
    pub quantity: String,
}

impl DepthChange {
    #[inline]
    pub fn is_removal(&self) -> bool {
        self.quantity == "0"
    }
}
