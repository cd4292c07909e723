//! Chain action envelope and decoded lifecycle events
//!
//! The feed delivers [`ChainAction`]s: transaction metadata plus a raw JSON
//! payload whose shape depends on `action`. [`decode::decode_action`] turns
//! them into typed [`DecodedEvent`]s with exact decimals.

pub mod decode;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{BlockNum, OrderId, PoolId, SeqNum, UniqueId};
use crate::models::{OrderStatus, Side};

pub use decode::{DecodeError, decode_action};

/// One action as delivered by the chain feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAction {
    pub trx_id: String,
    pub block_num: BlockNum,
    /// ISO-8601, with or without a zone designator (UTC assumed)
    pub block_time: String,
    pub global_sequence: SeqNum,
    /// Action name, e.g. "logplace"
    pub action: String,
    pub data: serde_json::Value,
}

/// Transaction metadata shared by every decoded event
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub trx_id: String,
    pub block_num: BlockNum,
    pub block_time: DateTime<Utc>,
    pub global_sequence: SeqNum,
    /// Idempotency key: `"{trx_id}:{global_sequence}"`
    pub unique_id: UniqueId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub meta: EventMeta,
    pub pool_id: PoolId,
    pub event: ChainEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Place(PlaceEvent),
    Match(MatchEvent),
    Cancel(CancelEvent),
}

impl ChainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Place(_) => "place",
            ChainEvent::Match(_) => "match",
            ChainEvent::Cancel(_) => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceEvent {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub side: Side,
    pub price: Decimal,
    /// Quantity left after matching at placement
    pub placed_qty: Decimal,
    /// Quantity already matched at placement
    pub executed_qty: Decimal,
    pub is_market: bool,
    /// Whether the remainder rests in the book
    pub inserted: bool,
}

impl PlaceEvent {
    #[inline]
    pub fn original_qty(&self) -> Decimal {
        self.placed_qty + self.executed_qty
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub maker_order_id: OrderId,
    pub maker: String,
    pub taker_order_id: OrderId,
    pub taker: String,
    pub taker_side: Side,
    pub price: Decimal,
    pub base_qty: Decimal,
    pub quote_qty: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub maker_new_status: Option<OrderStatus>,
    pub maker_remains_in_book: bool,
}

impl MatchEvent {
    /// Side the maker rests on
    #[inline]
    pub fn maker_side(&self) -> Side {
        self.taker_side.opposite()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelEvent {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub side: Side,
    pub price: Decimal,
    pub canceled_qty: Decimal,
    /// Quantity traded before the cancel, when the payload reports it
    pub executed_qty: Option<Decimal>,
}
