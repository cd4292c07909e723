//! Raw payload → typed event
//!
//! Quantities arrive as asset strings (`"1.50000000 BTC"`) and prices as
//! integers scaled by the pool's `price_precision`. Neither passes through
//! floating point.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use super::{CancelEvent, ChainAction, ChainEvent, DecodedEvent, EventMeta, MatchEvent, PlaceEvent};
use crate::core_types::{OrderId, PoolId, unique_event_id};
use crate::models::{OrderStatus, Side};
use crate::money::{self, MoneyError};
use crate::pools::{PoolConfig, PoolRegistry};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unknown pool: {0}")]
    UnknownPool(PoolId),

    #[error("Invalid amount: {0}")]
    Money(#[from] MoneyError),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid side: {0}")]
    InvalidSide(String),

    #[error("Invalid order status: {0}")]
    InvalidStatus(String),
}

// ============================================================================
// Raw payloads
// ============================================================================

/// Integers are emitted as JSON numbers or as strings depending on width.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawInt {
    Num(u64),
    Str(String),
}

fn de_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    match RawInt::deserialize(de)? {
        RawInt::Num(n) => Ok(n),
        RawInt::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct RawPlace {
    #[serde(deserialize_with = "de_u64")]
    pool_id: PoolId,
    #[serde(deserialize_with = "de_u64")]
    order_id: OrderId,
    #[serde(default)]
    client_order_id: Option<String>,
    trader: String,
    side: String,
    #[serde(deserialize_with = "de_u64")]
    price: u64,
    quantity: String,
    #[serde(default)]
    executed_quantity: Option<String>,
    #[serde(default)]
    is_market: bool,
    inserted: bool,
}

#[derive(Deserialize)]
struct RawMatch {
    #[serde(deserialize_with = "de_u64")]
    pool_id: PoolId,
    #[serde(deserialize_with = "de_u64")]
    maker_order_id: OrderId,
    maker: String,
    #[serde(deserialize_with = "de_u64")]
    taker_order_id: OrderId,
    taker: String,
    taker_side: String,
    #[serde(deserialize_with = "de_u64")]
    price: u64,
    base_quantity: String,
    quote_quantity: String,
    #[serde(default)]
    maker_fee: Option<String>,
    #[serde(default)]
    taker_fee: Option<String>,
    #[serde(default)]
    maker_new_status: Option<String>,
    maker_remains_in_book: bool,
}

#[derive(Deserialize)]
struct RawCancel {
    #[serde(deserialize_with = "de_u64")]
    pool_id: PoolId,
    #[serde(deserialize_with = "de_u64")]
    order_id: OrderId,
    #[serde(default)]
    client_order_id: Option<String>,
    trader: String,
    side: String,
    #[serde(deserialize_with = "de_u64")]
    price: u64,
    canceled_quantity: String,
    #[serde(default)]
    executed_quantity: Option<String>,
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one chain action against the pool registry.
///
/// # Errors
/// Every failure is fatal for this action only; callers log and skip it.
pub fn decode_action(action: &ChainAction, pools: &PoolRegistry) -> Result<DecodedEvent, DecodeError> {
    let meta = EventMeta {
        trx_id: action.trx_id.clone(),
        block_num: action.block_num,
        block_time: parse_block_time(&action.block_time)?,
        global_sequence: action.global_sequence,
        unique_id: unique_event_id(&action.trx_id, action.global_sequence),
    };

    let (pool_id, event) = match action.action.as_str() {
        "logplace" | "place" => {
            let raw: RawPlace = serde_json::from_value(action.data.clone())?;
            let pool = lookup(pools, raw.pool_id)?;
            let event = PlaceEvent {
                order_id: raw.order_id,
                client_order_id: non_empty(raw.client_order_id),
                trader: raw.trader,
                side: parse_side(&raw.side)?,
                price: pool.price_from_raw(raw.price)?,
                placed_qty: money::parse_asset_value(&raw.quantity)?,
                executed_qty: optional_amount(raw.executed_quantity.as_deref())?,
                is_market: raw.is_market,
                inserted: raw.inserted,
            };
            (raw.pool_id, ChainEvent::Place(event))
        }
        "logmatch" | "match" => {
            let raw: RawMatch = serde_json::from_value(action.data.clone())?;
            let pool = lookup(pools, raw.pool_id)?;
            let maker_new_status = match raw.maker_new_status.as_deref() {
                None | Some("") => None,
                Some(s) => Some(OrderStatus::parse(s).ok_or_else(|| DecodeError::InvalidStatus(s.to_string()))?),
            };
            let event = MatchEvent {
                maker_order_id: raw.maker_order_id,
                maker: raw.maker,
                taker_order_id: raw.taker_order_id,
                taker: raw.taker,
                taker_side: parse_side(&raw.taker_side)?,
                price: pool.price_from_raw(raw.price)?,
                base_qty: money::parse_asset_value(&raw.base_quantity)?,
                quote_qty: money::parse_asset_value(&raw.quote_quantity)?,
                maker_fee: optional_amount(raw.maker_fee.as_deref())?,
                taker_fee: optional_amount(raw.taker_fee.as_deref())?,
                maker_new_status,
                maker_remains_in_book: raw.maker_remains_in_book,
            };
            (raw.pool_id, ChainEvent::Match(event))
        }
        "logcancel" | "cancel" => {
            let raw: RawCancel = serde_json::from_value(action.data.clone())?;
            let pool = lookup(pools, raw.pool_id)?;
            let executed_qty = match raw.executed_quantity.as_deref() {
                None => None,
                Some(s) => Some(money::parse_asset_value(s)?),
            };
            let event = CancelEvent {
                order_id: raw.order_id,
                client_order_id: non_empty(raw.client_order_id),
                trader: raw.trader,
                side: parse_side(&raw.side)?,
                price: pool.price_from_raw(raw.price)?,
                canceled_qty: money::parse_asset_value(&raw.canceled_quantity)?,
                executed_qty,
            };
            (raw.pool_id, ChainEvent::Cancel(event))
        }
        other => return Err(DecodeError::UnknownAction(other.to_string())),
    };

    Ok(DecodedEvent {
        meta,
        pool_id,
        event,
    })
}

fn lookup(pools: &PoolRegistry, pool_id: PoolId) -> Result<&PoolConfig, DecodeError> {
    pools.get(pool_id).ok_or(DecodeError::UnknownPool(pool_id))
}

fn parse_side(raw: &str) -> Result<Side, DecodeError> {
    Side::parse(raw).ok_or_else(|| DecodeError::InvalidSide(raw.to_string()))
}

fn optional_amount(raw: Option<&str>) -> Result<Decimal, DecodeError> {
    match raw {
        None | Some("") => Ok(Decimal::ZERO),
        Some(s) => Ok(money::parse_asset_value(s)?),
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.filter(|s| !s.is_empty())
}

/// Chain timestamps are ISO-8601, usually without a zone ("2024-05-01T12:00:00.500")
pub fn parse_block_time(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_string()))
}
