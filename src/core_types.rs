//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Pool ID - on-chain identifier of a trading pool (market).
///
/// # Constraints:
/// - **Immutable**: assigned by the exchange contract, never reused
/// - Ordering guarantees are scoped to a single pool
pub type PoolId = u64;

/// Order ID - unique within a pool (assigned on-chain)
pub type OrderId = u64;

/// Global action sequence number (monotonically increasing across the chain)
pub type SeqNum = u64;

/// Block number
pub type BlockNum = u64;

/// Unique event identifier used for idempotent replay.
///
/// Built from the originating transaction identity and its ordinal,
/// see [`unique_event_id`].
pub type UniqueId = String;

/// Build the unique identifier of one chain event.
///
/// A single transaction can emit many actions (one Place followed by several
/// Match actions), so the transaction id alone is not unique; the global
/// sequence number disambiguates actions within the transaction.
#[inline]
pub fn unique_event_id(trx_id: &str, global_sequence: SeqNum) -> UniqueId {
    format!("{}:{}", trx_id, global_sequence)
}
