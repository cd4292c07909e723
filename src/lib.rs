//! dex_mirror - Order book depth and order lifecycle mirror for an on-chain DEX
//!
//! Consumes Place / Match / Cancel actions emitted by the chain and keeps
//! query-friendly copies of the market: multi-precision depth, open orders,
//! order history and trades.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier aliases (PoolId, OrderId, UniqueId)
//! - [`models`] - OpenOrder, HistoryOrder, Trade and DepthChange
//! - [`money`] - Asset string parsing and fixed-scale quantity helpers
//! - [`precision`] - Supported display precisions and price bucketing
//! - [`pools`] - Per-pool precision registry
//! - [`depth`] - DepthStore trait, in-memory and Redis backends, dedup
//! - [`events`] - Raw chain actions and typed decoding
//! - [`processor`] - Order lifecycle state machine
//! - [`buffer`] - Batched write buffers with read-through cache
//! - [`publish`] - Downstream push envelopes and publishers
//! - [`persistence`] - Postgres, TDengine and in-memory stores
//! - [`market`] - Depth query service and kline aggregation
//! - [`ingest`] - Event sources and ingestion loops
//! - [`repair`] - Pool rebuild from an authoritative snapshot
//! - [`app`] - Service graph wiring

// Core types - must be first!
pub mod core_types;

pub mod models;
pub mod money;
pub mod pools;
pub mod precision;

// Pipeline components
pub mod buffer;
pub mod depth;
pub mod events;
pub mod ingest;
pub mod market;
pub mod persistence;
pub mod processor;
pub mod publish;
pub mod repair;

// Wiring
pub mod app;
pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use app::Services;
pub use core_types::{BlockNum, OrderId, PoolId, SeqNum, UniqueId};
pub use depth::{DepthDelta, DepthError, DepthSnapshot, DepthStore};
pub use events::{ChainAction, ChainEvent, DecodedEvent};
pub use ingest::{EventSource, Ingestor, ShutdownSignal};
pub use models::{DepthChange, HistoryOrder, OpenOrder, OrderStatus, Side, Trade};
pub use precision::Precision;
pub use processor::{EventOutcome, OrderLifecycleProcessor};
