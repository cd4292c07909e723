//! Market data read side: depth queries and kline aggregation

pub mod depth_service;
pub mod kline;

pub use depth_service::{DepthQueryService, DepthView};
pub use kline::{Kline, KlineAggregator, KlineInterval};
