// Persistence: Postgres for open orders, TDengine for history orders and trades
pub mod history;
pub mod memory;
pub mod open_orders;
pub mod schema;
pub mod tdengine;
pub mod trades;

use anyhow::{Result, bail};

use crate::models::{OrderStatus, Side};

pub use history::HistoryOrderSink;
pub use memory::{MemoryOpenOrderRepository, MemorySink};
pub use open_orders::{OpenOrderRepository, PgOpenOrderRepository};
pub use tdengine::TDengineClient;
pub use trades::TradeSink;

// Stored numeric encodings

#[inline]
pub fn side_code(side: Side) -> u8 {
    match side {
        Side::Buy => 0,
        Side::Sell => 1,
    }
}

pub fn side_from_code(code: i16) -> Result<Side> {
    match code {
        0 => Ok(Side::Buy),
        1 => Ok(Side::Sell),
        other => bail!("Unknown side code {}", other),
    }
}

#[inline]
pub fn status_code(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::Open => 0,
        OrderStatus::PartiallyFilled => 1,
        OrderStatus::Filled => 2,
        OrderStatus::Cancelled => 3,
    }
}

pub fn status_from_code(code: i16) -> Result<OrderStatus> {
    match code {
        0 => Ok(OrderStatus::Open),
        1 => Ok(OrderStatus::PartiallyFilled),
        2 => Ok(OrderStatus::Filled),
        3 => Ok(OrderStatus::Cancelled),
        other => bail!("Unknown order status code {}", other),
    }
}
