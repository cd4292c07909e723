use anyhow::Result;
use taos::*;

/// Database holding history orders and trades
pub const DATABASE: &str = "trading";

/// Initialize TDengine schema for the history/trade store
pub async fn init_schema(taos: &Taos) -> Result<()> {
    tracing::info!("Initializing TDengine schema...");

    taos.exec(CREATE_DATABASE)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", "Failed to create database", e))?;

    taos.exec(&format!("USE {}", DATABASE))
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", "Failed to use database", e))?;

    // Row timestamps are generated in microseconds; any other precision
    // rejects them as out of range
    match check_database_precision(taos).await {
        Ok(precision) if precision == "us" => {
            tracing::info!("TDengine database precision: {} (correct)", precision);
        }
        Ok(precision) => {
            tracing::error!(
                "TDengine database precision is '{}', expected 'us'. \
                 Drop database {} and restart.",
                precision,
                DATABASE
            );
            return Err(anyhow::anyhow!(
                "Wrong database precision: '{}', expected 'us'",
                precision
            ));
        }
        Err(e) => {
            tracing::warn!("Could not check database precision: {}", e);
        }
    }

    taos.exec(CREATE_HISTORY_ORDERS_TABLE)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", "Failed to create history_orders table", e))?;

    taos.exec(CREATE_TRADES_TABLE)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", "Failed to create trades table", e))?;

    tracing::info!("TDengine schema initialized successfully");
    Ok(())
}

async fn check_database_precision(taos: &Taos) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct ShowCreate {
        #[serde(rename = "Create Database")]
        create: String,
    }

    let mut result = taos
        .query(&format!("SHOW CREATE DATABASE {}", DATABASE))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query database info: {}", e))?;

    let rows: Vec<ShowCreate> = result
        .deserialize()
        .try_collect()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to deserialize: {}", e))?;

    let Some(row) = rows.first() else {
        return Ok("ms (default)".to_string());
    };
    let create_stmt = row.create.to_uppercase();
    let precision = if create_stmt.contains("PRECISION 'US'") {
        "us"
    } else if create_stmt.contains("PRECISION 'NS'") {
        "ns"
    } else if create_stmt.contains("PRECISION 'MS'") {
        "ms"
    } else {
        "ms (default)"
    };
    Ok(precision.to_string())
}

// =============================================================================
// Tables
// =============================================================================
//
// PRECISION MUST BE 'us'. `ts` is a per-process strictly increasing
// microsecond clock (see `tdengine::next_ts_micros`) so rows sharing a block
// time never collide on the primary timestamp. Business times live in their
// own columns.
//
// Quantities and prices are VARCHAR decimal strings: exact, no float columns.
// One subtable per pool: ho_{pool_id}, tr_{pool_id}.

const CREATE_DATABASE: &str = r#"
CREATE DATABASE IF NOT EXISTS trading
    KEEP 365d
    DURATION 10d
    BUFFER 256
    WAL_LEVEL 2
    PRECISION 'us'
"#;

const CREATE_HISTORY_ORDERS_TABLE: &str = r#"
CREATE STABLE IF NOT EXISTS history_orders (
    ts TIMESTAMP,
    order_id BIGINT UNSIGNED,
    client_order_id NCHAR(64),
    trader NCHAR(64),
    side TINYINT UNSIGNED,
    price VARCHAR(48),
    original_qty VARCHAR(48),
    executed_qty VARCHAR(48),
    status TINYINT UNSIGNED,
    is_market BOOL,
    created_trx_id NCHAR(64),
    created_block BIGINT UNSIGNED,
    created_at TIMESTAMP,
    closed_at TIMESTAMP,
    cancel_trx_id NCHAR(64),
    cancel_block BIGINT UNSIGNED,
    canceled_qty VARCHAR(48)
) TAGS (
    pool_id BIGINT UNSIGNED
)
"#;

const CREATE_TRADES_TABLE: &str = r#"
CREATE STABLE IF NOT EXISTS trades (
    ts TIMESTAMP,
    trx_id NCHAR(64),
    block_num BIGINT UNSIGNED,
    global_sequence BIGINT UNSIGNED,
    maker_order_id BIGINT UNSIGNED,
    maker NCHAR(64),
    taker_order_id BIGINT UNSIGNED,
    taker NCHAR(64),
    side TINYINT UNSIGNED,
    price VARCHAR(48),
    base_qty VARCHAR(48),
    quote_qty VARCHAR(48),
    maker_fee VARCHAR(48),
    taker_fee VARCHAR(48),
    trade_time TIMESTAMP
) TAGS (
    pool_id BIGINT UNSIGNED
)
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_uses_microsecond_precision() {
        assert!(CREATE_DATABASE.contains("PRECISION 'us'"));
        assert!(CREATE_DATABASE.contains(DATABASE));
    }

    #[test]
    fn test_tables_tagged_by_pool() {
        for ddl in [CREATE_HISTORY_ORDERS_TABLE, CREATE_TRADES_TABLE] {
            assert!(ddl.contains("pool_id BIGINT UNSIGNED"));
            assert!(!ddl.contains("DOUBLE"));
        }
    }
}
