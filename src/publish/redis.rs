//! Redis pub/sub publisher
//!
//! Channel per message type and pool: `{prefix}:{type}:{pool_id}`.

use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;

use super::{PushEnvelope, Publisher};

pub const DEFAULT_CHANNEL_PREFIX: &str = "push";

pub struct RedisPublisher {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = ::redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let prefix = prefix.into();
        tracing::info!(redis_url, prefix = %prefix, "Redis publisher connected");
        Ok(Self { conn, prefix })
    }

    pub fn channel(&self, envelope: &PushEnvelope) -> String {
        channel_name(&self.prefix, envelope)
    }
}

fn channel_name(prefix: &str, envelope: &PushEnvelope) -> String {
    format!("{}:{}:{}", prefix, envelope.kind(), envelope.pool_id())
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, envelope: &PushEnvelope) -> anyhow::Result<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("PUBLISH")
            .arg(self.channel(envelope))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
