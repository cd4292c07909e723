//! Redis Streams consumer-group source
//!
//! Stream key `{prefix}:{subscription}`, one entry per chain action with the
//! JSON-encoded [`ChainAction`] in the `payload` field. Entries are XACKed
//! after processing. On start the consumer first replays its own pending
//! entries (id `0`), then switches to new entries (id `>`).

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{info, warn};

use super::{Delivery, EventSource};
use crate::events::ChainAction;

pub const DEFAULT_STREAM_PREFIX: &str = "chain";
pub const PAYLOAD_FIELD: &str = "payload";

pub struct RedisStreamSource {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    count: usize,
    block_ms: usize,
    replaying: bool,
}

pub fn stream_key(prefix: &str, subscription: &str) -> String {
    format!("{}:{}", prefix, subscription)
}

impl RedisStreamSource {
    pub async fn connect(
        redis_url: &str,
        stream: String,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let mut source = Self {
            conn,
            stream,
            group: group.to_string(),
            consumer: consumer.to_string(),
            count: count.max(1),
            block_ms,
            replaying: true,
        };
        source.ensure_group().await?;
        info!(stream = %source.stream, group, consumer, "Redis stream source connected");
        Ok(source)
    }

    async fn ensure_group(&mut self) -> anyhow::Result<()> {
        let created: redis::RedisResult<()> = self
            .conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_payload(id: &str, payload: Option<String>) -> Option<ChainAction> {
    let Some(raw) = payload else {
        warn!(entry_id = id, "Stream entry without payload field");
        return None;
    };
    match serde_json::from_str(&raw) {
        Ok(action) => Some(action),
        Err(e) => {
            warn!(entry_id = id, error = %e, "Stream entry payload is not a chain action");
            None
        }
    }
}

#[async_trait]
impl EventSource for RedisStreamSource {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn next_batch(&mut self) -> anyhow::Result<Vec<Delivery>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.count);
        let start = if self.replaying {
            "0"
        } else {
            opts = opts.block(self.block_ms);
            ">"
        };

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[start], &opts)
            .await?;

        let mut out = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let action = parse_payload(&entry.id, entry.get(PAYLOAD_FIELD));
                out.push(Delivery {
                    id: entry.id,
                    action,
                });
            }
        }

        if self.replaying && out.is_empty() {
            info!(stream = %self.stream, "Pending replay complete");
            self.replaying = false;
        }
        Ok(out)
    }

    async fn ack(&mut self, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: i64 = self.conn.xack(&self.stream, &self.group, ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        assert_eq!(stream_key("chain", "dex.pool"), "chain:dex.pool");
    }

    #[test]
    fn test_parse_payload() {
        let raw = r#"{"trx_id":"abc","block_num":10,"block_time":"2024-05-01T00:00:00.000","global_sequence":7,"action":"logplace","data":{"pool_id":1}}"#;
        let action = parse_payload("1-0", Some(raw.to_string())).unwrap();
        assert_eq!(action.trx_id, "abc");
        assert_eq!(action.global_sequence, 7);

        assert!(parse_payload("1-1", None).is_none());
        assert!(parse_payload("1-2", Some("not json".into())).is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_stream_roundtrip_and_ack() {
        let url = "redis://127.0.0.1:6379";
        let stream = format!("test:{}", uuid::Uuid::new_v4());
        let client = redis::Client::open(url).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();

        let mut source = RedisStreamSource::connect(url, stream.clone(), "g", "c1", 10, 100)
            .await
            .unwrap();
        let payload = r#"{"trx_id":"t","block_num":1,"block_time":"2024-05-01T00:00:00","global_sequence":1,"action":"logplace","data":{}}"#;
        let _: String = conn.xadd(&stream, "*", &[(PAYLOAD_FIELD, payload)]).await.unwrap();

        // First call drains the (empty) pending list
        assert!(source.next_batch().await.unwrap().is_empty());
        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].action.is_some());

        let ids: Vec<String> = batch.into_iter().map(|d| d.id).collect();
        source.ack(&ids).await.unwrap();
        let _: i64 = conn.del(&stream).await.unwrap();
    }
}
