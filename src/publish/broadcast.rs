//! In-process publisher over `tokio::sync::broadcast`

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{PushEnvelope, Publisher};

pub struct BroadcastPublisher {
    tx: broadcast::Sender<PushEnvelope>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEnvelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, envelope: &PushEnvelope) -> anyhow::Result<()> {
        // No subscribers is not a failure
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::DepthUpdate;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::new(4);
        let env = PushEnvelope::DepthUpdate(DepthUpdate {
            pool_id: 1,
            changes: vec![],
        });
        assert!(publisher.publish(&env).await.is_ok());

        let mut rx = publisher.subscribe();
        assert_eq!(publisher.receiver_count(), 1);
        publisher.publish(&env).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), env);
    }
}
