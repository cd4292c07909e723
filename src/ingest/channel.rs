//! In-process event source over a tokio mpsc channel

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Delivery, EventSource};
use crate::events::ChainAction;

/// Wait for the first entry of a batch before returning an empty one
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ChannelSource {
    name: String,
    rx: mpsc::Receiver<ChainAction>,
    batch: usize,
    next_id: u64,
    closed: bool,
}

impl ChannelSource {
    /// Returns the sending half and the source. Dropping every sender
    /// exhausts the source once the channel is drained.
    pub fn new(name: &str, capacity: usize, batch: usize) -> (mpsc::Sender<ChainAction>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            name: name.to_string(),
            rx,
            batch: batch.max(1),
            next_id: 0,
            closed: false,
        };
        (tx, source)
    }

    fn delivery(&mut self, action: ChainAction) -> Delivery {
        self.next_id += 1;
        Delivery {
            id: self.next_id.to_string(),
            action: Some(action),
        }
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_batch(&mut self) -> anyhow::Result<Vec<Delivery>> {
        let first = match tokio::time::timeout(POLL_INTERVAL, self.rx.recv()).await {
            Ok(Some(action)) => action,
            Ok(None) => {
                self.closed = true;
                return Ok(Vec::new());
            }
            Err(_) => return Ok(Vec::new()),
        };

        let mut out = Vec::with_capacity(self.batch);
        out.push(self.delivery(first));
        while out.len() < self.batch {
            match self.rx.try_recv() {
                Ok(action) => {
                    let d = self.delivery(action);
                    out.push(d);
                }
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn ack(&mut self, _ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.closed
    }
}
