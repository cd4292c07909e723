//! Write buffering - decouples event processing from storage latency
//!
//! ```text
//! add() ──▶ pending Vec ──(batch_size | ticker | flush())──▶ bounded mpsc ──▶ flush worker ──▶ BatchSink
//!           std Mutex, swap                                   queue_depth       one task
//! ```
//!
//! - Producers only hold the pending lock long enough to push or swap.
//! - Swap and enqueue happen under one async ordering lock, so the queue holds
//!   batches in swap order and `flush()` is a barrier for everything added
//!   before it.
//! - A full flush queue makes `add` await (backpressure, counted).
//! - Sink failures are logged and the batch is dropped (at-most-once).
//! - `shutdown()` stops the ticker, flushes the remainder and drains the queue.

pub mod cache;
pub mod open_orders;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use cache::RecordCache;
pub use open_orders::{OpenOrderBuffer, OpenOrderMutation};

// ============================================================
// SINK
// ============================================================

/// Destination of flushed batches
#[async_trait]
pub trait BatchSink<T>: Send + Sync + 'static {
    async fn write_batch(&self, batch: Vec<T>) -> anyhow::Result<()>;
}

// ============================================================
// CONFIGURATION
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Pending count that triggers an immediate flush
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Batches allowed to wait for the flush worker
    pub queue_depth: usize,
}

impl BufferConfig {
    pub const fn new(batch_size: usize, flush_interval_ms: u64, queue_depth: usize) -> Self {
        Self {
            batch_size,
            flush_interval_ms,
            queue_depth,
        }
    }

    pub const fn depth() -> Self {
        Self::new(500, 100, 64)
    }

    pub const fn open_orders() -> Self {
        Self::new(500, 200, 64)
    }

    pub const fn history_orders() -> Self {
        Self::new(1000, 500, 32)
    }

    pub const fn trades() -> Self {
        Self::new(1000, 1000, 32)
    }

    #[inline]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::new(500, 200, 64)
    }
}

// ============================================================
// STATS
// ============================================================

#[derive(Debug, Default)]
pub struct BufferStats {
    /// Records accepted by `add`
    pub buffered: AtomicU64,
    /// Records written by the sink
    pub flushed: AtomicU64,
    /// Records dropped after a sink failure
    pub failed: AtomicU64,
    /// Successful sink calls
    pub batches: AtomicU64,
    /// Times `add` had to wait for queue space
    pub backpressure: AtomicU64,
}

impl BufferStats {
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            buffered: self.buffered.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub buffered: u64,
    pub flushed: u64,
    pub failed: u64,
    pub batches: u64,
    pub backpressure: u64,
}

impl std::fmt::Display for BufferStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "buffered={}, flushed={} ({} batches), failed={}, backpressure={}",
            self.buffered, self.flushed, self.batches, self.failed, self.backpressure
        )
    }
}

// ============================================================
// WRITE BUFFER
// ============================================================

struct FlushJob<T> {
    batch: Vec<T>,
    /// Signalled once this job (and every job queued before it) is written
    done: Option<oneshot::Sender<()>>,
}

struct Shared<T> {
    name: &'static str,
    batch_size: usize,
    pending: Mutex<Vec<T>>,
    /// Held from swap until the job is queued
    order: tokio::sync::Mutex<()>,
    tx: Mutex<Option<mpsc::Sender<FlushJob<T>>>>,
    stats: Arc<BufferStats>,
}

impl<T: Send + 'static> Shared<T> {
    fn pending(&self) -> MutexGuard<'_, Vec<T>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self) -> Option<mpsc::Sender<FlushJob<T>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_pending(&self) -> Vec<T> {
        std::mem::take(&mut *self.pending())
    }

    /// Swap out the pending records and queue them, in one ordered step.
    ///
    /// An empty swap without a completion signal queues nothing.
    async fn swap_and_dispatch(&self, done: Option<oneshot::Sender<()>>) {
        let _order = self.order.lock().await;
        let batch = self.take_pending();
        if batch.is_empty() && done.is_none() {
            return;
        }
        self.dispatch(FlushJob { batch, done }).await;
    }

    async fn dispatch(&self, job: FlushJob<T>) {
        let Some(tx) = self.sender() else {
            self.drop_job(job, "buffer closed");
            return;
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.stats.backpressure.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(buffer = self.name, "Flush queue full, waiting");
                if let Err(mpsc::error::SendError(job)) = tx.send(job).await {
                    self.drop_job(job, "flush worker stopped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.drop_job(job, "flush worker stopped");
            }
        }
    }

    fn drop_job(&self, job: FlushJob<T>, reason: &str) {
        if job.batch.is_empty() {
            return;
        }
        self.stats
            .failed
            .fetch_add(job.batch.len() as u64, Ordering::Relaxed);
        tracing::error!(
            buffer = self.name,
            records = job.batch.len(),
            reason,
            "Dropping batch"
        );
    }
}

/// Generic batching writer over a [`BatchSink`].
///
/// Must be created inside a tokio runtime: it spawns a ticker and a flush
/// worker.
pub struct WriteBuffer<T> {
    shared: Arc<Shared<T>>,
    stop_tx: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WriteBuffer<T> {
    pub fn spawn(name: &'static str, config: BufferConfig, sink: Arc<dyn BatchSink<T>>) -> Self {
        let stats = Arc::new(BufferStats::default());
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let shared = Arc::new(Shared {
            name,
            batch_size: config.batch_size.max(1),
            pending: Mutex::new(Vec::with_capacity(config.batch_size.max(1))),
            order: tokio::sync::Mutex::new(()),
            tx: Mutex::new(Some(tx)),
            stats: stats.clone(),
        });

        let worker = tokio::spawn(run_worker(name, sink, rx, stats));

        let (stop_tx, stop_rx) = watch::channel(false);
        let ticker = tokio::spawn(run_ticker(shared.clone(), config.flush_interval(), stop_rx));

        tracing::info!(
            buffer = name,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            queue_depth = config.queue_depth,
            "Write buffer started"
        );

        Self {
            shared,
            stop_tx,
            ticker: Mutex::new(Some(ticker)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Buffer one record; flushes immediately once `batch_size` is reached.
    pub async fn add(&self, record: T) {
        let full = {
            let mut pending = self.shared.pending();
            pending.push(record);
            pending.len() >= self.shared.batch_size
        };
        self.shared.stats.buffered.fetch_add(1, Ordering::Relaxed);

        if full {
            self.shared.swap_and_dispatch(None).await;
        }
    }

    /// Flush everything buffered so far and wait until the sink has seen it.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared.swap_and_dispatch(Some(done_tx)).await;
        // Err: worker gone, nothing left to wait for
        let _ = done_rx.await;
    }

    /// Records waiting in the pending buffer (not yet queued)
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Stop the ticker, flush the remainder, drain the queue and join the worker.
    ///
    /// Records added after shutdown are counted as failed.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }

        self.flush().await;

        // Dropping the last sender ends the worker once the queue is empty
        self.shared.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!(buffer = self.shared.name, error = %e, "Flush worker panicked");
            }
        }

        tracing::info!(buffer = self.shared.name, stats = %self.stats(), "Write buffer stopped");
    }
}

async fn run_ticker<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                shared.swap_and_dispatch(None).await;
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_worker<T: Send + 'static>(
    name: &'static str,
    sink: Arc<dyn BatchSink<T>>,
    mut rx: mpsc::Receiver<FlushJob<T>>,
    stats: Arc<BufferStats>,
) {
    while let Some(job) = rx.recv().await {
        if !job.batch.is_empty() {
            let count = job.batch.len() as u64;
            match sink.write_batch(job.batch).await {
                Ok(()) => {
                    stats.flushed.fetch_add(count, Ordering::Relaxed);
                    stats.batches.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(buffer = name, records = count, "Batch flushed");
                }
                Err(e) => {
                    stats.failed.fetch_add(count, Ordering::Relaxed);
                    tracing::error!(buffer = name, records = count, error = %e, "Batch write failed, batch dropped");
                }
            }
        }
        if let Some(done) = job.done {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    /// Forwards every batch to a channel the test can await on
    struct ChannelSink(mpsc::UnboundedSender<Vec<u32>>);

    #[async_trait]
    impl BatchSink<u32> for ChannelSink {
        async fn write_batch(&self, batch: Vec<u32>) -> anyhow::Result<()> {
            let _ = self.0.send(batch);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl BatchSink<u32> for FailingSink {
        async fn write_batch(&self, _batch: Vec<u32>) -> anyhow::Result<()> {
            anyhow::bail!("storage unavailable")
        }
    }

    /// Blocks every write until the test releases permits
    struct GatedSink {
        gate: Arc<Semaphore>,
        written: mpsc::UnboundedSender<Vec<u32>>,
    }

    #[async_trait]
    impl BatchSink<u32> for GatedSink {
        async fn write_batch(&self, batch: Vec<u32>) -> anyhow::Result<()> {
            let permit = self.gate.acquire().await?;
            permit.forget();
            let _ = self.written.send(batch);
            Ok(())
        }
    }

    /// Slow sink that records everything it has finished writing
    #[derive(Default)]
    struct SlowSink {
        written: Mutex<Vec<u32>>,
    }

    impl SlowSink {
        fn count(&self) -> usize {
            self.written.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BatchSink<u32> for SlowSink {
        async fn write_batch(&self, batch: Vec<u32>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.written.lock().unwrap().extend(batch);
            Ok(())
        }
    }

    fn channel_buffer(config: BufferConfig) -> (WriteBuffer<u32>, mpsc::UnboundedReceiver<Vec<u32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WriteBuffer::spawn("test", config, Arc::new(ChannelSink(tx))), rx)
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let (buffer, mut rx) = channel_buffer(BufferConfig::new(3, 60_000, 4));
        for i in 0..3 {
            buffer.add(i).await;
        }
        assert_eq!(rx.recv().await.unwrap(), vec![0, 1, 2]);
        assert_eq!(buffer.pending_len(), 0);
        buffer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        let (buffer, mut rx) = channel_buffer(BufferConfig::new(100, 100, 4));
        buffer.add(7).await;
        let started = Instant::now();
        assert_eq!(rx.recv().await.unwrap(), vec![7]);
        assert!(started.elapsed() >= Duration::from_millis(100));
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remainder() {
        let (buffer, mut rx) = channel_buffer(BufferConfig::new(100, 60_000, 4));
        for i in 0..5 {
            buffer.add(i).await;
        }
        buffer.shutdown().await;

        let mut seen = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            seen.extend(batch);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        let stats = buffer.stats();
        assert_eq!(stats.buffered, 5);
        assert_eq!(stats.flushed, 5);
    }

    #[tokio::test]
    async fn test_every_record_flushed_exactly_once() {
        let (buffer, mut rx) = channel_buffer(BufferConfig::new(7, 5, 2));
        for i in 0..200 {
            buffer.add(i).await;
        }
        buffer.flush().await;

        let mut seen = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            seen.extend(batch);
        }
        assert_eq!(seen, (0..200).collect::<Vec<u32>>());
        buffer.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_waits_for_batches_taken_by_ticker() {
        let sink = Arc::new(SlowSink::default());
        // 1ms ticker keeps swapping concurrently with every flush
        let buffer = Arc::new(WriteBuffer::spawn("race", BufferConfig::new(10_000, 1, 64), sink.clone()));

        let mut added = 0u32;
        for _ in 0..100 {
            for _ in 0..5 {
                buffer.add(added).await;
                added += 1;
            }
            tokio::task::yield_now().await;
            buffer.flush().await;
            assert_eq!(sink.count(), added as usize, "flush returned before earlier records were written");
        }
        buffer.shutdown().await;

        let mut written = sink.written.lock().unwrap().clone();
        written.sort_unstable();
        assert_eq!(written, (0..added).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_sink_failure_drops_batch() {
        let buffer = WriteBuffer::spawn("failing", BufferConfig::new(2, 60_000, 4), Arc::new(FailingSink));
        buffer.add(1).await;
        buffer.add(2).await;
        buffer.flush().await;

        let stats = buffer.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.flushed, 0);
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let gate = Arc::new(Semaphore::new(0));
        let (written_tx, mut written_rx) = mpsc::unbounded_channel();
        let sink = GatedSink {
            gate: gate.clone(),
            written: written_tx,
        };
        let buffer = Arc::new(WriteBuffer::spawn("gated", BufferConfig::new(1, 60_000, 1), Arc::new(sink)));

        // First batch is taken by the worker and blocks in the sink
        buffer.add(1).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        // Second fills the queue
        buffer.add(2).await;

        let third = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.add(3).await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(buffer.stats().backpressure, 1);
        assert!(!third.is_finished());

        gate.add_permits(10);
        third.await.unwrap();
        buffer.shutdown().await;

        let mut seen = Vec::new();
        while let Ok(batch) = written_rx.try_recv() {
            seen.extend(batch);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_counts_failed() {
        let (buffer, _rx) = channel_buffer(BufferConfig::new(1, 60_000, 4));
        buffer.shutdown().await;
        buffer.add(9).await;
        assert_eq!(buffer.stats().failed, 1);
    }

    #[test]
    fn test_default_intervals() {
        assert_eq!(BufferConfig::depth().flush_interval(), Duration::from_millis(100));
        assert_eq!(BufferConfig::open_orders().flush_interval_ms, 200);
        assert_eq!(BufferConfig::history_orders().flush_interval_ms, 500);
        assert_eq!(BufferConfig::trades().flush_interval_ms, 1000);
    }
}
