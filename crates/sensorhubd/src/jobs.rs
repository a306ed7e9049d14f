//! Background job manager
//!
//! Three queues (write, broadcast, invalidate), each drained by one worker.
//! A worker flushes when its batch reaches `batch_size` or when `batch_timeout`
//! has passed since the oldest unflushed item was enqueued, whichever is first.

use crate::cache::Cache;
use crate::metrics::PipelineMetrics;
use crate::repository::ReadingRepository;
use sensorhub_common::config::JobsConfig;
use sensorhub_common::{BackoffConfig, Envelope, JobStats, Reading};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Push sink for flushed broadcasts
pub trait Broadcaster: Send + Sync {
    /// Deliver `message` to subscribers of `topic`; returns recipients
    fn publish(&self, topic: &str, message: &Envelope) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Write,
    Broadcast,
    Invalidate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Broadcast => "broadcast",
            Self::Invalidate => "invalidate",
        }
    }
}

/// Pending push for one topic; items sharing `key` coalesce to the latest
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastItem {
    pub topic: String,
    pub key: String,
    pub data: Value,
}

#[derive(Debug)]
struct Queued<T> {
    item: T,
    enqueued_at: Instant,
}

impl<T> Queued<T> {
    fn now(item: T) -> Self {
        Self {
            item,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Retries after the first failed write of a batch
    pub write_retries: usize,
    pub write_backoff: BackoffConfig,
    pub queue_capacity: usize,
}

impl JobSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            write_retries: config.write_retries,
            write_backoff: BackoffConfig {
                base_ms: 500,
                max_attempts: config.write_retries + 1,
                ..BackoffConfig::default()
            },
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

#[derive(Debug, Default)]
struct JobCounters {
    writes_processed: AtomicU64,
    writes_failed: AtomicU64,
    broadcasts_sent: AtomicU64,
    invalidations_processed: AtomicU64,
    items_dropped: AtomicU64,
}

/// Everything a flush needs, shared by the workers
struct FlushContext {
    settings: JobSettings,
    repository: Arc<dyn ReadingRepository>,
    broadcaster: Arc<dyn Broadcaster>,
    cache: Cache,
    counters: Arc<JobCounters>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl FlushContext {
    fn record(&self, kind: JobKind, result: &str, items: usize) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_batch(kind.as_str(), result, items);
        }
    }

    /// One repository call per attempt; dropped after the retry budget
    async fn flush_writes(&self, batch: Vec<Reading>) {
        let count = batch.len();
        let backoff = &self.settings.write_backoff;
        let attempts = self.settings.write_retries + 1;

        for attempt in 0..attempts {
            match self.repository.write_readings_batch(&batch).await {
                Ok(()) => {
                    self.counters
                        .writes_processed
                        .fetch_add(count as u64, Ordering::Relaxed);
                    self.record(JobKind::Write, "ok", count);
                    debug!("Wrote batch of {} readings", count);
                    return;
                }
                Err(e) if attempt + 1 < attempts => {
                    let delay = backoff.calculate_backoff(attempt);
                    warn!(
                        "Batch write of {} readings failed (attempt {}/{}): {}, retrying in {:?}",
                        count,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "Dropping batch of {} readings after {} attempts: {}",
                        count, attempts, e
                    );
                }
            }
        }

        self.counters
            .writes_failed
            .fetch_add(count as u64, Ordering::Relaxed);
        self.record(JobKind::Write, "failed", count);
    }

    /// One message per distinct topic, latest value per key, first-seen order
    async fn flush_broadcasts(&self, batch: Vec<BroadcastItem>) {
        let count = batch.len();
        let mut topics: Vec<(String, Vec<(String, Value)>)> = Vec::new();
        let mut topic_index: HashMap<String, usize> = HashMap::new();

        for item in batch {
            let slot = *topic_index.entry(item.topic.clone()).or_insert_with(|| {
                topics.push((item.topic.clone(), Vec::new()));
                topics.len() - 1
            });
            let entries = &mut topics[slot].1;
            match entries.iter_mut().find(|(key, _)| *key == item.key) {
                Some(entry) => entry.1 = item.data,
                None => entries.push((item.key, item.data)),
            }
        }

        for (topic, entries) in topics {
            let data = Value::Array(entries.into_iter().map(|(_, data)| data).collect());
            let recipients = self.broadcaster.publish(&topic, &Envelope::data(&topic, data));
            self.counters.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
            debug!("Broadcast on {} to {} connections", topic, recipients);
        }
        self.record(JobKind::Broadcast, "ok", count);
    }

    /// `invalidate_by_prefix` once per distinct prefix
    async fn flush_invalidations(&self, batch: Vec<String>) {
        let count = batch.len();
        let mut seen = HashSet::new();
        for prefix in batch {
            if !seen.insert(prefix.clone()) {
                continue;
            }
            self.cache.invalidate_by_prefix(&prefix).await;
            self.counters
                .invalidations_processed
                .fetch_add(1, Ordering::Relaxed);
        }
        self.record(JobKind::Invalidate, "ok", count);
    }
}

pub struct JobManager {
    write_tx: mpsc::Sender<Queued<Reading>>,
    broadcast_tx: mpsc::Sender<Queued<BroadcastItem>>,
    invalidate_tx: mpsc::Sender<Queued<String>>,
    counters: Arc<JobCounters>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Spawn one worker per queue
    pub fn start(
        settings: JobSettings,
        repository: Arc<dyn ReadingRepository>,
        broadcaster: Arc<dyn Broadcaster>,
        cache: Cache,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> Self {
        let counters = Arc::new(JobCounters::default());
        let cancel = CancellationToken::new();
        let batch_size = settings.batch_size;
        let batch_timeout = settings.batch_timeout;

        let (write_tx, write_rx) = mpsc::channel(settings.queue_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(settings.queue_capacity);
        let (invalidate_tx, invalidate_rx) = mpsc::channel(settings.queue_capacity);

        let ctx = Arc::new(FlushContext {
            settings,
            repository,
            broadcaster,
            cache,
            counters: Arc::clone(&counters),
            metrics,
        });

        let workers = vec![
            tokio::spawn(run_worker(JobKind::Write, write_rx, batch_size, batch_timeout, cancel.clone(), {
                let ctx = Arc::clone(&ctx);
                move |batch| {
                    let ctx = Arc::clone(&ctx);
                    async move { ctx.flush_writes(batch).await }
                }
            })),
            tokio::spawn(run_worker(JobKind::Broadcast, broadcast_rx, batch_size, batch_timeout, cancel.clone(), {
                let ctx = Arc::clone(&ctx);
                move |batch| {
                    let ctx = Arc::clone(&ctx);
                    async move { ctx.flush_broadcasts(batch).await }
                }
            })),
            tokio::spawn(run_worker(JobKind::Invalidate, invalidate_rx, batch_size, batch_timeout, cancel.clone(), {
                let ctx = Arc::clone(&ctx);
                move |batch| {
                    let ctx = Arc::clone(&ctx);
                    async move { ctx.flush_invalidations(batch).await }
                }
            })),
        ];

        info!(
            "Job manager started (batch size {}, timeout {:?})",
            batch_size, batch_timeout
        );

        Self {
            write_tx,
            broadcast_tx,
            invalidate_tx,
            counters,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    fn offer<T>(&self, kind: JobKind, tx: &mpsc::Sender<Queued<T>>, item: T) -> bool {
        match tx.try_send(Queued::now(item)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.items_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("{} queue full, dropping item", kind.as_str());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{} queue closed, ignoring item", kind.as_str());
                false
            }
        }
    }

    pub fn enqueue_write(&self, reading: Reading) -> bool {
        self.offer(JobKind::Write, &self.write_tx, reading)
    }

    pub fn enqueue_broadcast(
        &self,
        topic: impl Into<String>,
        key: impl Into<String>,
        data: Value,
    ) -> bool {
        let item = BroadcastItem {
            topic: topic.into(),
            key: key.into(),
            data,
        };
        self.offer(JobKind::Broadcast, &self.broadcast_tx, item)
    }

    pub fn enqueue_invalidate(&self, prefix: impl Into<String>) -> bool {
        self.offer(JobKind::Invalidate, &self.invalidate_tx, prefix.into())
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            writes_processed: self.counters.writes_processed.load(Ordering::Relaxed),
            writes_failed: self.counters.writes_failed.load(Ordering::Relaxed),
            broadcasts_sent: self.counters.broadcasts_sent.load(Ordering::Relaxed),
            invalidations_processed: self.counters.invalidations_processed.load(Ordering::Relaxed),
            items_dropped: self.counters.items_dropped.load(Ordering::Relaxed),
        }
    }

    /// Flush open batches and stop the workers
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Job worker ended abnormally: {}", e);
            }
        }
        info!("Job manager stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Timer-or-threshold batching loop for one queue
async fn run_worker<T, F, Fut>(
    kind: JobKind,
    mut rx: mpsc::Receiver<Queued<T>>,
    batch_size: usize,
    batch_timeout: Duration,
    cancel: CancellationToken,
    mut flush: F,
) where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);
    let mut oldest: Option<Instant> = None;

    loop {
        let deadline = oldest.map(|enqueued_at| enqueued_at + batch_timeout);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until_opt(deadline) => {
                debug!("{} batch timeout, flushing {} items", kind.as_str(), batch.len());
                flush(std::mem::take(&mut batch)).await;
                oldest = None;
            }
            received = rx.recv() => match received {
                Some(queued) => {
                    if batch.is_empty() {
                        oldest = Some(queued.enqueued_at);
                    }
                    batch.push(queued.item);
                    if batch.len() >= batch_size {
                        flush(std::mem::take(&mut batch)).await;
                        oldest = None;
                    }
                }
                None => break,
            },
        }
    }

    // Drain whatever was accepted before shutdown
    rx.close();
    while let Ok(queued) = rx.try_recv() {
        batch.push(queued.item);
        if batch.len() >= batch_size {
            flush(std::mem::take(&mut batch)).await;
        }
    }
    if !batch.is_empty() {
        debug!("{} worker flushing {} items on shutdown", kind.as_str(), batch.len());
        flush(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryReadingRepository;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<(String, Envelope)>>,
    }

    impl RecordingBroadcaster {
        fn sent(&self) -> Vec<(String, Envelope)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn publish(&self, topic: &str, message: &Envelope) -> usize {
            self.sent.lock().unwrap().push((topic.to_string(), message.clone()));
            1
        }
    }

    fn reading(device_id: &str, value: i64) -> Reading {
        let raw = json!({"field1": value}).as_object().unwrap().clone();
        Reading::from_raw(device_id, &raw, None, "created_at")
    }

    fn settings(batch_size: usize) -> JobSettings {
        JobSettings {
            batch_size,
            ..JobSettings::default()
        }
    }

    struct Harness {
        jobs: JobManager,
        repo: Arc<MemoryReadingRepository>,
        broadcaster: Arc<RecordingBroadcaster>,
        cache: Cache,
    }

    fn harness(settings: JobSettings, repo: MemoryReadingRepository) -> Harness {
        let repo = Arc::new(repo);
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let cache = Cache::in_memory(100);
        let jobs = JobManager::start(settings, repo.clone(), broadcaster.clone(), cache.clone(), None);
        Harness {
            jobs,
            repo,
            broadcaster,
            cache,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let h = harness(settings(3), MemoryReadingRepository::new());
        for n in 0..3 {
            assert!(h.jobs.enqueue_write(reading("D1", n)));
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.repo.batches().len(), 1);
        assert_eq!(h.repo.total_readings(), 3);
        assert_eq!(h.jobs.stats().writes_processed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_once_after_timeout() {
        let h = harness(settings(100), MemoryReadingRepository::new());
        h.jobs.enqueue_write(reading("D1", 1));
        h.jobs.enqueue_write(reading("D2", 2));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(h.repo.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.repo.batches().len(), 1);
        assert_eq!(h.repo.total_readings(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.repo.attempts(), 1, "no empty flushes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_retried_then_succeeds() {
        let h = harness(settings(1), MemoryReadingRepository::failing(2));
        h.jobs.enqueue_write(reading("D1", 1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.repo.attempts(), 3);
        let stats = h.jobs.stats();
        assert_eq!(stats.writes_processed, 1);
        assert_eq!(stats.writes_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_dropped_after_budget() {
        let h = harness(settings(2), MemoryReadingRepository::failing(10));
        h.jobs.enqueue_write(reading("D1", 1));
        h.jobs.enqueue_write(reading("D1", 2));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.repo.attempts(), 3);
        let stats = h.jobs.stats();
        assert_eq!(stats.writes_processed, 0);
        assert_eq!(stats.writes_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_coalesces_per_topic_and_key() {
        let h = harness(settings(4), MemoryReadingRepository::new());
        h.jobs.enqueue_broadcast("node_updates", "D1", json!({"v": 1}));
        h.jobs.enqueue_broadcast("node_updates", "D2", json!({"v": 2}));
        h.jobs.enqueue_broadcast("node_updates", "D1", json!({"v": 3}));
        h.jobs.enqueue_broadcast("device:D1", "D1", json!({"v": 3}));

        tokio::time::sleep(Duration::from_millis(1)).await;
        let sent = h.broadcaster.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "node_updates");
        assert_eq!(sent[0].1.data, Some(json!([{"v": 3}, {"v": 2}])));
        assert_eq!(sent[1].0, "device:D1");
        assert_eq!(h.jobs.stats().broadcasts_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidations_deduplicated() {
        let h = harness(settings(3), MemoryReadingRepository::new());
        let ttl = Duration::from_secs(60);
        h.cache.set("device:D1:history:10", &1u32, ttl).await;
        h.cache.set("device:D1:history:20", &1u32, ttl).await;
        h.cache.set("device:D2:history:10", &1u32, ttl).await;

        h.jobs.enqueue_invalidate("device:D1:history:");
        h.jobs.enqueue_invalidate("device:D1:history:");
        h.jobs.enqueue_invalidate("device:D3:history:");

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.jobs.stats().invalidations_processed, 2);
        assert_eq!(h.cache.get::<u32>("device:D1:history:10").await, None);
        assert_eq!(h.cache.get::<u32>("device:D2:history:10").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_open_batches() {
        let h = harness(settings(100), MemoryReadingRepository::new());
        h.jobs.enqueue_write(reading("D1", 1));
        h.jobs.enqueue_broadcast("node_updates", "D1", json!(1));

        h.jobs.shutdown().await;
        assert_eq!(h.repo.total_readings(), 1);
        assert_eq!(h.broadcaster.sent().len(), 1);
        assert!(!h.jobs.enqueue_write(reading("D1", 2)), "closed after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_counts_drops() {
        let h = harness(
            JobSettings {
                queue_capacity: 1,
                ..settings(100)
            },
            MemoryReadingRepository::new(),
        );
        // Worker has not run yet, so the channel holds one item
        assert!(h.jobs.enqueue_invalidate("a"));
        assert!(!h.jobs.enqueue_invalidate("b"));
        assert_eq!(h.jobs.stats().items_dropped, 1);
    }
}
