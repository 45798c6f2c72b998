use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One key status update. Immutable after submission except for
/// `retry_count`, which is owned by the worker processing it.
#[derive(Debug, Clone)]
pub struct StatusUpdateTask {
    pub key_id: i64,
    pub group_id: i64,
    pub is_success: bool,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub blacklist_threshold: i64,
}

impl StatusUpdateTask {
    pub fn success(key_id: i64, group_id: i64, blacklist_threshold: i64) -> Self {
        Self {
            key_id,
            group_id,
            is_success: true,
            error_message: String::new(),
            timestamp: Utc::now(),
            retry_count: 0,
            blacklist_threshold,
        }
    }

    pub fn failure(
        key_id: i64,
        group_id: i64,
        blacklist_threshold: i64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            key_id,
            group_id,
            is_success: false,
            error_message: error_message.into(),
            timestamp: Utc::now(),
            retry_count: 0,
            blacklist_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 10_000,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl WorkerPoolConfig {
    /// Invalid values fall back to the defaults.
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.worker_count == 0 {
            self.worker_count = defaults.worker_count;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = defaults.queue_capacity;
        }
        if self.retry_base_delay.is_zero() {
            self.retry_base_delay = defaults.retry_base_delay;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolMetrics {
    pub queue_length: i64,
    pub processed_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
}

/// Executes the cache-first / DB-second state transition for one task.
#[async_trait]
pub trait StatusProcessor: Send + Sync {
    async fn process_success(
        &self,
        key_id: i64,
        key_hash_key: &str,
        active_keys_list_key: &str,
    ) -> Result<(), String>;

    async fn process_failure(
        &self,
        task: &StatusUpdateTask,
        key_hash_key: &str,
        active_keys_list_key: &str,
    ) -> Result<(), String>;
}

#[derive(Default)]
struct PoolMetrics {
    queue_length: AtomicI64,
    processed_count: AtomicU64,
    error_count: AtomicU64,
    // Stays at zero: the full-queue path processes inline instead of
    // dropping.
    dropped_count: AtomicU64,
}

/// Bounded FIFO pool for key status updates. Submission never blocks on the
/// queue and never drops: a full queue processes the task synchronously on
/// the caller's task instead.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    tx: mpsc::Sender<StatusUpdateTask>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StatusUpdateTask>>>,
    processor: Arc<dyn StatusProcessor>,
    stop: CancellationToken,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<PoolMetrics>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, processor: Arc<dyn StatusProcessor>) -> Self {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            processor,
            stop: CancellationToken::new(),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("worker pool already running");
            return;
        }

        tracing::info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            "starting worker pool"
        );

        let mut workers = self.workers.lock().expect("worker handle lock");
        for worker_id in 0..self.config.worker_count {
            let rx = self.rx.clone();
            let stop = self.stop.clone();
            let processor = self.processor.clone();
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker_id, "worker started");
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = stop.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = task else {
                        break;
                    };
                    let len = metrics.queue_length.fetch_sub(1, Ordering::AcqRel) - 1;
                    metrics::gauge!("keypool_queue_length").set(len as f64);
                    process_task(processor.as_ref(), &config, &metrics, task).await;
                }
                tracing::debug!(worker_id, "worker stopped");
            }));
        }
    }

    /// Enqueue a status update. Returns false only when the pool is not
    /// running; a full queue processes the task inline and still returns
    /// true.
    pub async fn submit(&self, task: StatusUpdateTask) -> bool {
        if !self.running.load(Ordering::Acquire) {
            tracing::warn!("cannot submit task: worker pool not running");
            return false;
        }

        match self.tx.try_send(task) {
            Ok(()) => {
                let len = self.metrics.queue_length.fetch_add(1, Ordering::AcqRel) + 1;
                metrics::gauge!("keypool_queue_length").set(len as f64);
                let warn_threshold = (self.config.queue_capacity as f64 * 0.8) as i64;
                if len >= warn_threshold {
                    tracing::warn!(
                        queue_length = len,
                        capacity = self.config.queue_capacity,
                        "task queue approaching capacity"
                    );
                }
                true
            }
            Err(TrySendError::Full(task)) => {
                tracing::warn!(
                    key_id = task.key_id,
                    group_id = task.group_id,
                    "task queue full, processing synchronously to avoid dropping status update"
                );
                process_task(self.processor.as_ref(), &self.config, &self.metrics, task).await;
                true
            }
            Err(TrySendError::Closed(task)) => {
                process_task(self.processor.as_ref(), &self.config, &self.metrics, task).await;
                true
            }
        }
    }

    /// Cooperative shutdown: signal workers, wait for them to finish their
    /// current task, then drain whatever is still queued.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            tracing::warn!("worker pool already stopped");
            return;
        }

        tracing::info!("stopping worker pool");
        self.stop.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker handle lock");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        let mut drained = 0usize;
        {
            let mut rx = self.rx.lock().await;
            loop {
                match rx.try_recv() {
                    Ok(task) => {
                        self.metrics.queue_length.fetch_sub(1, Ordering::AcqRel);
                        drained += 1;
                        process_task(self.processor.as_ref(), &self.config, &self.metrics, task)
                            .await;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        if drained > 0 {
            tracing::info!(count = drained, "drained remaining tasks");
        }

        let snapshot = self.metrics();
        tracing::info!(
            processed = snapshot.processed_count,
            errors = snapshot.error_count,
            dropped = snapshot.dropped_count,
            "worker pool stopped"
        );
    }

    pub fn metrics(&self) -> WorkerPoolMetrics {
        WorkerPoolMetrics {
            queue_length: self.metrics.queue_length.load(Ordering::Acquire),
            processed_count: self.metrics.processed_count.load(Ordering::Acquire),
            error_count: self.metrics.error_count.load(Ordering::Acquire),
            dropped_count: self.metrics.dropped_count.load(Ordering::Acquire),
        }
    }
}

async fn process_task(
    processor: &dyn StatusProcessor,
    config: &WorkerPoolConfig,
    metrics: &PoolMetrics,
    mut task: StatusUpdateTask,
) {
    let key_hash_key = super::key_hash_key(task.key_id);
    let active_keys_list_key = super::active_keys_list_key(task.group_id);

    let mut last_error = String::new();
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = config.retry_base_delay * 2u32.pow(attempt - 1);
            tracing::debug!(
                key_id = task.key_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying task"
            );
            tokio::time::sleep(delay).await;
            task.retry_count = attempt;
        }

        let result = if task.is_success {
            processor
                .process_success(task.key_id, &key_hash_key, &active_keys_list_key)
                .await
        } else {
            processor
                .process_failure(&task, &key_hash_key, &active_keys_list_key)
                .await
        };

        match result {
            Ok(()) => {
                metrics.processed_count.fetch_add(1, Ordering::AcqRel);
                metrics::counter!("keypool_processed_total").increment(1);
                return;
            }
            Err(err) if is_permanent_error(&err) => {
                tracing::error!(
                    key_id = task.key_id,
                    error = %err,
                    "permanent error processing task, not retrying"
                );
                metrics.error_count.fetch_add(1, Ordering::AcqRel);
                metrics.processed_count.fetch_add(1, Ordering::AcqRel);
                metrics::counter!("keypool_errors_total").increment(1);
                return;
            }
            Err(err) => {
                tracing::warn!(
                    key_id = task.key_id,
                    attempt = attempt + 1,
                    error = %err,
                    "transient error processing task"
                );
                last_error = err;
            }
        }
    }

    tracing::error!(
        key_id = task.key_id,
        max_retries = config.max_retries,
        error = %last_error,
        "all retries exhausted for task"
    );
    metrics.error_count.fetch_add(1, Ordering::AcqRel);
    metrics.processed_count.fetch_add(1, Ordering::AcqRel);
    metrics::counter!("keypool_errors_total").increment(1);
}

/// Substring match on opaque error text; these two never resolve on retry.
pub fn is_permanent_error(err: &str) -> bool {
    err.contains("record not found") || err.contains("invalid key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_error_classifier() {
        assert!(is_permanent_error("db says record not found for key 9"));
        assert!(is_permanent_error("invalid key id"));
        assert!(!is_permanent_error("connection reset"));
        assert!(!is_permanent_error(""));
    }

    #[test]
    fn invalid_config_falls_back_to_defaults() {
        let config = WorkerPoolConfig {
            worker_count: 0,
            queue_capacity: 0,
            max_retries: 0,
            retry_base_delay: Duration::ZERO,
        }
        .normalized();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
    }
}
