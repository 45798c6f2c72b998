use async_trait::async_trait;
use polyrelay::keypool::cache::KeyCache;
use polyrelay::keypool::processor::KeyStatusProcessor;
use polyrelay::keypool::repository::{ApiKey, KeyRepository, KEY_STATUS_ACTIVE};
use polyrelay::keypool::worker_pool::{
    StatusProcessor, StatusUpdateTask, WorkerPool, WorkerPoolConfig,
};
use polyrelay::keypool::{active_keys_list_key, key_hash_key, MemoryKeyCache};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted processor: records invocation order and returns per-key results.
struct ScriptedProcessor {
    delay: Duration,
    calls: Mutex<Vec<i64>>,
    /// Keys listed here fail with a permanent error; `transient_failures`
    /// fail with a retryable one.
    permanent_failures: Vec<i64>,
    transient_failures: Vec<i64>,
}

impl ScriptedProcessor {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            permanent_failures: Vec::new(),
            transient_failures: Vec::new(),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_permanent_failures(mut self, keys: Vec<i64>) -> Self {
        self.permanent_failures = keys;
        self
    }

    fn with_transient_failures(mut self, keys: Vec<i64>) -> Self {
        self.transient_failures = keys;
        self
    }

    fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }

    async fn run(&self, key_id: i64) -> Result<(), String> {
        self.calls.lock().unwrap().push(key_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.permanent_failures.contains(&key_id) {
            return Err(format!("record not found: key {key_id}"));
        }
        if self.transient_failures.contains(&key_id) {
            return Err(format!("connection reset while updating key {key_id}"));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusProcessor for ScriptedProcessor {
    async fn process_success(
        &self,
        key_id: i64,
        _key_hash_key: &str,
        _active_keys_list_key: &str,
    ) -> Result<(), String> {
        self.run(key_id).await
    }

    async fn process_failure(
        &self,
        task: &StatusUpdateTask,
        _key_hash_key: &str,
        _active_keys_list_key: &str,
    ) -> Result<(), String> {
        self.run(task.key_id).await
    }
}

fn pool_config(workers: usize, capacity: usize, max_retries: u32) -> WorkerPoolConfig {
    WorkerPoolConfig {
        worker_count: workers,
        queue_capacity: capacity,
        max_retries,
        retry_base_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn submit_is_rejected_unless_running() {
    let processor = Arc::new(ScriptedProcessor::new());
    let pool = WorkerPool::new(pool_config(1, 8, 0), processor.clone());

    assert!(!pool.submit(StatusUpdateTask::success(1, 1, 3)).await);
    assert!(!pool.is_running());

    pool.start();
    assert!(pool.is_running());
    assert!(pool.submit(StatusUpdateTask::success(1, 1, 3)).await);

    pool.stop().await;
    assert!(!pool.submit(StatusUpdateTask::success(2, 1, 3)).await);

    let metrics = pool.metrics();
    assert_eq!(metrics.processed_count, 1);
    assert_eq!(metrics.dropped_count, 0);
}

#[tokio::test]
async fn counts_add_up_with_permanent_errors() {
    // Invariant: N submissions with M permanent failures and zero retries
    // end at processed=N, errors=M, dropped=0.
    let processor =
        Arc::new(ScriptedProcessor::new().with_permanent_failures(vec![2, 4, 6]));
    let pool = WorkerPool::new(pool_config(2, 64, 0), processor.clone());
    pool.start();

    for key_id in 1..=10 {
        assert!(pool.submit(StatusUpdateTask::success(key_id, 1, 3)).await);
    }
    pool.stop().await;

    let metrics = pool.metrics();
    assert_eq!(metrics.processed_count, 10);
    assert_eq!(metrics.error_count, 3);
    assert_eq!(metrics.dropped_count, 0);
    assert_eq!(metrics.queue_length, 0);
}

#[tokio::test]
async fn single_worker_preserves_submission_order() {
    let processor = Arc::new(ScriptedProcessor::new());
    let pool = WorkerPool::new(pool_config(1, 64, 3), processor.clone());
    pool.start();

    for key_id in 1..=20 {
        assert!(pool.submit(StatusUpdateTask::failure(key_id, 1, 3, "boom")).await);
    }
    pool.stop().await;

    assert_eq!(processor.calls(), (1..=20).collect::<Vec<i64>>());
}

#[tokio::test]
async fn full_queue_processes_synchronously_without_dropping() {
    // Backpressure scenario: one slow worker, capacity 2, five submissions
    // from a tight loop. At least one submission must run inline, which is
    // observable as caller wall-time.
    let delay = Duration::from_millis(50);
    let processor = Arc::new(ScriptedProcessor::new().with_delay(delay));
    let pool = WorkerPool::new(pool_config(1, 2, 0), processor.clone());
    pool.start();

    let started = std::time::Instant::now();
    for key_id in 1..=5 {
        assert!(pool.submit(StatusUpdateTask::success(key_id, 1, 3)).await);
    }
    let submit_elapsed = started.elapsed();
    pool.stop().await;

    let metrics = pool.metrics();
    assert_eq!(metrics.processed_count, 5);
    assert_eq!(metrics.dropped_count, 0);
    assert!(
        submit_elapsed >= delay,
        "expected at least one synchronous fallback, submits took {submit_elapsed:?}"
    );
}

#[tokio::test]
async fn permanent_error_is_not_retried() {
    let processor = Arc::new(ScriptedProcessor::new().with_permanent_failures(vec![7]));
    let pool = WorkerPool::new(pool_config(1, 8, 3), processor.clone());
    pool.start();

    assert!(pool.submit(StatusUpdateTask::failure(7, 1, 3, "boom")).await);
    pool.stop().await;

    assert_eq!(processor.calls().len(), 1);
    let metrics = pool.metrics();
    assert_eq!(metrics.processed_count, 1);
    assert_eq!(metrics.error_count, 1);
}

#[tokio::test]
async fn transient_error_retries_until_exhausted() {
    let processor = Arc::new(ScriptedProcessor::new().with_transient_failures(vec![5]));
    let pool = WorkerPool::new(pool_config(1, 8, 2), processor.clone());
    pool.start();

    assert!(pool.submit(StatusUpdateTask::failure(5, 1, 3, "boom")).await);
    pool.stop().await;

    // First attempt plus two retries.
    assert_eq!(processor.calls().len(), 3);
    let metrics = pool.metrics();
    assert_eq!(metrics.processed_count, 1);
    assert_eq!(metrics.error_count, 1);
}

#[tokio::test]
async fn stop_drains_queued_tasks() {
    let processor = Arc::new(ScriptedProcessor::new().with_delay(Duration::from_millis(5)));
    let pool = WorkerPool::new(pool_config(1, 64, 0), processor.clone());
    pool.start();

    let mut accepted = 0;
    for key_id in 1..=25 {
        if pool.submit(StatusUpdateTask::success(key_id, 1, 3)).await {
            accepted += 1;
        }
    }
    pool.stop().await;
    pool.stop().await; // double stop is a no-op

    let metrics = pool.metrics();
    assert!(metrics.processed_count >= accepted);
    assert_eq!(metrics.queue_length, 0);
}

// ---------------------------------------------------------------------------
// Task processor: cache-first protocol with rollback.

struct MockRepository {
    fail: AtomicBool,
    reset_calls: AtomicUsize,
    failure_calls: Mutex<Vec<(i64, i64, bool)>>,
}

impl MockRepository {
    fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            reset_calls: AtomicUsize::new(0),
            failure_calls: Mutex::new(Vec::new()),
        }
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyRepository for MockRepository {
    async fn get(&self, _key_id: i64) -> Result<Option<ApiKey>, String> {
        Ok(None)
    }

    async fn insert(&self, group_id: i64, key_value: &str) -> Result<ApiKey, String> {
        Ok(ApiKey {
            id: 1,
            group_id,
            key_value: key_value.to_string(),
            status: KEY_STATUS_ACTIVE.to_string(),
            failure_count: 0,
        })
    }

    async fn list_active_for_group(&self, _group_id: i64) -> Result<Vec<ApiKey>, String> {
        Ok(Vec::new())
    }

    async fn reset_failures(&self, _key_id: i64, _restore_active: bool) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("forced database failure".to_string());
        }
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_failure(
        &self,
        key_id: i64,
        failure_count: i64,
        blacklist: bool,
    ) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("forced database failure".to_string());
        }
        self.failure_calls
            .lock()
            .unwrap()
            .push((key_id, failure_count, blacklist));
        Ok(())
    }
}

async fn seed_key(cache: &MemoryKeyCache, key_id: i64, group_id: i64, failures: i64, status: &str) {
    cache
        .hset(
            &key_hash_key(key_id),
            &[
                ("key_value", format!("sk-{key_id}")),
                ("failure_count", failures.to_string()),
                ("status", status.to_string()),
            ],
        )
        .await
        .unwrap();
    if status == KEY_STATUS_ACTIVE {
        cache
            .lpush(&active_keys_list_key(group_id), &key_id.to_string())
            .await
            .unwrap();
    }
}

fn failure_task(key_id: i64, group_id: i64, threshold: i64) -> StatusUpdateTask {
    StatusUpdateTask::failure(key_id, group_id, threshold, "upstream status 500")
}

#[tokio::test]
async fn success_on_healthy_key_is_a_noop() {
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 0, KEY_STATUS_ACTIVE).await;
    processor
        .process_success(1, &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap();

    assert_eq!(repo.reset_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn success_resets_failures_and_reactivates() {
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 4, "invalid").await;
    cache
        .lpush(&active_keys_list_key(10), "2")
        .await
        .unwrap();

    processor
        .process_success(1, &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap();

    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("failure_count").map(|s| s.as_str()), Some("0"));
    assert_eq!(details.get("status").map(|s| s.as_str()), Some("active"));
    // Recovered id is prepended ahead of the rest of the pool.
    assert_eq!(
        cache.list_items(&active_keys_list_key(10)).await,
        vec!["1".to_string(), "2".to_string()]
    );
    assert_eq!(repo.reset_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_increments_and_blacklists_at_threshold() {
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 1, KEY_STATUS_ACTIVE).await;

    processor
        .process_failure(&failure_task(1, 10, 3), &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap();
    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("failure_count").map(|s| s.as_str()), Some("2"));
    assert_eq!(details.get("status").map(|s| s.as_str()), Some("active"));

    processor
        .process_failure(&failure_task(1, 10, 3), &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap();
    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("failure_count").map(|s| s.as_str()), Some("3"));
    assert_eq!(details.get("status").map(|s| s.as_str()), Some("invalid"));
    assert!(cache.list_items(&active_keys_list_key(10)).await.is_empty());

    let calls = repo.failure_calls.lock().unwrap().clone();
    assert_eq!(calls, vec![(1, 2, false), (1, 3, true)]);
}

#[tokio::test]
async fn failure_on_invalid_key_is_a_noop() {
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 5, "invalid").await;
    processor
        .process_failure(&failure_task(1, 10, 3), &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap();

    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("failure_count").map(|s| s.as_str()), Some("5"));
    assert!(repo.failure_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn zero_threshold_never_blacklists() {
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 99, KEY_STATUS_ACTIVE).await;
    processor
        .process_failure(&failure_task(1, 10, 0), &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap();

    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("status").map(|s| s.as_str()), Some("active"));
    assert_eq!(
        cache.list_items(&active_keys_list_key(10)).await,
        vec!["1".to_string()]
    );
}

#[tokio::test]
async fn database_failure_rolls_back_failure_update() {
    // Pre-state: failure_count=2, active, in the pool. A failed DB write
    // must restore exactly that state, with the key listed once.
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 2, KEY_STATUS_ACTIVE).await;
    repo.set_fail(true);

    let err = processor
        .process_failure(&failure_task(1, 10, 3), &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap_err();
    assert!(err.contains("forced database failure"));

    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("failure_count").map(|s| s.as_str()), Some("2"));
    assert_eq!(details.get("status").map(|s| s.as_str()), Some("active"));
    assert_eq!(
        cache.list_items(&active_keys_list_key(10)).await,
        vec!["1".to_string()]
    );
}

#[tokio::test]
async fn database_failure_rolls_back_recovery() {
    let cache = Arc::new(MemoryKeyCache::new());
    let repo = Arc::new(MockRepository::new());
    let processor = KeyStatusProcessor::new(cache.clone(), repo.clone());

    seed_key(&cache, 1, 10, 4, "invalid").await;
    repo.set_fail(true);

    let err = processor
        .process_success(1, &key_hash_key(1), &active_keys_list_key(10))
        .await
        .unwrap_err();
    assert!(err.contains("forced database failure"));

    let details = cache.hgetall(&key_hash_key(1)).await.unwrap();
    assert_eq!(details.get("failure_count").map(|s| s.as_str()), Some("4"));
    assert_eq!(details.get("status").map(|s| s.as_str()), Some("invalid"));
    assert!(cache.list_items(&active_keys_list_key(10)).await.is_empty());
}
