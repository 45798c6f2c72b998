use std::sync::Arc;

pub mod cache;
pub mod processor;
pub mod repository;
pub mod worker_pool;

pub use cache::{KeyCache, MemoryKeyCache};
pub use processor::KeyStatusProcessor;
pub use repository::{ApiKey, KeyRepository, SqliteKeyRepository, KEY_STATUS_ACTIVE};
pub use worker_pool::{
    StatusProcessor, StatusUpdateTask, WorkerPool, WorkerPoolConfig, WorkerPoolMetrics,
};

pub fn key_hash_key(key_id: i64) -> String {
    format!("key:{key_id}")
}

pub fn active_keys_list_key(group_id: i64) -> String {
    format!("group:{group_id}:active_keys")
}

/// Facade over the key cache, the durable key store and the status-update
/// worker pool.
pub struct KeyPoolService {
    cache: Arc<dyn KeyCache>,
    repository: Arc<dyn KeyRepository>,
    pool: WorkerPool,
}

impl KeyPoolService {
    pub fn new(
        cache: Arc<dyn KeyCache>,
        repository: Arc<dyn KeyRepository>,
        config: WorkerPoolConfig,
    ) -> Self {
        let processor = Arc::new(KeyStatusProcessor::new(cache.clone(), repository.clone()));
        Self {
            cache,
            repository,
            pool: WorkerPool::new(config, processor),
        }
    }

    pub fn start(&self) {
        self.pool.start();
    }

    pub fn cache(&self) -> Arc<dyn KeyCache> {
        self.cache.clone()
    }

    pub fn repository(&self) -> Arc<dyn KeyRepository> {
        self.repository.clone()
    }

    pub async fn shutdown(&self) {
        self.pool.stop().await;
    }

    pub fn metrics(&self) -> WorkerPoolMetrics {
        self.pool.metrics()
    }

    /// Warm the cache from the durable store: one hash per key plus the
    /// group's active-id list, in id order.
    pub async fn load_group_keys(&self, group_id: i64) -> Result<usize, String> {
        let keys = self.repository.list_active_for_group(group_id).await?;
        let list_key = active_keys_list_key(group_id);

        for key in keys.iter().rev() {
            let hash_key = key_hash_key(key.id);
            self.cache
                .hset(
                    &hash_key,
                    &[
                        ("key_value", key.key_value.clone()),
                        ("failure_count", key.failure_count.to_string()),
                        ("status", key.status.clone()),
                    ],
                )
                .await?;
            let id = key.id.to_string();
            self.cache.lrem(&list_key, 0, &id).await?;
            self.cache.lpush(&list_key, &id).await?;
        }

        tracing::info!(group_id, count = keys.len(), "loaded group keys into cache");
        Ok(keys.len())
    }

    /// Rotate the group's active list and resolve the winning key. `None`
    /// means the group has no usable keys.
    pub async fn select_key(&self, group_id: i64) -> Result<Option<ApiKey>, String> {
        let list_key = active_keys_list_key(group_id);
        let Some(id) = self.cache.lrotate(&list_key).await? else {
            return Ok(None);
        };
        let key_id: i64 = id
            .parse()
            .map_err(|_| format!("invalid key id in active list: {id}"))?;

        let details = self.cache.hgetall(&key_hash_key(key_id)).await?;
        if let Some(key_value) = details.get("key_value") {
            return Ok(Some(ApiKey {
                id: key_id,
                group_id,
                key_value: key_value.clone(),
                status: details
                    .get("status")
                    .cloned()
                    .unwrap_or_else(|| KEY_STATUS_ACTIVE.to_string()),
                failure_count: details
                    .get("failure_count")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            }));
        }

        // Cache miss for the hash itself; fall back to the durable store.
        self.repository.get(key_id).await
    }

    /// Queue a status update for asynchronous processing. Returns whether
    /// the pool accepted it (false only before start / after shutdown).
    pub async fn update_status(
        &self,
        key_id: i64,
        group_id: i64,
        blacklist_threshold: i64,
        is_success: bool,
        error_message: impl Into<String>,
    ) -> bool {
        let task = if is_success {
            StatusUpdateTask::success(key_id, group_id, blacklist_threshold)
        } else {
            StatusUpdateTask::failure(key_id, group_id, blacklist_threshold, error_message)
        };
        self.pool.submit(task).await
    }
}
