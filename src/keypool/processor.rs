use crate::keypool::cache::KeyCache;
use crate::keypool::repository::{KeyRepository, KEY_STATUS_ACTIVE, KEY_STATUS_INVALID};
use crate::keypool::worker_pool::{StatusProcessor, StatusUpdateTask};
use async_trait::async_trait;
use std::sync::Arc;

/// Cache-first, DB-second status transitions. The cache is the hot copy and
/// is updated optimistically; any later failure rolls the cache back to the
/// snapshot taken up front so both stores converge again.
pub struct KeyStatusProcessor {
    cache: Arc<dyn KeyCache>,
    repository: Arc<dyn KeyRepository>,
}

impl KeyStatusProcessor {
    pub fn new(cache: Arc<dyn KeyCache>, repository: Arc<dyn KeyRepository>) -> Self {
        Self { cache, repository }
    }

    /// Best effort: a failed rollback is logged and left for the next
    /// successful update of the same key to repair.
    async fn rollback_hash(&self, key_hash_key: &str, failure_count: i64, status: &str) {
        let fields = [
            ("failure_count", failure_count.to_string()),
            ("status", status.to_string()),
        ];
        if let Err(err) = self.cache.hset(key_hash_key, &fields).await {
            tracing::error!(
                key_hash_key,
                error = %err,
                "failed to roll back cache after database failure"
            );
        }
    }
}

#[async_trait]
impl StatusProcessor for KeyStatusProcessor {
    async fn process_success(
        &self,
        key_id: i64,
        key_hash_key: &str,
        active_keys_list_key: &str,
    ) -> Result<(), String> {
        let details = self
            .cache
            .hgetall(key_hash_key)
            .await
            .map_err(|err| format!("failed to read key details from cache: {err}"))?;

        let old_failure_count: i64 = details
            .get("failure_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let old_status = details.get("status").cloned().unwrap_or_default();
        let is_active = old_status == KEY_STATUS_ACTIVE;

        if old_failure_count == 0 && is_active {
            return Ok(());
        }

        let restore_to_active = !is_active;
        let mut updates: Vec<(&str, String)> = vec![("failure_count", "0".to_string())];
        if restore_to_active {
            updates.push(("status", KEY_STATUS_ACTIVE.to_string()));
        }
        self.cache
            .hset(key_hash_key, &updates)
            .await
            .map_err(|err| format!("failed to update key details in cache: {err}"))?;

        let id = key_id.to_string();
        if restore_to_active {
            if let Err(err) = self.cache.lrem(active_keys_list_key, 0, &id).await {
                self.rollback_hash(key_hash_key, old_failure_count, &old_status)
                    .await;
                return Err(format!(
                    "failed to remove key before re-adding on recovery: {err}"
                ));
            }
            if let Err(err) = self.cache.lpush(active_keys_list_key, &id).await {
                self.rollback_hash(key_hash_key, old_failure_count, &old_status)
                    .await;
                return Err(format!("failed to push key back to active list: {err}"));
            }
        }

        if let Err(db_err) = self.repository.reset_failures(key_id, restore_to_active).await {
            tracing::warn!(
                key_id,
                error = %db_err,
                "database update failed, rolling back cache"
            );
            self.rollback_hash(key_hash_key, old_failure_count, &old_status)
                .await;
            if restore_to_active {
                let _ = self.cache.lrem(active_keys_list_key, 0, &id).await;
            }
            return Err(db_err);
        }

        if restore_to_active {
            tracing::debug!(key_id, "key recovered, restored to active pool");
        }
        Ok(())
    }

    async fn process_failure(
        &self,
        task: &StatusUpdateTask,
        key_hash_key: &str,
        active_keys_list_key: &str,
    ) -> Result<(), String> {
        let details = self
            .cache
            .hgetall(key_hash_key)
            .await
            .map_err(|err| format!("failed to read key details from cache: {err}"))?;

        let old_status = details.get("status").cloned().unwrap_or_default();
        if old_status == KEY_STATUS_INVALID {
            return Ok(());
        }

        let old_failure_count: i64 = details
            .get("failure_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let new_failure_count = old_failure_count + 1;
        let should_blacklist =
            task.blacklist_threshold > 0 && new_failure_count >= task.blacklist_threshold;

        self.cache
            .hincr_by(key_hash_key, "failure_count", 1)
            .await
            .map_err(|err| format!("failed to increment failure count in cache: {err}"))?;

        let id = task.key_id.to_string();
        if should_blacklist {
            if let Err(err) = self
                .cache
                .hset(key_hash_key, &[("status", KEY_STATUS_INVALID.to_string())])
                .await
            {
                let _ = self.cache.hincr_by(key_hash_key, "failure_count", -1).await;
                return Err(format!("failed to mark key invalid in cache: {err}"));
            }
            if let Err(err) = self.cache.lrem(active_keys_list_key, 0, &id).await {
                self.rollback_hash(key_hash_key, old_failure_count, &old_status)
                    .await;
                return Err(format!("failed to remove key from active list: {err}"));
            }
        }

        if let Err(db_err) = self
            .repository
            .apply_failure(task.key_id, new_failure_count, should_blacklist)
            .await
        {
            tracing::warn!(
                key_id = task.key_id,
                error = %db_err,
                "database update failed, rolling back cache"
            );
            self.rollback_hash(key_hash_key, old_failure_count, &old_status)
                .await;
            if should_blacklist {
                let _ = self.cache.lpush(active_keys_list_key, &id).await;
            }
            return Err(db_err);
        }

        if should_blacklist {
            tracing::warn!(
                key_id = task.key_id,
                threshold = task.blacklist_threshold,
                "key reached blacklist threshold, disabling"
            );
        }
        Ok(())
    }
}
