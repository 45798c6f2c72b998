use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Hot-cache operations the key pool relies on. Shaped after the redis
/// commands so a remote cache can slot in behind the same trait.
#[async_trait]
pub trait KeyCache: Send + Sync {
    /// Return all fields of a hash; missing hashes are an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, String>;

    /// Set many hash fields atomically.
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), String>;

    /// Atomically add `delta` to a numeric hash field, returning the new
    /// value. A missing field counts as 0.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, String>;

    /// Prepend a value to a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), String>;

    /// Remove up to |count| occurrences of `value`; count 0 removes all.
    /// Returns the number removed.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64, String>;

    /// List length; missing lists have length 0.
    async fn llen(&self, key: &str) -> Result<i64, String>;

    /// Move the head of the list to its tail and return it. Used for key
    /// selection, not by the status-update protocol.
    async fn lrotate(&self, key: &str) -> Result<Option<String>, String>;
}

#[derive(Default)]
struct MemoryCacheInner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
}

/// In-process cache used by default and in tests.
#[derive(Clone, Default)]
pub struct MemoryKeyCache {
    inner: Arc<RwLock<MemoryCacheInner>>,
}

impl MemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full list contents, for assertions.
    pub async fn list_items(&self, key: &str) -> Vec<String> {
        let guard = self.inner.read().await;
        guard.lists.get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl KeyCache for MemoryKeyCache {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, String> {
        let guard = self.inner.read().await;
        Ok(guard.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let hash = guard.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, String> {
        let mut guard = self.inner.write().await;
        let hash = guard.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        guard
            .lists
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64, String> {
        let mut guard = self.inner.write().await;
        let Some(list) = guard.lists.get_mut(key) else {
            return Ok(0);
        };
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0;
        list.retain(|item| {
            if removed < limit && item == value {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed as i64)
    }

    async fn llen(&self, key: &str) -> Result<i64, String> {
        let guard = self.inner.read().await;
        Ok(guard.lists.get(key).map(|l| l.len()).unwrap_or(0) as i64)
    }

    async fn lrotate(&self, key: &str) -> Result<Option<String>, String> {
        let mut guard = self.inner.write().await;
        let Some(list) = guard.lists.get_mut(key) else {
            return Ok(None);
        };
        if list.is_empty() {
            return Ok(None);
        }
        let head = list.remove(0);
        list.push(head.clone());
        Ok(Some(head))
    }
}
