use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;

pub const KEY_STATUS_ACTIVE: &str = "active";
pub const KEY_STATUS_INVALID: &str = "invalid";

const TXN_RETRIES: u32 = 3;
const TXN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Durable key row.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: i64,
    pub group_id: i64,
    pub key_value: String,
    pub status: String,
    pub failure_count: i64,
}

/// Durable truth for key state. Mutations run in a transaction and retry on
/// transient lock contention; a missing row is reported with a message
/// containing `record not found`, which the worker pool treats as permanent.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    async fn get(&self, key_id: i64) -> Result<Option<ApiKey>, String>;
    async fn insert(&self, group_id: i64, key_value: &str) -> Result<ApiKey, String>;
    async fn list_active_for_group(&self, group_id: i64) -> Result<Vec<ApiKey>, String>;

    /// Success path: failure count back to zero, optionally restoring an
    /// invalid key to active.
    async fn reset_failures(&self, key_id: i64, restore_active: bool) -> Result<(), String>;

    /// Failure path: persist the new failure count, flipping the key to
    /// invalid when it crossed the blacklist threshold.
    async fn apply_failure(
        &self,
        key_id: i64,
        failure_count: i64,
        blacklist: bool,
    ) -> Result<(), String>;
}

#[derive(Clone)]
pub struct SqliteKeyRepository {
    pool: Pool<Sqlite>,
}

impl SqliteKeyRepository {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_keys (\
             id INTEGER PRIMARY KEY AUTOINCREMENT,\
             group_id INTEGER NOT NULL,\
             key_value TEXT NOT NULL,\
             status TEXT NOT NULL DEFAULT 'active',\
             failure_count INTEGER NOT NULL DEFAULT 0\
             )",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }

    async fn update_key(
        &self,
        key_id: i64,
        failure_count: i64,
        status: Option<&str>,
    ) -> Result<(), String> {
        let mut attempt = 0;
        loop {
            match self.try_update_key(key_id, failure_count, status).await {
                Ok(()) => return Ok(()),
                Err(err) if is_transient(&err) && attempt < TXN_RETRIES => {
                    attempt += 1;
                    tracing::debug!(key_id, attempt, "retrying key update after transient error");
                    tokio::time::sleep(TXN_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One transactional attempt. The locking read inside the transaction
    /// serializes concurrent writers on the same row.
    async fn try_update_key(
        &self,
        key_id: i64,
        failure_count: i64,
        status: Option<&str>,
    ) -> Result<(), String> {
        let mut tx = self.pool.begin().await.map_err(|err| err.to_string())?;

        let row = sqlx::query("SELECT id FROM api_keys WHERE id = ?")
            .bind(key_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| err.to_string())?;
        if row.is_none() {
            return Err(format!("record not found: key {key_id}"));
        }

        match status {
            Some(status) => {
                sqlx::query("UPDATE api_keys SET failure_count = ?, status = ? WHERE id = ?")
                    .bind(failure_count)
                    .bind(status)
                    .bind(key_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| err.to_string())?;
            }
            None => {
                sqlx::query("UPDATE api_keys SET failure_count = ? WHERE id = ?")
                    .bind(failure_count)
                    .bind(key_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| err.to_string())?;
            }
        }

        tx.commit().await.map_err(|err| err.to_string())
    }
}

fn is_transient(err: &str) -> bool {
    err.contains("locked") || err.contains("busy")
}

#[async_trait]
impl KeyRepository for SqliteKeyRepository {
    async fn get(&self, key_id: i64) -> Result<Option<ApiKey>, String> {
        let row = sqlx::query(
            "SELECT id, group_id, key_value, status, failure_count FROM api_keys WHERE id = ?",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        row.map(row_to_key).transpose()
    }

    async fn insert(&self, group_id: i64, key_value: &str) -> Result<ApiKey, String> {
        let result = sqlx::query(
            "INSERT INTO api_keys (group_id, key_value, status, failure_count)\
             VALUES (?, ?, 'active', 0)",
        )
        .bind(group_id)
        .bind(key_value)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(ApiKey {
            id: result.last_insert_rowid(),
            group_id,
            key_value: key_value.to_string(),
            status: KEY_STATUS_ACTIVE.to_string(),
            failure_count: 0,
        })
    }

    async fn list_active_for_group(&self, group_id: i64) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query(
            "SELECT id, group_id, key_value, status, failure_count FROM api_keys \
             WHERE group_id = ? AND status = 'active' ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        rows.into_iter().map(row_to_key).collect()
    }

    async fn reset_failures(&self, key_id: i64, restore_active: bool) -> Result<(), String> {
        let status = restore_active.then_some(KEY_STATUS_ACTIVE);
        self.update_key(key_id, 0, status).await
    }

    async fn apply_failure(
        &self,
        key_id: i64,
        failure_count: i64,
        blacklist: bool,
    ) -> Result<(), String> {
        let status = blacklist.then_some(KEY_STATUS_INVALID);
        self.update_key(key_id, failure_count, status).await
    }
}

fn row_to_key(row: sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    Ok(ApiKey {
        id: row.try_get("id").map_err(|err| err.to_string())?,
        group_id: row.try_get("group_id").map_err(|err| err.to_string())?,
        key_value: row.try_get("key_value").map_err(|err| err.to_string())?,
        status: row.try_get("status").map_err(|err| err.to_string())?,
        failure_count: row
            .try_get("failure_count")
            .map_err(|err| err.to_string())?,
    })
}
