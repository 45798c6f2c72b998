use crate::relay::ApiFormat;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

/// One tenant group: routing target, upstream dialect and key-pool budgets.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub api_format: ApiFormat,
    pub upstream_url: String,
    pub blacklist_threshold: i64,
    pub max_retries: i64,
    pub request_timeout_secs: u64,
    pub model_redirects: HashMap<String, String>,
}

impl Group {
    pub fn redirect_model(&self, model: &str) -> Option<&str> {
        self.model_redirects.get(model).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CreateGroupInput {
    pub name: String,
    pub api_format: ApiFormat,
    pub upstream_url: String,
    pub blacklist_threshold: i64,
    pub max_retries: i64,
    pub request_timeout_secs: u64,
    pub model_redirects: HashMap<String, String>,
}

impl Default for CreateGroupInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            api_format: ApiFormat::OpenAiChat,
            upstream_url: String::new(),
            blacklist_threshold: 3,
            max_retries: 3,
            request_timeout_secs: 30,
            model_redirects: HashMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct GroupStore {
    pool: Pool<Sqlite>,
}

impl GroupStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS groups (\
             id INTEGER PRIMARY KEY AUTOINCREMENT,\
             name TEXT NOT NULL UNIQUE,\
             api_format TEXT NOT NULL,\
             upstream_url TEXT NOT NULL,\
             blacklist_threshold INTEGER NOT NULL DEFAULT 3,\
             max_retries INTEGER NOT NULL DEFAULT 3,\
             request_timeout_secs INTEGER NOT NULL DEFAULT 30,\
             model_redirects TEXT NOT NULL DEFAULT '{}'\
             )",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }

    pub async fn create(&self, input: CreateGroupInput) -> Result<Group, String> {
        let redirects =
            serde_json::to_string(&input.model_redirects).map_err(|err| err.to_string())?;
        let result = sqlx::query(
            "INSERT INTO groups (name, api_format, upstream_url, blacklist_threshold,\
             max_retries, request_timeout_secs, model_redirects)\
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.name)
        .bind(input.api_format.as_str())
        .bind(&input.upstream_url)
        .bind(input.blacklist_threshold)
        .bind(input.max_retries)
        .bind(input.request_timeout_secs as i64)
        .bind(redirects)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;

        Ok(Group {
            id: result.last_insert_rowid(),
            name: input.name,
            api_format: input.api_format,
            upstream_url: input.upstream_url,
            blacklist_threshold: input.blacklist_threshold,
            max_retries: input.max_retries,
            request_timeout_secs: input.request_timeout_secs,
            model_redirects: input.model_redirects,
        })
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Group>, String> {
        let row = sqlx::query(
            "SELECT id, name, api_format, upstream_url, blacklist_threshold,\
             max_retries, request_timeout_secs, model_redirects \
             FROM groups WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        row.map(row_to_group).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Group>, String> {
        let rows = sqlx::query(
            "SELECT id, name, api_format, upstream_url, blacklist_threshold,\
             max_retries, request_timeout_secs, model_redirects \
             FROM groups ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        rows.into_iter().map(row_to_group).collect()
    }
}

fn row_to_group(row: sqlx::sqlite::SqliteRow) -> Result<Group, String> {
    let api_format: String = row.try_get("api_format").map_err(|err| err.to_string())?;
    let redirects_raw: String = row
        .try_get("model_redirects")
        .map_err(|err| err.to_string())?;
    let model_redirects: HashMap<String, String> =
        serde_json::from_str(&redirects_raw).unwrap_or_default();
    let timeout: i64 = row
        .try_get("request_timeout_secs")
        .map_err(|err| err.to_string())?;

    Ok(Group {
        id: row.try_get("id").map_err(|err| err.to_string())?,
        name: row.try_get("name").map_err(|err| err.to_string())?,
        api_format: ApiFormat::parse(&api_format),
        upstream_url: row.try_get("upstream_url").map_err(|err| err.to_string())?,
        blacklist_threshold: row
            .try_get("blacklist_threshold")
            .map_err(|err| err.to_string())?,
        max_retries: row.try_get("max_retries").map_err(|err| err.to_string())?,
        request_timeout_secs: timeout.max(0) as u64,
        model_redirects,
    })
}
