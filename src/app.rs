use crate::error::{AppError, AppResult};
use crate::groups::GroupStore;
use crate::keypool::{KeyPoolService, MemoryKeyCache, SqliteKeyRepository, WorkerPoolConfig};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub groups: GroupStore,
    pub key_pool: Arc<KeyPoolService>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub worker_pool: WorkerPoolConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_or("POLYRELAY_LISTEN", "0.0.0.0:8080");
        let metrics_path = env_or("POLYRELAY_METRICS_PATH", "/metrics");
        let database_dsn = std::env::var("POLYRELAY_DATABASE_DSN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                std::env::var("DATABASE_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
            })
            .unwrap_or_else(|| "sqlite://./data/polyrelay.db".to_string());

        let defaults = WorkerPoolConfig::default();
        let worker_pool = WorkerPoolConfig {
            worker_count: env_parsed("POLYRELAY_WORKER_COUNT", defaults.worker_count),
            queue_capacity: env_parsed("POLYRELAY_QUEUE_CAPACITY", defaults.queue_capacity),
            max_retries: env_parsed("POLYRELAY_STATUS_MAX_RETRIES", defaults.max_retries),
            retry_base_delay: Duration::from_millis(env_parsed(
                "POLYRELAY_STATUS_RETRY_BASE_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )),
        };

        Self {
            listen,
            metrics_path,
            database_dsn,
            worker_pool,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("polyrelay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "database_init_failed",
            err,
        )
    })?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        axum::http::StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let groups = GroupStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "group_store_init_failed",
            err,
        )
    })?;
    let repository = SqliteKeyRepository::new(pool).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "key_store_init_failed",
            err,
        )
    })?;

    let metrics = init_metrics()?;

    let key_pool = Arc::new(KeyPoolService::new(
        Arc::new(MemoryKeyCache::new()),
        Arc::new(repository),
        runtime.worker_pool.clone(),
    ));
    key_pool.start();

    for group in groups.list().await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "group_store_init_failed",
            err,
        )
    })? {
        if let Err(err) = key_pool.load_group_keys(group.id).await {
            tracing::warn!(group = %group.name, "failed to warm key cache: {err}");
        }
    }

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        groups,
        key_pool,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/proxy/{group}/{*path}", post(crate::handlers::proxy))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
