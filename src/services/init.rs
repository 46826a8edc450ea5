//! Startup wiring:
//! - database connection + migrations
//! - construction of the shared dispatch engine

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;

use crate::config::Config;
use crate::services::dispatch::DispatchCoordinator;
use crate::services::executor::BoundedExecutor;
use crate::services::fcm::FcmProvider;
use crate::services::provider::NotificationProvider;
use crate::services::rate_limit::TokenBucket;
use crate::services::registry::{DeviceRegistry, SqliteDeviceRegistry};
use crate::services::retry::RetryPolicy;
use crate::services::stats::OutcomeObserver;
use crate::services::worker::DeviceSendWorker;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = db_url.find('@') {
            let without_creds = &db_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Open the device database, creating the file and its directory on first
/// start, and apply pending migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Build the process-wide dispatch engine. The token bucket and executor
/// created here are the only instances; every dispatch shares them.
pub fn build_coordinator(
    config: &Config,
    pool: sqlx::SqlitePool,
    observer: Arc<dyn OutcomeObserver>,
) -> Result<DispatchCoordinator> {
    let dispatch = &config.dispatch;

    let provider: Arc<dyn NotificationProvider> = Arc::new(FcmProvider::new(&config.push)?);
    let registry: Arc<dyn DeviceRegistry> = Arc::new(SqliteDeviceRegistry::new(pool));

    tracing::info!(
        "Dispatch limits: {} sends/s, {} concurrent, {} retries, early response after {}ms",
        dispatch.rate_limit_per_second,
        dispatch.max_concurrent_sends,
        dispatch.max_retries,
        dispatch.early_response_threshold_ms
    );

    let worker = DeviceSendWorker::new(
        BoundedExecutor::new(dispatch.max_concurrent_sends),
        Arc::new(TokenBucket::per_second(dispatch.rate_limit_per_second)),
        RetryPolicy::from_config(dispatch),
        provider,
        registry,
        Duration::from_millis(config.push.provider_timeout_ms),
    );

    Ok(DispatchCoordinator::new(
        worker,
        observer,
        dispatch.early_response_threshold(),
        dispatch.max_text_length,
    ))
}
