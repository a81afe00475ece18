//! Initialization helpers for the application:
//! - queue database connection + migrations
//! - queue transport selection with offline fallback
//! - delivery backend registry

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::sqlite::SqliteConnectOptions;

use crate::config::{Config, QueueConfig};
use crate::db::ChannelType;
use crate::services::email::EmailNotifier;
use crate::services::in_app::InAppNotifier;
use crate::services::notifications::Notifier;
use crate::services::queue::{
    ConsumerOptions, MemoryTransport, OfflineTransport, QueueLanes, QueueTransport, RetryPolicy,
    RetryQueue, SqliteTransport,
};
use crate::services::sms::SmsNotifier;

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

/// Open a SQLite pool for the queue database and run migrations.
///
/// Accepts every URL form sqlx understands (`sqlite://path`, `sqlite:path`,
/// `sqlite::memory:`) and creates the parent directory of a database file.
pub async fn open_sqlite_pool(db_url: &str, max_connections: u32) -> Result<sqlx::SqlitePool> {
    tracing::info!("Connecting to queue database: {}", redact_db_url(db_url));

    let connect_options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| anyhow::anyhow!("Invalid queue database URL: {}", e))?
        .create_if_missing(true);

    let db_file_path = connect_options.clone().get_filename();
    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running queue database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Open the transport named by `QUEUE_URL`.
///
/// A transport that cannot be opened is replaced by an offline one; the
/// service keeps running and delivers notifications inline.
pub async fn connect_transport(config: &QueueConfig) -> Arc<dyn QueueTransport> {
    let lanes = QueueLanes::new(&config.name);

    if config.url.starts_with("memory://") {
        tracing::warn!("Using the in-memory queue transport; queued notifications do not survive restart");
        return Arc::new(MemoryTransport::new(config.retry_delay()));
    }

    if !config.url.starts_with("sqlite:") {
        tracing::error!(
            "Unsupported queue URL {}; notifications will be delivered inline",
            redact_db_url(&config.url)
        );
        return Arc::new(OfflineTransport::new("unsupported queue URL"));
    }

    match SqliteTransport::connect(
        &config.url,
        config.max_connections,
        lanes,
        config.retry_delay(),
    )
    .await
    {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::error!(
                "Failed to open queue transport, notifications will be delivered inline: {:?}",
                e
            );
            Arc::new(OfflineTransport::new(format!("queue unavailable: {}", e)))
        }
    }
}

/// Build the retry queue over the configured transport.
pub async fn init_queue(config: &QueueConfig) -> Arc<RetryQueue> {
    let transport = connect_transport(config).await;
    tracing::info!(
        "Notification queue '{}' using {} transport (max_retries={}, retry_delay={}ms)",
        config.name,
        transport.name(),
        config.max_retries,
        config.retry_delay_ms
    );

    Arc::new(RetryQueue::new(
        transport,
        RetryPolicy::new(config.max_retries),
        ConsumerOptions {
            poll_interval: config.poll_interval(),
            concurrency: config.worker_concurrency as usize,
        },
    ))
}

/// Register one delivery backend per channel.
///
/// Backends with missing configuration are still registered; they fail each
/// attempt with a configuration error so the notification goes through retry.
pub fn build_notifiers(config: &Config) -> Result<HashMap<ChannelType, Arc<dyn Notifier>>> {
    let mut notifiers: HashMap<ChannelType, Arc<dyn Notifier>> = HashMap::new();

    let email = EmailNotifier::new(&config.smtp);
    if !email.is_configured() {
        tracing::warn!("SMTP is not configured; EMAIL notifications will fail until it is");
    }
    notifiers.insert(ChannelType::Email, Arc::new(email));

    let sms = SmsNotifier::new(&config.sms)?;
    if !sms.is_configured() {
        tracing::warn!("Twilio is not configured; SMS notifications will fail until it is");
    }
    notifiers.insert(ChannelType::Sms, Arc::new(sms));

    notifiers.insert(ChannelType::InApp, Arc::new(InAppNotifier));

    Ok(notifiers)
}
