//! Durable queue transport on top of a SQLite table.
//!
//! All lanes share the `queue_messages` table. A retried row carries a
//! `visible_at` in the future and is promoted back to the main lane by the
//! next `receive` after that moment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::{Delivery, QueueEnvelope, QueueLanes, QueueStats, QueueTransport};
use crate::db::{NewQueueMessage, QueueMessageRepository};
use crate::error::{AppError, AppResult};

pub struct SqliteTransport {
    pool: SqlitePool,
    lanes: QueueLanes,
    retry_delay: Duration,
    closed: AtomicBool,
}

impl SqliteTransport {
    /// Open the database at `url`, run migrations and recover claimed rows.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        lanes: QueueLanes,
        retry_delay: Duration,
    ) -> anyhow::Result<Self> {
        let pool = crate::services::init::open_sqlite_pool(url, max_connections).await?;
        Ok(Self::open(pool, lanes, retry_delay).await?)
    }

    /// Wrap an already migrated pool.
    ///
    /// Rows still marked `processing` belong to a consumer that died before
    /// settling them; they are made claimable again.
    pub async fn open(pool: SqlitePool, lanes: QueueLanes, retry_delay: Duration) -> AppResult<Self> {
        let released = QueueMessageRepository::release_in_flight(&pool, &lanes.main).await?;
        if released > 0 {
            tracing::warn!(
                "Released {} notification(s) left in flight by a previous run",
                released
            );
        }

        Ok(Self {
            pool,
            lanes,
            retry_delay,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::QueueUnavailable(
                "sqlite transport is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn retry_delay_ms(&self) -> i64 {
        i64::try_from(self.retry_delay.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl QueueTransport for SqliteTransport {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn publish(&self, envelope: &QueueEnvelope) -> AppResult<()> {
        self.ensure_open()?;
        let payload = serde_json::to_string(envelope)?;
        QueueMessageRepository::insert(
            &self.pool,
            NewQueueMessage {
                queue: self.lanes.main.as_str(),
                payload,
                retry_count: i64::from(envelope.retry_count),
                visible_at: None,
            },
        )
        .await?;
        Ok(())
    }

    async fn receive(&self) -> AppResult<Option<Delivery>> {
        self.ensure_open()?;
        let now = Utc::now().timestamp_millis();

        let promoted =
            QueueMessageRepository::promote_due(&self.pool, &self.lanes.retry, &self.lanes.main, now)
                .await?;
        if promoted > 0 {
            tracing::debug!("Promoted {} envelope(s) from the retry lane", promoted);
        }

        loop {
            let Some(row) = QueueMessageRepository::claim_next(&self.pool, &self.lanes.main).await?
            else {
                return Ok(None);
            };

            match serde_json::from_str::<QueueEnvelope>(&row.payload) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        id: row.id,
                        envelope,
                    }))
                }
                Err(e) => {
                    tracing::error!("Dead-lettering undecodable queue message {}: {}", row.id, e);
                    let error = format!("undecodable payload: {}", e);
                    QueueMessageRepository::move_to_lane(
                        &self.pool,
                        &row.id,
                        &self.lanes.dead,
                        row.payload,
                        row.retry_count,
                        now,
                        Some(error.as_str()),
                    )
                    .await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        if !QueueMessageRepository::delete(&self.pool, &delivery.id).await? {
            tracing::debug!("Ack for unknown queue message {}", delivery.id);
        }
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, next: &QueueEnvelope, error: &str) -> AppResult<()> {
        let payload = serde_json::to_string(next)?;
        let visible_at = Utc::now()
            .timestamp_millis()
            .saturating_add(self.retry_delay_ms());

        QueueMessageRepository::move_to_lane(
            &self.pool,
            &delivery.id,
            &self.lanes.retry,
            payload,
            i64::from(next.retry_count),
            visible_at,
            Some(error),
        )
        .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> AppResult<()> {
        let payload = serde_json::to_string(&delivery.envelope)?;
        QueueMessageRepository::move_to_lane(
            &self.pool,
            &delivery.id,
            &self.lanes.dead,
            payload,
            i64::from(delivery.envelope.retry_count),
            Utc::now().timestamp_millis(),
            Some(error),
        )
        .await?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> AppResult<()> {
        if !QueueMessageRepository::release(&self.pool, &delivery.id).await? {
            return Err(AppError::NotFound(format!("claimed queue message {}", delivery.id)));
        }
        Ok(())
    }

    async fn stats(&self) -> AppResult<QueueStats> {
        self.ensure_open()?;
        let counts = QueueMessageRepository::count_by_lane(
            &self.pool,
            &[
                self.lanes.main.as_str(),
                self.lanes.retry.as_str(),
                self.lanes.dead.as_str(),
            ],
        )
        .await?;

        let mut stats = QueueStats::default();
        for (queue, status, count) in counts {
            let count = u64::try_from(count).unwrap_or(0);
            if queue == self.lanes.main {
                if status == "processing" {
                    stats.in_flight += count;
                } else {
                    stats.ready += count;
                }
            } else if queue == self.lanes.retry {
                stats.delayed += count;
            } else if queue == self.lanes.dead {
                stats.dead += count;
            }
        }
        Ok(stats)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::queue::tests::make_notification;
    use uuid::Uuid;

    fn temp_db_url() -> String {
        let path = std::env::temp_dir().join(format!("queue-test-{}.db", Uuid::new_v4()));
        format!("sqlite://{}", path.display())
    }

    async fn connect(url: &str, retry_delay: Duration) -> SqliteTransport {
        SqliteTransport::connect(url, 2, QueueLanes::new("notifications"), retry_delay)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claims_in_publish_order_and_acks() {
        let transport = connect(&temp_db_url(), Duration::from_millis(10)).await;
        let first = make_notification("u1");
        let second = make_notification("u1");
        transport.publish(&QueueEnvelope::new(first.clone())).await.unwrap();
        transport.publish(&QueueEnvelope::new(second.clone())).await.unwrap();

        let a = transport.receive().await.unwrap().unwrap();
        let b = transport.receive().await.unwrap().unwrap();
        assert_eq!(a.envelope.notification.id, first.id);
        assert_eq!(b.envelope.notification.id, second.id);
        assert!(transport.receive().await.unwrap().is_none());

        let stats = transport.stats().await.unwrap();
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.ready, 0);

        transport.ack(&a).await.unwrap();
        transport.ack(&b).await.unwrap();
        assert_eq!(transport.stats().await.unwrap(), QueueStats::default());
        transport.close().await;
    }

    #[tokio::test]
    async fn deferred_envelope_is_hidden_until_delay_passes() {
        let transport = connect(&temp_db_url(), Duration::from_millis(50)).await;
        transport
            .publish(&QueueEnvelope::new(make_notification("u1")))
            .await
            .unwrap();

        let delivery = transport.receive().await.unwrap().unwrap();
        let next = delivery.envelope.next_attempt();
        transport.defer(&delivery, &next, "smtp timeout").await.unwrap();

        assert!(transport.receive().await.unwrap().is_none());
        assert_eq!(transport.stats().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let redelivered = transport.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.id, delivery.id);
        assert_eq!(redelivered.envelope.retry_count, 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn dead_lettered_rows_are_kept_but_never_claimed() {
        let transport = connect(&temp_db_url(), Duration::from_millis(10)).await;
        transport
            .publish(&QueueEnvelope::new(make_notification("u1")))
            .await
            .unwrap();
        let delivery = transport.receive().await.unwrap().unwrap();
        transport.dead_letter(&delivery, "gave up").await.unwrap();

        assert!(transport.receive().await.unwrap().is_none());
        let stats = transport.stats().await.unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.in_flight, 0);

        let row = QueueMessageRepository::find_by_id(&transport.pool, &delivery.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.queue, "notifications-dead");
        assert_eq!(row.last_error.as_deref(), Some("gave up"));
        transport.close().await;
    }

    #[tokio::test]
    async fn unacked_rows_are_redelivered_after_restart() {
        let url = temp_db_url();
        let notification = make_notification("u1");

        let transport = connect(&url, Duration::from_millis(10)).await;
        transport
            .publish(&QueueEnvelope::new(notification.clone()))
            .await
            .unwrap();
        let claimed = transport.receive().await.unwrap().unwrap();
        transport.close().await;

        let reopened = connect(&url, Duration::from_millis(10)).await;
        let redelivered = reopened.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.id, claimed.id);
        assert_eq!(redelivered.envelope.notification.id, notification.id);
        reopened.close().await;
    }

    #[tokio::test]
    async fn undecodable_payload_goes_to_dead_lane() {
        let transport = connect(&temp_db_url(), Duration::from_millis(10)).await;
        QueueMessageRepository::insert(
            &transport.pool,
            NewQueueMessage {
                queue: "notifications",
                payload: "not json".to_string(),
                retry_count: 0,
                visible_at: None,
            },
        )
        .await
        .unwrap();

        assert!(transport.receive().await.unwrap().is_none());
        assert_eq!(transport.stats().await.unwrap().dead, 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn released_claim_is_claimable_again() {
        let transport = connect(&temp_db_url(), Duration::from_millis(10)).await;
        transport
            .publish(&QueueEnvelope::new(make_notification("u1")))
            .await
            .unwrap();
        let delivery = transport.receive().await.unwrap().unwrap();

        transport.release(&delivery).await.unwrap();
        assert_eq!(transport.stats().await.unwrap().ready, 1);
        assert!(matches!(
            transport.release(&delivery).await,
            Err(AppError::NotFound(_))
        ));

        let again = transport.receive().await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
        assert_eq!(again.envelope.retry_count, 0);
        transport.close().await;
    }

    #[tokio::test]
    async fn opaque_sqlite_url_creates_the_database_file() {
        let path = std::env::temp_dir().join(format!("queue-test-{}.db", Uuid::new_v4()));
        let url = format!("sqlite:{}", path.display());
        let transport = connect(&url, Duration::from_millis(10)).await;
        assert!(path.exists());
        transport.close().await;
    }

    #[tokio::test]
    async fn in_memory_url_needs_no_file() {
        let transport = SqliteTransport::connect(
            "sqlite::memory:",
            1,
            QueueLanes::new("notifications"),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        transport
            .publish(&QueueEnvelope::new(make_notification("u1")))
            .await
            .unwrap();
        assert!(transport.receive().await.unwrap().is_some());
        assert!(!std::path::Path::new(":memory:").exists());
        transport.close().await;
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let transport = connect(&temp_db_url(), Duration::from_millis(10)).await;
        transport.close().await;
        transport.close().await;
        assert!(matches!(
            transport
                .publish(&QueueEnvelope::new(make_notification("u1")))
                .await,
            Err(AppError::QueueUnavailable(_))
        ));
    }
}
