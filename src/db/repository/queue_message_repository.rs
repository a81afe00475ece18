use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::QueueMessage;
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    queue,
    payload,
    retry_count,
    status,
    visible_at,
    enqueued_at,
    last_error,
    created_at,
    updated_at
"#;

/// Data required to append a message to a lane.
#[derive(Debug, Clone)]
pub struct NewQueueMessage<'a> {
    pub queue: &'a str,
    pub payload: String,
    pub retry_count: i64,
    /// Unix millis; `None` makes the row visible immediately.
    pub visible_at: Option<i64>,
}

/// Repository for the durable queue table.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement UPDATE with a subselect:
///   `UPDATE ... WHERE id = (SELECT id FROM ... LIMIT 1) RETURNING ...`
///   so two consumers can never claim the same row.
/// - Moving a row between lanes rewrites its `queue` column in place; a row
///   therefore sits in exactly one lane at any time.
pub struct QueueMessageRepository;

impl QueueMessageRepository {
    /// Append a message to the given lane.
    pub async fn insert(pool: &SqlitePool, message: NewQueueMessage<'_>) -> AppResult<QueueMessage> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let visible_at = message.visible_at.unwrap_or(now);

        let sql = format!(
            r#"
            INSERT INTO queue_messages (
                id, queue, payload, retry_count, status,
                visible_at, enqueued_at, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'ready', ?, ?, NULL, ?, ?)
            RETURNING {COLUMNS}
            "#
        );

        sqlx::query_as::<_, QueueMessage>(&sql)
            .bind(id)
            .bind(message.queue)
            .bind(message.payload)
            .bind(message.retry_count)
            .bind(visible_at)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Move every row of `from` whose visibility time has passed into `to`.
    ///
    /// Promoted rows are ordered by the moment they became visible, so a
    /// retried message goes to the tail of the main lane rather than jumping
    /// ahead of newer work.
    pub async fn promote_due(pool: &SqlitePool, from: &str, to: &str, now: i64) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET queue = ?, status = 'ready', enqueued_at = visible_at, updated_at = ?
            WHERE queue = ? AND visible_at <= ?
            "#,
        )
        .bind(to)
        .bind(now)
        .bind(from)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Claim the oldest ready row of `queue`, marking it `processing`.
    pub async fn claim_next(pool: &SqlitePool, queue: &str) -> AppResult<Option<QueueMessage>> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            r#"
            UPDATE queue_messages
            SET status = 'processing', updated_at = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND status = 'ready'
                ORDER BY enqueued_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        );

        sqlx::query_as::<_, QueueMessage>(&sql)
            .bind(now)
            .bind(queue)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Permanently remove a row. Returns whether a row was deleted.
    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a row into another lane, replacing its payload.
    ///
    /// Used both for the retry lane (with a future `visible_at`) and the dead lane.
    pub async fn move_to_lane(
        pool: &SqlitePool,
        id: &str,
        queue: &str,
        payload: String,
        retry_count: i64,
        visible_at: i64,
        last_error: Option<&str>,
    ) -> AppResult<QueueMessage> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            r#"
            UPDATE queue_messages
            SET
                queue = ?,
                payload = ?,
                retry_count = ?,
                status = 'ready',
                visible_at = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        );

        sqlx::query_as::<_, QueueMessage>(&sql)
            .bind(queue)
            .bind(payload)
            .bind(retry_count)
            .bind(visible_at)
            .bind(last_error)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("queue message {}", id)))
    }

    /// Return rows left `processing` by a previous run to the ready state.
    pub async fn release_in_flight(pool: &SqlitePool, queue: &str) -> AppResult<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'ready', updated_at = ?
            WHERE queue = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(queue)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Return a single claimed row to the ready state.
    pub async fn release(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'ready', updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Count rows per (lane, status) for the given lanes.
    pub async fn count_by_lane(
        pool: &SqlitePool,
        queues: &[&str],
    ) -> AppResult<Vec<(String, String, i64)>> {
        let mut counts = Vec::new();
        for queue in queues {
            let rows = sqlx::query_as::<_, (String, String, i64)>(
                r#"
                SELECT queue, status, COUNT(*)
                FROM queue_messages
                WHERE queue = ?
                GROUP BY queue, status
                "#,
            )
            .bind(*queue)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;
            counts.extend(rows);
        }

        Ok(counts)
    }

    /// Fetch a row by id.
    #[cfg(test)]
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<QueueMessage>> {
        let sql = format!("SELECT {COLUMNS} FROM queue_messages WHERE id = ?");

        sqlx::query_as::<_, QueueMessage>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }
}
