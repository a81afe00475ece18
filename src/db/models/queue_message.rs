use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row of the durable queue table.
///
/// Each row holds one serialized `QueueEnvelope`. The `queue` column names the
/// lane the envelope currently sits in (main, retry or dead) so a move between
/// lanes is a single-row update.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Primary key (UUID)
    pub id: String,

    /// Lane name, e.g. `notifications`, `notifications-retry`, `notifications-dead`.
    pub queue: String,

    /// JSON-serialized envelope.
    pub payload: String,

    /// Mirror of the envelope retry counter, kept for inspection queries.
    pub retry_count: i64,

    /// 'ready' or 'processing'
    pub status: String,

    /// Unix millis after which the row may leave the retry lane.
    pub visible_at: i64,

    /// Unix millis used for FIFO ordering inside the main lane.
    pub enqueued_at: i64,

    /// Last error observed when an attempt failed (if any).
    pub last_error: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}
