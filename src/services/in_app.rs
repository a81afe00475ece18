use async_trait::async_trait;

use crate::db::Notification;
use crate::error::AppResult;
use crate::services::notifications::Notifier;

/// IN_APP notifications are read back through the API; delivery only logs.
pub struct InAppNotifier;

#[async_trait]
impl Notifier for InAppNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        tracing::info!(
            "In-app notification {} for user {}: {}",
            notification.id,
            notification.user_id,
            notification.title
        );
        Ok(())
    }
}
