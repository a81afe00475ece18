use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::db::{ChannelType, CreateNotificationRequest, Notification, NotificationStatus};
use crate::error::{AppError, AppResult};
use crate::services::queue::{EnvelopeHandler, RetryQueue};
use crate::services::store::NotificationStore;

/// A delivery backend for one channel.
///
/// Implementations make exactly one attempt and report the outcome; retrying
/// is the queue's job.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, notification: &Notification) -> AppResult<()>;
}

/// Validated fields of a creation request.
#[derive(Debug)]
struct NewNotification {
    user_id: String,
    channel: ChannelType,
    title: String,
    message: String,
    metadata: serde_json::Map<String, serde_json::Value>,
}

fn required(value: Option<String>, field: &str) -> AppResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Validation(format!("{} is required", field))),
    }
}

fn validate(request: CreateNotificationRequest) -> AppResult<NewNotification> {
    let user_id = required(request.user_id, "userId")?;
    let raw_type = required(request.notification_type, "type")?;
    let channel = ChannelType::from_str(&raw_type).ok_or_else(|| {
        AppError::Validation(format!(
            "type must be one of EMAIL, SMS, IN_APP (got {})",
            raw_type
        ))
    })?;
    let title = required(request.title, "title")?;
    let message = required(request.message, "message")?;

    Ok(NewNotification {
        user_id,
        channel,
        title,
        message,
        metadata: request.metadata.unwrap_or_default(),
    })
}

/// Creates notifications, hands them to the queue and delivers them when
/// the consumer calls back.
pub struct NotificationService {
    store: Arc<NotificationStore>,
    queue: Arc<RetryQueue>,
    notifiers: HashMap<ChannelType, Arc<dyn Notifier>>,
}

impl NotificationService {
    pub fn new(
        store: Arc<NotificationStore>,
        queue: Arc<RetryQueue>,
        notifiers: HashMap<ChannelType, Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            store,
            queue,
            notifiers,
        }
    }

    /// Store a new PENDING notification and enqueue it for delivery.
    ///
    /// When the queue rejects the notification a single inline delivery
    /// attempt is made before returning. The returned record is always the
    /// freshly created one.
    pub async fn create(&self, request: CreateNotificationRequest) -> AppResult<Notification> {
        let new = validate(request)?;
        let now = Utc::now();

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            channel: new.channel,
            title: new.title,
            message: new.message,
            metadata: new.metadata,
            status: NotificationStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        self.store.put(notification.clone()).await;
        tracing::info!(
            "Created {} notification {} for user {}",
            notification.channel,
            notification.id,
            notification.user_id
        );

        if let Err(e) = self.queue.enqueue(notification.clone()).await {
            tracing::warn!(
                "Could not enqueue notification {}, delivering inline: {}",
                notification.id,
                e
            );
            self.deliver_inline(&notification).await;
        }

        Ok(notification)
    }

    async fn deliver_inline(&self, notification: &Notification) {
        if let Err(e) = self.dispatch(notification).await {
            tracing::error!(
                "Inline delivery of notification {} failed: {}",
                notification.id,
                e
            );
            self.store
                .update_status(notification.id, NotificationStatus::Failed)
                .await;
        }
    }

    /// Deliver one notification through its channel backend.
    ///
    /// Backend errors are returned unchanged so the queue can apply its
    /// retry policy; only success is recorded here.
    pub async fn dispatch(&self, notification: &Notification) -> AppResult<()> {
        if let Some(current) = self.store.get(notification.id).await {
            if current.status.is_terminal() {
                tracing::info!(
                    "Notification {} is already {}, skipping redelivery",
                    notification.id,
                    current.status
                );
                return Ok(());
            }
        }

        let notifier = self
            .notifiers
            .get(&notification.channel)
            .ok_or_else(|| AppError::UnsupportedChannel(notification.channel.to_string()))?;

        notifier.send(notification).await?;

        self.store
            .update_status(notification.id, NotificationStatus::Sent)
            .await;
        tracing::info!(
            "Notification {} sent via {}",
            notification.id,
            notification.channel
        );
        Ok(())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<Notification> {
        self.store.list_by_user(user_id).await
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Notification> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("notification {}", id)))
    }
}

#[async_trait]
impl EnvelopeHandler for NotificationService {
    async fn handle(&self, notification: &Notification) -> AppResult<()> {
        self.dispatch(notification).await
    }

    async fn on_dead_letter(&self, notification: &Notification, error: &AppError) {
        tracing::error!(
            "Giving up on notification {} for user {}: {}",
            notification.id,
            notification.user_id,
            error
        );
        self.store
            .update_status(notification.id, NotificationStatus::Failed)
            .await;
    }
}
