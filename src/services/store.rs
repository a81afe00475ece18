//! In-memory notification record store.
//!
//! Notifications are grouped by owning user in insertion order. A secondary
//! id index resolves the owner for status updates. Both maps sit behind one
//! `RwLock` so a `put` racing an `update_status` can never lose a write.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{Notification, NotificationStatus};

#[derive(Default)]
struct StoreInner {
    by_user: HashMap<String, Vec<Notification>>,
    owners: HashMap<Uuid, String>,
}

#[derive(Default)]
pub struct NotificationStore {
    inner: RwLock<StoreInner>,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a notification, or overwrite the stored record with the same id.
    ///
    /// Overwrites keep the original list position; an overwrite that changes
    /// the owner moves the record to the end of the new owner's list.
    pub async fn put(&self, notification: Notification) {
        let mut inner = self.inner.write().await;
        let StoreInner { by_user, owners } = &mut *inner;

        if let Some(previous_owner) = owners.get(&notification.id).cloned() {
            if previous_owner == notification.user_id {
                if let Some(slot) = by_user
                    .get_mut(&previous_owner)
                    .and_then(|list| list.iter_mut().find(|n| n.id == notification.id))
                {
                    *slot = notification;
                    return;
                }
            } else if let Some(list) = by_user.get_mut(&previous_owner) {
                list.retain(|n| n.id != notification.id);
                if list.is_empty() {
                    by_user.remove(&previous_owner);
                }
            }
        }

        owners.insert(notification.id, notification.user_id.clone());
        by_user
            .entry(notification.user_id.clone())
            .or_default()
            .push(notification);
    }

    /// Notifications owned by `user_id`, oldest first.
    pub async fn list_by_user(&self, user_id: &str) -> Vec<Notification> {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, id: Uuid) -> Option<Notification> {
        let inner = self.inner.read().await;
        let owner = inner.owners.get(&id)?;
        inner
            .by_user
            .get(owner)?
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    /// Set the status of a notification and refresh its `updated_at`.
    ///
    /// Unknown ids are ignored. Transitions out of a terminal status are
    /// refused. Returns the updated record when a change was applied.
    pub async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Option<Notification> {
        let mut inner = self.inner.write().await;
        let StoreInner { by_user, owners } = &mut *inner;

        let notification = match owners.get(&id) {
            Some(owner) => by_user
                .get_mut(owner)
                .and_then(|list| list.iter_mut().find(|n| n.id == id)),
            // Index miss: fall back to scanning every owner.
            None => by_user
                .values_mut()
                .flat_map(|list| list.iter_mut())
                .find(|n| n.id == id),
        };

        let Some(notification) = notification else {
            tracing::debug!("Status update for unknown notification {} ignored", id);
            return None;
        };

        if !notification.status.can_transition_to(status) {
            tracing::warn!(
                "Refusing status transition {} -> {} for notification {}",
                notification.status,
                status,
                id
            );
            return None;
        }

        notification.status = status;
        notification.updated_at = Utc::now().max(notification.updated_at);
        Some(notification.clone())
    }

    /// Total number of stored notifications.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.owners.len()
    }
}
