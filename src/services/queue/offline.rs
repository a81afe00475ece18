//! Placeholder transport used when the queue could not be reached at startup.
//!
//! Every operation fails with `QueueUnavailable`, so notifications are
//! delivered through the inline fallback instead.

use async_trait::async_trait;

use super::{Delivery, QueueEnvelope, QueueStats, QueueTransport};
use crate::error::{AppError, AppResult};

pub struct OfflineTransport {
    reason: String,
}

impl OfflineTransport {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> AppResult<T> {
        Err(AppError::QueueUnavailable(self.reason.clone()))
    }
}

#[async_trait]
impl QueueTransport for OfflineTransport {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn publish(&self, _envelope: &QueueEnvelope) -> AppResult<()> {
        self.unavailable()
    }

    async fn receive(&self) -> AppResult<Option<Delivery>> {
        self.unavailable()
    }

    async fn ack(&self, _delivery: &Delivery) -> AppResult<()> {
        self.unavailable()
    }

    async fn defer(&self, _delivery: &Delivery, _next: &QueueEnvelope, _error: &str) -> AppResult<()> {
        self.unavailable()
    }

    async fn dead_letter(&self, _delivery: &Delivery, _error: &str) -> AppResult<()> {
        self.unavailable()
    }

    async fn release(&self, _delivery: &Delivery) -> AppResult<()> {
        self.unavailable()
    }

    async fn stats(&self) -> AppResult<QueueStats> {
        Ok(QueueStats::default())
    }

    async fn close(&self) {}
}
