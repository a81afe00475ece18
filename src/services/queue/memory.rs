//! Non-durable queue transport for tests and `memory://` deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Delivery, QueueEnvelope, QueueStats, QueueTransport};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct Lanes {
    main: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    retry: HashMap<String, QueueEnvelope>,
    dead: Vec<(QueueEnvelope, String)>,
}

pub struct MemoryTransport {
    lanes: Arc<Mutex<Lanes>>,
    retry_delay: Duration,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(Lanes::default())),
            retry_delay,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::QueueUnavailable(
                "memory transport is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Envelopes in the dead lane with the error that put them there.
    #[cfg(test)]
    pub async fn dead_letters(&self) -> Vec<(QueueEnvelope, String)> {
        self.lanes.lock().await.dead.clone()
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &QueueEnvelope) -> AppResult<()> {
        self.ensure_open()?;
        self.lanes.lock().await.main.push_back(Delivery {
            id: Uuid::new_v4().to_string(),
            envelope: envelope.clone(),
        });
        Ok(())
    }

    async fn receive(&self) -> AppResult<Option<Delivery>> {
        self.ensure_open()?;
        let mut lanes = self.lanes.lock().await;
        let Some(delivery) = lanes.main.pop_front() else {
            return Ok(None);
        };
        lanes
            .in_flight
            .insert(delivery.id.clone(), delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        self.lanes.lock().await.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, next: &QueueEnvelope, _error: &str) -> AppResult<()> {
        {
            let mut lanes = self.lanes.lock().await;
            if lanes.in_flight.remove(&delivery.id).is_none() {
                return Err(AppError::NotFound(format!("delivery {}", delivery.id)));
            }
            lanes.retry.insert(delivery.id.clone(), next.clone());
        }

        let lanes = self.lanes.clone();
        let id = delivery.id.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut lanes = lanes.lock().await;
            if let Some(envelope) = lanes.retry.remove(&id) {
                lanes.main.push_back(Delivery { id, envelope });
            }
        });

        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> AppResult<()> {
        let mut lanes = self.lanes.lock().await;
        lanes.in_flight.remove(&delivery.id);
        lanes
            .dead
            .push((delivery.envelope.clone(), error.to_string()));
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> AppResult<()> {
        let mut lanes = self.lanes.lock().await;
        let Some(claimed) = lanes.in_flight.remove(&delivery.id) else {
            return Err(AppError::NotFound(format!("delivery {}", delivery.id)));
        };
        lanes.main.push_front(claimed);
        Ok(())
    }

    async fn stats(&self) -> AppResult<QueueStats> {
        let lanes = self.lanes.lock().await;
        Ok(QueueStats {
            ready: lanes.main.len() as u64,
            in_flight: lanes.in_flight.len() as u64,
            delayed: lanes.retry.len() as u64,
            dead: lanes.dead.len() as u64,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
