//! Delivery queue with a delayed retry lane and dead-lettering.
//!
//! `RetryQueue` owns the retry policy and the consumer task; the actual
//! storage of envelopes is delegated to a [`QueueTransport`]. Transports
//! implement three lanes:
//!
//! - **main**: envelopes ready for immediate processing, FIFO.
//! - **retry**: failed envelopes waiting out a fixed delay. The transport
//!   moves them back to main on its own once the delay has elapsed.
//! - **dead**: envelopes that exhausted their retries or failed permanently.
//!
//! An envelope is claimed by exactly one attempt at a time. It stays claimed
//! until the consumer settles it. If settling fails the claim is released back
//! to main, and a crash between delivery and acknowledgment results in a
//! redelivery (at-least-once).

pub mod memory;
pub mod offline;
pub mod sqlite;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::db::Notification;
use crate::error::{AppError, AppResult};

pub use memory::MemoryTransport;
pub use offline::OfflineTransport;
pub use sqlite::SqliteTransport;

/// Unit of transport through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEnvelope {
    pub notification: Notification,
    pub retry_count: u32,
}

impl QueueEnvelope {
    pub fn new(notification: Notification) -> Self {
        Self {
            notification,
            retry_count: 0,
        }
    }

    /// The envelope to place in the retry lane after a failed attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            notification: self.notification.clone(),
            retry_count: self.retry_count.saturating_add(1),
        }
    }
}

/// An envelope claimed from the main lane, identified by its transport id.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub envelope: QueueEnvelope,
}

/// Lane names derived from the configured queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLanes {
    pub main: String,
    pub retry: String,
    pub dead: String,
}

impl QueueLanes {
    pub fn new(name: &str) -> Self {
        Self {
            main: name.to_string(),
            retry: format!("{}-retry", name),
            dead: format!("{}-dead", name),
        }
    }
}

/// Number of envelopes per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Waiting in the main lane.
    pub ready: u64,
    /// Claimed by the consumer and not yet acknowledged.
    pub in_flight: u64,
    /// Waiting out the retry delay.
    pub delayed: u64,
    pub dead: u64,
}

/// Storage backend for the queue lanes.
#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether the transport can accept and hand out work at all.
    fn is_connected(&self) -> bool {
        true
    }

    /// Durably append an envelope to the main lane.
    async fn publish(&self, envelope: &QueueEnvelope) -> AppResult<()>;

    /// Claim the next ready envelope of the main lane, if any.
    async fn receive(&self) -> AppResult<Option<Delivery>>;

    /// Remove a claimed envelope permanently.
    async fn ack(&self, delivery: &Delivery) -> AppResult<()>;

    /// Move a claimed envelope into the retry lane, replacing it with `next`.
    ///
    /// Must be atomic with respect to the main lane: after this returns the
    /// envelope is no longer claimable from main until its delay has elapsed.
    async fn defer(&self, delivery: &Delivery, next: &QueueEnvelope, error: &str) -> AppResult<()>;

    /// Move a claimed envelope into the dead lane.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> AppResult<()>;

    /// Give up a claim without settling it; the envelope is ready again as is.
    async fn release(&self, delivery: &Delivery) -> AppResult<()>;

    async fn stats(&self) -> AppResult<QueueStats>;

    /// Release the underlying connection. Must tolerate repeated calls.
    async fn close(&self);
}

/// Callback invoked by the consumer for each dequeued notification.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Attempt delivery once. An `Err` hands the envelope to the retry policy.
    async fn handle(&self, notification: &Notification) -> AppResult<()>;

    /// Called after the envelope was moved to the dead lane.
    async fn on_dead_letter(&self, notification: &Notification, error: &AppError);
}

/// What to do with an envelope after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    Retry(QueueEnvelope),
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Redeliveries allowed after the first failed attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn disposition(&self, envelope: &QueueEnvelope, outcome: &AppResult<()>) -> Disposition {
        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if !e.is_retryable() => Disposition::DeadLetter,
            Err(_) if envelope.retry_count < self.max_retries => {
                Disposition::Retry(envelope.next_attempt())
            }
            Err(_) => Disposition::DeadLetter,
        }
    }

    /// Upper bound on handler invocations for one notification.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    /// Sleep between polls when the main lane is empty.
    pub poll_interval: Duration,
    /// Maximum number of envelopes handled at once.
    pub concurrency: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            concurrency: 10,
        }
    }
}

pub struct RetryQueue {
    transport: Arc<dyn QueueTransport>,
    policy: RetryPolicy,
    options: ConsumerOptions,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RetryQueue {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        policy: RetryPolicy,
        options: ConsumerOptions,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            transport,
            policy,
            options,
            closed: AtomicBool::new(false),
            stop,
            consumer: Mutex::new(None),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether enqueued work reaches the transport.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.transport.is_connected()
    }

    /// Wrap `notification` in a fresh envelope and append it to the main lane.
    pub async fn enqueue(&self, notification: Notification) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::QueueUnavailable("queue is closed".to_string()));
        }

        let id = notification.id;
        let envelope = QueueEnvelope::new(notification);
        self.transport
            .publish(&envelope)
            .await
            .map_err(|e| match e {
                AppError::QueueUnavailable(_) => e,
                other => AppError::QueueUnavailable(other.to_string()),
            })?;

        tracing::info!(
            "Enqueued notification {} on {} transport",
            id,
            self.transport.name()
        );
        Ok(())
    }

    /// Register `handler` and start the background consumer task.
    pub async fn consume(&self, handler: Arc<dyn EnvelopeHandler>) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::QueueUnavailable("queue is closed".to_string()));
        }
        if !self.transport.is_connected() {
            return Err(AppError::QueueUnavailable(format!(
                "{} transport is not connected",
                self.transport.name()
            )));
        }

        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Err(AppError::QueueUnavailable(
                "a consumer is already registered".to_string(),
            ));
        }

        let worker = Consumer {
            transport: self.transport.clone(),
            policy: self.policy,
            options: self.options,
            handler,
        };
        *consumer = Some(tokio::spawn(worker.run(self.stop.subscribe())));
        Ok(())
    }

    pub async fn stats(&self) -> AppResult<QueueStats> {
        self.transport.stats().await
    }

    /// Stop consuming, wait for in-flight envelopes to settle, and release
    /// the transport. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop.send_replace(true);

        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Queue consumer task ended abnormally: {:?}", e);
            }
        }

        self.transport.close().await;
        tracing::info!("Notification queue closed");
    }
}

struct Consumer {
    transport: Arc<dyn QueueTransport>,
    policy: RetryPolicy,
    options: ConsumerOptions,
    handler: Arc<dyn EnvelopeHandler>,
}

impl Consumer {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        let error_backoff = self.options.poll_interval.max(Duration::from_secs(1));

        tracing::info!(
            "Notification consumer started (transport={}, concurrency={}, max_retries={})",
            self.transport.name(),
            self.options.concurrency,
            self.policy.max_retries
        );

        loop {
            while let Some(res) = in_flight.try_join_next() {
                if let Err(e) = res {
                    tracing::warn!("Notification handler task failed: {:?}", e);
                }
            }

            if *stop.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = stop.changed() => break,
            };

            let idle = match self.transport.receive().await {
                Ok(Some(delivery)) => {
                    let transport = self.transport.clone();
                    let handler = self.handler.clone();
                    let policy = self.policy;
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process_delivery(transport.as_ref(), policy, handler.as_ref(), delivery)
                            .await;
                    });
                    continue;
                }
                Ok(None) => self.options.poll_interval,
                Err(e) => {
                    tracing::warn!("Failed to receive from notification queue: {}", e);
                    error_backoff
                }
            };

            drop(permit);
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(
                "Waiting for {} in-flight notification(s) before stopping",
                in_flight.len()
            );
        }
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                tracing::warn!("Notification handler task failed: {:?}", e);
            }
        }

        tracing::info!("Notification consumer stopped");
    }
}

/// Run one attempt for a claimed envelope and settle it with the transport.
///
/// Transport failures while settling are logged and leave the envelope
/// claimed; it is released again when the transport reopens.
async fn process_delivery(
    transport: &dyn QueueTransport,
    policy: RetryPolicy,
    handler: &dyn EnvelopeHandler,
    delivery: Delivery,
) {
    let notification = &delivery.envelope.notification;
    let attempt = delivery.envelope.retry_count.saturating_add(1);
    let outcome = handler.handle(notification).await;

    match policy.disposition(&delivery.envelope, &outcome) {
        Disposition::Ack => {
            if let Err(e) = transport.ack(&delivery).await {
                tracing::warn!("Failed to ack notification {}: {}", notification.id, e);
            }
        }
        Disposition::Retry(next) => {
            let error = outcome.err().map(|e| e.to_string()).unwrap_or_default();
            match transport.defer(&delivery, &next, &error).await {
                Ok(()) => tracing::warn!(
                    "Notification {} failed on attempt {}/{} and was moved to the retry lane: {}",
                    notification.id,
                    attempt,
                    policy.max_attempts(),
                    error
                ),
                Err(e) => {
                    tracing::warn!(
                        "Failed to schedule retry for notification {}: {}",
                        notification.id,
                        e
                    );
                    release_claim(transport, &delivery).await;
                }
            }
        }
        Disposition::DeadLetter => {
            let Err(error) = outcome else {
                return;
            };
            if let Err(e) = transport.dead_letter(&delivery, &error.to_string()).await {
                tracing::warn!(
                    "Failed to dead-letter notification {}: {}",
                    notification.id,
                    e
                );
                release_claim(transport, &delivery).await;
                return;
            }
            tracing::warn!(
                "Notification {} moved to the dead lane after {} attempt(s): {}",
                notification.id,
                attempt,
                error
            );
            handler.on_dead_letter(notification, &error).await;
        }
    }
}

/// Hand an unsettled claim back to the main lane so it is attempted again.
async fn release_claim(transport: &dyn QueueTransport, delivery: &Delivery) {
    let id = delivery.envelope.notification.id;
    match transport.release(delivery).await {
        Ok(()) => tracing::info!("Notification {} returned to the main lane", id),
        Err(e) => tracing::error!(
            "Notification {} stays claimed until the transport is reopened: {}",
            id,
            e
        ),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{ChannelType, NotificationStatus};
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    pub(crate) fn make_notification(user_id: &str) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            channel: ChannelType::InApp,
            title: "Hi".to_string(),
            message: "Body".to_string(),
            metadata: Map::new(),
            status: NotificationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Poll `check` until it returns true or two seconds pass.
    pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[derive(Default)]
    struct ScriptedHandler {
        /// Number of initial attempts that fail.
        failures: u32,
        permanent: bool,
        attempts: AtomicU32,
        dead: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl EnvelopeHandler for ScriptedHandler {
        async fn handle(&self, _notification: &Notification) -> AppResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(AppError::UnsupportedChannel("PUSH".to_string()));
            }
            if attempt < self.failures {
                return Err(AppError::Delivery("backend down".to_string()));
            }
            Ok(())
        }

        async fn on_dead_letter(&self, notification: &Notification, _error: &AppError) {
            self.dead.lock().await.push(notification.id);
        }
    }

    /// Handler that takes a while to finish each delivery.
    #[derive(Default)]
    struct SlowHandler {
        started: AtomicU32,
        finished: AtomicU32,
    }

    #[async_trait]
    impl EnvelopeHandler for SlowHandler {
        async fn handle(&self, _notification: &Notification) -> AppResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_dead_letter(&self, _notification: &Notification, _error: &AppError) {}
    }

    /// Memory transport whose retry lane cannot be written.
    struct RetryLaneDown {
        inner: MemoryTransport,
        releases: AtomicU32,
    }

    #[async_trait]
    impl QueueTransport for RetryLaneDown {
        fn name(&self) -> &'static str {
            "retry-lane-down"
        }

        async fn publish(&self, envelope: &QueueEnvelope) -> AppResult<()> {
            self.inner.publish(envelope).await
        }

        async fn receive(&self) -> AppResult<Option<Delivery>> {
            self.inner.receive().await
        }

        async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
            self.inner.ack(delivery).await
        }

        async fn defer(&self, _delivery: &Delivery, _next: &QueueEnvelope, _error: &str) -> AppResult<()> {
            Err(AppError::QueueUnavailable("retry lane unavailable".to_string()))
        }

        async fn dead_letter(&self, delivery: &Delivery, error: &str) -> AppResult<()> {
            self.inner.dead_letter(delivery, error).await
        }

        async fn release(&self, delivery: &Delivery) -> AppResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(delivery).await
        }

        async fn stats(&self) -> AppResult<QueueStats> {
            self.inner.stats().await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    fn fast_queue(transport: Arc<dyn QueueTransport>) -> RetryQueue {
        RetryQueue::new(
            transport,
            RetryPolicy::new(3),
            ConsumerOptions {
                poll_interval: Duration::from_millis(5),
                concurrency: 4,
            },
        )
    }

    #[test]
    fn disposition_follows_retry_budget() {
        let policy = RetryPolicy::new(3);
        let mut envelope = QueueEnvelope::new(make_notification("u1"));
        let failure: AppResult<()> = Err(AppError::Delivery("boom".to_string()));

        assert_eq!(policy.disposition(&envelope, &Ok(())), Disposition::Ack);

        match policy.disposition(&envelope, &failure) {
            Disposition::Retry(next) => assert_eq!(next.retry_count, 1),
            other => panic!("expected retry, got {:?}", other),
        }

        envelope.retry_count = 2;
        match policy.disposition(&envelope, &failure) {
            Disposition::Retry(next) => assert_eq!(next.retry_count, 3),
            other => panic!("expected retry, got {:?}", other),
        }

        envelope.retry_count = 3;
        assert_eq!(
            policy.disposition(&envelope, &failure),
            Disposition::DeadLetter
        );
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn unbounded_retry_budget_does_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX);
        assert_eq!(policy.max_attempts(), u32::MAX);

        let mut envelope = QueueEnvelope::new(make_notification("u1"));
        envelope.retry_count = u32::MAX;
        let failure: AppResult<()> = Err(AppError::Delivery("boom".to_string()));
        assert_eq!(
            policy.disposition(&envelope, &failure),
            Disposition::DeadLetter
        );
        assert_eq!(envelope.next_attempt().retry_count, u32::MAX);
    }

    #[test]
    fn permanent_errors_skip_the_retry_lane() {
        let policy = RetryPolicy::default();
        let envelope = QueueEnvelope::new(make_notification("u1"));
        let failure: AppResult<()> = Err(AppError::UnsupportedChannel("PUSH".to_string()));
        assert_eq!(
            policy.disposition(&envelope, &failure),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn envelope_round_trips_with_retry_count_field() {
        let envelope = QueueEnvelope::new(make_notification("u1")).next_attempt();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["retryCount"], 1);
        let back: QueueEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[tokio::test]
    async fn successful_delivery_is_acked_once() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(5)));
        let queue = fast_queue(transport.clone());
        let handler = Arc::new(ScriptedHandler::default());

        queue.consume(handler.clone()).await.unwrap();
        queue.enqueue(make_notification("u1")).await.unwrap();

        let (t, h) = (&transport, &handler);
        assert!(
            eventually(|| async move {
                t.stats().await.unwrap() == QueueStats::default()
                    && h.attempts.load(Ordering::SeqCst) == 1
            })
            .await
        );
        queue.close().await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
        assert!(handler.dead.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered_through_retry_lane() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(5)));
        let queue = fast_queue(transport.clone());
        let handler = Arc::new(ScriptedHandler {
            failures: 2,
            ..Default::default()
        });

        queue.consume(handler.clone()).await.unwrap();
        queue.enqueue(make_notification("u1")).await.unwrap();

        let (t, h) = (&transport, &handler);
        assert!(eventually(|| async move { h.attempts.load(Ordering::SeqCst) == 3 }).await);
        assert!(eventually(|| async move { t.stats().await.unwrap() == QueueStats::default() }).await);
        queue.close().await;

        assert!(handler.dead.lock().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_after_max_attempts() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(5)));
        let queue = fast_queue(transport.clone());
        let handler = Arc::new(ScriptedHandler {
            failures: u32::MAX,
            ..Default::default()
        });
        let notification = make_notification("u1");
        let id = notification.id;

        queue.consume(handler.clone()).await.unwrap();
        queue.enqueue(notification).await.unwrap();

        let h = &handler;
        assert!(eventually(|| async move { h.dead.lock().await.len() == 1 }).await);
        // Give a stray redelivery the chance to show up before asserting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close().await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*handler.dead.lock().await, vec![id]);
        let stats = transport.stats().await.unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.ready + stats.delayed + stats.in_flight, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered_immediately() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(5)));
        let queue = fast_queue(transport.clone());
        let handler = Arc::new(ScriptedHandler {
            permanent: true,
            ..Default::default()
        });

        queue.consume(handler.clone()).await.unwrap();
        queue.enqueue(make_notification("u1")).await.unwrap();

        let h = &handler;
        assert!(eventually(|| async move { h.dead.lock().await.len() == 1 }).await);
        queue.close().await;
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_waits_for_the_delivery_in_progress() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(5)));
        let queue = fast_queue(transport.clone());
        let handler = Arc::new(SlowHandler::default());

        queue.consume(handler.clone()).await.unwrap();
        queue.enqueue(make_notification("u1")).await.unwrap();

        let (t, h) = (&transport, &handler);
        assert!(
            eventually(|| async move {
                h.started.load(Ordering::SeqCst) == 1 && t.stats().await.unwrap().in_flight == 1
            })
            .await
        );
        assert_eq!(handler.finished.load(Ordering::SeqCst), 0);

        queue.close().await;

        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn failed_retry_scheduling_releases_the_claim() {
        let transport = Arc::new(RetryLaneDown {
            inner: MemoryTransport::new(Duration::from_millis(5)),
            releases: AtomicU32::new(0),
        });
        let queue = fast_queue(transport.clone());
        let handler = Arc::new(ScriptedHandler {
            failures: 1,
            ..Default::default()
        });

        queue.consume(handler.clone()).await.unwrap();
        queue.enqueue(make_notification("u1")).await.unwrap();

        let (t, h) = (&transport, &handler);
        assert!(
            eventually(|| async move {
                h.attempts.load(Ordering::SeqCst) == 2
                    && t.stats().await.unwrap() == QueueStats::default()
            })
            .await
        );
        queue.close().await;

        assert_eq!(transport.releases.load(Ordering::SeqCst), 1);
        assert!(handler.dead.lock().await.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_work() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(5)));
        let queue = fast_queue(transport);
        queue
            .consume(Arc::new(ScriptedHandler::default()))
            .await
            .unwrap();

        queue.close().await;
        queue.close().await;

        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(make_notification("u1")).await,
            Err(AppError::QueueUnavailable(_))
        ));
        assert!(matches!(
            queue.consume(Arc::new(ScriptedHandler::default())).await,
            Err(AppError::QueueUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let queue = fast_queue(Arc::new(MemoryTransport::new(Duration::from_millis(5))));
        queue
            .consume(Arc::new(ScriptedHandler::default()))
            .await
            .unwrap();
        assert!(queue
            .consume(Arc::new(ScriptedHandler::default()))
            .await
            .is_err());
        queue.close().await;
    }

    #[tokio::test]
    async fn offline_transport_reports_queue_unavailable() {
        let queue = fast_queue(Arc::new(OfflineTransport::new("broker unreachable")));

        assert!(matches!(
            queue.enqueue(make_notification("u1")).await,
            Err(AppError::QueueUnavailable(_))
        ));
        assert!(matches!(
            queue.consume(Arc::new(ScriptedHandler::default())).await,
            Err(AppError::QueueUnavailable(_))
        ));
        queue.close().await;
    }
}
