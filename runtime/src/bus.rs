//! In-process event bus with per-aggregate ordered, at-least-once delivery.
//!
//! # Dispatch model
//!
//! Each `(subscription, aggregate_id)` pair gets its own bounded queue
//! drained by one worker task, so events for a given aggregate reach a
//! subscriber in version order while different aggregates proceed
//! concurrently. Bounded queues give back-pressure: `publish` waits when
//! a subscriber falls behind. No global ordering is promised.
//!
//! # Failure handling
//!
//! A failing handler is retried with the platform backoff policy
//! (retryable errors only). Once attempts are exhausted — or immediately
//! for a fatal error such as an undecodable payload — the delivery is
//! parked in the [`DeadLetterStore`] and a derived `<SourceType>_FAILED`
//! event is published carrying the source's correlation id, the error
//! message, and a code. Failure events are never derived from other
//! failure events.
//!
//! Idle workers retire after a quiet period so the worker map does not
//! grow with the number of aggregates ever seen.

use crate::retry::RetryPolicy;
use book_library_core::environment::{Clock, SystemClock};
use book_library_core::event::DomainEvent;
use book_library_core::event_bus::{
    DeadLetterStore, DeadLetteredEvent, EventBus, EventBusError, EventHandler, HandlerError,
    SubscriptionId,
};
use book_library_core::stream::AggregateId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

type WorkerKey = (u64, AggregateId);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// Typed pub/sub bus dispatching through per-key serialized worker queues.
///
/// Cheap to clone; all clones share the same subscriber registry and
/// workers.
#[derive(Clone)]
pub struct InProcessEventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    workers: Mutex<HashMap<WorkerKey, mpsc::Sender<DomainEvent>>>,
    next_subscription: AtomicU64,
    retry_policy: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    queue_capacity: usize,
    idle_timeout: Duration,
}

/// Builder for [`InProcessEventBus`].
pub struct InProcessEventBusBuilder {
    retry_policy: RetryPolicy,
    dead_letters: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    queue_capacity: usize,
    idle_timeout: Duration,
}

impl InProcessEventBusBuilder {
    /// Override the delivery retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the clock (tests use a fixed clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the per-key queue capacity (back-pressure bound).
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set how long an idle worker lingers before retiring.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Build the bus.
    #[must_use]
    pub fn build(self) -> InProcessEventBus {
        InProcessEventBus {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                retry_policy: self.retry_policy,
                dead_letters: self.dead_letters,
                clock: self.clock,
                queue_capacity: self.queue_capacity,
                idle_timeout: self.idle_timeout,
            }),
        }
    }
}

impl InProcessEventBus {
    /// Start building a bus around the given dead-letter store.
    #[must_use]
    pub fn builder(dead_letters: Arc<dyn DeadLetterStore>) -> InProcessEventBusBuilder {
        InProcessEventBusBuilder {
            retry_policy: RetryPolicy::default(),
            dead_letters,
            clock: Arc::new(SystemClock),
            queue_capacity: 256,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl BusInner {
    fn subscriptions_read(&self) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    fn subscribers_for(&self, event_type: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn workers_lock(&self) -> MutexGuard<'_, HashMap<WorkerKey, mpsc::Sender<DomainEvent>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch or spawn the serialized worker for `(subscription, aggregate)`.
    fn worker_sender(
        self: &Arc<Self>,
        key: &WorkerKey,
        subscription: &Subscription,
    ) -> mpsc::Sender<DomainEvent> {
        let mut workers = self.workers_lock();
        if let Some(sender) = workers.get(key) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        workers.insert(key.clone(), tx.clone());
        drop(workers);

        let inner = Arc::clone(self);
        let handler = Arc::clone(&subscription.handler);
        let key = key.clone();
        tokio::spawn(worker_loop(inner, key, rx, handler));

        tx
    }

    async fn do_publish(self: Arc<Self>, event: DomainEvent) -> Result<(), EventBusError> {
        let subscribers = self.subscribers_for(&event.event_type);
        metrics::counter!("event_bus.published", "event_type" => event.event_type.clone())
            .increment(1);
        tracing::debug!(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            subscribers = subscribers.len(),
            "Publishing event"
        );

        for subscription in subscribers {
            let key = (subscription.id.value(), event.aggregate_id.clone());
            let mut sender = self.worker_sender(&key, &subscription);

            if sender.send(event.clone()).await.is_err() {
                // The worker retired between lookup and send; replace it.
                self.workers_lock().remove(&key);
                sender = self.worker_sender(&key, &subscription);
                sender.send(event.clone()).await.map_err(|_| {
                    EventBusError::PublishFailed {
                        event_type: event.event_type.clone(),
                        reason: "subscriber queue closed".to_string(),
                    }
                })?;
            }
        }

        Ok(())
    }

    /// Type-erased publish, used from worker tasks to emit derived
    /// failure events without creating a recursive future type.
    fn publish_erased(
        self: &Arc<Self>,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send>> {
        let inner = Arc::clone(self);
        Box::pin(inner.do_publish(event))
    }
}

async fn worker_loop(
    inner: Arc<BusInner>,
    key: WorkerKey,
    mut rx: mpsc::Receiver<DomainEvent>,
    handler: Arc<dyn EventHandler>,
) {
    loop {
        match tokio::time::timeout(inner.idle_timeout, rx.recv()).await {
            Ok(Some(event)) => deliver(&inner, &handler, event).await,
            Ok(None) => break,
            Err(_idle) => {
                // Retire: drop our map entry, then drain stragglers that
                // raced against the removal.
                inner.workers_lock().remove(&key);
                while let Some(event) = rx.recv().await {
                    deliver(&inner, &handler, event).await;
                }
                break;
            }
        }
    }
}

async fn deliver(inner: &Arc<BusInner>, handler: &Arc<dyn EventHandler>, event: DomainEvent) {
    let policy = &inner.retry_policy;
    let mut attempt: u32 = 1;

    loop {
        match handler.handle(event.clone()).await {
            Ok(()) => {
                metrics::counter!("event_bus.delivered", "handler" => handler.name()).increment(1);
                return;
            }
            Err(err) => {
                if err.is_retryable() && attempt < policy.max_attempts {
                    let delay = policy.jittered_delay_for_retry(attempt - 1);
                    tracing::warn!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Handler failed, retrying delivery"
                    );
                    metrics::counter!("event_bus.delivery_retries", "handler" => handler.name())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                park_failed_delivery(inner, handler.name(), &event, &err, attempt).await;
                return;
            }
        }
    }
}

async fn park_failed_delivery(
    inner: &Arc<BusInner>,
    subscriber: &str,
    event: &DomainEvent,
    err: &HandlerError,
    attempts: u32,
) {
    let now = inner.clock.now();

    tracing::error!(
        handler = subscriber,
        event_type = %event.event_type,
        aggregate_id = %event.aggregate_id,
        version = %event.version,
        attempts,
        error = %err,
        "Delivery failed permanently, dead-lettering"
    );
    metrics::counter!("event_bus.dead_lettered", "handler" => subscriber.to_string())
        .increment(1);

    let entry = DeadLetteredEvent {
        event: event.clone(),
        subscriber: subscriber.to_string(),
        error: err.to_string(),
        attempts,
        failed_at: now,
    };
    if let Err(store_err) = inner.dead_letters.add(entry).await {
        tracing::error!(error = %store_err, "Failed to record dead-lettered event");
    }

    // Never derive a failure event from a failure event.
    if event.event_type.ends_with("_FAILED") {
        return;
    }
    let code = if err.is_retryable() {
        "INTERNAL_ERROR"
    } else {
        "VALIDATION_ERROR"
    };
    let failure = event.failure_event(&err.to_string(), code, now);
    if let Err(publish_err) = inner.publish_erased(failure).await {
        tracing::error!(error = %publish_err, "Failed to publish derived failure event");
    }
}

impl EventBus for InProcessEventBus {
    fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionId, EventBusError>> + Send + '_>> {
        let event_type = event_type.to_string();
        Box::pin(async move {
            let id = SubscriptionId::new(
                self.inner.next_subscription.fetch_add(1, Ordering::Relaxed),
            );
            self.inner
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(event_type.clone())
                .or_default()
                .push(Subscription {
                    id,
                    handler: Arc::clone(&handler),
                });
            tracing::debug!(event_type = %event_type, subscription = %id, handler = handler.name(), "Subscribed");
            Ok(id)
        })
    }

    fn unsubscribe(
        &self,
        event_type: &str,
        subscription: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let event_type = event_type.to_string();
        Box::pin(async move {
            if let Some(subs) = self
                .inner
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&event_type)
            {
                subs.retain(|s| s.id != subscription);
            }
            self.inner
                .workers_lock()
                .retain(|(sub_id, _), _| *sub_id != subscription.value());
            Ok(())
        })
    }

    fn publish(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(inner.do_publish(event))
    }
}

impl std::fmt::Debug for InProcessEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessEventBus")
            .field("subscriptions", &self.inner.subscriptions_read().len())
            .finish_non_exhaustive()
    }
}
