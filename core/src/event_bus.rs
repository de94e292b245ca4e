//! Event bus abstraction: typed pub/sub with at-least-once delivery.
//!
//! Events flow from the event store (source of truth) through the bus to
//! projection handlers and saga steps. Delivery guarantees:
//!
//! - **At-least-once**: handlers may see the same event twice and must
//!   be idempotent.
//! - **Per-aggregate order**: events for one `aggregate_id` reach each
//!   subscriber in `version` order; dispatch is serialized per key.
//!   No global ordering is promised.
//! - **Dead-lettering**: a handler that keeps failing after retries gets
//!   its event parked in a [`DeadLetterStore`] and a derived
//!   `<SourceType>_FAILED` event published in its place.
//!
//! The production implementation is `InProcessEventBus` in
//! `book-library-runtime`; tests use it directly or the capture helpers
//! in `book-library-testing`.

use crate::event::DomainEvent;
use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to publish an event.
    #[error("Publish failed for '{event_type}': {reason}")]
    PublishFailed {
        /// The event type that failed.
        event_type: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to register or remove a subscription.
    #[error("Subscription failed for '{event_type}': {reason}")]
    SubscriptionFailed {
        /// The event type involved.
        event_type: String,
        /// The reason for failure.
        reason: String,
    },

    /// The bus has shut down and no longer accepts work.
    #[error("Event bus is closed")]
    Closed,
}

/// Error returned by an event handler.
///
/// The bus retries `Retryable` failures with backoff; `Fatal` failures
/// (bad payload, unknown event type) go straight to the dead-letter
/// store — retrying a deterministic failure only burns time.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure; the delivery will be retried with backoff.
    #[error("{0}")]
    Retryable(String),

    /// Deterministic failure; the event is dead-lettered immediately.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    /// Whether the bus should retry this delivery.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// A subscriber callback for one or more event types.
///
/// Handlers must be idempotent: delivery is at-least-once, and replays
/// happen during catch-up and retry. When a handler publishes new events
/// in response to its input, it must derive their metadata with
/// [`crate::event::EventMetadata::caused_by`] so correlation and
/// causation propagate.
pub trait EventHandler: Send + Sync {
    /// Stable handler name, used for logging and dead-letter attribution.
    fn name(&self) -> &'static str;

    /// Process one delivered event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Retryable`] for transient failures and
    /// [`HandlerError::Fatal`] for deterministic ones.
    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

/// Opaque handle identifying one subscription, for `unsubscribe`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Create a subscription id from a raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Typed publish/subscribe bus.
///
/// # Dyn compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the bus can be shared as
/// `Arc<dyn EventBus>` across command handlers, projections, and sagas.
pub trait EventBus: Send + Sync {
    /// Register `handler` for all events of `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if registration fails.
    fn subscribe(
        &self,
        event_type: &str,
        handler: std::sync::Arc<dyn EventHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionId, EventBusError>> + Send + '_>>;

    /// Remove a subscription previously returned by `subscribe`.
    ///
    /// Unsubscribing an unknown id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if removal fails.
    fn unsubscribe(
        &self,
        event_type: &str,
        subscription: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Publish an event to every subscriber of its type.
    ///
    /// Returns once the event is enqueued for all subscribers; handler
    /// execution is asynchronous.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the event cannot be
    /// enqueued.
    fn publish(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;
}

/// A delivery a subscriber could not process after retries.
#[derive(Clone, Debug)]
pub struct DeadLetteredEvent {
    /// The event that failed, as delivered.
    pub event: DomainEvent,

    /// Name of the subscriber that failed.
    pub subscriber: String,

    /// Final error message.
    pub error: String,

    /// Number of delivery attempts made.
    pub attempts: u32,

    /// When the delivery was given up on.
    pub failed_at: DateTime<Utc>,
}

/// Error type for dead-letter store operations.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// Storage backend error.
    #[error("Dead-letter storage error: {0}")]
    Storage(String),
}

/// Persistent record of undeliverable events, keyed by
/// `(event_type, aggregate_id, version)` plus the failing subscriber.
pub trait DeadLetterStore: Send + Sync {
    /// Park a failed delivery.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the write fails.
    fn add(
        &self,
        entry: DeadLetteredEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// List unresolved entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the read fails.
    fn list_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetteredEvent>, DeadLetterError>> + Send + '_>>;

    /// Count unresolved entries (for monitoring).
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the read fails.
    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>>;

    /// Mark an entry resolved after manual reprocessing.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    fn mark_resolved(
        &self,
        event_type: &str,
        aggregate_id: &AggregateId,
        version: Version,
        resolved_by: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_retryability() {
        assert!(HandlerError::Retryable("net down".to_string()).is_retryable());
        assert!(!HandlerError::Fatal("bad payload".to_string()).is_retryable());
    }

    #[test]
    fn subscription_id_display() {
        let id = SubscriptionId::new(7);
        assert_eq!(format!("{id}"), "sub-7");
        assert_eq!(id.value(), 7);
    }
}
