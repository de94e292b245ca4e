//! Event handler doubles and an in-memory dead-letter store.
//!
//! - [`CaptureHandler`]: records every delivered event, with a polling
//!   helper for asserting on asynchronous delivery.
//! - [`FlakyHandler`]: fails a configured number of deliveries before
//!   succeeding — for at-least-once and retry tests.
//! - [`FailingHandler`]: always fails, retryably or fatally — for
//!   dead-letter tests.
//! - [`InMemoryDeadLetterStore`]: the dead-letter seam, in memory.

#![allow(clippy::missing_panics_doc)] // Lock poisoning is absorbed, not propagated

use book_library_core::event::DomainEvent;
use book_library_core::event_bus::{
    DeadLetterError, DeadLetterStore, DeadLetteredEvent, EventHandler, HandlerError,
};
use book_library_core::stream::{AggregateId, Version};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handler that records every delivered event.
#[derive(Clone)]
pub struct CaptureHandler {
    name: &'static str,
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl CaptureHandler {
    /// Create a named capture handler.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of everything delivered so far.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        self.lock().clone()
    }

    /// Number of deliveries so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Poll until at least `n` events arrived or `timeout` elapses.
    ///
    /// Returns whether the target was reached — assert on the result.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count() >= n
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DomainEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventHandler for CaptureHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.lock().push(event);
            Ok(())
        })
    }
}

/// Handler that fails the first `failures` deliveries, then captures.
#[derive(Clone)]
pub struct FlakyHandler {
    remaining: Arc<AtomicU32>,
    capture: CaptureHandler,
}

impl FlakyHandler {
    /// Create a handler that fails `failures` times before succeeding.
    #[must_use]
    pub fn new(name: &'static str, failures: u32) -> Self {
        Self {
            remaining: Arc::new(AtomicU32::new(failures)),
            capture: CaptureHandler::new(name),
        }
    }

    /// The underlying capture handler, for assertions.
    #[must_use]
    pub const fn capture(&self) -> &CaptureHandler {
        &self.capture
    }
}

impl EventHandler for FlakyHandler {
    fn name(&self) -> &'static str {
        self.capture.name
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(HandlerError::Retryable("injected transient failure".to_string()));
            }
            self.capture.lock().push(event);
            Ok(())
        })
    }
}

/// Handler that always fails.
pub struct FailingHandler {
    name: &'static str,
    fatal: bool,
    attempts: Arc<AtomicU32>,
}

impl FailingHandler {
    /// A handler failing retryably on every delivery.
    #[must_use]
    pub fn retryable(name: &'static str) -> Self {
        Self {
            name,
            fatal: false,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A handler failing fatally on every delivery.
    #[must_use]
    pub fn fatal(name: &'static str) -> Self {
        Self {
            name,
            fatal: true,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Total deliveries attempted against this handler.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventHandler for FailingHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(
        &self,
        _event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                Err(HandlerError::Fatal("injected fatal failure".to_string()))
            } else {
                Err(HandlerError::Retryable("injected failure".to_string()))
            }
        })
    }
}

/// In-memory dead-letter store.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<Mutex<Vec<DeadLetteredEvent>>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll until at least `n` entries are parked or `timeout` elapses.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.lock().len() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.lock().len() >= n
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeadLetteredEvent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn add(
        &self,
        entry: DeadLetteredEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.lock().push(entry);
            Ok(())
        })
    }

    fn list_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetteredEvent>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.lock().iter().take(limit).cloned().collect()) })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().len() as u64) })
    }

    fn mark_resolved(
        &self,
        event_type: &str,
        aggregate_id: &AggregateId,
        version: Version,
        _resolved_by: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let event_type = event_type.to_string();
        let aggregate_id = aggregate_id.clone();
        Box::pin(async move {
            self.lock().retain(|entry| {
                !(entry.event.event_type == event_type
                    && entry.event.aggregate_id == aggregate_id
                    && entry.event.version == version)
            });
            Ok(())
        })
    }
}
