//! In-memory event store for fast, deterministic testing.
//!
//! Implements the exact append semantics of the production store:
//! optimistic concurrency against the stream's current version,
//! contiguous per-aggregate versions, a block-allocated atomic global
//! counter that never reuses values (failed appends leave gaps), and
//! `stored_at` stamping.

#![allow(clippy::missing_panics_doc)] // Lock poisoning is absorbed, not propagated

use book_library_core::event::DomainEvent;
use book_library_core::event_store::{EventStore, EventStoreError};
use book_library_core::stream::{AggregateId, GlobalVersion, Version};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory event store mirroring the Postgres store's semantics.
///
/// Cheap to clone; clones share the same streams and counter.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<Mutex<HashMap<AggregateId, Vec<DomainEvent>>>>,
    global: Arc<AtomicU64>,
    inject_failures: Arc<AtomicU32>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with `EVENT_SAVE_FAILED`.
    ///
    /// Global versions allocated by those appends are burned, matching
    /// the production counter's never-reuse behavior.
    pub fn inject_append_failures(&self, n: u32) {
        self.inject_failures.store(n, Ordering::SeqCst);
    }

    /// Total number of stored events across all streams.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Current value of the global version counter.
    #[must_use]
    pub fn global_version(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Drop all streams (test isolation). The global counter keeps going.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AggregateId, Vec<DomainEvent>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventStore for InMemoryEventStore {
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if aggregate_id.as_str().is_empty() {
                return Err(EventStoreError::InvalidAggregateId(
                    "empty aggregate id".to_string(),
                ));
            }
            if events.is_empty() {
                return Ok(Vec::new());
            }

            // Counter allocation happens before the write and is never
            // rolled back, like the production store.
            let n = events.len() as u64;
            let first_global = self.global.fetch_add(n, Ordering::SeqCst) + 1;

            if self
                .inject_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(EventStoreError::SaveFailed("injected failure".to_string()));
            }

            let mut streams = self.lock();
            let stream = streams.entry(aggregate_id.clone()).or_default();
            let actual = Version::new(stream.len() as u64);
            if actual != expected_version {
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                });
            }

            let stored_at = Utc::now();
            let mut stored = Vec::with_capacity(events.len());
            for (i, mut event) in events.into_iter().enumerate() {
                event.version = expected_version + (i as u64 + 1);
                event.global_version = Some(GlobalVersion::new(first_global + i as u64));
                event.metadata.stored_at = Some(stored_at);
                event.aggregate_id = aggregate_id.clone();
                stream.push(event.clone());
                stored.push(event);
            }
            Ok(stored)
        })
    }

    fn load_events(
        &self,
        aggregate_id: AggregateId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if aggregate_id.as_str().is_empty() {
                return Err(EventStoreError::InvalidAggregateId(
                    "empty aggregate id".to_string(),
                ));
            }
            Ok(self.lock().get(&aggregate_id).cloned().unwrap_or_default())
        })
    }

    fn find_aggregate_id(
        &self,
        event_type: &str,
        field: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AggregateId>, EventStoreError>> + Send + '_>>
    {
        let event_type = event_type.to_string();
        let field = field.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let streams = self.lock();
            let mut best: Option<(GlobalVersion, AggregateId)> = None;
            for (id, events) in streams.iter() {
                for event in events {
                    if event.event_type == event_type
                        && event.payload[field.as_str()] == serde_json::Value::String(value.clone())
                    {
                        let global = event
                            .global_version
                            .unwrap_or(GlobalVersion::new(u64::MAX));
                        if best.as_ref().is_none_or(|(g, _)| global < *g) {
                            best = Some((global, id.clone()));
                        }
                    }
                }
            }
            Ok(best.map(|(_, id)| id))
        })
    }
}
