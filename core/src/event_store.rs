//! Event store trait and failure taxonomy.
//!
//! The event store is an append-only, per-aggregate versioned log with
//! optimistic concurrency and a store-wide ordering counter.
//!
//! # Append semantics
//!
//! Given `expected_version = v`, the store verifies the highest stored
//! version for the aggregate equals `v`, assigns `v+1..v+n` to the
//! supplied events, reserves a contiguous block of `n` global versions
//! from an atomic counter, stamps `metadata.stored_at`, and performs a
//! single atomic batch write. A duplicate `(aggregate_id, version)` is a
//! concurrency failure; any insert failure aborts the whole batch.
//! Global versions are never reused, even for failed appends, so
//! consumers must tolerate gaps.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `book-library-postgres`): production
//! - `InMemoryEventStore` (in `book-library-testing`): fast, deterministic
//!
//! # Dyn compatibility
//!
//! The trait returns `Pin<Box<dyn Future>>` instead of using `async fn`
//! so it can be used as a trait object (`Arc<dyn EventStore>`) by
//! command handlers, projections, and the saga.

use crate::aggregate::RehydrationError;
use crate::event::DomainEvent;
use crate::stream::{AggregateId, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
///
/// Each variant maps onto one code of the platform error taxonomy via
/// [`EventStoreError::code`].
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The supplied aggregate id is empty or malformed.
    #[error("Invalid aggregate ID: {0}")]
    InvalidAggregateId(String),

    /// Optimistic concurrency conflict: expected version doesn't match
    /// the stream's current version, or the batch collided with a
    /// concurrent writer on `(aggregate_id, version)`.
    #[error("Concurrency conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate where the conflict occurred.
        aggregate_id: AggregateId,
        /// The version the caller expected the stream to be at.
        expected: Version,
        /// The stream's actual version at check time.
        actual: Version,
    },

    /// The batch itself contains two events landing on the same version.
    #[error("Duplicate event at {aggregate_id} version {version}")]
    DuplicateEvent {
        /// The aggregate carrying the duplicate.
        aggregate_id: AggregateId,
        /// The colliding version.
        version: Version,
    },

    /// The batch write failed for a non-concurrency reason.
    #[error("Failed to save events: {0}")]
    SaveFailed(String),

    /// An event read failed.
    #[error("Failed to look up events: {0}")]
    LookupFailed(String),

    /// Replaying a stream into an aggregate failed.
    #[error("Rehydration failed: {0}")]
    Rehydration(#[from] RehydrationError),
}

impl EventStoreError {
    /// The taxonomy code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidAggregateId(_) => "INVALID_AGGREGATE_ID",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::DuplicateEvent { .. } => "DUPLICATE_EVENT",
            Self::SaveFailed(_) => "EVENT_SAVE_FAILED",
            Self::LookupFailed(_) => "EVENT_LOOKUP_FAILED",
            Self::Rehydration(_) => "REHYDRATION_FAILED",
        }
    }

    /// Whether retrying the same append may succeed.
    ///
    /// Only concurrency conflicts are retryable: the caller reloads the
    /// aggregate and re-appends at the new version. Everything else is
    /// deterministic or infrastructural.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Append-only event log with optimistic concurrency.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; they are shared as
/// `Arc<dyn EventStore>` across command handlers and the saga.
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate's stream.
    ///
    /// `expected_version` is the stream's current highest version
    /// ([`Version::INITIAL`] for a new stream). On success the returned
    /// events are the stamped copies: sequential `version`s, assigned
    /// `global_version`s, and `metadata.stored_at` set.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`]: a concurrent writer won
    /// - [`EventStoreError::DuplicateEvent`]: the batch collides with itself
    /// - [`EventStoreError::SaveFailed`]: the batch write failed; nothing
    ///   was persisted
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>>;

    /// Load all events for an aggregate, sorted ascending by `version`.
    ///
    /// A stream that doesn't exist yields an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::LookupFailed`] if the read fails.
    fn load_events(
        &self,
        aggregate_id: AggregateId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>>;

    /// Find the aggregate that recorded `event_type` with
    /// `payload[field] == value`, if any.
    ///
    /// This is the natural-key lookup used by uniqueness checks (e.g.
    /// ISBN before `CreateBook`, one wallet per user). When several
    /// aggregates match, the earliest by global order wins.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::LookupFailed`] if the scan fails.
    fn find_aggregate_id(
        &self,
        event_type: &str,
        field: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AggregateId>, EventStoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_display_and_code() {
        let error = EventStoreError::ConcurrencyConflict {
            aggregate_id: AggregateId::new("book-1"),
            expected: Version::new(3),
            actual: Version::new(4),
        };

        let display = format!("{error}");
        assert!(display.contains("expected version 3"));
        assert!(display.contains("found 4"));
        assert_eq!(error.code(), "CONCURRENCY_CONFLICT");
        assert!(error.is_concurrency_conflict());
    }

    #[test]
    fn non_conflict_errors_are_not_retryable() {
        let error = EventStoreError::SaveFailed("disk full".to_string());
        assert!(!error.is_concurrency_conflict());
        assert_eq!(error.code(), "EVENT_SAVE_FAILED");
    }
}
