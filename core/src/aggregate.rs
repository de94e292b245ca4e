//! Aggregate root abstraction, rehydration, and the pending-event context.
//!
//! An aggregate is the consistency boundary around one event stream. Its
//! state is never stored directly: it is rebuilt by replaying the stream
//! ([`rehydrate`]), and it changes only by recording new events.
//!
//! [`AggregateContext`] wraps an aggregate together with the version it
//! was loaded at and a buffer of pending (recorded but unpersisted)
//! events. Command handlers record events through it and commit the
//! buffer in one append under the loaded version, which is what makes
//! optimistic concurrency work.

use crate::event::{DomainEvent, EventError, EventMetadata, EventPayload};
use crate::event_bus::EventBus;
use crate::event_store::{EventStore, EventStoreError};
use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced while replaying a stream into an aggregate.
///
/// Rehydration never hides the cause: a decode failure carries the
/// underlying [`EventError`], a structural problem names the offending
/// event.
#[derive(Error, Debug)]
pub enum RehydrationError {
    /// The stream has no events (the aggregate does not exist).
    #[error("Cannot rehydrate {0}: stream is empty")]
    EmptyStream(AggregateId),

    /// The stream's first event is not a creation event.
    #[error("Cannot rehydrate {aggregate_id}: stream starts with {event_type}")]
    NotACreationEvent {
        /// The aggregate being rehydrated.
        aggregate_id: AggregateId,
        /// The unexpected first event type.
        event_type: String,
    },

    /// The stream skips or repeats a version.
    #[error("Stream for {aggregate_id} is not contiguous: expected version {expected}, found {found}")]
    VersionGap {
        /// The aggregate being rehydrated.
        aggregate_id: AggregateId,
        /// The version the k-th event should carry.
        expected: Version,
        /// The version actually found.
        found: Version,
    },

    /// A payload failed to decode into the aggregate's event type.
    #[error("Failed to decode event during rehydration: {0}")]
    Decode(#[from] EventError),
}

/// State rebuilt from one event stream.
///
/// Implementations hold plain owned state plus the version of the last
/// applied event. `initialize` consumes the stream's first (creation)
/// event; `apply` folds every later one. Both are infallible by design:
/// an event is a fact that already happened, so applying it cannot be
/// rejected — validation happens before an event is recorded.
pub trait AggregateRoot: Sized + Send {
    /// The typed event enum of this aggregate's context.
    type Event: EventPayload;

    /// The aggregate's stable identifier.
    fn aggregate_id(&self) -> &AggregateId;

    /// Version of the last applied event.
    fn version(&self) -> Version;

    /// Overwrite the tracked version (used by replay and commit).
    fn set_version(&mut self, version: Version);

    /// Build the initial state from the stream's first event.
    ///
    /// Returns `None` when the event is not a creation event for this
    /// aggregate type, which rehydration reports as a corrupt stream.
    fn initialize(aggregate_id: AggregateId, event: &Self::Event) -> Option<Self>;

    /// Fold one subsequent event into the state.
    fn apply(&mut self, event: &Self::Event);
}

/// Rebuild an aggregate by replaying its stream.
///
/// Events are sorted ascending by version, decoded, and applied in
/// order; the aggregate's version is set to the last applied event's.
/// Version contiguity (`k`-th event carries version `k`) is verified.
///
/// # Errors
///
/// Returns [`RehydrationError`] on an empty stream, a stream not opened
/// by a creation event, a version gap, or a payload that fails to
/// decode.
pub fn rehydrate<A: AggregateRoot>(
    aggregate_id: &AggregateId,
    mut events: Vec<DomainEvent>,
) -> Result<A, RehydrationError> {
    events.sort_by_key(|e| e.version);

    let Some((first, rest)) = events.split_first() else {
        return Err(RehydrationError::EmptyStream(aggregate_id.clone()));
    };
    if first.version != Version::new(1) {
        return Err(RehydrationError::VersionGap {
            aggregate_id: aggregate_id.clone(),
            expected: Version::new(1),
            found: first.version,
        });
    }

    let payload: A::Event = first.decode()?;
    let mut aggregate =
        A::initialize(aggregate_id.clone(), &payload).ok_or_else(|| {
            RehydrationError::NotACreationEvent {
                aggregate_id: aggregate_id.clone(),
                event_type: first.event_type.clone(),
            }
        })?;

    let mut expected = first.version;
    for event in rest {
        expected = expected.next();
        if event.version != expected {
            return Err(RehydrationError::VersionGap {
                aggregate_id: aggregate_id.clone(),
                expected,
                found: event.version,
            });
        }
        let payload: A::Event = event.decode()?;
        aggregate.apply(&payload);
    }
    aggregate.set_version(expected);

    Ok(aggregate)
}

/// An aggregate plus its loaded version and pending-event buffer.
///
/// The context is the write-side workflow object: load (or create),
/// record events produced by domain methods, then commit. Recording
/// applies the event to in-memory state immediately; committing appends
/// the whole buffer under the version the aggregate was loaded at and
/// publishes the stamped events.
pub struct AggregateContext<A: AggregateRoot> {
    aggregate: A,
    loaded_version: Version,
    pending: Vec<DomainEvent>,
}

impl<A: AggregateRoot> AggregateContext<A> {
    /// Start a context for a brand-new aggregate from its creation event.
    ///
    /// The creation event is recorded as pending at version 1; commit
    /// will append it with expected version 0.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the payload fails to serialize, and
    /// `None`-mapped [`RehydrationError::NotACreationEvent`] never occurs
    /// here because the caller supplies the creation event directly.
    pub fn create(
        aggregate_id: AggregateId,
        event: &A::Event,
        timestamp: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<Option<Self>, EventError> {
        let Some(mut aggregate) = A::initialize(aggregate_id.clone(), event) else {
            return Ok(None);
        };
        let version = Version::new(1);
        aggregate.set_version(version);
        let envelope = DomainEvent::new(aggregate_id, event, version, timestamp, metadata)?;
        Ok(Some(Self {
            aggregate,
            loaded_version: Version::INITIAL,
            pending: vec![envelope],
        }))
    }

    /// Load and rehydrate an existing aggregate.
    ///
    /// Returns `Ok(None)` when the stream is empty (the aggregate does
    /// not exist).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::LookupFailed`] if the read fails or
    /// [`EventStoreError::Rehydration`] if replay fails.
    pub async fn load(
        store: &dyn EventStore,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Self>, EventStoreError> {
        let events = store.load_events(aggregate_id.clone()).await?;
        if events.is_empty() {
            return Ok(None);
        }
        let aggregate: A = rehydrate(aggregate_id, events)?;
        let loaded_version = aggregate.version();
        Ok(Some(Self {
            aggregate,
            loaded_version,
            pending: Vec::new(),
        }))
    }

    /// The wrapped aggregate state (pending events already applied).
    pub const fn aggregate(&self) -> &A {
        &self.aggregate
    }

    /// The version the aggregate was loaded at (commit's expected version).
    pub const fn loaded_version(&self) -> Version {
        self.loaded_version
    }

    /// Events recorded but not yet persisted.
    #[must_use]
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Record a new domain event: apply it to state and buffer it.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the payload fails to serialize.
    pub fn record(
        &mut self,
        event: &A::Event,
        timestamp: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<(), EventError> {
        let version = self.aggregate.version().next();
        let envelope = DomainEvent::new(
            self.aggregate.aggregate_id().clone(),
            event,
            version,
            timestamp,
            metadata,
        )?;
        self.aggregate.apply(event);
        self.aggregate.set_version(version);
        self.pending.push(envelope);
        Ok(())
    }

    /// Drop all pending events without persisting them.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Persist the pending buffer and publish the stamped events.
    ///
    /// Appends under the loaded version, publishes each stamped event on
    /// the bus, then drains the buffer and advances the loaded version.
    /// A publish failure is logged and does not fail the commit: the
    /// events are durable in the store, and delivery is at-least-once
    /// territory, not append territory.
    ///
    /// # Errors
    ///
    /// Returns the append error unchanged; the pending buffer is kept so
    /// the caller can reload and retry.
    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        bus: &dyn EventBus,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let stored = store
            .append_events(
                self.aggregate.aggregate_id().clone(),
                self.loaded_version,
                self.pending.clone(),
            )
            .await?;
        self.pending.clear();

        for event in &stored {
            if let Err(publish_err) = bus.publish(event.clone()).await {
                tracing::warn!(
                    aggregate_id = %event.aggregate_id,
                    event_type = %event.event_type,
                    error = %publish_err,
                    "Event persisted but publish failed"
                );
            }
        }

        self.loaded_version = self.aggregate.version();
        Ok(stored)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Opened {
        owner: String,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Bumped {
        by: i64,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum CounterEvent {
        Opened(Opened),
        Bumped(Bumped),
    }

    impl EventPayload for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Opened(_) => "CounterOpened",
                Self::Bumped(_) => "CounterBumped",
            }
        }

        fn to_json(&self) -> Result<serde_json::Value, EventError> {
            let result = match self {
                Self::Opened(p) => serde_json::to_value(p),
                Self::Bumped(p) => serde_json::to_value(p),
            };
            result.map_err(|e| EventError::Serialization(e.to_string()))
        }

        fn from_json(
            event_type: &str,
            schema_version: u32,
            payload: &serde_json::Value,
        ) -> Result<Self, EventError> {
            match (event_type, schema_version) {
                ("CounterOpened", 1) => serde_json::from_value(payload.clone())
                    .map(Self::Opened)
                    .map_err(|e| EventError::Deserialization(e.to_string())),
                ("CounterBumped", 1) => serde_json::from_value(payload.clone())
                    .map(Self::Bumped)
                    .map_err(|e| EventError::Deserialization(e.to_string())),
                _ => Err(EventError::UnknownEventType {
                    event_type: event_type.to_string(),
                    schema_version,
                }),
            }
        }
    }

    #[derive(Debug)]
    struct Counter {
        id: AggregateId,
        version: Version,
        owner: String,
        value: i64,
    }

    impl AggregateRoot for Counter {
        type Event = CounterEvent;

        fn aggregate_id(&self) -> &AggregateId {
            &self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn initialize(aggregate_id: AggregateId, event: &Self::Event) -> Option<Self> {
            match event {
                CounterEvent::Opened(p) => Some(Self {
                    id: aggregate_id,
                    version: Version::INITIAL,
                    owner: p.owner.clone(),
                    value: 0,
                }),
                CounterEvent::Bumped(_) => None,
            }
        }

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Opened(p) => self.owner = p.owner.clone(),
                CounterEvent::Bumped(p) => self.value += p.by,
            }
        }
    }

    fn envelope(id: &str, event: &CounterEvent, version: u64) -> DomainEvent {
        DomainEvent::new(
            AggregateId::new(id),
            event,
            Version::new(version),
            Utc::now(),
            EventMetadata::default(),
        )
        .unwrap()
    }

    #[test]
    fn rehydrate_folds_events_in_version_order() {
        let id = AggregateId::new("counter-1");
        // Deliberately shuffled: rehydrate must sort by version.
        let events = vec![
            envelope("counter-1", &CounterEvent::Bumped(Bumped { by: 2 }), 3),
            envelope(
                "counter-1",
                &CounterEvent::Opened(Opened {
                    owner: "alice".to_string(),
                }),
                1,
            ),
            envelope("counter-1", &CounterEvent::Bumped(Bumped { by: 5 }), 2),
        ];

        let counter: Counter = rehydrate(&id, events).unwrap();
        assert_eq!(counter.value, 7);
        assert_eq!(counter.owner, "alice");
        assert_eq!(counter.version(), Version::new(3));
    }

    #[test]
    fn rehydrate_empty_stream_fails() {
        let id = AggregateId::new("counter-1");
        let result: Result<Counter, _> = rehydrate(&id, vec![]);
        assert!(matches!(result, Err(RehydrationError::EmptyStream(_))));
    }

    #[test]
    fn rehydrate_reports_version_gap() {
        let id = AggregateId::new("counter-1");
        let events = vec![
            envelope(
                "counter-1",
                &CounterEvent::Opened(Opened {
                    owner: "alice".to_string(),
                }),
                1,
            ),
            envelope("counter-1", &CounterEvent::Bumped(Bumped { by: 5 }), 3),
        ];

        let result: Result<Counter, _> = rehydrate(&id, events);
        assert!(matches!(
            result,
            Err(RehydrationError::VersionGap { expected, found, .. })
                if expected == Version::new(2) && found == Version::new(3)
        ));
    }

    #[test]
    fn rehydrate_rejects_stream_not_opened_by_creation_event() {
        let id = AggregateId::new("counter-1");
        let events = vec![envelope(
            "counter-1",
            &CounterEvent::Bumped(Bumped { by: 1 }),
            1,
        )];

        let result: Result<Counter, _> = rehydrate(&id, events);
        assert!(matches!(
            result,
            Err(RehydrationError::NotACreationEvent { event_type, .. })
                if event_type == "CounterBumped"
        ));
    }

    #[test]
    fn context_records_and_buffers() {
        let mut ctx: AggregateContext<Counter> = AggregateContext::create(
            AggregateId::new("counter-1"),
            &CounterEvent::Opened(Opened {
                owner: "bob".to_string(),
            }),
            Utc::now(),
            EventMetadata::default(),
        )
        .unwrap()
        .unwrap();

        ctx.record(
            &CounterEvent::Bumped(Bumped { by: 4 }),
            Utc::now(),
            EventMetadata::default(),
        )
        .unwrap();

        assert_eq!(ctx.pending_events().len(), 2);
        assert_eq!(ctx.pending_events()[0].version, Version::new(1));
        assert_eq!(ctx.pending_events()[1].version, Version::new(2));
        assert_eq!(ctx.aggregate().value, 4);
        assert_eq!(ctx.loaded_version(), Version::INITIAL);

        ctx.clear_pending();
        assert!(ctx.pending_events().is_empty());
    }
}
