//! Domain event envelope and payload types.
//!
//! Every fact in the system travels inside a [`DomainEvent`] envelope:
//! the aggregate it belongs to, its per-aggregate `version`, the
//! store-assigned `globalVersion`, a `schemaVersion` for payload
//! evolution, and tracing metadata (correlation, causation, user).
//!
//! # Wire format
//!
//! Envelopes serialize to camelCase JSON:
//!
//! ```json
//! { "aggregateId": "...", "eventType": "BookCreated", "version": 7,
//!   "globalVersion": 12034, "schemaVersion": 1,
//!   "timestamp": "2024-05-01T12:34:56Z",
//!   "payload": { },
//!   "metadata": { "correlationId": "...", "causationId": "...", "userId": "..." } }
//! ```
//!
//! # Typed payloads
//!
//! Payloads are opaque JSON to the store. Each bounded context defines an
//! event enum implementing [`EventPayload`]; decoding dispatches on
//! `(eventType, schemaVersion)` and reports unknown pairs as
//! [`EventError::UnknownEventType`] so the bus can dead-letter them
//! instead of dropping them.

use crate::stream::{AggregateId, GlobalVersion, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error types for event encoding and decoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize a payload to JSON.
    #[error("Failed to serialize event payload: {0}")]
    Serialization(String),

    /// Failed to deserialize a payload from JSON.
    #[error("Failed to deserialize event payload: {0}")]
    Deserialization(String),

    /// Unknown `(eventType, schemaVersion)` pair encountered during decoding.
    #[error("Unknown event type: {event_type} (schema v{schema_version})")]
    UnknownEventType {
        /// The unrecognized event type discriminator.
        event_type: String,
        /// The schema version carried by the envelope.
        schema_version: u32,
    },
}

/// Tracing metadata carried by every event.
///
/// `correlation_id` links every event in one business request;
/// `causation_id` points at the specific event that caused this one
/// (`"{aggregateId}:{version}"` of the input). `stored_at` is stamped by
/// the event store at append time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Identifier of the business request that started the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Reference to the event that directly caused this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// The user on whose behalf the event was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// When the event store persisted the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
}

impl EventMetadata {
    /// Metadata for a fresh inbound request.
    ///
    /// A missing correlation id is synthesized so the chain is always
    /// traceable.
    #[must_use]
    pub fn for_request(correlation_id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            correlation_id: Some(
                correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            causation_id: None,
            user_id,
            stored_at: None,
        }
    }

    /// Metadata for an event produced in reaction to `source`.
    ///
    /// Copies the correlation id (synthesizing one when the source lacks
    /// it) and sets the causation id to the source's event reference.
    #[must_use]
    pub fn caused_by(source: &DomainEvent) -> Self {
        Self {
            correlation_id: Some(
                source
                    .metadata
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            causation_id: Some(source.event_ref()),
            user_id: source.metadata.user_id.clone(),
            stored_at: None,
        }
    }
}

/// A typed event payload belonging to one bounded context.
///
/// Context event enums (e.g. `BookEvent`) implement this trait; the
/// envelope stores the payload as JSON and the discriminator in
/// `eventType`, so decoding is an external dispatch on
/// `(eventType, schemaVersion)`.
pub trait EventPayload: Sized + Send + Sync {
    /// Stable string discriminator, e.g. `"BookCreated"`.
    fn event_type(&self) -> &'static str;

    /// Payload schema version, bumped on incompatible shape changes.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Serialize this payload to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be
    /// represented as JSON.
    fn to_json(&self) -> Result<serde_json::Value, EventError>;

    /// Decode a payload from its envelope discriminator and JSON body.
    ///
    /// # Errors
    ///
    /// - [`EventError::UnknownEventType`] for an unrecognized
    ///   `(event_type, schema_version)` pair
    /// - [`EventError::Deserialization`] if the JSON body does not match
    ///   the expected shape
    fn from_json(
        event_type: &str,
        schema_version: u32,
        payload: &serde_json::Value,
    ) -> Result<Self, EventError>;
}

/// The canonical event envelope.
///
/// `version` and `global_version` are assigned by the event store at
/// append; events built by aggregates carry the version the aggregate
/// expects them to land at, and `global_version` stays `None` until
/// stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Stable identifier of the owning aggregate.
    pub aggregate_id: AggregateId,

    /// String discriminator, e.g. `"ReservationReturned"`.
    pub event_type: String,

    /// Per-aggregate sequence number, starting at 1.
    pub version: Version,

    /// Store-wide sequence number, assigned at append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_version: Option<GlobalVersion>,

    /// Payload schema version.
    pub schema_version: u32,

    /// Event creation instant (UTC).
    pub timestamp: DateTime<Utc>,

    /// Type-specific body, opaque to the store.
    pub payload: serde_json::Value,

    /// Correlation, causation, user, and storage metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl DomainEvent {
    /// Build an envelope around a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be
    /// serialized.
    pub fn new<P: EventPayload>(
        aggregate_id: AggregateId,
        payload: &P,
        version: Version,
        timestamp: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<Self, EventError> {
        Ok(Self {
            aggregate_id,
            event_type: payload.event_type().to_string(),
            version,
            global_version: None,
            schema_version: payload.schema_version(),
            timestamp,
            payload: payload.to_json()?,
            metadata,
        })
    }

    /// The event's identity for causation linking.
    ///
    /// `(aggregateId, version)` is unique by the store's compound index,
    /// so `"{aggregateId}:{version}"` names exactly one event.
    #[must_use]
    pub fn event_ref(&self) -> String {
        format!("{}:{}", self.aggregate_id, self.version)
    }

    /// Decode the payload into its context's typed event enum.
    ///
    /// # Errors
    ///
    /// See [`EventPayload::from_json`].
    pub fn decode<P: EventPayload>(&self) -> Result<P, EventError> {
        P::from_json(&self.event_type, self.schema_version, &self.payload)
    }

    /// Build the derived error event for a failed delivery of `self`.
    ///
    /// The derived event is named `<sourceType>_FAILED` and carries the
    /// source's correlation id, the failure reason, and an error code.
    /// It is published on the bus but never appended to a stream.
    #[must_use]
    pub fn failure_event(&self, reason: &str, code: &str, timestamp: DateTime<Utc>) -> Self {
        let correlation_id = self.metadata.correlation_id.clone();
        Self {
            aggregate_id: self.aggregate_id.clone(),
            event_type: format!("{}_FAILED", self.event_type),
            version: self.version,
            global_version: None,
            schema_version: 1,
            timestamp,
            payload: serde_json::json!({
                "sourceEventType": self.event_type,
                "reason": reason,
                "code": code,
                "correlationId": correlation_id.clone(),
            }),
            metadata: EventMetadata {
                correlation_id,
                causation_id: Some(self.event_ref()),
                user_id: self.metadata.user_id.clone(),
                stored_at: None,
            },
        }
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} on {}",
            self.event_type, self.version, self.aggregate_id
        )
    }
}
