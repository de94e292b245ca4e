//! Book domain events.

use book_library_core::event::{EventError, EventPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A new book entered the catalogue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookCreated {
    /// ISBN, the catalogue's natural key.
    pub isbn: String,
    /// Title.
    pub title: String,
    /// Author.
    pub author: String,
    /// Year of publication.
    pub publication_year: i32,
    /// Publisher.
    pub publisher: String,
    /// Retail price.
    pub price: f64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// Catalogue data changed; only the changed fields are present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookUpdated {
    /// New title, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New author, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// New publication year, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    /// New publisher, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// New price, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Update instant.
    pub updated_at: DateTime<Utc>,
}

impl BookUpdated {
    /// Whether the patch changes anything at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.publication_year.is_none()
            && self.publisher.is_none()
            && self.price.is_none()
    }
}

/// The book was soft-deleted from the catalogue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDeleted {
    /// Deletion instant.
    pub deleted_at: DateTime<Utc>,
}

/// The Books context's event stream alphabet.
#[derive(Clone, Debug, PartialEq)]
pub enum BookEvent {
    /// `BookCreated`
    Created(BookCreated),
    /// `BookUpdated`
    Updated(BookUpdated),
    /// `BookDeleted`
    Deleted(BookDeleted),
}

impl EventPayload for BookEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "BookCreated",
            Self::Updated(_) => "BookUpdated",
            Self::Deleted(_) => "BookDeleted",
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, EventError> {
        let result = match self {
            Self::Created(p) => serde_json::to_value(p),
            Self::Updated(p) => serde_json::to_value(p),
            Self::Deleted(p) => serde_json::to_value(p),
        };
        result.map_err(|e| EventError::Serialization(e.to_string()))
    }

    fn from_json(
        event_type: &str,
        schema_version: u32,
        payload: &serde_json::Value,
    ) -> Result<Self, EventError> {
        let decode_err = |e: serde_json::Error| EventError::Deserialization(e.to_string());
        match (event_type, schema_version) {
            ("BookCreated", 1) => serde_json::from_value(payload.clone())
                .map(Self::Created)
                .map_err(decode_err),
            ("BookUpdated", 1) => serde_json::from_value(payload.clone())
                .map(Self::Updated)
                .map_err(decode_err),
            ("BookDeleted", 1) => serde_json::from_value(payload.clone())
                .map(Self::Deleted)
                .map_err(decode_err),
            _ => Err(EventError::UnknownEventType {
                event_type: event_type.to_string(),
                schema_version,
            }),
        }
    }
}
