//! Book projection handler: materializes `books_projection` from the
//! event stream.
//!
//! Idempotence comes from the document store's version guard: replays
//! and out-of-order older events are silent no-ops.

use crate::events::BookEvent;
use crate::queries::BOOKS_COLLECTION;
use book_library_core::document::DocumentStore;
use book_library_core::event::DomainEvent;
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Event types this projection subscribes to.
pub const BOOK_EVENT_TYPES: [&str; 3] = ["BookCreated", "BookUpdated", "BookDeleted"];

/// Materializes book read models.
pub struct BookProjectionHandler {
    docs: Arc<dyn DocumentStore>,
}

impl BookProjectionHandler {
    /// Wire the projection to its document store.
    #[must_use]
    pub const fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// Subscribe the projection to every book event type.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if a subscription fails.
    pub async fn register(docs: Arc<dyn DocumentStore>, bus: &dyn EventBus) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> = Arc::new(Self::new(docs));
        for event_type in BOOK_EVENT_TYPES {
            bus.subscribe(event_type, Arc::clone(&handler)).await?;
        }
        Ok(())
    }

    async fn apply(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        // An undecodable or unknown payload is deterministic: dead-letter
        // it instead of burning retries.
        let decoded: BookEvent = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let id = event.aggregate_id.as_str();

        let outcome = match decoded {
            BookEvent::Created(created) => {
                let doc = json!({
                    "id": id,
                    "isbn": created.isbn,
                    "title": created.title,
                    "author": created.author,
                    "publicationYear": created.publication_year,
                    "publisher": created.publisher,
                    "price": created.price,
                    "createdAt": created.created_at,
                });
                self.docs
                    .upsert(BOOKS_COLLECTION, id, doc, event.version, event.timestamp)
                    .await
            }
            BookEvent::Updated(updated) => {
                let mut changes = serde_json::Map::new();
                if let Some(title) = updated.title {
                    changes.insert("title".to_string(), title.into());
                }
                if let Some(author) = updated.author {
                    changes.insert("author".to_string(), author.into());
                }
                if let Some(year) = updated.publication_year {
                    changes.insert("publicationYear".to_string(), year.into());
                }
                if let Some(publisher) = updated.publisher {
                    changes.insert("publisher".to_string(), publisher.into());
                }
                if let Some(price) = updated.price {
                    changes.insert("price".to_string(), price.into());
                }
                self.docs
                    .upsert(
                        BOOKS_COLLECTION,
                        id,
                        serde_json::Value::Object(changes),
                        event.version,
                        event.timestamp,
                    )
                    .await
            }
            BookEvent::Deleted(deleted) => {
                self.docs
                    .soft_delete(BOOKS_COLLECTION, id, event.version, deleted.deleted_at)
                    .await
            }
        };

        outcome.map_err(|e| HandlerError::Retryable(e.to_string()))?;
        Ok(())
    }
}

impl EventHandler for BookProjectionHandler {
    fn name(&self) -> &'static str {
        "books-projection"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.apply(&event).await })
    }
}
