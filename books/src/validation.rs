//! Book-validation responder for the reservation–payment saga.
//!
//! Answers `ReservationBookValidation` requests by checking the books
//! projection for a live book and publishing `BookValidationResult`
//! with the retail price. Correlation and causation metadata propagate
//! from the request.

use crate::queries::BOOKS_COLLECTION;
use book_library_core::document::DocumentStore;
use book_library_core::environment::Clock;
use book_library_core::event::{DomainEvent, EventMetadata};
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use book_library_core::messages::{
    BookValidationResult, RESERVATION_BOOK_VALIDATION, SagaMessage,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Responds to the saga's book-validation requests.
pub struct BookValidationHandler {
    docs: Arc<dyn DocumentStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl BookValidationHandler {
    /// Wire the responder to its collaborators.
    #[must_use]
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { docs, bus, clock }
    }

    /// Subscribe the responder to validation requests.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription fails.
    pub async fn register(
        docs: Arc<dyn DocumentStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> =
            Arc::new(Self::new(docs, Arc::clone(&bus), clock));
        bus.subscribe(RESERVATION_BOOK_VALIDATION, handler).await?;
        Ok(())
    }

    async fn answer(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let SagaMessage::BookValidation(request) = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?
        else {
            return Err(HandlerError::Fatal("unexpected message type".to_string()));
        };

        let book = self
            .docs
            .get(BOOKS_COLLECTION, &request.book_id, false)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        let result = match book {
            Some(doc) => BookValidationResult {
                reservation_id: request.reservation_id.clone(),
                book_id: request.book_id.clone(),
                valid: true,
                retail_price: doc["price"].as_f64(),
                reason: None,
            },
            None => BookValidationResult {
                reservation_id: request.reservation_id.clone(),
                book_id: request.book_id.clone(),
                valid: false,
                retail_price: None,
                reason: Some("book not found".to_string()),
            },
        };

        tracing::info!(
            reservation_id = %request.reservation_id,
            book_id = %request.book_id,
            valid = result.valid,
            "Book validation answered"
        );

        let answer = SagaMessage::ValidationResult(result)
            .to_domain_event(self.clock.now(), EventMetadata::caused_by(event))
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        self.bus
            .publish(answer)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;
        Ok(())
    }
}

impl EventHandler for BookValidationHandler {
    fn name(&self) -> &'static str {
        "books-validation"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.answer(&event).await })
    }
}
