//! Reservation projection handler: materializes
//! `reservations_projection` with secondary access paths on `userId`,
//! `bookId`, `status`, and `dueDate`.

use crate::events::ReservationEvent;
use book_library_core::document::DocumentStore;
use book_library_core::event::DomainEvent;
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The reservations projection collection.
pub const RESERVATIONS_COLLECTION: &str = "reservations_projection";

/// Event types this projection subscribes to.
pub const RESERVATION_EVENT_TYPES: [&str; 7] = [
    "ReservationCreated",
    "ReservationStatusUpdated",
    "ReservationReturned",
    "ReservationFeeCharged",
    "ReservationFeePaid",
    "ReservationDueDateExtended",
    "ReservationDeleted",
];

/// Materializes reservation read models.
pub struct ReservationProjectionHandler {
    docs: Arc<dyn DocumentStore>,
}

impl ReservationProjectionHandler {
    /// Wire the projection to its document store.
    #[must_use]
    pub const fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// Subscribe the projection to every reservation event type.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if a subscription fails.
    pub async fn register(
        docs: Arc<dyn DocumentStore>,
        bus: &dyn EventBus,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> = Arc::new(Self::new(docs));
        for event_type in RESERVATION_EVENT_TYPES {
            bus.subscribe(event_type, Arc::clone(&handler)).await?;
        }
        Ok(())
    }

    async fn apply(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let decoded: ReservationEvent = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let id = event.aggregate_id.as_str();

        let outcome = match decoded {
            ReservationEvent::Created(created) => {
                let mut doc = json!({
                    "id": id,
                    "userId": created.user_id,
                    "bookId": created.book_id,
                    "status": "created",
                    "feeCharged": created.fee_charged,
                    "reservedAt": created.reserved_at,
                    "dueDate": created.due_date,
                    "createdAt": created.reserved_at,
                });
                if let (Some(map), Some(retail)) = (doc.as_object_mut(), created.retail_price) {
                    map.insert("retailPrice".to_string(), retail.into());
                }
                self.docs
                    .upsert(RESERVATIONS_COLLECTION, id, doc, event.version, event.timestamp)
                    .await
            }
            ReservationEvent::StatusUpdated(updated) => {
                let mut doc = json!({
                    "status": updated.status,
                    "statusReason": updated.reason,
                });
                if let (Some(map), Some(retail)) = (doc.as_object_mut(), updated.retail_price) {
                    map.insert("retailPrice".to_string(), retail.into());
                }
                self.docs
                    .upsert(RESERVATIONS_COLLECTION, id, doc, event.version, event.timestamp)
                    .await
            }
            ReservationEvent::Returned(returned) => {
                self.docs
                    .upsert(
                        RESERVATIONS_COLLECTION,
                        id,
                        json!({
                            "status": "returned",
                            "returnedAt": returned.returned_at,
                            "daysLate": returned.days_late,
                        }),
                        event.version,
                        event.timestamp,
                    )
                    .await
            }
            ReservationEvent::FeeCharged(charged) => {
                self.docs
                    .upsert(
                        RESERVATIONS_COLLECTION,
                        id,
                        json!({ "lateFee": charged.amount }),
                        event.version,
                        event.timestamp,
                    )
                    .await
            }
            ReservationEvent::FeePaid(paid) => {
                self.docs
                    .upsert(
                        RESERVATIONS_COLLECTION,
                        id,
                        json!({
                            "payment": { "amount": paid.amount, "paidAt": paid.paid_at },
                        }),
                        event.version,
                        event.timestamp,
                    )
                    .await
            }
            ReservationEvent::DueDateExtended(extended) => {
                self.docs
                    .upsert(
                        RESERVATIONS_COLLECTION,
                        id,
                        json!({ "dueDate": extended.due_date }),
                        event.version,
                        event.timestamp,
                    )
                    .await
            }
            ReservationEvent::Deleted(deleted) => {
                self.docs
                    .soft_delete(RESERVATIONS_COLLECTION, id, event.version, deleted.deleted_at)
                    .await
            }
        };

        outcome.map_err(|e| HandlerError::Retryable(e.to_string()))?;
        Ok(())
    }
}

impl EventHandler for ReservationProjectionHandler {
    fn name(&self) -> &'static str {
        "reservations-projection"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.apply(&event).await })
    }
}
