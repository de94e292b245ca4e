//! Purchase-on-late-fee responder.
//!
//! Listens for `WalletLateFeeApplied` and books the outcome against the
//! reservation: the charge lands as `ReservationFeeCharged`, and a fee
//! that reached the retail price moves the reservation to `bought`.
//! Redeliveries are absorbed by the already-on-file check.

use crate::commands::ReservationCommandHandler;
use book_library_core::event::{DomainEvent, EventMetadata};
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The slice of `WalletLateFeeApplied` this context consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LateFeeNotice {
    reservation_id: String,
    fee: f64,
    book_purchased: bool,
}

/// Books wallet late-fee outcomes onto reservations.
pub struct PurchaseOnLateFeeHandler {
    commands: Arc<ReservationCommandHandler>,
}

impl PurchaseOnLateFeeHandler {
    /// Wire the responder to the reservation commands.
    #[must_use]
    pub const fn new(commands: Arc<ReservationCommandHandler>) -> Self {
        Self { commands }
    }

    /// Subscribe the responder to wallet late-fee events.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription fails.
    pub async fn register(
        commands: Arc<ReservationCommandHandler>,
        bus: &dyn EventBus,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> = Arc::new(Self::new(commands));
        bus.subscribe("WalletLateFeeApplied", handler).await?;
        Ok(())
    }

    async fn book_outcome(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let notice: LateFeeNotice = serde_json::from_value(event.payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad WalletLateFeeApplied payload: {e}")))?;

        let result = self
            .commands
            .record_late_fee(
                EventMetadata::caused_by(event),
                &notice.reservation_id,
                notice.fee,
                notice.book_purchased,
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_client_error() => Err(HandlerError::Fatal(err.to_string())),
            Err(err) => Err(HandlerError::Retryable(err.to_string())),
        }
    }
}

impl EventHandler for PurchaseOnLateFeeHandler {
    fn name(&self) -> &'static str {
        "reservations-late-fee-outcomes"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.book_outcome(&event).await })
    }
}
