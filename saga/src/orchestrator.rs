//! The reservation–payment saga orchestrator.
//!
//! A persistent state machine with one row per coordinated reservation:
//!
//! | From | Event in | To | Action |
//! |---|---|---|---|
//! | — | `ReservationCreated` | `AwaitingBookValidation` | publish `ReservationBookValidation` |
//! | `AwaitingBookValidation` | `BookValidationResult(valid)` | `AwaitingPayment` | publish `WalletPaymentRequest` |
//! | `AwaitingBookValidation` | `BookValidationResult(!valid)` or `ReservationBookValidationFailed` | `Failed` | reservation → `rejected` |
//! | `AwaitingPayment` | `WalletPaymentSuccess` | `Completed` | reservation → `active` |
//! | `AwaitingPayment` | `WalletPaymentDeclined` | `Compensating` → `Failed` | reservation → `cancelled` (`payment_declined`) |
//! | waiting | `ReservationCancellationRequested` | `Compensating` → `Failed` | reservation → `cancelled` |
//!
//! # Delivery discipline
//!
//! Duplicate deliveries are detected by the last-processed causation
//! id; duplicates of the current waiting step reissue the step's
//! request (downstream handlers are idempotent). An answer that arrives
//! before its step is recorded is returned as retryable so the bus
//! redelivers it after backoff. Step failures never bubble out of the
//! saga: they are logged and compensated.

use book_library_core::environment::Clock;
use book_library_core::event::{DomainEvent, EventMetadata};
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use book_library_core::messages::{
    BOOK_VALIDATION_RESULT, RESERVATION_CANCELLATION_REQUESTED, ReservationBookValidation,
    SagaMessage, WalletPaymentRequest,
};
use book_library_core::saga::{SagaState, SagaStateStore, SagaStatus, SagaStep};
use book_library_reservations::commands::ReservationCommandHandler;
use book_library_reservations::events::ReservationStatus;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Event types the orchestrator subscribes to.
pub const SAGA_INPUT_TYPES: [&str; 6] = [
    "ReservationCreated",
    BOOK_VALIDATION_RESULT,
    "ReservationBookValidation_FAILED",
    "WalletPaymentSuccess",
    "WalletPaymentDeclined",
    RESERVATION_CANCELLATION_REQUESTED,
];

/// The slice of `ReservationCreated` the saga consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedNotice {
    user_id: String,
    book_id: String,
    fee_charged: f64,
    #[serde(default)]
    retail_price: Option<f64>,
}

/// The slice of wallet payment events the saga consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentNotice {
    reservation_id: String,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    reason: Option<String>,
}

/// Coordinates Books, Reservations, and Wallets for one reservation.
pub struct ReservationPaymentSaga {
    sagas: Arc<dyn SagaStateStore>,
    bus: Arc<dyn EventBus>,
    reservations: Arc<ReservationCommandHandler>,
    clock: Arc<dyn Clock>,
}

impl ReservationPaymentSaga {
    /// Wire the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        sagas: Arc<dyn SagaStateStore>,
        bus: Arc<dyn EventBus>,
        reservations: Arc<ReservationCommandHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sagas,
            bus,
            reservations,
            clock,
        }
    }

    /// Subscribe the orchestrator to every saga input.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if a subscription fails.
    pub async fn register(
        sagas: Arc<dyn SagaStateStore>,
        bus: Arc<dyn EventBus>,
        reservations: Arc<ReservationCommandHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> =
            Arc::new(Self::new(sagas, Arc::clone(&bus), reservations, clock));
        for event_type in SAGA_INPUT_TYPES {
            bus.subscribe(event_type, Arc::clone(&handler)).await?;
        }
        Ok(())
    }

    async fn process(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        match event.event_type.as_str() {
            "ReservationCreated" => self.on_reservation_created(event).await,
            BOOK_VALIDATION_RESULT => self.on_validation_result(event).await,
            "ReservationBookValidation_FAILED" => {
                let reason = event.payload["reason"]
                    .as_str()
                    .unwrap_or("book validation failed")
                    .to_string();
                self.on_validation_rejected(event, event.aggregate_id.as_str(), reason)
                    .await
            }
            "WalletPaymentSuccess" => self.on_payment_success(event).await,
            "WalletPaymentDeclined" => self.on_payment_declined(event).await,
            RESERVATION_CANCELLATION_REQUESTED => self.on_cancellation(event).await,
            other => Err(HandlerError::Fatal(format!(
                "saga received unexpected event type {other}"
            ))),
        }
    }

    async fn on_reservation_created(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let notice: CreatedNotice = serde_json::from_value(event.payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad ReservationCreated payload: {e}")))?;
        let reservation_id = event.aggregate_id.as_str();

        if let Some(existing) = self.load(reservation_id).await? {
            if existing.step == SagaStep::AwaitingBookValidation {
                // Redelivered start: reissue the request in case the
                // first publish was lost. The responder is idempotent.
                self.publish_validation_request(&existing, event).await?;
            }
            return Ok(());
        }

        let now = self.clock.now();
        let state = SagaState {
            id: format!("saga-{}", uuid::Uuid::new_v4()),
            reservation_id: reservation_id.to_string(),
            user_id: notice.user_id,
            book_id: notice.book_id,
            step: SagaStep::AwaitingBookValidation,
            status: SagaStatus::Active,
            retail_price: notice.retail_price,
            fee_charged: Some(notice.fee_charged),
            compensations: Vec::new(),
            retry_count: 0,
            last_causation_id: Some(event.event_ref()),
            started_at: now,
            updated_at: now,
            last_error: None,
        };
        self.upsert(state.clone()).await?;
        tracing::info!(
            reservation_id = reservation_id,
            "Saga started, awaiting book validation"
        );

        self.publish_validation_request(&state, event).await
    }

    async fn on_validation_result(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let SagaMessage::ValidationResult(result) = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?
        else {
            return Err(HandlerError::Fatal("unexpected message type".to_string()));
        };

        let Some(state) = self.load(&result.reservation_id).await? else {
            // The answer can overtake the saga row; let the bus retry.
            return Err(HandlerError::Retryable(format!(
                "no saga row yet for reservation {}",
                result.reservation_id
            )));
        };
        if state.already_processed(&event.event_ref()) || state.step.is_terminal() {
            return Ok(());
        }
        if state.step != SagaStep::AwaitingBookValidation {
            // Late duplicate of an already-answered step.
            return Ok(());
        }

        if !result.valid {
            let reason = result
                .reason
                .unwrap_or_else(|| "book validation failed".to_string());
            return self
                .on_validation_rejected(event, &result.reservation_id, reason)
                .await;
        }

        let mut state = state;
        state.step = SagaStep::AwaitingPayment;
        state.retail_price = result.retail_price.or(state.retail_price);
        state.retry_count = 0;
        state.last_causation_id = Some(event.event_ref());
        state.updated_at = self.clock.now();
        self.upsert(state.clone()).await?;

        // Mark the reservation validated; a failure here compensates
        // instead of bubbling.
        if let Err(err) = self
            .reservations
            .update_status(
                EventMetadata::caused_by(event),
                &state.reservation_id,
                ReservationStatus::Validated,
                None,
                state.retail_price,
            )
            .await
        {
            return self.compensate(state, event, err.to_string()).await;
        }

        tracing::info!(
            reservation_id = %state.reservation_id,
            retail_price = ?state.retail_price,
            "Book validated, awaiting payment"
        );
        self.publish_payment_request(&state, event).await
    }

    async fn on_validation_rejected(
        &self,
        event: &DomainEvent,
        reservation_id: &str,
        reason: String,
    ) -> Result<(), HandlerError> {
        let Some(state) = self.load(reservation_id).await? else {
            return Err(HandlerError::Retryable(format!(
                "no saga row yet for reservation {reservation_id}"
            )));
        };
        if state.already_processed(&event.event_ref()) || state.step.is_terminal() {
            return Ok(());
        }

        if let Err(err) = self
            .reservations
            .update_status(
                EventMetadata::caused_by(event),
                reservation_id,
                ReservationStatus::Rejected,
                Some(reason.clone()),
                None,
            )
            .await
        {
            tracing::error!(
                reservation_id = reservation_id,
                error = %err,
                "Failed to reject reservation, failing saga anyway"
            );
        }

        let mut state = state;
        state.step = SagaStep::Failed;
        state.status = SagaStatus::Failed;
        state.last_error = Some(reason.clone());
        state.last_causation_id = Some(event.event_ref());
        state.updated_at = self.clock.now();
        self.upsert(state).await?;

        tracing::warn!(
            reservation_id = reservation_id,
            reason = %reason,
            "Saga failed at book validation"
        );
        Ok(())
    }

    async fn on_payment_success(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let notice: PaymentNotice = serde_json::from_value(event.payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad WalletPaymentSuccess payload: {e}")))?;

        let Some(state) = self.load(&notice.reservation_id).await? else {
            return Err(HandlerError::Retryable(format!(
                "no saga row yet for reservation {}",
                notice.reservation_id
            )));
        };
        if state.already_processed(&event.event_ref()) || state.step.is_terminal() {
            return Ok(());
        }
        if state.step != SagaStep::AwaitingPayment {
            return Err(HandlerError::Retryable(format!(
                "payment answer before payment step for {}",
                notice.reservation_id
            )));
        }

        if let Err(err) = self
            .reservations
            .settle_payment(
                EventMetadata::caused_by(event),
                &notice.reservation_id,
                notice.amount,
            )
            .await
        {
            return self.compensate(state, event, err.to_string()).await;
        }

        let mut state = state;
        state.step = SagaStep::Completed;
        state.status = SagaStatus::Completed;
        state.fee_charged = Some(notice.amount);
        state.last_causation_id = Some(event.event_ref());
        state.updated_at = self.clock.now();
        self.upsert(state).await?;

        tracing::info!(
            reservation_id = %notice.reservation_id,
            "Saga completed, reservation active"
        );
        Ok(())
    }

    async fn on_payment_declined(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let notice: PaymentNotice = serde_json::from_value(event.payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad WalletPaymentDeclined payload: {e}")))?;

        let Some(state) = self.load(&notice.reservation_id).await? else {
            return Err(HandlerError::Retryable(format!(
                "no saga row yet for reservation {}",
                notice.reservation_id
            )));
        };
        if state.already_processed(&event.event_ref()) || state.step.is_terminal() {
            return Ok(());
        }
        if state.step != SagaStep::AwaitingPayment {
            return Err(HandlerError::Retryable(format!(
                "payment answer before payment step for {}",
                notice.reservation_id
            )));
        }

        tracing::warn!(
            reservation_id = %notice.reservation_id,
            wallet_reason = ?notice.reason,
            "Payment declined"
        );
        self.compensate(state, event, "payment_declined".to_string())
            .await
    }

    async fn on_cancellation(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let SagaMessage::Cancellation(request) = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?
        else {
            return Err(HandlerError::Fatal("unexpected message type".to_string()));
        };

        let Some(state) = self.load(&request.reservation_id).await? else {
            tracing::warn!(
                reservation_id = %request.reservation_id,
                "Cancellation requested for unknown saga"
            );
            return Ok(());
        };
        if state.step.is_terminal() || state.step == SagaStep::Compensating {
            return Ok(());
        }

        let reason = request
            .reason
            .unwrap_or_else(|| "cancelled_by_user".to_string());
        self.compensate(state, event, reason).await
    }

    /// Cancel the reservation and drive the saga to `Failed`.
    ///
    /// Compensation is the saga's answer to every step failure; it never
    /// bubbles errors to the caller beyond asking for redelivery.
    async fn compensate(
        &self,
        mut state: SagaState,
        cause: &DomainEvent,
        reason: String,
    ) -> Result<(), HandlerError> {
        tracing::warn!(
            reservation_id = %state.reservation_id,
            step = %state.step,
            reason = %reason,
            "Saga compensating"
        );

        state.step = SagaStep::Compensating;
        state.status = SagaStatus::Active;
        state.last_error = Some(reason.clone());
        state.updated_at = self.clock.now();
        self.upsert(state.clone()).await?;

        let cancel = self
            .reservations
            .update_status(
                EventMetadata::caused_by(cause),
                &state.reservation_id,
                ReservationStatus::Cancelled,
                Some(reason.clone()),
                None,
            )
            .await;
        match cancel {
            Ok(()) => state.compensations.push("reservation_cancelled".to_string()),
            Err(err) if err.is_client_error() => {
                // Nothing left to unwind (e.g. reservation already
                // terminal); record and finish.
                tracing::warn!(
                    reservation_id = %state.reservation_id,
                    error = %err,
                    "Compensation had nothing to cancel"
                );
                state
                    .compensations
                    .push("reservation_cancel_skipped".to_string());
            }
            Err(err) => {
                // Infrastructure trouble: leave the row in Compensating
                // and ask for redelivery.
                return Err(HandlerError::Retryable(err.to_string()));
            }
        }

        state.step = SagaStep::Failed;
        state.status = SagaStatus::Failed;
        state.last_causation_id = Some(cause.event_ref());
        state.updated_at = self.clock.now();
        self.upsert(state.clone()).await?;

        tracing::warn!(
            reservation_id = %state.reservation_id,
            reason = %reason,
            "Saga failed after compensation"
        );
        Ok(())
    }

    async fn publish_validation_request(
        &self,
        state: &SagaState,
        cause: &DomainEvent,
    ) -> Result<(), HandlerError> {
        let message = SagaMessage::BookValidation(ReservationBookValidation {
            reservation_id: state.reservation_id.clone(),
            book_id: state.book_id.clone(),
        });
        self.publish(message, cause).await
    }

    async fn publish_payment_request(
        &self,
        state: &SagaState,
        cause: &DomainEvent,
    ) -> Result<(), HandlerError> {
        let message = SagaMessage::PaymentRequest(WalletPaymentRequest {
            reservation_id: state.reservation_id.clone(),
            user_id: state.user_id.clone(),
            fee_charged: state.fee_charged.unwrap_or(0.0),
        });
        self.publish(message, cause).await
    }

    async fn publish(&self, message: SagaMessage, cause: &DomainEvent) -> Result<(), HandlerError> {
        let event = message
            .to_domain_event(self.clock.now(), EventMetadata::caused_by(cause))
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        self.bus
            .publish(event)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))
    }

    async fn load(&self, reservation_id: &str) -> Result<Option<SagaState>, HandlerError> {
        self.sagas
            .load(reservation_id)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))
    }

    async fn upsert(&self, state: SagaState) -> Result<(), HandlerError> {
        self.sagas
            .upsert(state)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))
    }
}

impl EventHandler for ReservationPaymentSaga {
    fn name(&self) -> &'static str {
        "reservation-payment-saga"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.process(&event).await })
    }
}
