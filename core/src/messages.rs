//! Cross-context workflow messages for the reservation–payment saga.
//!
//! These events travel on the bus but are never appended to an
//! aggregate stream: they are the saga's requests to other contexts and
//! their answers. They use the coordinated reservation's id as the
//! envelope's aggregate id so per-reservation delivery ordering holds.

use crate::event::{DomainEvent, EventError, EventMetadata, EventPayload};
use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type of the saga's book-validation request.
pub const RESERVATION_BOOK_VALIDATION: &str = "ReservationBookValidation";
/// Event type of the Books context's validation answer.
pub const BOOK_VALIDATION_RESULT: &str = "BookValidationResult";
/// Event type of the saga's payment request to the Wallets context.
pub const WALLET_PAYMENT_REQUEST: &str = "WalletPaymentRequest";
/// Event type of an external cancellation request.
pub const RESERVATION_CANCELLATION_REQUESTED: &str = "ReservationCancellationRequested";

/// Ask the Books context whether the reserved book can be lent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationBookValidation {
    /// The reservation being validated.
    pub reservation_id: String,
    /// The reserved book.
    pub book_id: String,
}

/// The Books context's answer to a validation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookValidationResult {
    /// The reservation being validated.
    pub reservation_id: String,
    /// The reserved book.
    pub book_id: String,
    /// Whether the book exists and is lendable.
    pub valid: bool,
    /// Retail price of the book, when valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retail_price: Option<f64>,
    /// Why validation failed, when invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ask the Wallets context to settle the reservation fee.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPaymentRequest {
    /// The reservation the fee belongs to.
    pub reservation_id: String,
    /// The paying user.
    pub user_id: String,
    /// Fee to charge.
    pub fee_charged: f64,
}

/// External request to cancel a reservation mid-workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationCancellationRequested {
    /// The reservation to cancel.
    pub reservation_id: String,
    /// Why the reservation is cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The saga's wire messages as one typed payload enum.
#[derive(Clone, Debug, PartialEq)]
pub enum SagaMessage {
    /// Request: validate the reserved book.
    BookValidation(ReservationBookValidation),
    /// Answer: validation outcome.
    ValidationResult(BookValidationResult),
    /// Request: settle the reservation fee.
    PaymentRequest(WalletPaymentRequest),
    /// Request: cancel the reservation.
    Cancellation(ReservationCancellationRequested),
}

impl EventPayload for SagaMessage {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BookValidation(_) => RESERVATION_BOOK_VALIDATION,
            Self::ValidationResult(_) => BOOK_VALIDATION_RESULT,
            Self::PaymentRequest(_) => WALLET_PAYMENT_REQUEST,
            Self::Cancellation(_) => RESERVATION_CANCELLATION_REQUESTED,
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, EventError> {
        let result = match self {
            Self::BookValidation(p) => serde_json::to_value(p),
            Self::ValidationResult(p) => serde_json::to_value(p),
            Self::PaymentRequest(p) => serde_json::to_value(p),
            Self::Cancellation(p) => serde_json::to_value(p),
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
            (RESERVATION_BOOK_VALIDATION, 1) => serde_json::from_value(payload.clone())
                .map(Self::BookValidation)
                .map_err(decode_err),
            (BOOK_VALIDATION_RESULT, 1) => serde_json::from_value(payload.clone())
                .map(Self::ValidationResult)
                .map_err(decode_err),
            (WALLET_PAYMENT_REQUEST, 1) => serde_json::from_value(payload.clone())
                .map(Self::PaymentRequest)
                .map_err(decode_err),
            (RESERVATION_CANCELLATION_REQUESTED, 1) => serde_json::from_value(payload.clone())
                .map(Self::Cancellation)
                .map_err(decode_err),
            _ => Err(EventError::UnknownEventType {
                event_type: event_type.to_string(),
                schema_version,
            }),
        }
    }
}

impl SagaMessage {
    /// The reservation this message coordinates.
    #[must_use]
    pub fn reservation_id(&self) -> &str {
        match self {
            Self::BookValidation(p) => &p.reservation_id,
            Self::ValidationResult(p) => &p.reservation_id,
            Self::PaymentRequest(p) => &p.reservation_id,
            Self::Cancellation(p) => &p.reservation_id,
        }
    }

    /// Wrap this message in a bus envelope keyed by its reservation.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload fails to
    /// serialize.
    pub fn to_domain_event(
        &self,
        timestamp: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<DomainEvent, EventError> {
        DomainEvent::new(
            AggregateId::new(self.reservation_id()),
            self,
            Version::new(1),
            timestamp,
            metadata,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn messages_roundtrip_through_the_envelope() {
        let message = SagaMessage::PaymentRequest(WalletPaymentRequest {
            reservation_id: "r1".to_string(),
            user_id: "u1".to_string(),
            fee_charged: 3.0,
        });

        let event = message
            .to_domain_event(Utc::now(), EventMetadata::default())
            .unwrap();
        assert_eq!(event.event_type, "WalletPaymentRequest");
        assert_eq!(event.aggregate_id.as_str(), "r1");
        assert_eq!(event.payload["feeCharged"], 3.0);

        let decoded: SagaMessage = event.decode().unwrap();
        assert_eq!(decoded, message);
    }
}
