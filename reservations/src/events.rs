//! Reservation domain events.

use book_library_core::event::{EventError, EventPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a reservation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Just created, not yet validated.
    Created,
    /// Book validated, awaiting payment.
    Validated,
    /// Validation failed.
    Rejected,
    /// Fee paid, book lent out.
    Active,
    /// Past the due date.
    Late,
    /// Book returned.
    Returned,
    /// Converted into a purchase by accumulated late fees.
    Bought,
    /// Cancelled before activation.
    Cancelled,
}

impl ReservationStatus {
    /// Whether the lifecycle may move from `self` to `next`.
    ///
    /// Duplicate inputs are commutative by design: a transition to the
    /// current status is treated as a no-op by the aggregate, not an
    /// error.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Created,
                Self::Validated | Self::Rejected | Self::Active | Self::Cancelled
            ) | (Self::Validated, Self::Active | Self::Rejected | Self::Cancelled)
                | (
                    Self::Active,
                    Self::Late | Self::Returned | Self::Bought | Self::Cancelled
                )
                | (Self::Late, Self::Returned | Self::Bought)
                | (Self::Returned, Self::Bought)
        )
    }

    /// Whether the reservation can still be returned.
    #[must_use]
    pub const fn is_returnable(self) -> bool {
        matches!(self, Self::Active | Self::Late)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
            Self::Active => "active",
            Self::Late => "late",
            Self::Returned => "returned",
            Self::Bought => "bought",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A user reserved a book.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationCreated {
    /// The reserving user.
    pub user_id: String,
    /// The reserved book (canonical internal id).
    pub book_id: String,
    /// Reservation instant.
    pub reserved_at: DateTime<Utc>,
    /// When the book is due back.
    pub due_date: DateTime<Utc>,
    /// Reservation fee.
    pub fee_charged: f64,
    /// Retail price snapshot, when known at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retail_price: Option<f64>,
}

/// The reservation moved through its lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStatusUpdated {
    /// The new status.
    pub status: ReservationStatus,
    /// Why, when the transition needs explaining (e.g.
    /// `payment_declined`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Transition instant.
    pub updated_at: DateTime<Utc>,
    /// Retail price learned during validation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retail_price: Option<f64>,
}

/// The book came back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationReturned {
    /// The reserving user (for the wallet's late-fee charge).
    pub user_id: String,
    /// The returned book.
    pub book_id: String,
    /// Return instant.
    pub returned_at: DateTime<Utc>,
    /// Whole days past the due date (0 when on time).
    pub days_late: i64,
    /// Retail price snapshot for the purchase threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retail_price: Option<f64>,
}

/// A fee was charged against the reservation (late fee).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationFeeCharged {
    /// Amount charged.
    pub amount: f64,
    /// Charge instant.
    pub charged_at: DateTime<Utc>,
}

/// The reservation fee was settled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationFeePaid {
    /// Amount paid.
    pub amount: f64,
    /// Settlement instant.
    pub paid_at: DateTime<Utc>,
}

/// The due date was pushed out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDueDateExtended {
    /// The new due date.
    pub due_date: DateTime<Utc>,
    /// Extension instant.
    pub extended_at: DateTime<Utc>,
}

/// The reservation was soft-deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDeleted {
    /// Deletion instant.
    pub deleted_at: DateTime<Utc>,
}

/// The Reservations context's event stream alphabet.
#[derive(Clone, Debug, PartialEq)]
pub enum ReservationEvent {
    /// `ReservationCreated`
    Created(ReservationCreated),
    /// `ReservationStatusUpdated`
    StatusUpdated(ReservationStatusUpdated),
    /// `ReservationReturned`
    Returned(ReservationReturned),
    /// `ReservationFeeCharged`
    FeeCharged(ReservationFeeCharged),
    /// `ReservationFeePaid`
    FeePaid(ReservationFeePaid),
    /// `ReservationDueDateExtended`
    DueDateExtended(ReservationDueDateExtended),
    /// `ReservationDeleted`
    Deleted(ReservationDeleted),
}

impl EventPayload for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "ReservationCreated",
            Self::StatusUpdated(_) => "ReservationStatusUpdated",
            Self::Returned(_) => "ReservationReturned",
            Self::FeeCharged(_) => "ReservationFeeCharged",
            Self::FeePaid(_) => "ReservationFeePaid",
            Self::DueDateExtended(_) => "ReservationDueDateExtended",
            Self::Deleted(_) => "ReservationDeleted",
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, EventError> {
        let result = match self {
            Self::Created(p) => serde_json::to_value(p),
            Self::StatusUpdated(p) => serde_json::to_value(p),
            Self::Returned(p) => serde_json::to_value(p),
            Self::FeeCharged(p) => serde_json::to_value(p),
            Self::FeePaid(p) => serde_json::to_value(p),
            Self::DueDateExtended(p) => serde_json::to_value(p),
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
            ("ReservationCreated", 1) => serde_json::from_value(payload.clone())
                .map(Self::Created)
                .map_err(decode_err),
            ("ReservationStatusUpdated", 1) => serde_json::from_value(payload.clone())
                .map(Self::StatusUpdated)
                .map_err(decode_err),
            ("ReservationReturned", 1) => serde_json::from_value(payload.clone())
                .map(Self::Returned)
                .map_err(decode_err),
            ("ReservationFeeCharged", 1) => serde_json::from_value(payload.clone())
                .map(Self::FeeCharged)
                .map_err(decode_err),
            ("ReservationFeePaid", 1) => serde_json::from_value(payload.clone())
                .map(Self::FeePaid)
                .map_err(decode_err),
            ("ReservationDueDateExtended", 1) => serde_json::from_value(payload.clone())
                .map(Self::DueDateExtended)
                .map_err(decode_err),
            ("ReservationDeleted", 1) => serde_json::from_value(payload.clone())
                .map(Self::Deleted)
                .map_err(decode_err),
            _ => Err(EventError::UnknownEventType {
                event_type: event_type.to_string(),
                schema_version,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transition_table() {
        use ReservationStatus as S;
        assert!(S::Created.can_transition_to(S::Validated));
        assert!(S::Created.can_transition_to(S::Rejected));
        assert!(S::Validated.can_transition_to(S::Active));
        assert!(S::Active.can_transition_to(S::Returned));
        assert!(S::Late.can_transition_to(S::Returned));
        assert!(S::Returned.can_transition_to(S::Bought));

        assert!(!S::Returned.can_transition_to(S::Active));
        assert!(!S::Cancelled.can_transition_to(S::Active));
        assert!(!S::Bought.can_transition_to(S::Returned));
        assert!(!S::Rejected.can_transition_to(S::Validated));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(ReservationStatus::Active).unwrap_or_default();
        assert_eq!(json, "active");
    }
}
