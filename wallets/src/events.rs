//! Wallet domain events.

use book_library_core::event::{EventError, EventPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A wallet was opened for a user (exactly one per `userId`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCreated {
    /// The owning user.
    pub user_id: String,
    /// Opening balance.
    pub balance: f64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// The balance changed by `delta` (top-up or correction).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalanceUpdated {
    /// Signed change applied to the balance.
    pub delta: f64,
    /// Balance after the change.
    pub balance: f64,
    /// Update instant.
    pub updated_at: DateTime<Utc>,
}

/// A late fee was charged for an overdue reservation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletLateFeeApplied {
    /// The overdue reservation.
    pub reservation_id: String,
    /// Days past the due date.
    pub days_late: i64,
    /// Amount charged (capped at the retail price).
    pub fee: f64,
    /// Balance after the charge.
    pub balance: f64,
    /// Whether the cumulative fee reached the retail price, converting
    /// the loan into a purchase.
    pub book_purchased: bool,
    /// Books purchased through late fees so far.
    pub books_purchased: u32,
    /// Charge instant.
    pub applied_at: DateTime<Utc>,
}

/// A reservation fee was settled successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPaymentSuccess {
    /// The reservation whose fee was paid.
    pub reservation_id: String,
    /// Amount charged.
    pub amount: f64,
    /// Balance after the charge.
    pub balance: f64,
    /// Settlement instant.
    pub paid_at: DateTime<Utc>,
}

/// A reservation fee could not be settled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPaymentDeclined {
    /// The reservation whose fee was requested.
    pub reservation_id: String,
    /// Amount requested.
    pub amount: f64,
    /// Why the payment was declined.
    pub reason: String,
    /// Unchanged balance.
    pub balance: f64,
    /// Decline instant.
    pub declined_at: DateTime<Utc>,
}

/// The Wallets context's event stream alphabet.
#[derive(Clone, Debug, PartialEq)]
pub enum WalletEvent {
    /// `WalletCreated`
    Created(WalletCreated),
    /// `WalletBalanceUpdated`
    BalanceUpdated(WalletBalanceUpdated),
    /// `WalletLateFeeApplied`
    LateFeeApplied(WalletLateFeeApplied),
    /// `WalletPaymentSuccess`
    PaymentSuccess(WalletPaymentSuccess),
    /// `WalletPaymentDeclined`
    PaymentDeclined(WalletPaymentDeclined),
}

impl EventPayload for WalletEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "WalletCreated",
            Self::BalanceUpdated(_) => "WalletBalanceUpdated",
            Self::LateFeeApplied(_) => "WalletLateFeeApplied",
            Self::PaymentSuccess(_) => "WalletPaymentSuccess",
            Self::PaymentDeclined(_) => "WalletPaymentDeclined",
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, EventError> {
        let result = match self {
            Self::Created(p) => serde_json::to_value(p),
            Self::BalanceUpdated(p) => serde_json::to_value(p),
            Self::LateFeeApplied(p) => serde_json::to_value(p),
            Self::PaymentSuccess(p) => serde_json::to_value(p),
            Self::PaymentDeclined(p) => serde_json::to_value(p),
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
            ("WalletCreated", 1) => serde_json::from_value(payload.clone())
                .map(Self::Created)
                .map_err(decode_err),
            ("WalletBalanceUpdated", 1) => serde_json::from_value(payload.clone())
                .map(Self::BalanceUpdated)
                .map_err(decode_err),
            ("WalletLateFeeApplied", 1) => serde_json::from_value(payload.clone())
                .map(Self::LateFeeApplied)
                .map_err(decode_err),
            ("WalletPaymentSuccess", 1) => serde_json::from_value(payload.clone())
                .map(Self::PaymentSuccess)
                .map_err(decode_err),
            ("WalletPaymentDeclined", 1) => serde_json::from_value(payload.clone())
                .map(Self::PaymentDeclined)
                .map_err(decode_err),
            _ => Err(EventError::UnknownEventType {
                event_type: event_type.to_string(),
                schema_version,
            }),
        }
    }
}
