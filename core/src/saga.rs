//! Persistent saga state and its store seam.
//!
//! A saga is a long-running process coordinating multiple aggregates
//! with compensations instead of distributed transactions. Its state is
//! one upserted row per active workflow instance; every transition
//! bumps `updated_at`, and duplicate deliveries are detected by the
//! last-processed causation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Position of a saga in its state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStep {
    /// Waiting for the Books context to validate the reserved book.
    AwaitingBookValidation,
    /// Waiting for the Wallets context to settle the reservation fee.
    AwaitingPayment,
    /// Terminal: every step succeeded.
    Completed,
    /// Running compensating actions after a failure.
    Compensating,
    /// Terminal: the workflow failed (compensations done).
    Failed,
}

impl SagaStep {
    /// Whether the saga is parked waiting for an external answer.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::AwaitingBookValidation | Self::AwaitingPayment)
    }

    /// Whether the saga has reached a terminal step.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingBookValidation => "AwaitingBookValidation",
            Self::AwaitingPayment => "AwaitingPayment",
            Self::Completed => "Completed",
            Self::Compensating => "Compensating",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Coarse liveness summary, indexed for operational queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    /// The workflow is still progressing.
    Active,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One persisted reservation–payment workflow instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaState {
    /// Saga instance id.
    pub id: String,

    /// The reservation this workflow coordinates (unique per saga).
    pub reservation_id: String,

    /// The reserving user.
    pub user_id: String,

    /// The reserved book (canonical internal id, not ISBN).
    pub book_id: String,

    /// State-machine position.
    pub step: SagaStep,

    /// Liveness summary.
    pub status: SagaStatus,

    /// Retail price learned from book validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retail_price: Option<f64>,

    /// Fee charged for the reservation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_charged: Option<f64>,

    /// Compensating actions already executed, in order.
    #[serde(default)]
    pub compensations: Vec<String>,

    /// Step-reissue attempts made by the timeout watchdog.
    #[serde(default)]
    pub retry_count: u32,

    /// Causation id of the last processed input (duplicate detection).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_causation_id: Option<String>,

    /// When the workflow started.
    pub started_at: DateTime<Utc>,

    /// When the last transition happened.
    pub updated_at: DateTime<Utc>,

    /// Message of the last error, if any step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SagaState {
    /// Whether `causation_id` was already processed by this saga.
    #[must_use]
    pub fn already_processed(&self, causation_id: &str) -> bool {
        self.last_causation_id.as_deref() == Some(causation_id)
    }
}

/// Error type for saga state persistence.
#[derive(Error, Debug)]
pub enum SagaStoreError {
    /// Storage backend error.
    #[error("Saga storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Saga serialization error: {0}")]
    Serialization(String),
}

/// Persistence seam for saga state, keyed by `reservation_id`.
pub trait SagaStateStore: Send + Sync {
    /// Insert or replace the row for `state.reservation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SagaStoreError`] if the write fails.
    fn upsert(
        &self,
        state: SagaState,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaStoreError>> + Send + '_>>;

    /// Load the saga coordinating `reservation_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SagaStoreError`] if the read fails.
    fn load(
        &self,
        reservation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaState>, SagaStoreError>> + Send + '_>>;

    /// Find sagas parked in a waiting step whose `updated_at` is older
    /// than `older_than` (the timeout watchdog's scan).
    ///
    /// # Errors
    ///
    /// Returns [`SagaStoreError`] if the scan fails.
    fn find_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaState>, SagaStoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_classification() {
        assert!(SagaStep::AwaitingBookValidation.is_waiting());
        assert!(SagaStep::AwaitingPayment.is_waiting());
        assert!(!SagaStep::Compensating.is_waiting());
        assert!(SagaStep::Completed.is_terminal());
        assert!(SagaStep::Failed.is_terminal());
        assert!(!SagaStep::Compensating.is_terminal());
    }

    #[test]
    fn duplicate_detection_matches_last_causation() {
        let state = SagaState {
            id: "saga-1".to_string(),
            reservation_id: "r1".to_string(),
            user_id: "u1".to_string(),
            book_id: "b1".to_string(),
            step: SagaStep::AwaitingPayment,
            status: SagaStatus::Active,
            retail_price: Some(20.0),
            fee_charged: None,
            compensations: vec![],
            retry_count: 0,
            last_causation_id: Some("r1:1".to_string()),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            last_error: None,
        };

        assert!(state.already_processed("r1:1"));
        assert!(!state.already_processed("r1:2"));
    }
}
