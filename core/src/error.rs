//! Application error type with the platform's code taxonomy.
//!
//! Errors are identified by *codes*, not types: `BOOK_NOT_FOUND`,
//! `RESERVATION_INVALID_TRANSITION`, `CONCURRENCY_CONFLICT`, and so on.
//! Command and query handlers return [`AppError`]; adapters map the
//! class ([`AppError::is_client_error`]) onto their transport (4xx/5xx).

use crate::event::EventError;
use crate::event_store::EventStoreError;
use crate::document::ProjectionError;
use crate::saga::SagaStoreError;
use thiserror::Error;

/// An application-level failure carrying a taxonomy code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct AppError {
    /// Taxonomy code, e.g. `BOOK_ALREADY_EXISTS`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl AppError {
    /// Build an error with an explicit code.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// `VALIDATION_ERROR`: malformed or missing input.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    /// `<ENTITY>_NOT_FOUND`.
    #[must_use]
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(
            format!("{entity}_NOT_FOUND"),
            format!("{entity} {id} not found"),
        )
    }

    /// `<ENTITY>_ALREADY_EXISTS`.
    #[must_use]
    pub fn already_exists(entity: &str, message: impl Into<String>) -> Self {
        Self::new(format!("{entity}_ALREADY_EXISTS"), message)
    }

    /// `<ENTITY>_INVALID_TRANSITION`.
    #[must_use]
    pub fn invalid_transition(entity: &str, message: impl Into<String>) -> Self {
        Self::new(format!("{entity}_INVALID_TRANSITION"), message)
    }

    /// `<ENTITY>_INVALID_DATA`.
    #[must_use]
    pub fn invalid_data(entity: &str, message: impl Into<String>) -> Self {
        Self::new(format!("{entity}_INVALID_DATA"), message)
    }

    /// `OPERATION_TIMEOUT`: a handler exceeded its deadline.
    #[must_use]
    pub fn timeout(operation: &str) -> Self {
        Self::new(
            "OPERATION_TIMEOUT",
            format!("{operation} exceeded its deadline"),
        )
    }

    /// `COMPLEXITY_LIMIT_EXCEEDED`: the query asks for too much.
    #[must_use]
    pub fn complexity(message: impl Into<String>) -> Self {
        Self::new("COMPLEXITY_LIMIT_EXCEEDED", message)
    }

    /// `INTERNAL_ERROR`: unexpected infrastructure failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    /// Whether this error is the caller's fault (4xx-class).
    ///
    /// Validation and domain-rule violations fail fast as client errors;
    /// concurrency conflicts surface as retryable client conflicts;
    /// infrastructure failures are server errors.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.code == "VALIDATION_ERROR"
            || self.code == "CONCURRENCY_CONFLICT"
            || self.code == "COMPLEXITY_LIMIT_EXCEEDED"
            || self.code.ends_with("_NOT_FOUND")
            || self.code.ends_with("_ALREADY_EXISTS")
            || self.code.ends_with("_INVALID_TRANSITION")
            || self.code.ends_with("_INVALID_DATA")
    }
}

impl From<EventStoreError> for AppError {
    fn from(err: EventStoreError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<EventError> for AppError {
    fn from(err: EventError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<ProjectionError> for AppError {
    fn from(err: ProjectionError) -> Self {
        match &err {
            ProjectionError::InvalidQuery(message) => Self::validation(message.clone()),
            ProjectionError::Storage(_) | ProjectionError::Serialization(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<SagaStoreError> for AppError {
    fn from(err: SagaStoreError) -> Self {
        Self::internal(err.to_string())
    }
}
