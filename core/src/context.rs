//! Per-request execution context: correlation, user, deadline.
//!
//! Every command and query handler takes a [`RequestContext`]. It seeds
//! the correlation metadata for produced events and carries the
//! optional deadline; I/O wrapped with [`with_deadline`] maps an
//! exceeded deadline onto `OPERATION_TIMEOUT`. In-flight appends are
//! safe to retry after a timeout because `(aggregate_id, version)`
//! uniqueness makes them idempotent.

use crate::error::AppError;
use crate::event::EventMetadata;
use std::future::Future;
use std::time::Duration;

/// Identity and deadline of one inbound request.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Business-request correlation id; synthesized when absent.
    pub correlation_id: Option<String>,

    /// The acting user.
    pub user_id: Option<String>,

    /// Wall-clock budget for the whole handler.
    pub deadline: Option<Duration>,
}

impl RequestContext {
    /// An anonymous context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the acting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the handler deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Event metadata for the first event of this request.
    ///
    /// A missing correlation id is synthesized so every chain is
    /// traceable.
    #[must_use]
    pub fn metadata(&self) -> EventMetadata {
        EventMetadata::for_request(self.correlation_id.clone(), self.user_id.clone())
    }
}

/// Run `operation` under the context's deadline, if it has one.
///
/// # Errors
///
/// Returns `OPERATION_TIMEOUT` when the deadline elapses; otherwise the
/// operation's own result.
pub async fn with_deadline<T, F>(
    ctx: &RequestContext,
    operation_name: &str,
    operation: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match ctx.deadline {
        Some(deadline) => match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation = operation_name, ?deadline, "Operation timed out");
                Err(AppError::timeout(operation_name))
            }
        },
        None => operation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_maps_to_operation_timeout() {
        let ctx = RequestContext::new().with_deadline(Duration::from_millis(5));

        let result: Result<(), AppError> = with_deadline(&ctx, "SlowOp", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result.map_err(|e| e.code),
            Err("OPERATION_TIMEOUT".to_string())
        );
    }

    #[tokio::test]
    async fn no_deadline_passes_through() {
        let ctx = RequestContext::new();
        let result = with_deadline(&ctx, "FastOp", async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn metadata_synthesizes_correlation() {
        let meta = RequestContext::new().with_user("u1").metadata();
        assert!(meta.correlation_id.is_some());
        assert_eq!(meta.user_id.as_deref(), Some("u1"));
    }
}
