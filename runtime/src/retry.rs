//! Retry logic with capped exponential backoff and jitter.
//!
//! One policy drives every retried operation in the platform: event
//! store appends that hit a concurrency conflict, and event bus
//! deliveries that fail transiently. Defaults follow the platform
//! contract: 5 attempts, base delay 25 ms doubling per attempt, capped
//! at 1 s, with ±25 % jitter to avoid thundering herds.
//!
//! # Example
//!
//! ```rust
//! use book_library_runtime::retry::{RetryPolicy, retry_with_policy};
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::default();
//!
//! let result = retry_with_policy(&policy, |_err: &String| true, || async {
//!     Ok::<_, String>(42)
//! })
//! .await?;
//!
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use book_library_core::error::AppError;
use book_library_core::event_store::EventStoreError;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 5 (1 initial try + 4 retries)
/// - `base_delay`: 25 ms
/// - `max_delay`: 1 s
/// - `multiplier`: 2.0
/// - `jitter`: 0.25 (each delay is scaled by a uniform factor in
///   `[1 - jitter, 1 + jitter]`)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap for the exponential backoff.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub multiplier: f64,
    /// Relative jitter amplitude (0.25 = ±25 %).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A policy that never retries (single attempt).
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff delay before retry number `retry` (0-based), without jitter.
    ///
    /// `delay = base_delay * multiplier^retry`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.base_delay.as_millis() as f64 * exp;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }

    /// Backoff delay with jitter applied.
    #[must_use]
    pub fn jittered_delay_for_retry(&self, retry: u32) -> Duration {
        let delay = self.delay_for_retry(retry);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts (including the first).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set the relative jitter amplitude.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Retry an async operation, consulting `is_retryable` per failure.
///
/// Non-retryable errors fail immediately; retryable ones back off with
/// jitter until the attempt budget is spent.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub async fn retry_with_policy<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                    return Err(err);
                }

                let delay = policy.jittered_delay_for_retry(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                metrics::counter!("event_runtime.retries").increment(1);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// An error that can signal an optimistic-concurrency conflict.
///
/// Implemented for the store error and the application error so
/// [`append_batch`] can wrap an operation at either level.
pub trait RetryableConflict {
    /// Whether this failure is a concurrency conflict worth retrying.
    fn is_concurrency_conflict(&self) -> bool;
}

impl RetryableConflict for EventStoreError {
    fn is_concurrency_conflict(&self) -> bool {
        Self::is_concurrency_conflict(self)
    }
}

impl RetryableConflict for AppError {
    fn is_concurrency_conflict(&self) -> bool {
        self.code == "CONCURRENCY_CONFLICT"
    }
}

/// Retry an event store append on concurrency conflict only.
///
/// The operation must re-derive the append each attempt (reload the
/// aggregate, re-run the domain method, append at the fresh version) —
/// replaying the identical batch after a conflict would conflict
/// forever.
///
/// # Errors
///
/// Returns the conflict error once attempts are exhausted; every other
/// error fails on first occurrence.
pub async fn append_batch<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: RetryableConflict + std::fmt::Display,
{
    retry_with_policy(policy, E::is_concurrency_conflict, operation).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use book_library_core::stream::{AggregateId, Version};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_calculation_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(25));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(200));
        // 25ms * 2^10 = 25.6s, capped at 1s.
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let jittered = policy.jittered_delay_for_retry(2).as_secs_f64();
            let base = policy.delay_for_retry(2).as_secs_f64();
            assert!(jittered >= base * 0.75 - f64::EPSILON);
            assert!(jittered <= base * 1.25 + f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(1))
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_policy(&policy, |_: &String| true, || {
            let c = Arc::clone(&counter_clone);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .base_delay(Duration::from_millis(1))
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<i32, String> = retry_with_policy(&policy, |_| true, || {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("still broken".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn append_batch_retries_conflicts_only() {
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .base_delay(Duration::from_millis(1))
            .build();

        // Conflict twice, then succeed.
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let result = append_batch(&policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EventStoreError::ConcurrencyConflict {
                        aggregate_id: AggregateId::new("book-1"),
                        expected: Version::new(3),
                        actual: Version::new(4),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        // A save failure is not retried.
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let result: Result<(), _> = append_batch(&policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(EventStoreError::SaveFailed("disk full".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
