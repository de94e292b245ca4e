//! # Book Library Testing
//!
//! Deterministic in-memory adapters and helpers for testing the
//! book-library platform without a database or broker:
//!
//! - [`InMemoryEventStore`]: full append/concurrency/global-counter
//!   semantics of the production store
//! - [`InMemoryDocumentStore`]: version-guarded projection collections
//! - [`InMemorySagaStore`]: saga rows keyed by reservation
//! - [`InMemoryDeadLetterStore`], [`CaptureHandler`], [`FlakyHandler`],
//!   [`FailingHandler`]: bus test doubles
//! - [`FixedClock`] / [`test_clock`]: deterministic, manually advanced
//!   time

#![allow(clippy::missing_panics_doc)] // Lock poisoning is absorbed, not propagated

pub mod documents;
pub mod event_store;
pub mod handlers;
pub mod saga_store;

pub use documents::InMemoryDocumentStore;
pub use event_store::InMemoryEventStore;
pub use handlers::{CaptureHandler, FailingHandler, FlakyHandler, InMemoryDeadLetterStore};
pub use saga_store::InMemorySagaStore;

/// Mock implementations of environment traits.
pub mod mocks {
    use book_library_core::environment::Clock;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Deterministic clock for tests.
    ///
    /// Returns the same instant until advanced explicitly, making
    /// timestamp assertions and timeout scans reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use book_library_testing::mocks::test_clock;
    /// use book_library_core::environment::Clock;
    ///
    /// let clock = test_clock();
    /// let t1 = clock.now();
    /// let t2 = clock.now();
    /// assert_eq!(t1, t2);
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a clock pinned at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Pin the clock to a new instant.
        pub fn set(&self, to: DateTime<Utc>) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = to;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// A fixed clock at 2025-01-01 00:00:00 UTC.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use book_library_core::environment::Clock;

    #[test]
    fn fixed_clock_is_deterministic_until_advanced() {
        let clock = test_clock();
        let t1 = clock.now();
        assert_eq!(t1, clock.now());

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(clock.now() - t1, chrono::Duration::seconds(31));
    }
}
