//! Aggregate identification and versioning types.
//!
//! This module defines strong types for aggregate identity (`AggregateId`)
//! and the two version counters used by the event store: the per-aggregate
//! `Version` (optimistic concurrency) and the store-wide `GlobalVersion`
//! (cross-aggregate ordering for projections and debugging).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `AggregateId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

/// Unique identifier for an aggregate instance (one event stream).
///
/// Examples: `"book-0b7c…"`, `"reservation-4f21…"`, `"wallet-user-42"`.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings (use for external input)
/// - `new()` and `From`: no validation (application-controlled data)
///
/// # Examples
///
/// ```
/// use book_library_core::stream::AggregateId;
///
/// let id = AggregateId::new("book-123");
/// assert_eq!(id.as_str(), "book-123");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId(String);

impl AggregateId {
    /// Create a new `AggregateId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the aggregate ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `AggregateId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseAggregateIdError(
                "Aggregate ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-aggregate event sequence number for optimistic concurrency control.
///
/// The first event of an aggregate has version 1; the k-th event has
/// version k. An append supplies the *expected* current version (0 for a
/// new stream); a mismatch signals a concurrent writer.
///
/// # Examples
///
/// ```
/// use book_library_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// assert!(v0.is_initial());
/// assert_eq!(v0.next(), Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a stream with no events yet.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    ///
    /// Reaching `u64::MAX` is not a realistic concern for any stream.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (no events appended yet).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Store-wide, strictly increasing sequence number assigned at append.
///
/// Used for cross-aggregate ordering of projections and debugging only;
/// correctness never depends on it. The counter may skip values (failed
/// appends never return their allocated block), so consumers must
/// tolerate gaps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalVersion(u64);

impl GlobalVersion {
    /// Create a new `GlobalVersion` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GlobalVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GlobalVersion> for u64 {
    fn from(version: GlobalVersion) -> Self {
        version.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod aggregate_id_tests {
        use super::*;

        #[test]
        fn new_creates_aggregate_id() {
            let id = AggregateId::new("book-123");
            assert_eq!(id.as_str(), "book-123");
        }

        #[test]
        #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
        fn parse_from_str() {
            let id: AggregateId = "reservation-1".parse().expect("parse should succeed");
            assert_eq!(id, AggregateId::new("reservation-1"));
        }

        #[test]
        fn parse_empty_string_fails() {
            let result = "".parse::<AggregateId>();
            assert!(result.is_err());
        }

        #[test]
        fn display() {
            let id = AggregateId::new("wallet-7");
            assert_eq!(format!("{id}"), "wallet-7");
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn initial_version() {
            assert_eq!(Version::INITIAL, Version::new(0));
            assert!(Version::INITIAL.is_initial());
            assert!(!Version::new(1).is_initial());
        }

        #[test]
        fn next_version() {
            assert_eq!(Version::INITIAL.next(), Version::new(1));
            assert_eq!(Version::new(1).next(), Version::new(2));
        }

        #[test]
        fn version_ordering() {
            assert!(Version::new(1) < Version::new(2));
            assert!(Version::new(3) > Version::new(1));
        }

        #[test]
        fn version_arithmetic() {
            assert_eq!(Version::new(5) + 3, Version::new(8));
        }
    }

    mod global_version_tests {
        use super::*;

        #[test]
        fn global_version_roundtrip() {
            let gv = GlobalVersion::from(12_034_u64);
            assert_eq!(gv.value(), 12_034);
            let raw: u64 = gv.into();
            assert_eq!(raw, 12_034);
        }

        #[test]
        fn global_version_ordering() {
            assert!(GlobalVersion::new(10) < GlobalVersion::new(11));
        }
    }
}
