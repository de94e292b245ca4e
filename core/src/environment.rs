//! Injected environment dependencies.
//!
//! External facilities are abstracted behind traits and passed into
//! handlers explicitly — no module-load side effects, no globals.

use chrono::{DateTime, Utc};

/// Clock trait: abstracts time for testability.
///
/// Production code uses [`SystemClock`]; tests use the fixed clock from
/// `book-library-testing` for deterministic timestamps.
pub trait Clock: Send + Sync {
    /// The current instant (UTC).
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
