//! Environment-driven configuration for the core runtime.
//!
//! All values have working defaults; an unparseable variable falls back
//! to its default with a warning rather than failing startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration recognized by the core.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Default page size for projection queries (`PAGINATION_DEFAULT_LIMIT`).
    pub pagination_default_limit: u32,

    /// Upper bound on page size (`PAGINATION_MAX_LIMIT`).
    pub pagination_max_limit: u32,

    /// Late fee charged per overdue day (`LATE_FEE_PER_DAY`).
    pub late_fee_per_day: f64,

    /// How long a saga step may wait before the watchdog reissues it
    /// (`SAGA_STEP_TIMEOUT`, milliseconds).
    pub saga_step_timeout: Duration,

    /// Step reissues before the saga compensates (`SAGA_MAX_RETRIES`).
    pub saga_max_retries: u32,

    /// Event store connection string (`EVENT_STORE_CONN_STRING`).
    pub event_store_conn_string: Option<String>,

    /// Event store database name (`EVENT_STORE_DB`).
    pub event_store_db: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pagination_default_limit: 10,
            pagination_max_limit: 100,
            late_fee_per_day: 0.2,
            saga_step_timeout: Duration::from_millis(30_000),
            saga_max_retries: 3,
            event_store_conn_string: None,
            event_store_db: None,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pagination_default_limit: env_or(
                "PAGINATION_DEFAULT_LIMIT",
                defaults.pagination_default_limit,
            ),
            pagination_max_limit: env_or("PAGINATION_MAX_LIMIT", defaults.pagination_max_limit),
            late_fee_per_day: env_or("LATE_FEE_PER_DAY", defaults.late_fee_per_day),
            saga_step_timeout: Duration::from_millis(env_or(
                "SAGA_STEP_TIMEOUT",
                u64::try_from(defaults.saga_step_timeout.as_millis()).unwrap_or(30_000),
            )),
            saga_max_retries: env_or("SAGA_MAX_RETRIES", defaults.saga_max_retries),
            event_store_conn_string: env::var("EVENT_STORE_CONN_STRING").ok(),
            event_store_db: env::var("EVENT_STORE_DB").ok(),
        }
    }
}

/// Parse an environment variable, falling back to `default` (with a
/// warning) on absence or parse failure.
fn env_or<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    parse_or(env::var(name).ok(), name, default)
}

fn parse_or<T: FromStr + Copy + std::fmt::Debug>(raw: Option<String>, name: &str, default: T) -> T {
    match raw {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    variable = name,
                    value = raw,
                    fallback = ?default,
                    "Unparseable environment variable, using default"
                );
                default
            }
        },
        None => default,
    }
}
