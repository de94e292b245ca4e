//! Query-cache interface.
//!
//! The core defines the caching seam only: a TTL'd key/value store plus
//! a policy with a guard predicate deciding which results are worth
//! caching (e.g. skip empty pages). Wiring an actual backend (Redis, an
//! in-process map) is an adapter concern outside this workspace.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// TTL'd cache for query results, keyed by a caller-built string.
pub trait QueryCache: Send + Sync {
    /// Look up a cached value.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Option<serde_json::Value>> + Send + '_>>;

    /// Store a value with a time-to-live.
    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Drop a cached value (called on invalidating writes).
    fn invalidate(&self, key: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Caching policy for one query: TTL plus a guard predicate.
///
/// The guard inspects the fresh result and returns whether it should be
/// cached at all.
#[derive(Clone)]
pub struct CachePolicy {
    /// How long a cached result stays fresh.
    pub ttl: Duration,
    /// Whether a given result is worth caching.
    pub cache_if: Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>,
}

impl CachePolicy {
    /// A policy caching every result for `ttl`.
    #[must_use]
    pub fn always(ttl: Duration) -> Self {
        Self {
            ttl,
            cache_if: Arc::new(|_| true),
        }
    }

    /// A policy with a custom guard predicate.
    #[must_use]
    pub fn with_guard(
        ttl: Duration,
        guard: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            ttl,
            cache_if: Arc::new(guard),
        }
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn guard_predicate_filters_results() {
        let policy = CachePolicy::with_guard(Duration::from_secs(60), |v| {
            !v.as_array().is_some_and(Vec::is_empty)
        });

        assert!((policy.cache_if)(&json!([1, 2])));
        assert!(!(policy.cache_if)(&json!([])));
    }
}
