//! In-memory saga state store.

#![allow(clippy::missing_panics_doc)] // Lock poisoning is absorbed, not propagated

use book_library_core::saga::{SagaState, SagaStateStore, SagaStoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory saga rows keyed by `reservation_id`.
///
/// Cheap to clone; clones share the same rows.
#[derive(Clone, Default, Debug)]
pub struct InMemorySagaStore {
    rows: Arc<Mutex<HashMap<String, SagaState>>>,
}

impl InMemorySagaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saga rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sagas are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SagaState>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SagaStateStore for InMemorySagaStore {
    fn upsert(
        &self,
        state: SagaState,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.lock().insert(state.reservation_id.clone(), state);
            Ok(())
        })
    }

    fn load(
        &self,
        reservation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaState>, SagaStoreError>> + Send + '_>> {
        let reservation_id = reservation_id.to_string();
        Box::pin(async move { Ok(self.lock().get(&reservation_id).cloned()) })
    }

    fn find_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaState>, SagaStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut stale: Vec<SagaState> = self
                .lock()
                .values()
                .filter(|s| s.step.is_waiting() && s.updated_at < older_than)
                .cloned()
                .collect();
            stale.sort_by_key(|s| s.updated_at);
            Ok(stale)
        })
    }
}
