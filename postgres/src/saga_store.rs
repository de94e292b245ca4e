//! `PostgreSQL` saga state store.
//!
//! One row per coordinated reservation in `reservation_payment_sagas`:
//! the full state as JSONB plus promoted `step`/`status`/`updated_at`
//! columns for the watchdog scan and operational queries.

use book_library_core::saga::{SagaState, SagaStateStore, SagaStep, SagaStoreError};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// Saga rows backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> Result<SagaState, SagaStoreError> {
        let state: serde_json::Value = row.get("state");
        serde_json::from_value(state).map_err(|e| SagaStoreError::Serialization(e.to_string()))
    }
}

impl SagaStateStore for PostgresSagaStore {
    fn upsert(
        &self,
        state: SagaState,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaStoreError>> + Send + '_>> {
        Box::pin(async move {
            let state_json = serde_json::to_value(&state)
                .map_err(|e| SagaStoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r"
                INSERT INTO reservation_payment_sagas
                    (reservation_id, state, step, status, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (reservation_id) DO UPDATE
                SET state = EXCLUDED.state,
                    step = EXCLUDED.step,
                    status = EXCLUDED.status,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(&state.reservation_id)
            .bind(state_json)
            .bind(state.step.to_string())
            .bind(state.status.to_string())
            .bind(state.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| SagaStoreError::Storage(e.to_string()))?;

            tracing::debug!(
                reservation_id = %state.reservation_id,
                step = %state.step,
                status = %state.status,
                "Saga state upserted"
            );
            Ok(())
        })
    }

    fn load(
        &self,
        reservation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaState>, SagaStoreError>> + Send + '_>> {
        let reservation_id = reservation_id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT state FROM reservation_payment_sagas WHERE reservation_id = $1",
            )
            .bind(&reservation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SagaStoreError::Storage(e.to_string()))?;

            row.as_ref().map(Self::row_to_state).transpose()
        })
    }

    fn find_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaState>, SagaStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT state FROM reservation_payment_sagas
                WHERE step IN ($1, $2) AND updated_at < $3
                ORDER BY updated_at ASC
                ",
            )
            .bind(SagaStep::AwaitingBookValidation.to_string())
            .bind(SagaStep::AwaitingPayment.to_string())
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SagaStoreError::Storage(e.to_string()))?;

            rows.iter().map(Self::row_to_state).collect()
        })
    }
}
