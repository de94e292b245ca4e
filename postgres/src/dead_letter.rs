//! `PostgreSQL` dead-letter store.
//!
//! Persists deliveries a subscriber could not process after retries,
//! keyed by `(event_type, aggregate_id, version, subscriber)`. Entries
//! support an investigation lifecycle: pending until marked resolved.

use book_library_core::event::DomainEvent;
use book_library_core::event_bus::{
    DeadLetterError, DeadLetterStore, DeadLetteredEvent,
};
use book_library_core::stream::{AggregateId, Version};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// Dead-letter entries backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetteredEvent, DeadLetterError> {
        let event_json: serde_json::Value = row.get("event");
        let event: DomainEvent = serde_json::from_value(event_json)
            .map_err(|e| DeadLetterError::Storage(format!("Bad stored event: {e}")))?;
        let attempts: i32 = row.get("attempts");

        Ok(DeadLetteredEvent {
            event,
            subscriber: row.get("subscriber"),
            error: row.get("error"),
            attempts: attempts.unsigned_abs(),
            failed_at: row.get("failed_at"),
        })
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn add(
        &self,
        entry: DeadLetteredEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let event_json = serde_json::to_value(&entry.event)
                .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

            // Redelivery of an already-parked event refreshes the entry
            // instead of duplicating it.
            #[allow(clippy::cast_possible_wrap)] // Versions stay far below i64::MAX
            sqlx::query(
                r"
                INSERT INTO dead_letter_events
                    (event_type, aggregate_id, version, subscriber,
                     event, error, attempts, failed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (event_type, aggregate_id, version, subscriber) DO UPDATE
                SET error = EXCLUDED.error,
                    attempts = dead_letter_events.attempts + EXCLUDED.attempts,
                    failed_at = EXCLUDED.failed_at,
                    status = 'pending'
                ",
            )
            .bind(&entry.event.event_type)
            .bind(entry.event.aggregate_id.as_str())
            .bind(entry.event.version.value() as i64)
            .bind(&entry.subscriber)
            .bind(event_json)
            .bind(&entry.error)
            .bind(i32::try_from(entry.attempts).unwrap_or(i32::MAX))
            .bind(entry.failed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

            tracing::warn!(
                event_type = %entry.event.event_type,
                aggregate_id = %entry.event.aggregate_id,
                version = %entry.event.version,
                subscriber = %entry.subscriber,
                error = %entry.error,
                "Event added to dead-letter store"
            );
            metrics::counter!("event_bus.dlq.added").increment(1);

            Ok(())
        })
    }

    fn list_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetteredEvent>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT event, subscriber, error, attempts, failed_at
                FROM dead_letter_events
                WHERE status = 'pending'
                ORDER BY failed_at ASC
                LIMIT $1
                ",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

            rows.iter().map(Self::row_to_entry).collect()
        })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM dead_letter_events WHERE status = 'pending'",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

            #[allow(clippy::cast_sign_loss)] // COUNT(*) is non-negative
            Ok(count as u64)
        })
    }

    fn mark_resolved(
        &self,
        event_type: &str,
        aggregate_id: &AggregateId,
        version: Version,
        resolved_by: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let event_type = event_type.to_string();
        let aggregate_id = aggregate_id.clone();
        let resolved_by = resolved_by.to_string();
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Versions stay far below i64::MAX
            sqlx::query(
                r"
                UPDATE dead_letter_events
                SET status = 'resolved', resolved_at = NOW(), resolved_by = $4
                WHERE event_type = $1 AND aggregate_id = $2 AND version = $3
                ",
            )
            .bind(&event_type)
            .bind(aggregate_id.as_str())
            .bind(version.value() as i64)
            .bind(&resolved_by)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

            tracing::info!(
                event_type = %event_type,
                aggregate_id = %aggregate_id,
                version = %version,
                resolved_by = %resolved_by,
                "Dead-letter entry resolved"
            );
            metrics::counter!("event_bus.dlq.resolved").increment(1);

            Ok(())
        })
    }
}
