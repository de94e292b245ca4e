//! `PostgreSQL` event store.
//!
//! Layout: one `event_store` table with a compound primary key
//! `(aggregate_id, version)` plus a secondary index on `global_version`,
//! and a single-row `counters` table backing the global counter.
//!
//! Global versions are allocated as a contiguous block with one atomic
//! `UPDATE … RETURNING` *before* the insert transaction, so a failed
//! append burns its block — the counter never reuses values, and
//! consumers must tolerate gaps.

use book_library_core::event::{DomainEvent, EventMetadata};
use book_library_core::event_store::{EventStore, EventStoreError};
use book_library_core::stream::{AggregateId, GlobalVersion, Version};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// Production event store backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect to the event store database.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::LookupFailed`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::LookupFailed(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the schema migrations (event store, projections, sagas, DLQ).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SaveFailed`] if migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::SaveFailed(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Reserve a contiguous block of `n` global versions; returns the
    /// first value of the block.
    async fn allocate_global_block(&self, n: i64) -> Result<i64, EventStoreError> {
        let (seq,): (i64,) = sqlx::query_as(
            "UPDATE counters SET seq = seq + $1 WHERE id = 'globalVersion' RETURNING seq",
        )
        .bind(n)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EventStoreError::SaveFailed(format!("Counter allocation failed: {e}")))?;

        Ok(seq - n + 1)
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<DomainEvent, EventStoreError> {
        let version: i64 = row.get("version");
        let global_version: i64 = row.get("global_version");
        let schema_version: i32 = row.get("schema_version");
        let metadata_json: serde_json::Value = row.get("metadata");
        let metadata: EventMetadata = serde_json::from_value(metadata_json)
            .map_err(|e| EventStoreError::LookupFailed(format!("Bad event metadata: {e}")))?;

        #[allow(clippy::cast_sign_loss)] // Versions are assigned positive
        Ok(DomainEvent {
            aggregate_id: AggregateId::new(row.get::<String, _>("aggregate_id")),
            event_type: row.get("event_type"),
            version: Version::new(version as u64),
            global_version: Some(GlobalVersion::new(global_version as u64)),
            schema_version: schema_version.unsigned_abs(),
            timestamp: row.get("timestamp"),
            payload: row.get("payload"),
            metadata,
        })
    }
}

impl EventStore for PostgresEventStore {
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if aggregate_id.as_str().is_empty() {
                return Err(EventStoreError::InvalidAggregateId(
                    "empty aggregate id".to_string(),
                ));
            }
            if events.is_empty() {
                return Ok(Vec::new());
            }

            let n = i64::try_from(events.len())
                .map_err(|_| EventStoreError::SaveFailed("batch too large".to_string()))?;
            let first_global = self.allocate_global_block(n).await?;

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| EventStoreError::SaveFailed(e.to_string()))?;

            let (actual,): (Option<i64>,) =
                sqlx::query_as("SELECT MAX(version) FROM event_store WHERE aggregate_id = $1")
                    .bind(aggregate_id.as_str())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| EventStoreError::LookupFailed(e.to_string()))?;
            #[allow(clippy::cast_sign_loss)] // Versions are assigned positive
            let actual = Version::new(actual.unwrap_or(0) as u64);
            if actual != expected_version {
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                });
            }

            let stored_at = Utc::now();
            let mut stored = Vec::with_capacity(events.len());
            for (i, mut event) in events.into_iter().enumerate() {
                event.aggregate_id = aggregate_id.clone();
                event.version = expected_version + (i as u64 + 1);
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)] // Counter starts at 0 and only grows
                let global = (first_global + i as i64) as u64;
                event.global_version = Some(GlobalVersion::new(global));
                event.metadata.stored_at = Some(stored_at);

                let metadata = serde_json::to_value(&event.metadata)
                    .map_err(|e| EventStoreError::SaveFailed(e.to_string()))?;

                #[allow(clippy::cast_possible_wrap)] // Versions stay far below i64::MAX
                let insert = sqlx::query(
                    r"
                    INSERT INTO event_store (
                        aggregate_id, event_type, version, global_version,
                        schema_version, timestamp, payload, metadata
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ",
                )
                .bind(event.aggregate_id.as_str())
                .bind(&event.event_type)
                .bind(event.version.value() as i64)
                .bind(event.global_version.map_or(0, |g| g.value() as i64))
                .bind(i32::try_from(event.schema_version).unwrap_or(1))
                .bind(event.timestamp)
                .bind(&event.payload)
                .bind(metadata)
                .execute(&mut *tx)
                .await;

                if let Err(err) = insert {
                    // A unique violation on (aggregate_id, version) means a
                    // concurrent writer slipped in between the check and
                    // the insert. The whole batch rolls back.
                    if err
                        .as_database_error()
                        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
                    {
                        metrics::counter!("event_store.concurrency_conflicts").increment(1);
                        return Err(EventStoreError::ConcurrencyConflict {
                            aggregate_id,
                            expected: expected_version,
                            actual: event.version,
                        });
                    }
                    return Err(EventStoreError::SaveFailed(err.to_string()));
                }

                stored.push(event);
            }

            tx.commit()
                .await
                .map_err(|e| EventStoreError::SaveFailed(e.to_string()))?;

            metrics::counter!("event_store.appended").increment(stored.len() as u64);
            tracing::debug!(
                aggregate_id = %aggregate_id,
                count = stored.len(),
                first_version = %stored[0].version,
                "Appended events"
            );

            Ok(stored)
        })
    }

    fn load_events(
        &self,
        aggregate_id: AggregateId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if aggregate_id.as_str().is_empty() {
                return Err(EventStoreError::InvalidAggregateId(
                    "empty aggregate id".to_string(),
                ));
            }

            let rows = sqlx::query(
                r"
                SELECT aggregate_id, event_type, version, global_version,
                       schema_version, timestamp, payload, metadata
                FROM event_store
                WHERE aggregate_id = $1
                ORDER BY version ASC
                ",
            )
            .bind(aggregate_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::LookupFailed(e.to_string()))?;

            rows.iter().map(Self::row_to_event).collect()
        })
    }

    fn find_aggregate_id(
        &self,
        event_type: &str,
        field: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AggregateId>, EventStoreError>> + Send + '_>>
    {
        let event_type = event_type.to_string();
        let field = field.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as(
                r"
                SELECT aggregate_id
                FROM event_store
                WHERE event_type = $1 AND payload->>$2 = $3
                ORDER BY global_version ASC
                LIMIT 1
                ",
            )
            .bind(&event_type)
            .bind(&field)
            .bind(&value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EventStoreError::LookupFailed(e.to_string()))?;

            Ok(row.map(|(id,)| AggregateId::new(id)))
        })
    }
}

#[cfg(test)]
mod tests {
    // Connection-level behavior is covered against the in-memory store in
    // book-library-testing; these tests pin the query-independent pieces.

    use book_library_core::stream::Version;

    #[test]
    fn version_block_arithmetic() {
        // A block of 3 starting after seq=11 covers 12..=14.
        let seq_after_update = 14_i64;
        let n = 3_i64;
        let first = seq_after_update - n + 1;
        assert_eq!(first, 12);
        assert_eq!(Version::new(0) + 1, Version::new(1));
    }
}
