//! # Book Library Postgres
//!
//! `PostgreSQL` adapters for the book-library platform:
//!
//! - [`PostgresEventStore`]: the append-only event log
//!   (`event_store` + `counters` tables, optimistic concurrency,
//!   block-allocated global versions)
//! - [`PostgresDocumentStore`]: JSONB projection collections with
//!   version-guarded upserts and tombstone soft deletes
//! - [`PostgresSagaStore`]: reservation-payment saga rows
//! - [`PostgresDeadLetterStore`]: undeliverable events
//!
//! All adapters share one `PgPool`; schema migrations live under
//! `migrations/` and run via [`PostgresEventStore::migrate`].

pub mod dead_letter;
pub mod documents;
pub mod event_store;
pub mod saga_store;

pub use dead_letter::PostgresDeadLetterStore;
pub use documents::PostgresDocumentStore;
pub use event_store::PostgresEventStore;
pub use saga_store::PostgresSagaStore;
