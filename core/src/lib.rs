//! # Book Library Core
//!
//! Core traits and types for the book-library event-sourcing platform.
//!
//! The platform is a set of cooperating bounded contexts (Books,
//! Reservations, Wallets) following CQRS with event sourcing: commands
//! produce domain events appended to a per-aggregate log with
//! optimistic concurrency, a projection pipeline materializes read
//! models, and a persistent saga coordinates the reservation–payment
//! workflow across contexts.
//!
//! This crate holds the seams everything else plugs into:
//!
//! - [`event`]: the [`DomainEvent`](event::DomainEvent) envelope, typed
//!   payloads, correlation/causation metadata
//! - [`stream`]: aggregate ids and the two version counters
//! - [`aggregate`]: aggregate roots, rehydration, the pending-event
//!   context used by command handlers
//! - [`event_store`]: the append-only log contract and its failure
//!   taxonomy
//! - [`event_bus`]: typed pub/sub with at-least-once delivery and
//!   dead-lettering
//! - [`document`]: the projection/document store contract
//!   (version-guarded upserts, soft delete, filters, pagination)
//! - [`saga`]: persistent saga state and its store
//! - [`messages`]: the saga's cross-context request/answer events
//! - [`error`]: the application error code taxonomy
//! - [`context`]: per-request correlation/deadline plumbing
//! - [`cache`]: the query-cache interface
//! - [`config`]: environment-driven configuration
//! - [`environment`]: injected dependencies (clock)
//!
//! Production adapters live in `book-library-postgres` and
//! `book-library-runtime`; deterministic in-memory counterparts live in
//! `book-library-testing`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod environment;
pub mod messages;
pub mod saga;
pub mod stream;
