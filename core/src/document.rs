//! Document store seam for the read side.
//!
//! Projections materialize into per-context document collections
//! (`books_projection`, `reservations_projection`, `wallets_projection`).
//! This module defines the storage contract those collections share:
//!
//! - **Version-guarded upserts**: an update only applies when the stored
//!   version is lower than the incoming event's version. A stale update
//!   is a *silent success* — it means a redelivered or out-of-order
//!   older event, which idempotent projections must absorb.
//! - **Soft delete**: a delete sets `deletedAt` (and `updatedAt`);
//!   normal reads exclude tombstones.
//! - **Field selection**: queries may pass an allow-list; the store
//!   projects those fields plus the primary key.
//! - **Offset pagination** with a `{data, pagination}` envelope.
//! - **Filters**: equality and numeric ranges, built by per-context
//!   filter builders and translated into backend predicates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::stream::Version;
use chrono::{DateTime, Utc};

/// Error type for projection/document operations.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The query referenced an unknown collection or disallowed key.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Sort direction for paginated queries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// A pagination request: 1-based `page`, `limit`, optional sort.
///
/// `limit` is clamped to the configured maximum; an absent limit falls
/// back to the configured default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// 1-based page number; 0 or absent means page 1.
    #[serde(default)]
    pub page: u32,

    /// Requested page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Sort key (validated against a per-entity allow-list upstream).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,

    /// Sort direction.
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl PageRequest {
    /// First page with the default limit.
    #[must_use]
    pub fn first() -> Self {
        Self::default()
    }

    /// Resolve against configured defaults: clamp the limit and compute
    /// the row offset.
    #[must_use]
    pub fn resolve(&self, default_limit: u32, max_limit: u32) -> ResolvedPage {
        let page = self.page.max(1);
        let limit = self.limit.unwrap_or(default_limit).clamp(1, max_limit);
        ResolvedPage {
            page,
            limit,
            skip: u64::from(page - 1) * u64::from(limit),
        }
    }
}

/// A [`PageRequest`] after clamping: concrete page, limit, and offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPage {
    /// 1-based page number.
    pub page: u32,
    /// Effective page size.
    pub limit: u32,
    /// Rows to skip.
    pub skip: u64,
}

/// Pagination summary in the response envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Total matching documents.
    pub total: u64,
    /// 1-based page number of this slice.
    pub page: u32,
    /// Effective page size.
    pub limit: u32,
    /// Total number of pages.
    pub pages: u32,
    /// Whether a later page exists.
    pub has_next: bool,
    /// Whether an earlier page exists.
    pub has_prev: bool,
}

/// Paginated response envelope: `{data, pagination}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// The page of documents.
    pub data: Vec<T>,
    /// Pagination summary.
    pub pagination: PageInfo,
}

impl<T> Page<T> {
    /// Assemble the envelope from a slice of results and the total count.
    #[must_use]
    pub fn new(data: Vec<T>, total: u64, resolved: ResolvedPage) -> Self {
        let pages = total.div_ceil(u64::from(resolved.limit));
        #[allow(clippy::cast_possible_truncation)] // pages <= total/1, bounded by u32 pages in practice
        let pages = pages.min(u64::from(u32::MAX)) as u32;
        Self {
            data,
            pagination: PageInfo {
                total,
                page: resolved.page,
                limit: resolved.limit,
                pages,
                has_next: resolved.page < pages,
                has_prev: resolved.page > 1 && total > 0,
            },
        }
    }

    /// Map the data items, keeping the pagination summary.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}

/// One predicate on a document field.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// `doc[field] == value`.
    Eq(String, serde_json::Value),
    /// `doc[field] >= value` (numeric).
    Gte(String, f64),
    /// `doc[field] <= value` (numeric).
    Lte(String, f64),
}

impl Condition {
    /// The field this condition applies to.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(f, _) | Self::Gte(f, _) | Self::Lte(f, _) => f,
        }
    }
}

/// A conjunction of [`Condition`]s plus the tombstone switch.
///
/// Backends translate this into native predicates; the in-memory store
/// evaluates [`Filter::matches`] directly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    /// All conditions; a document must satisfy every one.
    pub conditions: Vec<Condition>,
    /// Include soft-deleted documents (default: exclude).
    pub include_deleted: bool,
}

impl Filter {
    /// An empty filter matching every live document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    /// Add a numeric lower bound.
    #[must_use]
    pub fn gte(mut self, field: impl Into<String>, value: f64) -> Self {
        self.conditions.push(Condition::Gte(field.into(), value));
        self
    }

    /// Add a numeric upper bound.
    #[must_use]
    pub fn lte(mut self, field: impl Into<String>, value: f64) -> Self {
        self.conditions.push(Condition::Lte(field.into(), value));
        self
    }

    /// Include tombstoned documents in the result.
    #[must_use]
    pub const fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Evaluate the filter against one document.
    ///
    /// Tombstone exclusion is part of the evaluation: a document with a
    /// non-null `deletedAt` only matches when `include_deleted` is set.
    #[must_use]
    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        if !self.include_deleted && !doc["deletedAt"].is_null() {
            return false;
        }
        self.conditions.iter().all(|c| match c {
            Condition::Eq(field, value) => &doc[field.as_str()] == value,
            Condition::Gte(field, bound) => {
                doc[field.as_str()].as_f64().is_some_and(|v| v >= *bound)
            }
            Condition::Lte(field, bound) => {
                doc[field.as_str()].as_f64().is_some_and(|v| v <= *bound)
            }
        })
    }
}

/// Compare two JSON scalars for sorting (numbers, strings, bools; null
/// sorts first, non-scalars last).
#[must_use]
pub fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Project a document onto an allow-list of fields plus the primary key.
///
/// Unknown fields in the allow-list are simply absent from the result.
#[must_use]
pub fn select_fields(
    doc: &serde_json::Value,
    fields: &[String],
    key_field: &str,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    if let Some(key) = doc.get(key_field) {
        out.insert(key_field.to_string(), key.clone());
    }
    for field in fields {
        if field == key_field {
            continue;
        }
        if let Some(value) = doc.get(field.as_str()) {
            out.insert(field.clone(), value.clone());
        }
    }
    serde_json::Value::Object(out)
}

/// Outcome of a version-guarded write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No document existed; one was inserted at the event's version.
    Inserted,
    /// The document existed at a lower version and was updated.
    Updated,
    /// The stored version was already >= the event's version; nothing
    /// changed. This is a success: it signals a redelivered or
    /// out-of-order older event.
    Stale,
}

/// Versioned JSON document collections (the projection backend).
///
/// One store serves every collection of a deployment; collections are
/// addressed by name (an allow-list in the Postgres backend).
///
/// # Dyn compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn DocumentStore>` by projection handlers and query handlers.
pub trait DocumentStore: Send + Sync {
    /// Version-guarded upsert.
    ///
    /// Inserts `changes` as a fresh document at `version` when no
    /// document with this id exists; otherwise merges `changes` into the
    /// stored document, but only when `stored.version < version`. The
    /// write also sets `version` and `updatedAt` on the document.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on storage failure or when `changes`
    /// is not a JSON object.
    fn upsert(
        &self,
        collection: &str,
        id: &str,
        changes: serde_json::Value,
        version: Version,
        updated_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>>;

    /// Version-guarded soft delete: sets `deletedAt` and `updatedAt`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on storage failure.
    fn soft_delete(
        &self,
        collection: &str,
        id: &str,
        version: Version,
        deleted_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>>;

    /// Fetch one document by id. Tombstones are excluded unless
    /// `include_deleted` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on storage failure.
    fn get(
        &self,
        collection: &str,
        id: &str,
        include_deleted: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send + '_>>;

    /// Fetch the first live document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on storage failure.
    fn find_one(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send + '_>>;

    /// Paginated, filtered, optionally field-selected query.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on storage failure or an invalid
    /// sort key.
    fn find(
        &self,
        collection: &str,
        filter: Filter,
        page: ResolvedPage,
        sort_by: Option<String>,
        sort_order: SortOrder,
        fields: Option<Vec<String>>,
    ) -> Pin<Box<dyn Future<Output = Result<Page<serde_json::Value>>> + Send + '_>>;

    /// Count documents matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on storage failure.
    fn count(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}
