//! `PostgreSQL` document store for projections.
//!
//! Each projection collection is a table with a JSONB `doc` column plus
//! promoted `version` / `updated_at` / `deleted_at` columns for the
//! idempotence guard, tombstone filter, and indexing. Collection names
//! are an allow-list; the filter model binds every value, so no caller
//! data ever reaches the SQL text.

use book_library_core::document::{
    Condition, DocumentStore, Filter, Page, ProjectionError, ResolvedPage, Result, SortOrder,
    UpsertOutcome, select_fields,
};
use book_library_core::stream::Version;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use std::future::Future;
use std::pin::Pin;

/// The projection collections this store serves.
const COLLECTIONS: [&str; 3] = [
    "books_projection",
    "reservations_projection",
    "wallets_projection",
];

/// JSONB-backed projection collections.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(collection: &str) -> Result<&'static str> {
        COLLECTIONS
            .iter()
            .find(|t| **t == collection)
            .copied()
            .ok_or_else(|| {
                ProjectionError::InvalidQuery(format!("unknown collection: {collection}"))
            })
    }

    /// Merge the promoted columns back into the document.
    fn row_to_doc(row: &PgRow) -> serde_json::Value {
        let mut doc: serde_json::Value = row.get("doc");
        let version: i64 = row.get("version");
        let updated_at: DateTime<Utc> = row.get("updated_at");
        let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("version".to_string(), version.into());
            obj.insert(
                "updatedAt".to_string(),
                timestamp_value(updated_at),
            );
            obj.insert(
                "deletedAt".to_string(),
                deleted_at.map_or(serde_json::Value::Null, timestamp_value),
            );
        }
        doc
    }
}

fn timestamp_value(ts: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// Append the filter's SQL predicate and collect its bind values.
///
/// Equality binds a one-field containment document (`doc @> $n`), so the
/// field name itself is never interpolated; ranges bind the field name
/// through `doc->>$n`.
fn push_filter_sql(
    filter: &Filter,
    sql: &mut String,
    binds: &mut Vec<BindValue>,
    next_param: &mut usize,
) {
    sql.push_str(" WHERE TRUE");
    if !filter.include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    for condition in &filter.conditions {
        match condition {
            Condition::Eq(field, value) => {
                sql.push_str(&format!(" AND doc @> ${}", next_param));
                binds.push(BindValue::Json(serde_json::json!({ field: value })));
                *next_param += 1;
            }
            Condition::Gte(field, bound) => {
                sql.push_str(&format!(
                    " AND (doc->>${})::float8 >= ${}",
                    next_param,
                    *next_param + 1
                ));
                binds.push(BindValue::Text(field.clone()));
                binds.push(BindValue::Float(*bound));
                *next_param += 2;
            }
            Condition::Lte(field, bound) => {
                sql.push_str(&format!(
                    " AND (doc->>${})::float8 <= ${}",
                    next_param,
                    *next_param + 1
                ));
                binds.push(BindValue::Text(field.clone()));
                binds.push(BindValue::Float(*bound));
                *next_param += 2;
            }
        }
    }
}

enum BindValue {
    Json(serde_json::Value),
    Text(String),
    Float(f64),
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    binds: Vec<BindValue>,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for bind in binds {
        query = match bind {
            BindValue::Json(v) => query.bind(v),
            BindValue::Text(v) => query.bind(v),
            BindValue::Float(v) => query.bind(v),
        };
    }
    query
}

fn bind_all_scalar<'q, T>(
    mut query: sqlx::query::QueryScalar<'q, Postgres, T, sqlx::postgres::PgArguments>,
    binds: Vec<BindValue>,
) -> sqlx::query::QueryScalar<'q, Postgres, T, sqlx::postgres::PgArguments> {
    for bind in binds {
        query = match bind {
            BindValue::Json(v) => query.bind(v),
            BindValue::Text(v) => query.bind(v),
            BindValue::Float(v) => query.bind(v),
        };
    }
    query
}

/// Sort keys are allow-listed upstream; this is the last-line guard
/// keeping identifiers out of the SQL text unless they are plain words.
fn safe_sort_key(key: &str) -> Result<&str> {
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(key)
    } else {
        Err(ProjectionError::InvalidQuery(format!(
            "invalid sort key: {key}"
        )))
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn upsert(
        &self,
        collection: &str,
        id: &str,
        changes: serde_json::Value,
        version: Version,
        updated_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let table = Self::table(&collection)?;
            if !changes.is_object() {
                return Err(ProjectionError::Serialization(
                    "document changes must be a JSON object".to_string(),
                ));
            }

            // Insert wins only for a fresh id; updates merge the change
            // set and are guarded by the stored version. `xmax = 0`
            // distinguishes a fresh insert from an update of an existing
            // row; no row back means the guard rejected a stale event.
            #[allow(clippy::cast_possible_wrap)] // Versions stay far below i64::MAX
            let row: Option<(bool,)> = sqlx::query_as(&format!(
                "INSERT INTO {table} (id, doc, version, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE
                 SET doc = {table}.doc || EXCLUDED.doc,
                     version = EXCLUDED.version,
                     updated_at = EXCLUDED.updated_at
                 WHERE {table}.version < EXCLUDED.version
                 RETURNING (xmax = 0) AS inserted"
            ))
            .bind(&id)
            .bind(&changes)
            .bind(version.value() as i64)
            .bind(updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to upsert: {e}")))?;

            Ok(match row {
                None => UpsertOutcome::Stale,
                Some((true,)) => UpsertOutcome::Inserted,
                Some((false,)) => UpsertOutcome::Updated,
            })
        })
    }

    fn soft_delete(
        &self,
        collection: &str,
        id: &str,
        version: Version,
        deleted_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertOutcome>> + Send + '_>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let table = Self::table(&collection)?;

            // A delete arriving before the insert converges on a
            // tombstone, which the stale guard then protects.
            #[allow(clippy::cast_possible_wrap)] // Versions stay far below i64::MAX
            let row: Option<(bool,)> = sqlx::query_as(&format!(
                "INSERT INTO {table} (id, doc, version, updated_at, deleted_at)
                 VALUES ($1, jsonb_build_object('id', $1::text), $2, $3, $3)
                 ON CONFLICT (id) DO UPDATE
                 SET version = EXCLUDED.version,
                     updated_at = EXCLUDED.updated_at,
                     deleted_at = EXCLUDED.deleted_at
                 WHERE {table}.version < EXCLUDED.version
                 RETURNING (xmax = 0) AS inserted"
            ))
            .bind(&id)
            .bind(version.value() as i64)
            .bind(deleted_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to soft-delete: {e}")))?;

            Ok(match row {
                None => UpsertOutcome::Stale,
                Some((true,)) => UpsertOutcome::Inserted,
                Some((false,)) => UpsertOutcome::Updated,
            })
        })
    }

    fn get(
        &self,
        collection: &str,
        id: &str,
        include_deleted: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send + '_>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let table = Self::table(&collection)?;
            let tombstones = if include_deleted {
                ""
            } else {
                " AND deleted_at IS NULL"
            };

            let row = sqlx::query(&format!(
                "SELECT doc, version, updated_at, deleted_at
                 FROM {table} WHERE id = $1{tombstones}"
            ))
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to get: {e}")))?;

            Ok(row.as_ref().map(Self::row_to_doc))
        })
    }

    fn find_one(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send + '_>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let table = Self::table(&collection)?;

            let mut sql = format!("SELECT doc, version, updated_at, deleted_at FROM {table}");
            let mut binds = Vec::new();
            let mut next_param = 1;
            push_filter_sql(&filter, &mut sql, &mut binds, &mut next_param);
            sql.push_str(" ORDER BY id ASC LIMIT 1");

            let row = bind_all(sqlx::query(&sql), binds)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to query: {e}")))?;

            Ok(row.as_ref().map(Self::row_to_doc))
        })
    }

    fn find(
        &self,
        collection: &str,
        filter: Filter,
        page: ResolvedPage,
        sort_by: Option<String>,
        sort_order: SortOrder,
        fields: Option<Vec<String>>,
    ) -> Pin<Box<dyn Future<Output = Result<Page<serde_json::Value>>> + Send + '_>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let table = Self::table(&collection)?;

            let mut where_sql = String::new();
            let mut binds = Vec::new();
            let mut next_param = 1;
            push_filter_sql(&filter, &mut where_sql, &mut binds, &mut next_param);

            let count_sql = format!("SELECT COUNT(*) FROM {table}{where_sql}");
            let count_binds = binds
                .iter()
                .map(|b| match b {
                    BindValue::Json(v) => BindValue::Json(v.clone()),
                    BindValue::Text(v) => BindValue::Text(v.clone()),
                    BindValue::Float(v) => BindValue::Float(*v),
                })
                .collect();
            let total: i64 = bind_all_scalar(sqlx::query_scalar(&count_sql), count_binds)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to count: {e}")))?;

            // jsonb ordering is type-aware, so numbers sort numerically.
            let order_sql = match &sort_by {
                Some(key) => {
                    let key = safe_sort_key(key)?;
                    let direction = match sort_order {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    format!(" ORDER BY doc->'{key}' {direction}, id ASC")
                }
                None => " ORDER BY id ASC".to_string(),
            };

            let select_sql = format!(
                "SELECT doc, version, updated_at, deleted_at FROM {table}{where_sql}{order_sql} \
                 LIMIT {} OFFSET {}",
                page.limit, page.skip
            );
            let rows = bind_all(sqlx::query(&select_sql), binds)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to query: {e}")))?;

            let data: Vec<serde_json::Value> = rows
                .iter()
                .map(Self::row_to_doc)
                .map(|doc| match &fields {
                    Some(fields) => select_fields(&doc, fields, "id"),
                    None => doc,
                })
                .collect();

            #[allow(clippy::cast_sign_loss)] // COUNT(*) is non-negative
            Ok(Page::new(data, total as u64, page))
        })
    }

    fn count(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let table = Self::table(&collection)?;

            let mut sql = format!("SELECT COUNT(*) FROM {table}");
            let mut binds = Vec::new();
            let mut next_param = 1;
            push_filter_sql(&filter, &mut sql, &mut binds, &mut next_param);

            let total: i64 = bind_all_scalar(sqlx::query_scalar(&sql), binds)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to count: {e}")))?;

            #[allow(clippy::cast_sign_loss)] // COUNT(*) is non-negative
            Ok(total as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_collection_is_rejected() {
        assert!(PostgresDocumentStore::table("books_projection").is_ok());
        assert!(PostgresDocumentStore::table("users").is_err());
    }

    #[test]
    fn filter_sql_binds_every_value() {
        let filter = Filter::all()
            .eq("status", "active")
            .gte("price", 5.0)
            .lte("price", 20.0);

        let mut sql = String::from("SELECT COUNT(*) FROM books_projection");
        let mut binds = Vec::new();
        let mut next_param = 1;
        push_filter_sql(&filter, &mut sql, &mut binds, &mut next_param);

        assert!(sql.contains("deleted_at IS NULL"));
        assert!(sql.contains("doc @> $1"));
        assert!(sql.contains("(doc->>$2)::float8 >= $3"));
        assert!(sql.contains("(doc->>$4)::float8 <= $5"));
        assert_eq!(binds.len(), 5);
        assert_eq!(next_param, 6);
    }

    #[test]
    fn sort_keys_must_be_plain_identifiers() {
        assert!(safe_sort_key("publicationYear").is_ok());
        assert!(safe_sort_key("due_date").is_ok());
        assert!(safe_sort_key("price'; DROP TABLE books_projection; --").is_err());
        assert!(safe_sort_key("").is_err());
    }
}
