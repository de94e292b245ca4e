//! In-memory document store for projection testing.
//!
//! Honors the full projection contract: version-guarded upserts with
//! silent-stale semantics, soft delete via tombstones, filtered and
//! paginated queries with field selection.

#![allow(clippy::missing_panics_doc)] // Lock poisoning is absorbed, not propagated

use book_library_core::document::{
    DocumentStore, Filter, Page, ProjectionError, ResolvedPage, Result, SortOrder, UpsertOutcome,
    compare_json, select_fields,
};
use book_library_core::stream::Version;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Collections = HashMap<String, BTreeMap<String, serde_json::Value>>;

/// In-memory JSON document collections.
///
/// Cheap to clone; clones share the same collections.
#[derive(Clone, Default, Debug)]
pub struct InMemoryDocumentStore {
    collections: Arc<Mutex<Collections>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection, tombstones included.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.lock().get(collection).map_or(0, BTreeMap::len)
    }

    /// Whether a collection holds no documents at all.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Raw document fetch, tombstones included (for assertions).
    #[must_use]
    pub fn raw(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.lock().get(collection)?.get(id).cloned()
    }

    /// Drop every collection (test isolation).
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn stored_version(doc: &serde_json::Value) -> u64 {
    doc["version"].as_u64().unwrap_or(0)
}

fn timestamp_value(ts: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

impl DocumentStore for InMemoryDocumentStore {
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
            let serde_json::Value::Object(changes) = changes else {
                return Err(ProjectionError::Serialization(
                    "document changes must be a JSON object".to_string(),
                ));
            };

            let mut collections = self.lock();
            let docs = collections.entry(collection).or_default();
            match docs.get_mut(&id) {
                None => {
                    let mut doc = changes;
                    doc.insert("version".to_string(), version.value().into());
                    doc.insert("updatedAt".to_string(), timestamp_value(updated_at));
                    docs.insert(id, serde_json::Value::Object(doc));
                    Ok(UpsertOutcome::Inserted)
                }
                Some(existing) => {
                    if stored_version(existing) >= version.value() {
                        // Redelivered or out-of-order older event.
                        return Ok(UpsertOutcome::Stale);
                    }
                    if let serde_json::Value::Object(doc) = existing {
                        for (key, value) in changes {
                            doc.insert(key, value);
                        }
                        doc.insert("version".to_string(), version.value().into());
                        doc.insert("updatedAt".to_string(), timestamp_value(updated_at));
                    }
                    Ok(UpsertOutcome::Updated)
                }
            }
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
            let mut collections = self.lock();
            let docs = collections.entry(collection).or_default();
            match docs.get_mut(&id) {
                None => {
                    // Delete arrived before the insert: converge on a
                    // tombstone so the late insert stays out.
                    let mut doc = serde_json::Map::new();
                    doc.insert("id".to_string(), id.clone().into());
                    doc.insert("version".to_string(), version.value().into());
                    doc.insert("deletedAt".to_string(), timestamp_value(deleted_at));
                    doc.insert("updatedAt".to_string(), timestamp_value(deleted_at));
                    docs.insert(id, serde_json::Value::Object(doc));
                    Ok(UpsertOutcome::Inserted)
                }
                Some(existing) => {
                    if stored_version(existing) >= version.value() {
                        return Ok(UpsertOutcome::Stale);
                    }
                    if let serde_json::Value::Object(doc) = existing {
                        doc.insert("version".to_string(), version.value().into());
                        doc.insert("deletedAt".to_string(), timestamp_value(deleted_at));
                        doc.insert("updatedAt".to_string(), timestamp_value(deleted_at));
                    }
                    Ok(UpsertOutcome::Updated)
                }
            }
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
            let collections = self.lock();
            let doc = collections
                .get(&collection)
                .and_then(|docs| docs.get(&id))
                .cloned();
            Ok(doc.filter(|d| include_deleted || d["deletedAt"].is_null()))
        })
    }

    fn find_one(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send + '_>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let collections = self.lock();
            Ok(collections.get(&collection).and_then(|docs| {
                docs.values().find(|doc| filter.matches(doc)).cloned()
            }))
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
            let collections = self.lock();
            let mut matched: Vec<serde_json::Value> = collections
                .get(&collection)
                .map(|docs| {
                    docs.values()
                        .filter(|doc| filter.matches(doc))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            drop(collections);

            if let Some(key) = sort_by {
                matched.sort_by(|a, b| {
                    let ordering = compare_json(&a[key.as_str()], &b[key.as_str()]);
                    match sort_order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });
            }

            let total = matched.len() as u64;
            let data: Vec<serde_json::Value> = matched
                .into_iter()
                .skip(usize::try_from(page.skip).unwrap_or(usize::MAX))
                .take(page.limit as usize)
                .map(|doc| match &fields {
                    Some(fields) => select_fields(&doc, fields, "id"),
                    None => doc,
                })
                .collect();

            Ok(Page::new(data, total, page))
        })
    }

    fn count(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let collections = self.lock();
            Ok(collections.get(&collection).map_or(0, |docs| {
                docs.values().filter(|doc| filter.matches(doc)).count() as u64
            }))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn upsert_then_stale_update_is_silent() {
        let store = InMemoryDocumentStore::new();

        let outcome = store
            .upsert(
                "books_projection",
                "b1",
                json!({"id": "b1", "title": "T"}),
                Version::new(2),
                ts("2024-05-01T10:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        // An older event arrives late: no downgrade.
        let outcome = store
            .upsert(
                "books_projection",
                "b1",
                json!({"title": "OLD"}),
                Version::new(1),
                ts("2024-05-01T09:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);

        let doc = store.get("books_projection", "b1", false).await.unwrap().unwrap();
        assert_eq!(doc["title"], "T");
        assert_eq!(doc["version"], 2);
    }

    #[tokio::test]
    async fn soft_delete_hides_from_reads() {
        let store = InMemoryDocumentStore::new();
        store
            .upsert(
                "books_projection",
                "b1",
                json!({"id": "b1", "title": "T"}),
                Version::new(1),
                ts("2024-05-01T10:00:00Z"),
            )
            .await
            .unwrap();

        store
            .soft_delete(
                "books_projection",
                "b1",
                Version::new(2),
                ts("2024-05-02T10:00:00Z"),
            )
            .await
            .unwrap();

        assert!(store.get("books_projection", "b1", false).await.unwrap().is_none());
        let raw = store.get("books_projection", "b1", true).await.unwrap().unwrap();
        assert!(!raw["deletedAt"].is_null());
        assert_eq!(raw["updatedAt"], raw["deletedAt"]);
    }

    #[tokio::test]
    async fn find_filters_sorts_and_paginates() {
        let store = InMemoryDocumentStore::new();
        for (id, price) in [("b1", 5.0), ("b2", 15.0), ("b3", 25.0), ("b4", 10.0)] {
            store
                .upsert(
                    "books_projection",
                    id,
                    json!({"id": id, "price": price, "author": "A"}),
                    Version::new(1),
                    ts("2024-05-01T10:00:00Z"),
                )
                .await
                .unwrap();
        }

        let page = store
            .find(
                "books_projection",
                Filter::all().lte("price", 20.0),
                ResolvedPage {
                    page: 1,
                    limit: 2,
                    skip: 0,
                },
                Some("price".to_string()),
                SortOrder::Desc,
                Some(vec!["price".to_string()]),
            )
            .await
            .unwrap();

        assert_eq!(page.pagination.total, 3);
        assert_eq!(page.pagination.pages, 2);
        assert!(page.pagination.has_next);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0], json!({"id": "b2", "price": 15.0}));
        assert_eq!(page.data[1], json!({"id": "b4", "price": 10.0}));
    }

    #[tokio::test]
    async fn delete_before_insert_converges_on_tombstone() {
        let store = InMemoryDocumentStore::new();

        store
            .soft_delete(
                "books_projection",
                "b1",
                Version::new(3),
                ts("2024-05-02T10:00:00Z"),
            )
            .await
            .unwrap();

        // The late creation event must not resurrect the document.
        let outcome = store
            .upsert(
                "books_projection",
                "b1",
                json!({"id": "b1", "title": "T"}),
                Version::new(1),
                ts("2024-05-01T10:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert!(store.get("books_projection", "b1", false).await.unwrap().is_none());
    }
}
