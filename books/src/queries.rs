//! Book queries: projection lookups with field selection, filtering,
//! and pagination.

use book_library_core::config::Config;
use book_library_core::context::{RequestContext, with_deadline};
use book_library_core::document::{
    DocumentStore, Filter, Page, PageRequest, select_fields,
};
use book_library_core::error::AppError;
use std::sync::Arc;

const ENTITY: &str = "BOOK";

/// The books projection collection.
pub const BOOKS_COLLECTION: &str = "books_projection";

/// Sort keys accepted by [`BookQueryHandler::list_books`].
const SORT_KEYS: [&str; 6] = [
    "title",
    "author",
    "publicationYear",
    "price",
    "createdAt",
    "updatedAt",
];

/// Catalogue search parameters.
#[derive(Clone, Debug, Default)]
pub struct BookListQuery {
    /// Exact title match.
    pub title: Option<String>,
    /// Exact author match.
    pub author: Option<String>,
    /// Exact publisher match.
    pub publisher: Option<String>,
    /// Publication year lower bound.
    pub publication_year_min: Option<i32>,
    /// Publication year upper bound.
    pub publication_year_max: Option<i32>,
    /// Price lower bound.
    pub price_min: Option<f64>,
    /// Price upper bound.
    pub price_max: Option<f64>,
    /// Pagination and sorting.
    pub page: PageRequest,
    /// Field allow-list for the response.
    pub fields: Option<Vec<String>>,
}

/// Translate a catalogue search into document-store predicates.
fn build_filter(query: &BookListQuery) -> Filter {
    let mut filter = Filter::all();
    if let Some(title) = &query.title {
        filter = filter.eq("title", title.clone());
    }
    if let Some(author) = &query.author {
        filter = filter.eq("author", author.clone());
    }
    if let Some(publisher) = &query.publisher {
        filter = filter.eq("publisher", publisher.clone());
    }
    if let Some(min) = query.publication_year_min {
        filter = filter.gte("publicationYear", f64::from(min));
    }
    if let Some(max) = query.publication_year_max {
        filter = filter.lte("publicationYear", f64::from(max));
    }
    if let Some(min) = query.price_min {
        filter = filter.gte("price", min);
    }
    if let Some(max) = query.price_max {
        filter = filter.lte("price", max);
    }
    filter
}

/// Query side of the Books context. Reads exclusively from the
/// projection; never touches the event store.
pub struct BookQueryHandler {
    docs: Arc<dyn DocumentStore>,
    config: Config,
}

impl BookQueryHandler {
    /// Wire the handler to the projection store.
    #[must_use]
    pub const fn new(docs: Arc<dyn DocumentStore>, config: Config) -> Self {
        Self { docs, config }
    }

    /// Fetch one book by id.
    ///
    /// # Errors
    ///
    /// Returns `BOOK_NOT_FOUND` for unknown or deleted books.
    pub async fn get_book(
        &self,
        ctx: &RequestContext,
        book_id: &str,
        fields: Option<Vec<String>>,
    ) -> Result<serde_json::Value, AppError> {
        with_deadline(ctx, "GetBook", async {
            let doc = self
                .docs
                .get(BOOKS_COLLECTION, book_id, false)
                .await?
                .ok_or_else(|| AppError::not_found(ENTITY, book_id))?;
            Ok(apply_fields(doc, fields.as_deref()))
        })
        .await
    }

    /// Fetch one book by ISBN.
    ///
    /// # Errors
    ///
    /// Returns `BOOK_NOT_FOUND` when no live book carries the ISBN.
    pub async fn get_book_by_isbn(
        &self,
        ctx: &RequestContext,
        isbn: &str,
        fields: Option<Vec<String>>,
    ) -> Result<serde_json::Value, AppError> {
        with_deadline(ctx, "GetBookByIsbn", async {
            let doc = self
                .docs
                .find_one(BOOKS_COLLECTION, Filter::all().eq("isbn", isbn))
                .await?
                .ok_or_else(|| AppError::not_found(ENTITY, isbn))?;
            Ok(apply_fields(doc, fields.as_deref()))
        })
        .await
    }

    /// Search the catalogue.
    ///
    /// # Errors
    ///
    /// Returns `VALIDATION_ERROR` for a sort key outside the allow-list.
    pub async fn list_books(
        &self,
        ctx: &RequestContext,
        query: BookListQuery,
    ) -> Result<Page<serde_json::Value>, AppError> {
        with_deadline(ctx, "ListBooks", async {
            if let Some(sort_by) = &query.page.sort_by {
                if !SORT_KEYS.contains(&sort_by.as_str()) {
                    return Err(AppError::validation(format!(
                        "cannot sort books by {sort_by}"
                    )));
                }
            }

            let filter = build_filter(&query);
            let resolved = query.page.resolve(
                self.config.pagination_default_limit,
                self.config.pagination_max_limit,
            );
            let page = self
                .docs
                .find(
                    BOOKS_COLLECTION,
                    filter,
                    resolved,
                    query.page.sort_by.clone(),
                    query.page.sort_order,
                    query.fields.clone(),
                )
                .await?;
            Ok(page)
        })
        .await
    }
}

fn apply_fields(doc: serde_json::Value, fields: Option<&[String]>) -> serde_json::Value {
    match fields {
        Some(fields) => select_fields(&doc, fields, "id"),
        None => doc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builder_applies_ranges_only_when_set() {
        let query = BookListQuery {
            author: Some("A".to_string()),
            price_min: Some(5.0),
            ..BookListQuery::default()
        };
        let filter = build_filter(&query);
        assert_eq!(filter.conditions.len(), 2);

        let empty = build_filter(&BookListQuery::default());
        assert!(empty.conditions.is_empty());
    }
}
