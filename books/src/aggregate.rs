//! The Book aggregate.
//!
//! Pure domain logic: validation happens here, before an event is
//! recorded; applying an event can never fail. Domain methods return
//! the event describing the change, and callers record it through an
//! `AggregateContext`.

use crate::events::{BookCreated, BookDeleted, BookEvent, BookUpdated};
use book_library_core::aggregate::AggregateRoot;
use book_library_core::error::AppError;
use book_library_core::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};

const ENTITY: &str = "BOOK";

/// Catalogue entry, rebuilt from its event stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Book {
    id: AggregateId,
    version: Version,
    /// ISBN, the catalogue's natural key.
    pub isbn: String,
    /// Title.
    pub title: String,
    /// Author.
    pub author: String,
    /// Year of publication.
    pub publication_year: i32,
    /// Publisher.
    pub publisher: String,
    /// Retail price.
    pub price: f64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last change instant.
    pub updated_at: DateTime<Utc>,
    /// Tombstone instant, once deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A partial update to catalogue data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BookPatch {
    /// New title.
    pub title: Option<String>,
    /// New author.
    pub author: Option<String>,
    /// New publication year.
    pub publication_year: Option<i32>,
    /// New publisher.
    pub publisher: Option<String>,
    /// New price.
    pub price: Option<f64>,
}

impl BookPatch {
    const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.publication_year.is_none()
            && self.publisher.is_none()
            && self.price.is_none()
    }
}

fn non_empty(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_data(
            ENTITY,
            format!("{field} cannot be empty"),
        ));
    }
    Ok(trimmed.to_string())
}

impl Book {
    /// Validate inputs for a new catalogue entry and build its creation
    /// event.
    ///
    /// # Errors
    ///
    /// Returns `BOOK_INVALID_DATA` on empty strings, a non-positive
    /// price, or an implausible publication year.
    pub fn create(
        isbn: &str,
        title: &str,
        author: &str,
        publication_year: i32,
        publisher: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<BookEvent, AppError> {
        let isbn = non_empty("isbn", isbn)?;
        let title = non_empty("title", title)?;
        let author = non_empty("author", author)?;
        let publisher = non_empty("publisher", publisher)?;
        if !price.is_finite() || price < 0.0 {
            return Err(AppError::invalid_data(ENTITY, "price must be >= 0"));
        }
        if !(0..=9999).contains(&publication_year) {
            return Err(AppError::invalid_data(
                ENTITY,
                format!("implausible publication year: {publication_year}"),
            ));
        }

        Ok(BookEvent::Created(BookCreated {
            isbn,
            title,
            author,
            publication_year,
            publisher,
            price,
            created_at: now,
        }))
    }

    /// Build the update event for `patch`, trimming strings and keeping
    /// only fields that actually change.
    ///
    /// Returns `Ok(None)` when every patched field already has the
    /// requested value — no event is emitted for a no-op.
    ///
    /// # Errors
    ///
    /// Returns `BOOK_INVALID_DATA` for an empty patch or invalid field
    /// values, `BOOK_NOT_FOUND` when the book is deleted.
    pub fn update(&self, patch: &BookPatch, now: DateTime<Utc>) -> Result<Option<BookEvent>, AppError> {
        if self.deleted_at.is_some() {
            return Err(AppError::not_found(ENTITY, self.id.as_str()));
        }
        if patch.is_empty() {
            return Err(AppError::invalid_data(ENTITY, "empty update"));
        }

        let mut changes = BookUpdated {
            updated_at: now,
            ..BookUpdated::default()
        };

        if let Some(title) = &patch.title {
            let title = non_empty("title", title)?;
            if title != self.title {
                changes.title = Some(title);
            }
        }
        if let Some(author) = &patch.author {
            let author = non_empty("author", author)?;
            if author != self.author {
                changes.author = Some(author);
            }
        }
        if let Some(publisher) = &patch.publisher {
            let publisher = non_empty("publisher", publisher)?;
            if publisher != self.publisher {
                changes.publisher = Some(publisher);
            }
        }
        if let Some(year) = patch.publication_year {
            if !(0..=9999).contains(&year) {
                return Err(AppError::invalid_data(
                    ENTITY,
                    format!("implausible publication year: {year}"),
                ));
            }
            if year != self.publication_year {
                changes.publication_year = Some(year);
            }
        }
        if let Some(price) = patch.price {
            if !price.is_finite() || price < 0.0 {
                return Err(AppError::invalid_data(ENTITY, "price must be >= 0"));
            }
            if (price - self.price).abs() > f64::EPSILON {
                changes.price = Some(price);
            }
        }

        if changes.is_empty() {
            return Ok(None);
        }
        Ok(Some(BookEvent::Updated(changes)))
    }

    /// Build the soft-delete event.
    ///
    /// # Errors
    ///
    /// Returns `BOOK_NOT_FOUND` when the book is already deleted.
    pub fn delete(&self, now: DateTime<Utc>) -> Result<BookEvent, AppError> {
        if self.deleted_at.is_some() {
            return Err(AppError::not_found(ENTITY, self.id.as_str()));
        }
        Ok(BookEvent::Deleted(BookDeleted { deleted_at: now }))
    }

    /// Whether the book is tombstoned.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl AggregateRoot for Book {
    type Event = BookEvent;

    fn aggregate_id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn initialize(aggregate_id: AggregateId, event: &Self::Event) -> Option<Self> {
        let BookEvent::Created(created) = event else {
            return None;
        };
        Some(Self {
            id: aggregate_id,
            version: Version::INITIAL,
            isbn: created.isbn.clone(),
            title: created.title.clone(),
            author: created.author.clone(),
            publication_year: created.publication_year,
            publisher: created.publisher.clone(),
            price: created.price,
            created_at: created.created_at,
            updated_at: created.created_at,
            deleted_at: None,
        })
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BookEvent::Created(_) => {}
            BookEvent::Updated(updated) => {
                if let Some(title) = &updated.title {
                    self.title = title.clone();
                }
                if let Some(author) = &updated.author {
                    self.author = author.clone();
                }
                if let Some(year) = updated.publication_year {
                    self.publication_year = year;
                }
                if let Some(publisher) = &updated.publisher {
                    self.publisher = publisher.clone();
                }
                if let Some(price) = updated.price {
                    self.price = price;
                }
                self.updated_at = updated.updated_at;
            }
            BookEvent::Deleted(deleted) => {
                self.deleted_at = Some(deleted.deleted_at);
                self.updated_at = deleted.deleted_at;
            }
        }
    }
}
