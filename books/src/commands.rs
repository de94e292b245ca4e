//! Book command handlers.
//!
//! Every mutation follows the same shape: validate inputs, run the
//! uniqueness check, load and rehydrate the aggregate, invoke the
//! domain method, append under the loaded version, publish, drain.
//! Appends that lose an optimistic-concurrency race are retried through
//! `append_batch`, re-deriving the whole operation each attempt.

use crate::aggregate::{Book, BookPatch};
use book_library_core::aggregate::{AggregateContext, AggregateRoot};
use book_library_core::context::{RequestContext, with_deadline};
use book_library_core::environment::Clock;
use book_library_core::error::AppError;
use book_library_core::event_bus::EventBus;
use book_library_core::event_store::EventStore;
use book_library_core::stream::AggregateId;
use book_library_runtime::retry::{RetryPolicy, append_batch};
use std::sync::Arc;

const ENTITY: &str = "BOOK";

/// Add a book to the catalogue.
#[derive(Clone, Debug)]
pub struct CreateBook {
    /// ISBN (natural key).
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
}

/// Command side of the Books context.
pub struct BookCommandHandler {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl BookCommandHandler {
    /// Wire the handler to its collaborators.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the append retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create a book. The ISBN must not belong to a live book.
    ///
    /// # Errors
    ///
    /// - `BOOK_INVALID_DATA`: validation failed
    /// - `BOOK_ALREADY_EXISTS`: a live book carries this ISBN
    /// - `OPERATION_TIMEOUT`: the request deadline elapsed
    pub async fn create_book(
        &self,
        ctx: &RequestContext,
        command: CreateBook,
    ) -> Result<Book, AppError> {
        with_deadline(ctx, "CreateBook", self.create_inner(ctx, command)).await
    }

    async fn create_inner(
        &self,
        ctx: &RequestContext,
        command: CreateBook,
    ) -> Result<Book, AppError> {
        let now = self.clock.now();
        let event = Book::create(
            &command.isbn,
            &command.title,
            &command.author,
            command.publication_year,
            &command.publisher,
            command.price,
            now,
        )?;

        let isbn = command.isbn.trim();
        if let Some(existing) = self
            .store
            .find_aggregate_id("BookCreated", "isbn", isbn)
            .await?
        {
            // A tombstoned book frees its ISBN.
            let live = AggregateContext::<Book>::load(&*self.store, &existing)
                .await?
                .is_some_and(|loaded| !loaded.aggregate().is_deleted());
            if live {
                return Err(AppError::already_exists(
                    ENTITY,
                    format!("ISBN {isbn} already registered"),
                ));
            }
        }

        let id = AggregateId::new(format!("book-{}", uuid::Uuid::new_v4()));
        let mut aggregate = AggregateContext::<Book>::create(id, &event, now, ctx.metadata())?
            .ok_or_else(|| AppError::internal("creation event rejected by aggregate"))?;
        aggregate.commit(&*self.store, &*self.bus).await?;

        tracing::info!(
            book_id = %aggregate.aggregate().aggregate_id(),
            isbn = isbn,
            "Book created"
        );
        Ok(aggregate.aggregate().clone())
    }

    /// Apply a partial update to catalogue data.
    ///
    /// A patch whose fields all match the current state is a no-op and
    /// returns the unchanged book.
    ///
    /// # Errors
    ///
    /// - `BOOK_NOT_FOUND`: unknown or deleted book
    /// - `BOOK_INVALID_DATA`: empty patch or bad field values
    /// - `CONCURRENCY_CONFLICT`: lost the append race after retries
    pub async fn update_book(
        &self,
        ctx: &RequestContext,
        book_id: &str,
        patch: BookPatch,
    ) -> Result<Book, AppError> {
        let patch = &patch;
        with_deadline(
            ctx,
            "UpdateBook",
            append_batch(&self.retry, move || self.update_inner(ctx, book_id, patch)),
        )
        .await
    }

    async fn update_inner(
        &self,
        ctx: &RequestContext,
        book_id: &str,
        patch: &BookPatch,
    ) -> Result<Book, AppError> {
        let id = AggregateId::new(book_id);
        let mut aggregate = self.load_live(&id).await?;

        let Some(event) = aggregate.aggregate().update(patch, self.clock.now())? else {
            return Ok(aggregate.aggregate().clone());
        };
        aggregate.record(&event, self.clock.now(), ctx.metadata())?;
        aggregate.commit(&*self.store, &*self.bus).await?;

        Ok(aggregate.aggregate().clone())
    }

    /// Soft-delete a book from the catalogue.
    ///
    /// # Errors
    ///
    /// - `BOOK_NOT_FOUND`: unknown or already-deleted book
    pub async fn delete_book(&self, ctx: &RequestContext, book_id: &str) -> Result<(), AppError> {
        with_deadline(
            ctx,
            "DeleteBook",
            append_batch(&self.retry, move || self.delete_inner(ctx, book_id)),
        )
        .await
    }

    async fn delete_inner(&self, ctx: &RequestContext, book_id: &str) -> Result<(), AppError> {
        let id = AggregateId::new(book_id);
        let mut aggregate = self.load_live(&id).await?;

        let event = aggregate.aggregate().delete(self.clock.now())?;
        aggregate.record(&event, self.clock.now(), ctx.metadata())?;
        aggregate.commit(&*self.store, &*self.bus).await?;

        tracing::info!(book_id = %id, "Book deleted");
        Ok(())
    }

    async fn load_live(&self, id: &AggregateId) -> Result<AggregateContext<Book>, AppError> {
        let aggregate = AggregateContext::<Book>::load(&*self.store, id)
            .await?
            .ok_or_else(|| AppError::not_found(ENTITY, id.as_str()))?;
        if aggregate.aggregate().is_deleted() {
            return Err(AppError::not_found(ENTITY, id.as_str()));
        }
        Ok(aggregate)
    }
}
