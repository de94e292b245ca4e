//! Behavioral tests for the Books context: command flow, uniqueness,
//! optimistic concurrency, and projection semantics.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use book_library_books::aggregate::BookPatch;
use book_library_books::commands::{BookCommandHandler, CreateBook};
use book_library_books::projection::BookProjectionHandler;
use book_library_books::queries::{BookListQuery, BookQueryHandler};
use book_library_core::aggregate::AggregateRoot;
use book_library_core::config::Config;
use book_library_core::context::RequestContext;
use book_library_core::document::{PageRequest, SortOrder};
use book_library_core::event_bus::EventHandler;
use book_library_core::event_store::EventStore;
use book_library_core::stream::AggregateId;
use book_library_runtime::bus::InProcessEventBus;
use book_library_runtime::retry::RetryPolicy;
use book_library_testing::{InMemoryDeadLetterStore, InMemoryDocumentStore, InMemoryEventStore, test_clock};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    store: InMemoryEventStore,
    docs: Arc<InMemoryDocumentStore>,
    commands: BookCommandHandler,
    queries: BookQueryHandler,
}

async fn fixture() -> Fixture {
    let store = InMemoryEventStore::new();
    let docs = Arc::new(InMemoryDocumentStore::new());
    let bus = InProcessEventBus::builder(Arc::new(InMemoryDeadLetterStore::new()))
        .retry_policy(
            RetryPolicy::builder()
                .base_delay(Duration::from_millis(1))
                .build(),
        )
        .build();

    BookProjectionHandler::register(docs.clone(), &bus)
        .await
        .unwrap();

    let commands = BookCommandHandler::new(
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        Arc::new(test_clock()),
    )
    .with_retry_policy(
        RetryPolicy::builder()
            .base_delay(Duration::from_millis(1))
            .build(),
    );
    let queries = BookQueryHandler::new(docs.clone(), Config::default());

    Fixture {
        store,
        docs,
        commands,
        queries,
    }
}

fn create_command() -> CreateBook {
    CreateBook {
        isbn: "0515125628".to_string(),
        title: "T".to_string(),
        author: "A".to_string(),
        publication_year: 1999,
        publisher: "P".to_string(),
        price: 9.99,
    }
}

async fn wait_for_doc(docs: &InMemoryDocumentStore, id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if docs.raw("books_projection", id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("projection for {id} never materialized");
}

#[tokio::test]
async fn create_book_appends_one_event_and_duplicate_isbn_is_rejected() {
    let fx = fixture().await;
    let ctx = RequestContext::new();

    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    let events = fx
        .store
        .load_events(book.aggregate_id().clone())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "BookCreated");
    assert_eq!(events[0].version.value(), 1);

    let err = fx
        .commands
        .create_book(&ctx, create_command())
        .await
        .unwrap_err();
    assert_eq!(err.code, "BOOK_ALREADY_EXISTS");
}

#[tokio::test]
async fn deleting_a_book_frees_its_isbn() {
    let fx = fixture().await;
    let ctx = RequestContext::new();

    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    fx.commands
        .delete_book(&ctx, book.aggregate_id().as_str())
        .await
        .unwrap();

    let recreated = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    assert_ne!(recreated.aggregate_id(), book.aggregate_id());
}

#[tokio::test]
async fn update_validates_and_skips_noops() {
    let fx = fixture().await;
    let ctx = RequestContext::new();
    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    let id = book.aggregate_id().as_str();

    let err = fx
        .commands
        .update_book(&ctx, id, BookPatch::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, "BOOK_INVALID_DATA");

    // Same values: no event appended.
    let unchanged = fx
        .commands
        .update_book(
            &ctx,
            id,
            BookPatch {
                title: Some("T".to_string()),
                ..BookPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(unchanged.version().value(), 1);

    let updated = fx
        .commands
        .update_book(
            &ctx,
            id,
            BookPatch {
                price: Some(12.5),
                ..BookPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version().value(), 2);
    assert!((updated.price - 12.5).abs() < f64::EPSILON);

    let err = fx
        .commands
        .update_book(&ctx, "book-missing", BookPatch::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, "BOOK_NOT_FOUND");
}

#[tokio::test]
async fn concurrent_updates_serialize_through_retry() {
    let fx = fixture().await;
    let ctx = RequestContext::new();
    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    let id = book.aggregate_id().as_str().to_string();

    // Bring the stream to version 3.
    for price in [10.0, 11.0] {
        fx.commands
            .update_book(
                &ctx,
                &id,
                BookPatch {
                    price: Some(price),
                    ..BookPatch::default()
                },
            )
            .await
            .unwrap();
    }

    let first = fx.commands.update_book(
        &ctx,
        &id,
        BookPatch {
            title: Some("Left".to_string()),
            ..BookPatch::default()
        },
    );
    let second = fx.commands.update_book(
        &ctx,
        &id,
        BookPatch {
            author: Some("Right".to_string()),
            ..BookPatch::default()
        },
    );
    let (first, second) = tokio::join!(first, second);

    let events = fx
        .store
        .load_events(AggregateId::new(id.clone()))
        .await
        .unwrap();
    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    match successes {
        // Both landed: versions 4 and 5, in some order.
        2 => assert_eq!(events.len(), 5),
        // One lost the race even after retries.
        1 => {
            assert_eq!(events.len(), 4);
            let err = [first, second].into_iter().find_map(Result::err).unwrap();
            assert_eq!(err.code, "CONCURRENCY_CONFLICT");
        }
        _ => panic!("at least one concurrent update must succeed"),
    }
}

#[tokio::test]
async fn projection_follows_create_update_delete() {
    let fx = fixture().await;
    let ctx = RequestContext::new();
    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    let id = book.aggregate_id().as_str();
    wait_for_doc(&fx.docs, id).await;

    let doc = fx.queries.get_book(&ctx, id, None).await.unwrap();
    assert_eq!(doc["isbn"], "0515125628");
    assert_eq!(doc["publicationYear"], 1999);

    fx.commands
        .update_book(
            &ctx,
            id,
            BookPatch {
                price: Some(20.0),
                ..BookPatch::default()
            },
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let doc = fx.docs.raw("books_projection", id).unwrap();
        if doc["version"] == 2 {
            assert_eq!(doc["price"], 20.0);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "projection never saw the update"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fx.commands.delete_book(&ctx, id).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if fx.queries.get_book(&ctx, id, None).await.is_err() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delete never reached the projection"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Tombstoned rows stay out of listings.
    let page = fx
        .queries
        .list_books(&ctx, BookListQuery::default())
        .await
        .unwrap();
    assert_eq!(page.pagination.total, 0);
}

#[tokio::test]
async fn replaying_the_stream_yields_identical_projection_documents() {
    let fx = fixture().await;
    let ctx = RequestContext::new();
    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    let id = book.aggregate_id().as_str();
    fx.commands
        .update_book(
            &ctx,
            id,
            BookPatch {
                price: Some(20.0),
                title: Some("T2".to_string()),
                ..BookPatch::default()
            },
        )
        .await
        .unwrap();

    let events = fx
        .store
        .load_events(book.aggregate_id().clone())
        .await
        .unwrap();

    // Replay the full log twice into a fresh store; both replays and the
    // live projection must converge on the same document.
    let replay_docs = Arc::new(InMemoryDocumentStore::new());
    let replayer = BookProjectionHandler::new(replay_docs.clone());
    for _ in 0..2 {
        for event in &events {
            replayer.handle(event.clone()).await.unwrap();
        }
    }

    wait_for_doc(&fx.docs, id).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while fx.docs.raw("books_projection", id).unwrap()["version"] != 2 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        replay_docs.raw("books_projection", id),
        fx.docs.raw("books_projection", id)
    );
}

#[tokio::test]
async fn out_of_order_older_event_does_not_downgrade() {
    let fx = fixture().await;
    let ctx = RequestContext::new();
    let book = fx.commands.create_book(&ctx, create_command()).await.unwrap();
    let id = book.aggregate_id().as_str();
    fx.commands
        .update_book(
            &ctx,
            id,
            BookPatch {
                price: Some(20.0),
                ..BookPatch::default()
            },
        )
        .await
        .unwrap();

    let events = fx
        .store
        .load_events(book.aggregate_id().clone())
        .await
        .unwrap();

    // Deliver newest first into a fresh projection.
    let docs = Arc::new(InMemoryDocumentStore::new());
    let projection = BookProjectionHandler::new(docs.clone());
    projection.handle(events[1].clone()).await.unwrap();
    projection.handle(events[0].clone()).await.unwrap();

    let doc = docs.raw("books_projection", id).unwrap();
    assert_eq!(doc["version"], 2);
    assert_eq!(doc["price"], 20.0);
}

#[tokio::test]
async fn list_books_paginates_and_sorts() {
    let fx = fixture().await;
    let ctx = RequestContext::new();

    for (i, price) in [5.0_f64, 25.0, 15.0].iter().enumerate() {
        let book = fx
            .commands
            .create_book(
                &ctx,
                CreateBook {
                    isbn: format!("isbn-{i}"),
                    title: format!("Book {i}"),
                    author: "A".to_string(),
                    publication_year: 2000 + i32::try_from(i).unwrap(),
                    publisher: "P".to_string(),
                    price: *price,
                },
            )
            .await
            .unwrap();
        wait_for_doc(&fx.docs, book.aggregate_id().as_str()).await;
    }

    let page = fx
        .queries
        .list_books(
            &ctx,
            BookListQuery {
                price_max: Some(20.0),
                page: PageRequest {
                    page: 1,
                    limit: Some(1),
                    sort_by: Some("price".to_string()),
                    sort_order: SortOrder::Desc,
                },
                fields: Some(vec!["price".to_string(), "title".to_string()]),
                ..BookListQuery::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.pagination.total, 2);
    assert_eq!(page.pagination.pages, 2);
    assert!(page.pagination.has_next);
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0]["price"], 15.0);
    // Field selection: primary key plus the allow-list only.
    assert!(page.data[0].get("isbn").is_none());

    let err = fx
        .queries
        .list_books(
            &ctx,
            BookListQuery {
                page: PageRequest {
                    sort_by: Some("isbn".to_string()),
                    ..PageRequest::default()
                },
                ..BookListQuery::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, "VALIDATION_ERROR");
}
