//! End-to-end tests for the reservation–payment saga with every context
//! wired onto one in-process bus: happy path, declined payment,
//! invalid book, late-return fees and purchase conversion, duplicate
//! delivery, and the timeout watchdog.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use book_library_books::commands::{BookCommandHandler, CreateBook};
use book_library_books::projection::BookProjectionHandler;
use book_library_books::validation::BookValidationHandler;
use book_library_core::aggregate::AggregateRoot;
use book_library_core::config::Config;
use book_library_core::context::RequestContext;
use book_library_core::environment::Clock;
use book_library_core::event_bus::EventBus;
use book_library_core::event_store::EventStore;
use book_library_core::saga::{SagaStateStore, SagaStatus, SagaStep};
use book_library_core::stream::AggregateId;
use book_library_reservations::commands::{CreateReservation, ReservationCommandHandler};
use book_library_reservations::projection::ReservationProjectionHandler;
use book_library_reservations::purchases::PurchaseOnLateFeeHandler;
use book_library_runtime::bus::InProcessEventBus;
use book_library_runtime::retry::RetryPolicy;
use book_library_saga::orchestrator::ReservationPaymentSaga;
use book_library_saga::watchdog::SagaWatchdog;
use book_library_testing::{
    FixedClock, InMemoryDeadLetterStore, InMemoryDocumentStore, InMemoryEventStore,
    InMemorySagaStore, test_clock,
};
use book_library_wallets::commands::WalletCommandHandler;
use book_library_wallets::projection::WalletProjectionHandler;
use book_library_wallets::responders::{LateFeeHandler, PaymentRequestHandler};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

struct Platform {
    store: InMemoryEventStore,
    docs: Arc<InMemoryDocumentStore>,
    sagas: Arc<InMemorySagaStore>,
    bus: InProcessEventBus,
    clock: FixedClock,
    books: Arc<BookCommandHandler>,
    wallets: Arc<WalletCommandHandler>,
    reservations: Arc<ReservationCommandHandler>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .build()
}

/// Wire the whole platform onto one bus. `with_book_validation` left
/// false starves the saga at its first step (for watchdog tests).
async fn platform(with_book_validation: bool) -> Platform {
    let store = InMemoryEventStore::new();
    let docs = Arc::new(InMemoryDocumentStore::new());
    let sagas = Arc::new(InMemorySagaStore::new());
    let clock = test_clock();
    let bus = InProcessEventBus::builder(Arc::new(InMemoryDeadLetterStore::new()))
        .retry_policy(fast_retry())
        .clock(Arc::new(clock.clone()))
        .build();

    let store_arc: Arc<dyn EventStore> = Arc::new(store.clone());
    let bus_arc: Arc<dyn EventBus> = Arc::new(bus.clone());
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

    let books = Arc::new(
        BookCommandHandler::new(store_arc.clone(), bus_arc.clone(), clock_arc.clone())
            .with_retry_policy(fast_retry()),
    );
    let wallets = Arc::new(
        WalletCommandHandler::new(store_arc.clone(), bus_arc.clone(), clock_arc.clone())
            .with_retry_policy(fast_retry()),
    );
    let reservations = Arc::new(
        ReservationCommandHandler::new(store_arc.clone(), bus_arc.clone(), clock_arc.clone())
            .with_retry_policy(fast_retry()),
    );

    BookProjectionHandler::register(docs.clone(), &bus).await.unwrap();
    ReservationProjectionHandler::register(docs.clone(), &bus).await.unwrap();
    WalletProjectionHandler::register(docs.clone(), &bus).await.unwrap();

    if with_book_validation {
        BookValidationHandler::register(docs.clone(), bus_arc.clone(), clock_arc.clone())
            .await
            .unwrap();
    }
    PaymentRequestHandler::register(
        wallets.clone(),
        store_arc.clone(),
        bus_arc.clone(),
        clock_arc.clone(),
    )
    .await
    .unwrap();
    LateFeeHandler::register(
        wallets.clone(),
        store_arc.clone(),
        bus_arc.clone(),
        clock_arc.clone(),
        Config::default(),
    )
    .await
    .unwrap();
    PurchaseOnLateFeeHandler::register(reservations.clone(), &bus)
        .await
        .unwrap();
    ReservationPaymentSaga::register(
        sagas.clone(),
        bus_arc.clone(),
        reservations.clone(),
        clock_arc,
    )
    .await
    .unwrap();

    Platform {
        store,
        docs,
        sagas,
        bus,
        clock,
        books,
        wallets,
        reservations,
    }
}

async fn wait_for_saga(
    sagas: &InMemorySagaStore,
    reservation_id: &str,
    step: SagaStep,
) -> book_library_core::saga::SagaState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(state) = sagas.load(reservation_id).await.unwrap() {
            if state.step == step {
                return state;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "saga for {reservation_id} never reached {step}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_reservation_status(
    docs: &InMemoryDocumentStore,
    reservation_id: &str,
    status: &str,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(doc) = docs.raw("reservations_projection", reservation_id) {
            if doc["status"] == status {
                return doc;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reservation {reservation_id} never became {status}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wallet_doc_for(docs: &InMemoryDocumentStore, user_id: &str) -> Option<serde_json::Value> {
    use book_library_core::document::{DocumentStore, Filter};
    docs.find_one(
        "wallets_projection",
        Filter::all().eq("userId", user_id),
    )
    .await
    .unwrap()
}

async fn seeded_book(platform: &Platform, price: f64) -> String {
    let ctx = RequestContext::new();
    let book = platform
        .books
        .create_book(
            &ctx,
            CreateBook {
                isbn: "0515125628".to_string(),
                title: "T".to_string(),
                author: "A".to_string(),
                publication_year: 1999,
                publisher: "P".to_string(),
                price,
            },
        )
        .await
        .unwrap();
    let id = book.aggregate_id().as_str().to_string();

    // The validation responder reads the projection; wait for it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while platform.docs.raw("books_projection", &id).is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    id
}

fn reservation_command(platform: &Platform, user_id: &str, book_id: &str) -> CreateReservation {
    CreateReservation {
        user_id: user_id.to_string(),
        book_id: book_id.to_string(),
        due_date: platform.clock.now() + ChronoDuration::days(14),
        fee_charged: 3.0,
        retail_price: None,
    }
}

#[tokio::test]
async fn happy_path_completes_and_activates_the_reservation() {
    let platform = platform(true).await;
    let ctx = RequestContext::new();
    let book_id = seeded_book(&platform, 20.0).await;
    platform.wallets.create_wallet(&ctx, "u1", 10.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", &book_id))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();

    let state = wait_for_saga(&platform.sagas, reservation_id, SagaStep::Completed).await;
    assert_eq!(state.status, SagaStatus::Completed);
    assert_eq!(state.retail_price, Some(20.0));
    assert_eq!(state.book_id, book_id);

    let doc = wait_for_reservation_status(&platform.docs, reservation_id, "active").await;
    assert_eq!(doc["payment"]["amount"], 3.0);
    assert_eq!(doc["retailPrice"], 20.0);

    // Fee left the wallet.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(wallet) = wallet_doc_for(&platform.docs, "u1").await {
            if wallet["balance"] == 7.0 {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "wallet never charged");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn declined_payment_compensates_and_cancels() {
    let platform = platform(true).await;
    let ctx = RequestContext::new();
    let book_id = seeded_book(&platform, 20.0).await;
    // Not enough funds for the 3.0 fee.
    platform.wallets.create_wallet(&ctx, "u1", 1.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", &book_id))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();

    let state = wait_for_saga(&platform.sagas, reservation_id, SagaStep::Failed).await;
    assert_eq!(state.status, SagaStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some("payment_declined"));
    assert_eq!(state.compensations, vec!["reservation_cancelled".to_string()]);

    let doc = wait_for_reservation_status(&platform.docs, reservation_id, "cancelled").await;
    assert_eq!(doc["statusReason"], "payment_declined");

    // The wallet was never charged.
    let wallet = wallet_doc_for(&platform.docs, "u1").await.unwrap();
    assert_eq!(wallet["balance"], 1.0);
}

#[tokio::test]
async fn unknown_book_rejects_the_reservation() {
    let platform = platform(true).await;
    let ctx = RequestContext::new();
    platform.wallets.create_wallet(&ctx, "u1", 10.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", "book-missing"))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();

    let state = wait_for_saga(&platform.sagas, reservation_id, SagaStep::Failed).await;
    assert_eq!(state.status, SagaStatus::Failed);

    wait_for_reservation_status(&platform.docs, reservation_id, "rejected").await;
}

#[tokio::test]
async fn late_return_charges_one_decimal_fee_without_purchase() {
    let platform = platform(true).await;
    let ctx = RequestContext::new();
    let book_id = seeded_book(&platform, 20.0).await;
    platform.wallets.create_wallet(&ctx, "u1", 10.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", &book_id))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();
    wait_for_saga(&platform.sagas, reservation_id, SagaStep::Completed).await;
    wait_for_reservation_status(&platform.docs, reservation_id, "active").await;

    // Due in 14 days; return 5 days past due.
    platform.clock.advance(ChronoDuration::days(19));
    platform
        .reservations
        .return_reservation(&ctx, reservation_id)
        .await
        .unwrap();

    // 5 × 0.2 = 1.0 leaves the wallet (after the 3.0 fee: 10 − 3 − 1 = 6).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let wallet = wallet_doc_for(&platform.docs, "u1").await.unwrap();
        if wallet["balance"] == 6.0 {
            assert_eq!(wallet["booksPurchased"], 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "late fee never charged");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let doc = platform
            .docs
            .raw("reservations_projection", reservation_id)
            .unwrap();
        if doc["lateFee"] == 1.0 {
            assert_eq!(doc["status"], "returned");
            assert_eq!(doc["daysLate"], 5);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "late fee never booked");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn hundred_days_late_converts_the_loan_into_a_purchase() {
    let platform = platform(true).await;
    let ctx = RequestContext::new();
    let book_id = seeded_book(&platform, 20.0).await;
    platform.wallets.create_wallet(&ctx, "u1", 5.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", &book_id))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();
    wait_for_saga(&platform.sagas, reservation_id, SagaStep::Completed).await;
    wait_for_reservation_status(&platform.docs, reservation_id, "active").await;

    platform.clock.advance(ChronoDuration::days(114));
    platform
        .reservations
        .return_reservation(&ctx, reservation_id)
        .await
        .unwrap();

    // 100 × 0.2 = 20.0 = retail price: the fee buys the book.
    wait_for_reservation_status(&platform.docs, reservation_id, "bought").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let wallet = wallet_doc_for(&platform.docs, "u1").await.unwrap();
        // 5 − 3 (fee) − 20 (purchase) = −18.
        if wallet["balance"] == -18.0 {
            assert_eq!(wallet["booksPurchased"], 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "purchase never charged");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn duplicate_deliveries_leave_the_saga_and_streams_unchanged() {
    let platform = platform(true).await;
    let ctx = RequestContext::new();
    let book_id = seeded_book(&platform, 20.0).await;
    platform.wallets.create_wallet(&ctx, "u1", 10.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", &book_id))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();
    wait_for_saga(&platform.sagas, reservation_id, SagaStep::Completed).await;
    wait_for_reservation_status(&platform.docs, reservation_id, "active").await;

    let events_before = platform
        .store
        .load_events(AggregateId::new(reservation_id))
        .await
        .unwrap();

    // Redeliver the wallet's payment success verbatim.
    let wallet = platform
        .wallets
        .find_by_user("u1")
        .await
        .unwrap()
        .unwrap();
    let wallet_events = platform
        .store
        .load_events(wallet.aggregate().aggregate_id().clone())
        .await
        .unwrap();
    let success = wallet_events
        .iter()
        .find(|e| e.event_type == "WalletPaymentSuccess")
        .unwrap()
        .clone();
    platform.bus.publish(success).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = platform.sagas.load(reservation_id).await.unwrap().unwrap();
    assert_eq!(state.step, SagaStep::Completed);
    let events_after = platform
        .store
        .load_events(AggregateId::new(reservation_id))
        .await
        .unwrap();
    assert_eq!(events_before.len(), events_after.len());
}

#[tokio::test]
async fn watchdog_reissues_then_compensates_a_starved_saga() {
    // No book-validation responder: the saga waits forever on its own.
    let platform = platform(false).await;
    let ctx = RequestContext::new();
    platform.wallets.create_wallet(&ctx, "u1", 10.0).await.unwrap();

    let reservation = platform
        .reservations
        .create_reservation(&ctx, reservation_command(&platform, "u1", "book-1"))
        .await
        .unwrap();
    let reservation_id = reservation.aggregate_id().as_str();
    wait_for_saga(
        &platform.sagas,
        reservation_id,
        SagaStep::AwaitingBookValidation,
    )
    .await;

    let config = Config {
        saga_max_retries: 1,
        ..Config::default()
    };
    let watchdog = SagaWatchdog::new(
        platform.sagas.clone(),
        Arc::new(platform.bus.clone()),
        platform.reservations.clone(),
        Arc::new(platform.clock.clone()),
        config,
    );

    // First stale scan: reissue.
    platform.clock.advance(ChronoDuration::seconds(31));
    watchdog.tick().await;
    let state = platform.sagas.load(reservation_id).await.unwrap().unwrap();
    assert_eq!(state.step, SagaStep::AwaitingBookValidation);
    assert_eq!(state.retry_count, 1);

    // Second stale scan: retries exhausted, compensate.
    platform.clock.advance(ChronoDuration::seconds(31));
    watchdog.tick().await;
    let state = wait_for_saga(&platform.sagas, reservation_id, SagaStep::Failed).await;
    assert_eq!(state.status, SagaStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some("saga_step_timeout"));

    let doc = wait_for_reservation_status(&platform.docs, reservation_id, "cancelled").await;
    assert_eq!(doc["statusReason"], "saga_step_timeout");
}
