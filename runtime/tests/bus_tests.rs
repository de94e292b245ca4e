//! Behavioral tests for the in-process event bus: per-aggregate
//! ordering, at-least-once delivery under injected failures,
//! dead-lettering, and derived failure events.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use book_library_core::event::{DomainEvent, EventMetadata};
use book_library_core::event_bus::{DeadLetterStore, EventBus};
use book_library_core::stream::{AggregateId, Version};
use book_library_runtime::bus::InProcessEventBus;
use book_library_runtime::retry::RetryPolicy;
use book_library_testing::{
    CaptureHandler, FailingHandler, FlakyHandler, InMemoryDeadLetterStore,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

fn fast_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

fn test_bus(dead_letters: Arc<InMemoryDeadLetterStore>) -> InProcessEventBus {
    InProcessEventBus::builder(dead_letters)
        .retry_policy(fast_policy())
        .build()
}

fn event(aggregate: &str, event_type: &str, version: u64) -> DomainEvent {
    DomainEvent {
        aggregate_id: AggregateId::new(aggregate),
        event_type: event_type.to_string(),
        version: Version::new(version),
        global_version: None,
        schema_version: 1,
        timestamp: Utc::now(),
        payload: serde_json::json!({"n": version}),
        metadata: EventMetadata::for_request(Some("corr-1".to_string()), None),
    }
}

#[tokio::test]
async fn delivers_to_subscribers_of_the_event_type() {
    let bus = test_bus(Arc::new(InMemoryDeadLetterStore::new()));
    let books = Arc::new(CaptureHandler::new("books"));
    let other = Arc::new(CaptureHandler::new("other"));

    bus.subscribe("BookCreated", books.clone()).await.unwrap();
    bus.subscribe("BookDeleted", other.clone()).await.unwrap();

    bus.publish(event("book-1", "BookCreated", 1)).await.unwrap();

    assert!(books.wait_for_count(1, Duration::from_secs(2)).await);
    assert_eq!(other.count(), 0);
}

#[tokio::test]
async fn per_aggregate_delivery_is_in_version_order() {
    let bus = test_bus(Arc::new(InMemoryDeadLetterStore::new()));
    let capture = Arc::new(CaptureHandler::new("ordered"));
    bus.subscribe("ReservationCreated", capture.clone())
        .await
        .unwrap();

    for version in 1..=20 {
        bus.publish(event("reservation-1", "ReservationCreated", version))
            .await
            .unwrap();
    }

    assert!(capture.wait_for_count(20, Duration::from_secs(5)).await);
    let versions: Vec<u64> = capture
        .events()
        .iter()
        .filter(|e| e.aggregate_id.as_str() == "reservation-1")
        .map(|e| e.version.value())
        .collect();
    assert_eq!(versions, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn different_aggregates_do_not_block_each_other() {
    let bus = test_bus(Arc::new(InMemoryDeadLetterStore::new()));
    let capture = Arc::new(CaptureHandler::new("multi"));
    bus.subscribe("WalletCreated", capture.clone()).await.unwrap();

    for aggregate in ["wallet-1", "wallet-2", "wallet-3"] {
        for version in 1..=5 {
            bus.publish(event(aggregate, "WalletCreated", version))
                .await
                .unwrap();
        }
    }

    assert!(capture.wait_for_count(15, Duration::from_secs(5)).await);

    // Order must hold within each aggregate independently.
    for aggregate in ["wallet-1", "wallet-2", "wallet-3"] {
        let versions: Vec<u64> = capture
            .events()
            .iter()
            .filter(|e| e.aggregate_id.as_str() == aggregate)
            .map(|e| e.version.value())
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }
}

#[tokio::test]
async fn transient_handler_failures_are_retried_until_delivery() {
    let bus = test_bus(Arc::new(InMemoryDeadLetterStore::new()));
    let flaky = Arc::new(FlakyHandler::new("flaky", 2));
    bus.subscribe("BookCreated", flaky.clone()).await.unwrap();

    bus.publish(event("book-1", "BookCreated", 1)).await.unwrap();

    // 2 injected failures, 3 attempts allowed: the event lands.
    assert!(
        flaky
            .capture()
            .wait_for_count(1, Duration::from_secs(2))
            .await
    );
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_derive_failure_event() {
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let bus = test_bus(dead_letters.clone());

    let failing = Arc::new(FailingHandler::retryable("broken"));
    let failures = Arc::new(CaptureHandler::new("failures"));
    bus.subscribe("BookCreated", failing.clone()).await.unwrap();
    bus.subscribe("BookCreated_FAILED", failures.clone())
        .await
        .unwrap();

    bus.publish(event("book-1", "BookCreated", 1)).await.unwrap();

    assert!(dead_letters.wait_for_count(1, Duration::from_secs(2)).await);
    assert_eq!(failing.attempts(), 3);

    let parked = dead_letters.list_pending(10).await.unwrap();
    assert_eq!(parked[0].event.event_type, "BookCreated");
    assert_eq!(parked[0].subscriber, "broken");
    assert_eq!(parked[0].attempts, 3);

    assert!(failures.wait_for_count(1, Duration::from_secs(2)).await);
    let derived = &failures.events()[0];
    assert_eq!(derived.event_type, "BookCreated_FAILED");
    assert_eq!(derived.payload["sourceEventType"], "BookCreated");
    assert_eq!(derived.payload["correlationId"], "corr-1");
    assert_eq!(derived.metadata.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(derived.metadata.causation_id.as_deref(), Some("book-1:1"));
}

#[tokio::test]
async fn fatal_failures_skip_retries() {
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let bus = test_bus(dead_letters.clone());

    let failing = Arc::new(FailingHandler::fatal("strict"));
    bus.subscribe("BookCreated", failing.clone()).await.unwrap();

    bus.publish(event("book-1", "BookCreated", 1)).await.unwrap();

    assert!(dead_letters.wait_for_count(1, Duration::from_secs(2)).await);
    assert_eq!(failing.attempts(), 1);
}

#[tokio::test]
async fn failure_events_are_not_rederived() {
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let bus = test_bus(dead_letters.clone());

    // A handler that fails even on the derived failure event.
    let failing = Arc::new(FailingHandler::fatal("cursed"));
    bus.subscribe("BookCreated_FAILED", failing.clone())
        .await
        .unwrap();

    bus.publish(event("book-1", "BookCreated_FAILED", 1))
        .await
        .unwrap();

    assert!(dead_letters.wait_for_count(1, Duration::from_secs(2)).await);
    // Parked, but no BookCreated_FAILED_FAILED cascade.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dead_letters.count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = test_bus(Arc::new(InMemoryDeadLetterStore::new()));
    let capture = Arc::new(CaptureHandler::new("gone"));

    let sub = bus.subscribe("BookCreated", capture.clone()).await.unwrap();
    bus.publish(event("book-1", "BookCreated", 1)).await.unwrap();
    assert!(capture.wait_for_count(1, Duration::from_secs(2)).await);

    bus.unsubscribe("BookCreated", sub).await.unwrap();
    bus.publish(event("book-1", "BookCreated", 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(capture.count(), 1);
}
