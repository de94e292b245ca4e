//! Wallet projection handler: materializes `wallets_projection`, keyed
//! by wallet id with a unique `userId`.

use crate::events::WalletEvent;
use book_library_core::document::DocumentStore;
use book_library_core::event::DomainEvent;
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The wallets projection collection.
pub const WALLETS_COLLECTION: &str = "wallets_projection";

/// Event types this projection subscribes to.
pub const WALLET_EVENT_TYPES: [&str; 5] = [
    "WalletCreated",
    "WalletBalanceUpdated",
    "WalletLateFeeApplied",
    "WalletPaymentSuccess",
    "WalletPaymentDeclined",
];

/// Materializes wallet read models.
pub struct WalletProjectionHandler {
    docs: Arc<dyn DocumentStore>,
}

impl WalletProjectionHandler {
    /// Wire the projection to its document store.
    #[must_use]
    pub const fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// Subscribe the projection to every wallet event type.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if a subscription fails.
    pub async fn register(
        docs: Arc<dyn DocumentStore>,
        bus: &dyn EventBus,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> = Arc::new(Self::new(docs));
        for event_type in WALLET_EVENT_TYPES {
            bus.subscribe(event_type, Arc::clone(&handler)).await?;
        }
        Ok(())
    }

    async fn apply(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let decoded: WalletEvent = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let id = event.aggregate_id.as_str();

        let changes = match decoded {
            WalletEvent::Created(created) => json!({
                "id": id,
                "userId": created.user_id,
                "balance": created.balance,
                "booksPurchased": 0,
                "createdAt": created.created_at,
            }),
            WalletEvent::BalanceUpdated(updated) => json!({
                "balance": updated.balance,
            }),
            WalletEvent::LateFeeApplied(applied) => json!({
                "balance": applied.balance,
                "booksPurchased": applied.books_purchased,
            }),
            WalletEvent::PaymentSuccess(paid) => json!({
                "balance": paid.balance,
            }),
            // A decline changes nothing, but the write still advances the
            // projection version so replays stay idempotent.
            WalletEvent::PaymentDeclined(declined) => json!({
                "balance": declined.balance,
            }),
        };

        self.docs
            .upsert(WALLETS_COLLECTION, id, changes, event.version, event.timestamp)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;
        Ok(())
    }
}

impl EventHandler for WalletProjectionHandler {
    fn name(&self) -> &'static str {
        "wallets-projection"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.apply(&event).await })
    }
}
