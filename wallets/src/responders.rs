//! Wallet responders to cross-context events.
//!
//! - [`PaymentRequestHandler`] answers the saga's `WalletPaymentRequest`
//!   by charging the user's wallet; the resulting
//!   `WalletPaymentSuccess` / `WalletPaymentDeclined` events are
//!   appended to the wallet stream and published for the saga.
//! - [`LateFeeHandler`] reacts to `ReservationReturned` by charging the
//!   configured late fee; a fee reaching the retail price marks the
//!   book as purchased.
//!
//! A user without a wallet gets one opened with a zero balance on first
//! contact, preserving the one-wallet-per-user invariant.

use crate::aggregate::Wallet;
use crate::commands::WalletCommandHandler;
use book_library_core::aggregate::AggregateContext;
use book_library_core::config::Config;
use book_library_core::context::RequestContext;
use book_library_core::environment::Clock;
use book_library_core::error::AppError;
use book_library_core::event::{DomainEvent, EventMetadata};
use book_library_core::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use book_library_core::event_store::EventStore;
use book_library_core::messages::{SagaMessage, WALLET_PAYMENT_REQUEST};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

fn to_handler_error(err: &AppError) -> HandlerError {
    if err.is_client_error() {
        HandlerError::Fatal(err.to_string())
    } else {
        HandlerError::Retryable(err.to_string())
    }
}

/// Charges wallets on the saga's payment requests.
pub struct PaymentRequestHandler {
    commands: Arc<WalletCommandHandler>,
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl PaymentRequestHandler {
    /// Wire the responder to its collaborators.
    #[must_use]
    pub fn new(
        commands: Arc<WalletCommandHandler>,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            commands,
            store,
            bus,
            clock,
        }
    }

    /// Subscribe the responder to payment requests.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription fails.
    pub async fn register(
        commands: Arc<WalletCommandHandler>,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> =
            Arc::new(Self::new(commands, store, Arc::clone(&bus), clock));
        bus.subscribe(WALLET_PAYMENT_REQUEST, handler).await?;
        Ok(())
    }

    async fn settle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let SagaMessage::PaymentRequest(request) = event
            .decode()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?
        else {
            return Err(HandlerError::Fatal("unexpected message type".to_string()));
        };

        let mut wallet = self
            .wallet_for(&request.user_id, event)
            .await
            .map_err(|e| to_handler_error(&e))?;

        let outcome = wallet
            .aggregate()
            .request_payment(&request.reservation_id, request.fee_charged, self.clock.now())
            .map_err(|e| to_handler_error(&e))?;
        wallet
            .record(&outcome, self.clock.now(), EventMetadata::caused_by(event))
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        wallet
            .commit(&*self.store, &*self.bus)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        tracing::info!(
            reservation_id = %request.reservation_id,
            user_id = %request.user_id,
            amount = request.fee_charged,
            "Payment request settled"
        );
        Ok(())
    }

    async fn wallet_for(
        &self,
        user_id: &str,
        cause: &DomainEvent,
    ) -> Result<AggregateContext<Wallet>, AppError> {
        if let Some(wallet) = self.commands.find_by_user(user_id).await? {
            return Ok(wallet);
        }
        // First contact: open an empty wallet for the user.
        let ctx = RequestContext {
            correlation_id: cause.metadata.correlation_id.clone(),
            user_id: Some(user_id.to_string()),
            deadline: None,
        };
        self.commands.create_wallet(&ctx, user_id, 0.0).await?;
        self.commands
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::internal("wallet vanished after creation"))
    }
}

impl EventHandler for PaymentRequestHandler {
    fn name(&self) -> &'static str {
        "wallets-payment-requests"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.settle(&event).await })
    }
}

/// The slice of `ReservationReturned` this context consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReturnedNotice {
    user_id: String,
    days_late: i64,
    #[serde(default)]
    retail_price: Option<f64>,
}

/// Charges late fees when reservations come back overdue.
pub struct LateFeeHandler {
    commands: Arc<WalletCommandHandler>,
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl LateFeeHandler {
    /// Wire the responder to its collaborators.
    #[must_use]
    pub fn new(
        commands: Arc<WalletCommandHandler>,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            commands,
            store,
            bus,
            clock,
            config,
        }
    }

    /// Subscribe the responder to reservation returns.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription fails.
    pub async fn register(
        commands: Arc<WalletCommandHandler>,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Result<(), EventBusError> {
        let handler: Arc<dyn EventHandler> =
            Arc::new(Self::new(commands, store, Arc::clone(&bus), clock, config));
        bus.subscribe("ReservationReturned", handler).await?;
        Ok(())
    }

    async fn charge(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let notice: ReturnedNotice = serde_json::from_value(event.payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad ReservationReturned payload: {e}")))?;
        if notice.days_late <= 0 {
            return Ok(());
        }

        let mut wallet = self
            .wallet_for(&notice.user_id, event)
            .await
            .map_err(|e| to_handler_error(&e))?;

        let fee_event = wallet
            .aggregate()
            .apply_late_fee(
                event.aggregate_id.as_str(),
                notice.days_late,
                notice.retail_price,
                self.config.late_fee_per_day,
                self.clock.now(),
            )
            .map_err(|e| to_handler_error(&e))?;
        let Some(fee_event) = fee_event else {
            return Ok(());
        };

        wallet
            .record(&fee_event, self.clock.now(), EventMetadata::caused_by(event))
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        wallet
            .commit(&*self.store, &*self.bus)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        tracing::info!(
            reservation_id = %event.aggregate_id,
            user_id = %notice.user_id,
            days_late = notice.days_late,
            "Late fee applied"
        );
        Ok(())
    }

    async fn wallet_for(
        &self,
        user_id: &str,
        cause: &DomainEvent,
    ) -> Result<AggregateContext<Wallet>, AppError> {
        if let Some(wallet) = self.commands.find_by_user(user_id).await? {
            return Ok(wallet);
        }
        let ctx = RequestContext {
            correlation_id: cause.metadata.correlation_id.clone(),
            user_id: Some(user_id.to_string()),
            deadline: None,
        };
        self.commands.create_wallet(&ctx, user_id, 0.0).await?;
        self.commands
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::internal("wallet vanished after creation"))
    }
}

impl EventHandler for LateFeeHandler {
    fn name(&self) -> &'static str {
        "wallets-late-fees"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move { self.charge(&event).await })
    }
}
