//! Wallet command handlers.

use crate::aggregate::Wallet;
use book_library_core::aggregate::{AggregateContext, AggregateRoot};
use book_library_core::context::{RequestContext, with_deadline};
use book_library_core::environment::Clock;
use book_library_core::error::AppError;
use book_library_core::event_bus::EventBus;
use book_library_core::event_store::EventStore;
use book_library_core::stream::AggregateId;
use book_library_runtime::retry::{RetryPolicy, append_batch};
use std::sync::Arc;

const ENTITY: &str = "WALLET";

/// Command side of the Wallets context.
pub struct WalletCommandHandler {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl WalletCommandHandler {
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

    /// Open a wallet for a user. Each user has exactly one wallet.
    ///
    /// # Errors
    ///
    /// - `WALLET_INVALID_DATA`: bad inputs
    /// - `WALLET_ALREADY_EXISTS`: the user already has a wallet
    pub async fn create_wallet(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        initial_balance: f64,
    ) -> Result<Wallet, AppError> {
        with_deadline(ctx, "CreateWallet", async {
            let now = self.clock.now();
            let event = Wallet::create(user_id, initial_balance, now)?;

            if self.find_by_user(user_id.trim()).await?.is_some() {
                return Err(AppError::already_exists(
                    ENTITY,
                    format!("user {user_id} already has a wallet"),
                ));
            }

            let id = AggregateId::new(format!("wallet-{}", uuid::Uuid::new_v4()));
            let mut aggregate = AggregateContext::<Wallet>::create(id, &event, now, ctx.metadata())?
                .ok_or_else(|| AppError::internal("creation event rejected by aggregate"))?;
            aggregate.commit(&*self.store, &*self.bus).await?;

            tracing::info!(
                wallet_id = %aggregate.aggregate().aggregate_id(),
                user_id = user_id,
                "Wallet created"
            );
            Ok(aggregate.aggregate().clone())
        })
        .await
    }

    /// Add funds to a user's wallet.
    ///
    /// # Errors
    ///
    /// - `WALLET_NOT_FOUND`: the user has no wallet
    /// - `WALLET_INVALID_DATA`: non-positive amount
    pub async fn top_up(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        amount: f64,
    ) -> Result<Wallet, AppError> {
        with_deadline(
            ctx,
            "TopUpWallet",
            append_batch(&self.retry, move || self.top_up_inner(ctx, user_id, amount)),
        )
        .await
    }

    async fn top_up_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        amount: f64,
    ) -> Result<Wallet, AppError> {
        let mut aggregate = self
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(ENTITY, user_id))?;

        let event = aggregate.aggregate().top_up(amount, self.clock.now())?;
        aggregate.record(&event, self.clock.now(), ctx.metadata())?;
        aggregate.commit(&*self.store, &*self.bus).await?;

        Ok(aggregate.aggregate().clone())
    }

    /// Locate a user's wallet through the natural-key lookup.
    ///
    /// # Errors
    ///
    /// Propagates store lookup and rehydration failures.
    pub async fn find_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<AggregateContext<Wallet>>, AppError> {
        let Some(id) = self
            .store
            .find_aggregate_id("WalletCreated", "userId", user_id)
            .await?
        else {
            return Ok(None);
        };
        Ok(AggregateContext::<Wallet>::load(&*self.store, &id).await?)
    }
}
