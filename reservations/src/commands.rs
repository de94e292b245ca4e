//! Reservation command handlers.
//!
//! Besides the externally-facing commands (create, return, extend,
//! request cancellation, delete), this handler exposes the
//! saga-facing mutations: lifecycle updates, payment settlement, and
//! late-fee bookkeeping. All of them follow the load → invoke → append
//! → publish shape, with conflict-only retries re-deriving the whole
//! operation each attempt.

use crate::aggregate::Reservation;
use crate::events::ReservationStatus;
use book_library_core::aggregate::{AggregateContext, AggregateRoot};
use book_library_core::context::{RequestContext, with_deadline};
use book_library_core::environment::Clock;
use book_library_core::error::AppError;
use book_library_core::event::EventMetadata;
use book_library_core::event_bus::EventBus;
use book_library_core::event_store::EventStore;
use book_library_core::messages::{ReservationCancellationRequested, SagaMessage};
use book_library_core::stream::AggregateId;
use book_library_runtime::retry::{RetryPolicy, append_batch};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const ENTITY: &str = "RESERVATION";

/// Reserve a book for a user.
#[derive(Clone, Debug)]
pub struct CreateReservation {
    /// The reserving user.
    pub user_id: String,
    /// The reserved book (canonical internal id).
    pub book_id: String,
    /// When the book is due back.
    pub due_date: DateTime<Utc>,
    /// Reservation fee.
    pub fee_charged: f64,
    /// Retail price snapshot, when known at creation.
    pub retail_price: Option<f64>,
}

/// Command side of the Reservations context.
pub struct ReservationCommandHandler {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ReservationCommandHandler {
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

    /// Create a reservation. Publishing `ReservationCreated` starts the
    /// reservation–payment saga.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_DATA` on bad inputs.
    pub async fn create_reservation(
        &self,
        ctx: &RequestContext,
        command: CreateReservation,
    ) -> Result<Reservation, AppError> {
        with_deadline(ctx, "CreateReservation", async {
            let now = self.clock.now();
            let event = Reservation::create(
                &command.user_id,
                &command.book_id,
                command.due_date,
                command.fee_charged,
                command.retail_price,
                now,
            )?;

            let id = AggregateId::new(format!("reservation-{}", uuid::Uuid::new_v4()));
            let mut aggregate =
                AggregateContext::<Reservation>::create(id, &event, now, ctx.metadata())?
                    .ok_or_else(|| AppError::internal("creation event rejected by aggregate"))?;
            aggregate.commit(&*self.store, &*self.bus).await?;

            tracing::info!(
                reservation_id = %aggregate.aggregate().aggregate_id(),
                user_id = %command.user_id,
                book_id = %command.book_id,
                "Reservation created"
            );
            Ok(aggregate.aggregate().clone())
        })
        .await
    }

    /// Return a reserved book.
    ///
    /// # Errors
    ///
    /// - `RESERVATION_NOT_FOUND`: unknown or deleted reservation
    /// - `RESERVATION_INVALID_TRANSITION`: not `active` or `late`
    pub async fn return_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
    ) -> Result<Reservation, AppError> {
        with_deadline(
            ctx,
            "ReturnReservation",
            append_batch(&self.retry, move || self.return_inner(ctx, reservation_id)),
        )
        .await
    }

    async fn return_inner(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
    ) -> Result<Reservation, AppError> {
        let mut aggregate = self.load_live(reservation_id).await?;
        let event = aggregate.aggregate().mark_as_returned(self.clock.now())?;
        aggregate.record(&event, self.clock.now(), ctx.metadata())?;
        aggregate.commit(&*self.store, &*self.bus).await?;
        Ok(aggregate.aggregate().clone())
    }

    /// Push the due date out.
    ///
    /// # Errors
    ///
    /// - `RESERVATION_INVALID_TRANSITION`: terminal status
    /// - `RESERVATION_INVALID_DATA`: date not after the current one
    pub async fn extend_due_date(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
        new_due_date: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        with_deadline(
            ctx,
            "ExtendReservationDueDate",
            append_batch(&self.retry, move || {
                self.extend_inner(ctx, reservation_id, new_due_date)
            }),
        )
        .await
    }

    async fn extend_inner(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
        new_due_date: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        let mut aggregate = self.load_live(reservation_id).await?;
        let event = aggregate
            .aggregate()
            .extend_due_date(new_due_date, self.clock.now())?;
        aggregate.record(&event, self.clock.now(), ctx.metadata())?;
        aggregate.commit(&*self.store, &*self.bus).await?;
        Ok(aggregate.aggregate().clone())
    }

    /// Ask the saga to cancel a reservation still in flight.
    ///
    /// The cancellation itself happens asynchronously: the saga moves to
    /// its compensation path and updates the reservation.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_NOT_FOUND` for an unknown reservation.
    pub async fn request_cancellation(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
        reason: Option<String>,
    ) -> Result<(), AppError> {
        with_deadline(ctx, "RequestReservationCancellation", async {
            // Existence check only; the saga owns the state change.
            self.load_live(reservation_id).await?;

            let message = SagaMessage::Cancellation(ReservationCancellationRequested {
                reservation_id: reservation_id.to_string(),
                reason,
            });
            let event = message.to_domain_event(self.clock.now(), ctx.metadata())?;
            self.bus.publish(event).await.map_err(|e| {
                AppError::internal(format!("failed to publish cancellation request: {e}"))
            })?;
            Ok(())
        })
        .await
    }

    /// Soft-delete a reservation.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_NOT_FOUND` for unknown or already-deleted
    /// reservations.
    pub async fn delete_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
    ) -> Result<(), AppError> {
        with_deadline(
            ctx,
            "DeleteReservation",
            append_batch(&self.retry, move || self.delete_inner(ctx, reservation_id)),
        )
        .await
    }

    async fn delete_inner(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
    ) -> Result<(), AppError> {
        let mut aggregate = self.load_live(reservation_id).await?;
        let event = aggregate.aggregate().delete(self.clock.now())?;
        aggregate.record(&event, self.clock.now(), ctx.metadata())?;
        aggregate.commit(&*self.store, &*self.bus).await?;
        Ok(())
    }

    /// Saga-facing lifecycle transition. Duplicate inputs are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_TRANSITION` for a disallowed move.
    pub async fn update_status(
        &self,
        metadata: EventMetadata,
        reservation_id: &str,
        status: ReservationStatus,
        reason: Option<String>,
        retail_price: Option<f64>,
    ) -> Result<(), AppError> {
        let metadata = &metadata;
        let reason = &reason;
        append_batch(&self.retry, move || {
            self.status_inner(metadata, reservation_id, status, reason, retail_price)
        })
        .await
    }

    async fn status_inner(
        &self,
        metadata: &EventMetadata,
        reservation_id: &str,
        status: ReservationStatus,
        reason: &Option<String>,
        retail_price: Option<f64>,
    ) -> Result<(), AppError> {
        let mut aggregate = self.load_live(reservation_id).await?;
        let Some(event) = aggregate.aggregate().update_status(
            status,
            reason.clone(),
            retail_price,
            self.clock.now(),
        )?
        else {
            return Ok(());
        };
        aggregate.record(&event, self.clock.now(), metadata.clone())?;
        aggregate.commit(&*self.store, &*self.bus).await?;
        Ok(())
    }

    /// Saga-facing payment settlement: records the fee as paid and
    /// activates the reservation in one commit. A reservation whose fee
    /// is already settled is left untouched.
    ///
    /// # Errors
    ///
    /// Propagates load and append failures.
    pub async fn settle_payment(
        &self,
        metadata: EventMetadata,
        reservation_id: &str,
        amount: f64,
    ) -> Result<(), AppError> {
        let metadata = &metadata;
        append_batch(&self.retry, move || {
            self.settle_inner(metadata, reservation_id, amount)
        })
        .await
    }

    async fn settle_inner(
        &self,
        metadata: &EventMetadata,
        reservation_id: &str,
        amount: f64,
    ) -> Result<(), AppError> {
        let mut aggregate = self.load_live(reservation_id).await?;
        if aggregate.aggregate().payment.is_some() {
            return Ok(());
        }

        let paid = aggregate.aggregate().pay_fee(amount, self.clock.now())?;
        aggregate.record(&paid, self.clock.now(), metadata.clone())?;
        if let Some(activated) = aggregate.aggregate().update_status(
            ReservationStatus::Active,
            None,
            None,
            self.clock.now(),
        )? {
            aggregate.record(&activated, self.clock.now(), metadata.clone())?;
        }
        aggregate.commit(&*self.store, &*self.bus).await?;
        Ok(())
    }

    /// Wallet-facing late-fee bookkeeping: records the charge and, when
    /// the fee bought the book, moves the reservation to `bought`.
    /// A late fee already on file is left untouched.
    ///
    /// # Errors
    ///
    /// Propagates load and append failures.
    pub async fn record_late_fee(
        &self,
        metadata: EventMetadata,
        reservation_id: &str,
        amount: f64,
        book_purchased: bool,
    ) -> Result<(), AppError> {
        let metadata = &metadata;
        append_batch(&self.retry, move || {
            self.late_fee_inner(metadata, reservation_id, amount, book_purchased)
        })
        .await
    }

    async fn late_fee_inner(
        &self,
        metadata: &EventMetadata,
        reservation_id: &str,
        amount: f64,
        book_purchased: bool,
    ) -> Result<(), AppError> {
        let mut aggregate = self.load_live(reservation_id).await?;
        if aggregate.aggregate().late_fee.is_some() {
            return Ok(());
        }

        if amount > 0.0 {
            let charged = aggregate.aggregate().charge_fee(amount, self.clock.now())?;
            aggregate.record(&charged, self.clock.now(), metadata.clone())?;
        }
        if book_purchased {
            if let Some(bought) = aggregate.aggregate().update_status(
                ReservationStatus::Bought,
                Some("late_fees_reached_retail_price".to_string()),
                None,
                self.clock.now(),
            )? {
                aggregate.record(&bought, self.clock.now(), metadata.clone())?;
            }
        }
        aggregate.commit(&*self.store, &*self.bus).await?;
        Ok(())
    }

    /// Load a reservation context by id.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_NOT_FOUND` for unknown or deleted
    /// reservations.
    pub async fn load_live(
        &self,
        reservation_id: &str,
    ) -> Result<AggregateContext<Reservation>, AppError> {
        let id = AggregateId::new(reservation_id);
        let aggregate = AggregateContext::<Reservation>::load(&*self.store, &id)
            .await?
            .ok_or_else(|| AppError::not_found(ENTITY, reservation_id))?;
        if aggregate.aggregate().is_deleted() {
            return Err(AppError::not_found(ENTITY, reservation_id));
        }
        Ok(aggregate)
    }
}
