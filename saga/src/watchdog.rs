//! Saga timeout watchdog.
//!
//! Sagas parked in a waiting step can starve when a request or its
//! answer is lost. The watchdog periodically scans for rows whose
//! `updated_at` is older than the step timeout, reissues the step's
//! request up to the retry cap, and compensates once the cap is spent.
//! Reissues are safe because the downstream responders are idempotent
//! per reservation.

use book_library_core::config::Config;
use book_library_core::environment::Clock;
use book_library_core::event::EventMetadata;
use book_library_core::event_bus::EventBus;
use book_library_core::messages::{
    ReservationBookValidation, SagaMessage, WalletPaymentRequest,
};
use book_library_core::saga::{SagaState, SagaStateStore, SagaStatus, SagaStep};
use book_library_reservations::commands::ReservationCommandHandler;
use book_library_reservations::events::ReservationStatus;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::watch;

/// Periodic scanner driving stuck sagas forward or into compensation.
pub struct SagaWatchdog {
    sagas: Arc<dyn SagaStateStore>,
    bus: Arc<dyn EventBus>,
    reservations: Arc<ReservationCommandHandler>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl SagaWatchdog {
    /// Wire the watchdog to its collaborators.
    #[must_use]
    pub fn new(
        sagas: Arc<dyn SagaStateStore>,
        bus: Arc<dyn EventBus>,
        reservations: Arc<ReservationCommandHandler>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            sagas,
            bus,
            reservations,
            clock,
            config,
        }
    }

    /// Run the scan loop until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.saga_step_timeout.div_f64(2.0).max(
            std::time::Duration::from_millis(50),
        );
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(?interval, "Saga watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Saga watchdog stopped");
                        break;
                    }
                }
            }
        }
    }

    /// One scan: reissue or compensate every stale waiting saga.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let Ok(timeout) = ChronoDuration::from_std(self.config.saga_step_timeout) else {
            return;
        };
        let stale = match self.sagas.find_stale(now - timeout).await {
            Ok(stale) => stale,
            Err(err) => {
                tracing::error!(error = %err, "Saga watchdog scan failed");
                return;
            }
        };

        for state in stale {
            if state.retry_count < self.config.saga_max_retries {
                self.reissue(state).await;
            } else {
                self.give_up(state).await;
            }
        }
    }

    async fn reissue(&self, mut state: SagaState) {
        let message = match state.step {
            SagaStep::AwaitingBookValidation => {
                SagaMessage::BookValidation(ReservationBookValidation {
                    reservation_id: state.reservation_id.clone(),
                    book_id: state.book_id.clone(),
                })
            }
            SagaStep::AwaitingPayment => SagaMessage::PaymentRequest(WalletPaymentRequest {
                reservation_id: state.reservation_id.clone(),
                user_id: state.user_id.clone(),
                fee_charged: state.fee_charged.unwrap_or(0.0),
            }),
            _ => return,
        };

        state.retry_count += 1;
        state.updated_at = self.clock.now();
        tracing::warn!(
            reservation_id = %state.reservation_id,
            step = %state.step,
            retry = state.retry_count,
            "Saga step timed out, reissuing request"
        );

        if let Err(err) = self.sagas.upsert(state.clone()).await {
            tracing::error!(error = %err, "Failed to persist saga retry");
            return;
        }

        let metadata = EventMetadata {
            correlation_id: Some(format!("saga-retry-{}", state.reservation_id)),
            causation_id: None,
            user_id: Some(state.user_id.clone()),
            stored_at: None,
        };
        match message.to_domain_event(self.clock.now(), metadata) {
            Ok(event) => {
                if let Err(err) = self.bus.publish(event).await {
                    tracing::error!(error = %err, "Failed to reissue saga request");
                }
            }
            Err(err) => tracing::error!(error = %err, "Failed to build saga request"),
        }
    }

    async fn give_up(&self, mut state: SagaState) {
        tracing::error!(
            reservation_id = %state.reservation_id,
            step = %state.step,
            retries = state.retry_count,
            "Saga exhausted step retries, compensating"
        );

        state.step = SagaStep::Compensating;
        state.last_error = Some("saga_step_timeout".to_string());
        state.updated_at = self.clock.now();
        if let Err(err) = self.sagas.upsert(state.clone()).await {
            tracing::error!(error = %err, "Failed to persist saga compensation");
            return;
        }

        let metadata = EventMetadata {
            correlation_id: Some(format!("saga-timeout-{}", state.reservation_id)),
            causation_id: None,
            user_id: Some(state.user_id.clone()),
            stored_at: None,
        };
        let cancel = self
            .reservations
            .update_status(
                metadata,
                &state.reservation_id,
                ReservationStatus::Cancelled,
                Some("saga_step_timeout".to_string()),
                None,
            )
            .await;
        match cancel {
            Ok(()) => state.compensations.push("reservation_cancelled".to_string()),
            Err(err) => {
                tracing::error!(
                    reservation_id = %state.reservation_id,
                    error = %err,
                    "Compensation after timeout could not cancel the reservation"
                );
                state
                    .compensations
                    .push("reservation_cancel_skipped".to_string());
            }
        }

        state.step = SagaStep::Failed;
        state.status = SagaStatus::Failed;
        state.updated_at = self.clock.now();
        if let Err(err) = self.sagas.upsert(state).await {
            tracing::error!(error = %err, "Failed to persist saga failure");
        }
    }
}
