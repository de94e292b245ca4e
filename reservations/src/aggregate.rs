//! The Reservation aggregate.

use crate::events::{
    ReservationCreated, ReservationDeleted, ReservationDueDateExtended, ReservationEvent,
    ReservationFeeCharged, ReservationFeePaid, ReservationReturned, ReservationStatus,
    ReservationStatusUpdated,
};
use book_library_core::aggregate::AggregateRoot;
use book_library_core::error::AppError;
use book_library_core::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};

const ENTITY: &str = "RESERVATION";

/// A settled reservation payment.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentInfo {
    /// Amount paid.
    pub amount: f64,
    /// Settlement instant.
    pub paid_at: DateTime<Utc>,
}

/// A book loan, rebuilt from its event stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    id: AggregateId,
    version: Version,
    /// The reserving user.
    pub user_id: String,
    /// The reserved book.
    pub book_id: String,
    /// Lifecycle position.
    pub status: ReservationStatus,
    /// Reservation fee.
    pub fee_charged: f64,
    /// Retail price snapshot, once known.
    pub retail_price: Option<f64>,
    /// Late fee charged on return, if any.
    pub late_fee: Option<f64>,
    /// Reservation instant.
    pub reserved_at: DateTime<Utc>,
    /// When the book is due back.
    pub due_date: DateTime<Utc>,
    /// Return instant, once returned.
    pub returned_at: Option<DateTime<Utc>>,
    /// Fee settlement, once paid.
    pub payment: Option<PaymentInfo>,
    /// Why the current status was entered, when it needs explaining.
    pub status_reason: Option<String>,
    /// Last change instant.
    pub updated_at: DateTime<Utc>,
    /// Tombstone instant, once deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Validate inputs for a new reservation and build its creation
    /// event.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_DATA` on empty ids, a due date not
    /// in the future, or a negative fee.
    pub fn create(
        user_id: &str,
        book_id: &str,
        due_date: DateTime<Utc>,
        fee_charged: f64,
        retail_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<ReservationEvent, AppError> {
        let user_id = user_id.trim();
        let book_id = book_id.trim();
        if user_id.is_empty() || book_id.is_empty() {
            return Err(AppError::invalid_data(
                ENTITY,
                "userId and bookId are required",
            ));
        }
        if due_date <= now {
            return Err(AppError::invalid_data(ENTITY, "dueDate must be in the future"));
        }
        if !fee_charged.is_finite() || fee_charged < 0.0 {
            return Err(AppError::invalid_data(ENTITY, "feeCharged must be >= 0"));
        }

        Ok(ReservationEvent::Created(ReservationCreated {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            reserved_at: now,
            due_date,
            fee_charged,
            retail_price,
        }))
    }

    /// Build the return event. Days late count whole days past the due
    /// date, never negative.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_TRANSITION` unless the reservation
    /// is `active` or `late`.
    pub fn mark_as_returned(&self, now: DateTime<Utc>) -> Result<ReservationEvent, AppError> {
        self.ensure_live()?;
        if !self.status.is_returnable() {
            return Err(AppError::invalid_transition(
                ENTITY,
                format!("cannot return a {} reservation", self.status),
            ));
        }

        let days_late = (now.date_naive() - self.due_date.date_naive())
            .num_days()
            .max(0);

        Ok(ReservationEvent::Returned(ReservationReturned {
            user_id: self.user_id.clone(),
            book_id: self.book_id.clone(),
            returned_at: now,
            days_late,
            retail_price: self.retail_price,
        }))
    }

    /// Build a lifecycle transition event.
    ///
    /// A transition to the current status is a no-op (`Ok(None)`), which
    /// is what makes duplicate saga inputs commutative.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_TRANSITION` for a move the lifecycle
    /// does not allow.
    pub fn update_status(
        &self,
        status: ReservationStatus,
        reason: Option<String>,
        retail_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationEvent>, AppError> {
        self.ensure_live()?;
        if status == self.status {
            return Ok(None);
        }
        if !self.status.can_transition_to(status) {
            return Err(AppError::invalid_transition(
                ENTITY,
                format!("{} -> {status} is not allowed", self.status),
            ));
        }

        Ok(Some(ReservationEvent::StatusUpdated(
            ReservationStatusUpdated {
                status,
                reason,
                updated_at: now,
                retail_price,
            },
        )))
    }

    /// Build a due-date extension event.
    ///
    /// # Errors
    ///
    /// - `RESERVATION_INVALID_TRANSITION`: terminal status
    /// - `RESERVATION_INVALID_DATA`: new date not after the current one
    pub fn extend_due_date(
        &self,
        new_due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReservationEvent, AppError> {
        self.ensure_live()?;
        if !matches!(
            self.status,
            ReservationStatus::Created
                | ReservationStatus::Validated
                | ReservationStatus::Active
                | ReservationStatus::Late
        ) {
            return Err(AppError::invalid_transition(
                ENTITY,
                format!("cannot extend a {} reservation", self.status),
            ));
        }
        if new_due_date <= self.due_date {
            return Err(AppError::invalid_data(
                ENTITY,
                "new due date must be after the current one",
            ));
        }

        Ok(ReservationEvent::DueDateExtended(
            ReservationDueDateExtended {
                due_date: new_due_date,
                extended_at: now,
            },
        ))
    }

    /// Build a fee-charge event (late fee bookkeeping).
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_DATA` for a non-positive amount.
    pub fn charge_fee(&self, amount: f64, now: DateTime<Utc>) -> Result<ReservationEvent, AppError> {
        self.ensure_live()?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::invalid_data(ENTITY, "amount must be > 0"));
        }
        Ok(ReservationEvent::FeeCharged(ReservationFeeCharged {
            amount,
            charged_at: now,
        }))
    }

    /// Build a fee-settlement event.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_INVALID_DATA` for a negative amount.
    pub fn pay_fee(&self, amount: f64, now: DateTime<Utc>) -> Result<ReservationEvent, AppError> {
        self.ensure_live()?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(AppError::invalid_data(ENTITY, "amount must be >= 0"));
        }
        Ok(ReservationEvent::FeePaid(ReservationFeePaid {
            amount,
            paid_at: now,
        }))
    }

    /// Build the soft-delete event.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_NOT_FOUND` when already deleted.
    pub fn delete(&self, now: DateTime<Utc>) -> Result<ReservationEvent, AppError> {
        self.ensure_live()?;
        Ok(ReservationEvent::Deleted(ReservationDeleted {
            deleted_at: now,
        }))
    }

    /// Whether the reservation is tombstoned.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn ensure_live(&self) -> Result<(), AppError> {
        if self.is_deleted() {
            return Err(AppError::not_found(ENTITY, self.id.as_str()));
        }
        Ok(())
    }
}

impl AggregateRoot for Reservation {
    type Event = ReservationEvent;

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
        let ReservationEvent::Created(created) = event else {
            return None;
        };
        Some(Self {
            id: aggregate_id,
            version: Version::INITIAL,
            user_id: created.user_id.clone(),
            book_id: created.book_id.clone(),
            status: ReservationStatus::Created,
            fee_charged: created.fee_charged,
            retail_price: created.retail_price,
            late_fee: None,
            reserved_at: created.reserved_at,
            due_date: created.due_date,
            returned_at: None,
            payment: None,
            status_reason: None,
            updated_at: created.reserved_at,
            deleted_at: None,
        })
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ReservationEvent::Created(_) => {}
            ReservationEvent::StatusUpdated(updated) => {
                self.status = updated.status;
                self.status_reason = updated.reason.clone();
                if updated.retail_price.is_some() {
                    self.retail_price = updated.retail_price;
                }
                self.updated_at = updated.updated_at;
            }
            ReservationEvent::Returned(returned) => {
                self.status = ReservationStatus::Returned;
                self.returned_at = Some(returned.returned_at);
                self.updated_at = returned.returned_at;
            }
            ReservationEvent::FeeCharged(charged) => {
                self.late_fee = Some(charged.amount);
                self.updated_at = charged.charged_at;
            }
            ReservationEvent::FeePaid(paid) => {
                self.payment = Some(PaymentInfo {
                    amount: paid.amount,
                    paid_at: paid.paid_at,
                });
                self.updated_at = paid.paid_at;
            }
            ReservationEvent::DueDateExtended(extended) => {
                self.due_date = extended.due_date;
                self.updated_at = extended.extended_at;
            }
            ReservationEvent::Deleted(deleted) => {
                self.deleted_at = Some(deleted.deleted_at);
                self.updated_at = deleted.deleted_at;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic
mod tests {
    use super::*;
    use chrono::Duration;

    fn reservation_with_status(status: ReservationStatus) -> Reservation {
        let now = Utc::now();
        let event =
            Reservation::create("u1", "b1", now + Duration::days(14), 3.0, Some(20.0), now)
                .unwrap();
        let mut reservation = Reservation::initialize(AggregateId::new("r1"), &event).unwrap();
        if status != ReservationStatus::Created {
            reservation.status = status;
        }
        reservation
    }

    #[test]
    fn create_requires_future_due_date() {
        let now = Utc::now();
        let err = Reservation::create("u1", "b1", now - Duration::days(1), 3.0, None, now)
            .unwrap_err();
        assert_eq!(err.code, "RESERVATION_INVALID_DATA");
    }

    #[test]
    fn return_transitions_from_active_and_late_only() {
        let now = Utc::now();
        for status in [ReservationStatus::Active, ReservationStatus::Late] {
            let reservation = reservation_with_status(status);
            let event = reservation.mark_as_returned(now).unwrap();
            assert!(matches!(event, ReservationEvent::Returned(_)));
        }

        for status in [
            ReservationStatus::Created,
            ReservationStatus::Returned,
            ReservationStatus::Cancelled,
        ] {
            let reservation = reservation_with_status(status);
            let err = reservation.mark_as_returned(now).unwrap_err();
            assert_eq!(err.code, "RESERVATION_INVALID_TRANSITION");
        }
    }

    #[test]
    fn days_late_counts_whole_days_and_never_negative() {
        let now = Utc::now();
        let mut reservation = reservation_with_status(ReservationStatus::Active);

        reservation.due_date = now - Duration::days(5);
        let ReservationEvent::Returned(returned) = reservation.mark_as_returned(now).unwrap()
        else {
            panic!("expected return event");
        };
        assert_eq!(returned.days_late, 5);

        reservation.due_date = now + Duration::days(3);
        let ReservationEvent::Returned(returned) = reservation.mark_as_returned(now).unwrap()
        else {
            panic!("expected return event");
        };
        assert_eq!(returned.days_late, 0);
    }

    #[test]
    fn duplicate_status_input_is_a_noop() {
        let reservation = reservation_with_status(ReservationStatus::Active);
        let result = reservation
            .update_status(ReservationStatus::Active, None, None, Utc::now())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let reservation = reservation_with_status(ReservationStatus::Cancelled);
        let err = reservation
            .update_status(ReservationStatus::Active, None, None, Utc::now())
            .unwrap_err();
        assert_eq!(err.code, "RESERVATION_INVALID_TRANSITION");
    }

    #[test]
    fn extension_must_move_the_date_forward() {
        let reservation = reservation_with_status(ReservationStatus::Active);
        let err = reservation
            .extend_due_date(reservation.due_date - Duration::days(1), Utc::now())
            .unwrap_err();
        assert_eq!(err.code, "RESERVATION_INVALID_DATA");

        let event = reservation
            .extend_due_date(reservation.due_date + Duration::days(7), Utc::now())
            .unwrap();
        assert!(matches!(event, ReservationEvent::DueDateExtended(_)));

        let terminal = reservation_with_status(ReservationStatus::Bought);
        let err = terminal
            .extend_due_date(terminal.due_date + Duration::days(7), Utc::now())
            .unwrap_err();
        assert_eq!(err.code, "RESERVATION_INVALID_TRANSITION");
    }
}
