//! The Wallet aggregate.
//!
//! One wallet per user. Balances are money amounts kept to one decimal
//! by [`round1`] wherever fees are computed; a late fee may drive the
//! balance negative (the fee is a debt), but a reservation payment is
//! declined rather than overdrawing.

use crate::events::{
    WalletBalanceUpdated, WalletCreated, WalletEvent, WalletLateFeeApplied, WalletPaymentDeclined,
    WalletPaymentSuccess,
};
use book_library_core::aggregate::AggregateRoot;
use book_library_core::error::AppError;
use book_library_core::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};

const ENTITY: &str = "WALLET";

/// Round a money amount to one decimal place.
#[must_use]
pub fn round1(amount: f64) -> f64 {
    (amount * 10.0).round() / 10.0
}

/// A user's wallet, rebuilt from its event stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Wallet {
    id: AggregateId,
    version: Version,
    /// The owning user.
    pub user_id: String,
    /// Current balance.
    pub balance: f64,
    /// Books purchased through late fees.
    pub books_purchased: u32,
    /// Reservations whose fee was settled, with the settled amount.
    /// Makes redelivered payment requests idempotent.
    settled: std::collections::HashMap<String, f64>,
    /// Reservations whose late fee was already charged.
    late_fees_charged: std::collections::HashSet<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last change instant.
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Validate and build the creation event for a user's wallet.
    ///
    /// # Errors
    ///
    /// Returns `WALLET_INVALID_DATA` on an empty user id or negative
    /// opening balance.
    pub fn create(
        user_id: &str,
        balance: f64,
        now: DateTime<Utc>,
    ) -> Result<WalletEvent, AppError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::invalid_data(ENTITY, "userId cannot be empty"));
        }
        if !balance.is_finite() || balance < 0.0 {
            return Err(AppError::invalid_data(ENTITY, "balance must be >= 0"));
        }
        Ok(WalletEvent::Created(WalletCreated {
            user_id: user_id.to_string(),
            balance: round1(balance),
            created_at: now,
        }))
    }

    /// Build a top-up event.
    ///
    /// # Errors
    ///
    /// Returns `WALLET_INVALID_DATA` for a non-positive amount.
    pub fn top_up(&self, amount: f64, now: DateTime<Utc>) -> Result<WalletEvent, AppError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::invalid_data(ENTITY, "amount must be > 0"));
        }
        let delta = round1(amount);
        Ok(WalletEvent::BalanceUpdated(WalletBalanceUpdated {
            delta,
            balance: round1(self.balance + delta),
            updated_at: now,
        }))
    }

    /// Settle a reservation fee: success when covered, declined when not.
    ///
    /// Both outcomes are events; a declined payment never changes the
    /// balance.
    ///
    /// # Errors
    ///
    /// Returns `WALLET_INVALID_DATA` for a negative amount.
    pub fn request_payment(
        &self,
        reservation_id: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<WalletEvent, AppError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(AppError::invalid_data(ENTITY, "amount must be >= 0"));
        }
        let amount = round1(amount);
        // A reissued request for an already-settled reservation confirms
        // the original settlement without charging again.
        if let Some(settled_amount) = self.settled.get(reservation_id) {
            return Ok(WalletEvent::PaymentSuccess(WalletPaymentSuccess {
                reservation_id: reservation_id.to_string(),
                amount: *settled_amount,
                balance: self.balance,
                paid_at: now,
            }));
        }
        if self.balance + f64::EPSILON < amount {
            return Ok(WalletEvent::PaymentDeclined(WalletPaymentDeclined {
                reservation_id: reservation_id.to_string(),
                amount,
                reason: "insufficient_funds".to_string(),
                balance: self.balance,
                declined_at: now,
            }));
        }
        Ok(WalletEvent::PaymentSuccess(WalletPaymentSuccess {
            reservation_id: reservation_id.to_string(),
            amount,
            balance: round1(self.balance - amount),
            paid_at: now,
        }))
    }

    /// Charge a late fee of `days_late × fee_per_day` (rounded to one
    /// decimal).
    ///
    /// When the fee reaches the retail price the book counts as
    /// purchased and the charge is capped at the retail price. Returns
    /// `None` when nothing is due (`days_late == 0`).
    ///
    /// # Errors
    ///
    /// Returns `WALLET_INVALID_DATA` for negative inputs.
    pub fn apply_late_fee(
        &self,
        reservation_id: &str,
        days_late: i64,
        retail_price: Option<f64>,
        fee_per_day: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<WalletEvent>, AppError> {
        if days_late < 0 || !fee_per_day.is_finite() || fee_per_day < 0.0 {
            return Err(AppError::invalid_data(ENTITY, "invalid late-fee inputs"));
        }
        if self.late_fees_charged.contains(reservation_id) {
            return Ok(None);
        }

        #[allow(clippy::cast_precision_loss)] // Days late stay tiny
        let fee = round1(days_late as f64 * fee_per_day);
        if fee <= 0.0 {
            return Ok(None);
        }

        let book_purchased =
            retail_price.is_some_and(|retail| fee + f64::EPSILON >= retail);
        let charge = match (book_purchased, retail_price) {
            (true, Some(retail)) => round1(retail),
            _ => fee,
        };

        Ok(Some(WalletEvent::LateFeeApplied(WalletLateFeeApplied {
            reservation_id: reservation_id.to_string(),
            days_late,
            fee: charge,
            balance: round1(self.balance - charge),
            book_purchased,
            books_purchased: self.books_purchased + u32::from(book_purchased),
            applied_at: now,
        })))
    }
}

impl AggregateRoot for Wallet {
    type Event = WalletEvent;

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
        let WalletEvent::Created(created) = event else {
            return None;
        };
        Some(Self {
            id: aggregate_id,
            version: Version::INITIAL,
            user_id: created.user_id.clone(),
            balance: created.balance,
            books_purchased: 0,
            settled: std::collections::HashMap::new(),
            late_fees_charged: std::collections::HashSet::new(),
            created_at: created.created_at,
            updated_at: created.created_at,
        })
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WalletEvent::Created(_) => {}
            WalletEvent::BalanceUpdated(updated) => {
                self.balance = updated.balance;
                self.updated_at = updated.updated_at;
            }
            WalletEvent::LateFeeApplied(applied) => {
                self.balance = applied.balance;
                self.books_purchased = applied.books_purchased;
                self.late_fees_charged
                    .insert(applied.reservation_id.clone());
                self.updated_at = applied.applied_at;
            }
            WalletEvent::PaymentSuccess(paid) => {
                self.balance = paid.balance;
                self.settled.insert(paid.reservation_id.clone(), paid.amount);
                self.updated_at = paid.paid_at;
            }
            WalletEvent::PaymentDeclined(declined) => {
                self.updated_at = declined.declined_at;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic
mod tests {
    use super::*;

    fn wallet_with_balance(balance: f64) -> Wallet {
        let event = Wallet::create("u1", balance, Utc::now()).unwrap();
        Wallet::initialize(AggregateId::new("wallet-1"), &event).unwrap()
    }

    #[test]
    fn round1_keeps_one_decimal() {
        assert!((round1(1.0000001) - 1.0).abs() < f64::EPSILON);
        assert!((round1(0.25) - 0.3).abs() < f64::EPSILON);
        assert!((round1(5.0 * 0.2) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn payment_succeeds_when_covered_and_declines_when_not() {
        let wallet = wallet_with_balance(5.0);

        let event = wallet.request_payment("r1", 3.0, Utc::now()).unwrap();
        let WalletEvent::PaymentSuccess(paid) = event else {
            panic!("expected success");
        };
        assert!((paid.balance - 2.0).abs() < f64::EPSILON);

        let event = wallet.request_payment("r1", 8.0, Utc::now()).unwrap();
        let WalletEvent::PaymentDeclined(declined) = event else {
            panic!("expected decline");
        };
        assert_eq!(declined.reason, "insufficient_funds");
        assert!((declined.balance - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn late_fee_five_days_is_one_unit_and_no_purchase() {
        let wallet = wallet_with_balance(10.0);
        let event = wallet
            .apply_late_fee("r1", 5, Some(20.0), 0.2, Utc::now())
            .unwrap()
            .unwrap();

        let WalletEvent::LateFeeApplied(applied) = event else {
            panic!("expected late fee");
        };
        assert!((applied.fee - 1.0).abs() < f64::EPSILON);
        assert!((applied.balance - 9.0).abs() < f64::EPSILON);
        assert!(!applied.book_purchased);
        assert_eq!(applied.books_purchased, 0);
    }

    #[test]
    fn late_fee_reaching_retail_price_buys_the_book() {
        let wallet = wallet_with_balance(10.0);
        let event = wallet
            .apply_late_fee("r1", 100, Some(20.0), 0.2, Utc::now())
            .unwrap()
            .unwrap();

        let WalletEvent::LateFeeApplied(applied) = event else {
            panic!("expected late fee");
        };
        // 100 × 0.2 = 20.0 = retail price: charge capped, book bought.
        assert!((applied.fee - 20.0).abs() < f64::EPSILON);
        assert!((applied.balance - -10.0).abs() < f64::EPSILON);
        assert!(applied.book_purchased);
        assert_eq!(applied.books_purchased, 1);
    }

    #[test]
    fn zero_days_late_charges_nothing() {
        let wallet = wallet_with_balance(10.0);
        assert!(
            wallet
                .apply_late_fee("r1", 0, Some(20.0), 0.2, Utc::now())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn settled_reservation_is_not_charged_twice() {
        let mut wallet = wallet_with_balance(5.0);
        let event = wallet.request_payment("r1", 3.0, Utc::now()).unwrap();
        wallet.apply(&event);
        assert!((wallet.balance - 2.0).abs() < f64::EPSILON);

        // A reissued request confirms the settlement without charging.
        let event = wallet.request_payment("r1", 3.0, Utc::now()).unwrap();
        let WalletEvent::PaymentSuccess(paid) = event else {
            panic!("expected success");
        };
        assert!((paid.balance - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn late_fee_is_charged_once_per_reservation() {
        let mut wallet = wallet_with_balance(10.0);
        let event = wallet
            .apply_late_fee("r1", 5, Some(20.0), 0.2, Utc::now())
            .unwrap()
            .unwrap();
        wallet.apply(&event);

        assert!(
            wallet
                .apply_late_fee("r1", 5, Some(20.0), 0.2, Utc::now())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn validation_failures_use_the_wallet_code() {
        assert_eq!(
            Wallet::create("", 0.0, Utc::now()).unwrap_err().code,
            "WALLET_INVALID_DATA"
        );
        let wallet = wallet_with_balance(1.0);
        assert_eq!(
            wallet.top_up(0.0, Utc::now()).unwrap_err().code,
            "WALLET_INVALID_DATA"
        );
    }
}
