//! # Book Library Wallets
//!
//! The Wallets bounded context: one wallet per user, balance updates,
//! reservation-fee payments for the saga, and late-fee charging with
//! purchase-on-threshold semantics.

pub mod aggregate;
pub mod commands;
pub mod events;
pub mod projection;
pub mod queries;
pub mod responders;

pub use aggregate::{Wallet, round1};
pub use commands::WalletCommandHandler;
pub use events::WalletEvent;
pub use projection::WalletProjectionHandler;
pub use queries::WalletQueryHandler;
pub use responders::{LateFeeHandler, PaymentRequestHandler};
