//! # Book Library Saga
//!
//! The reservation–payment saga: a persistent state machine
//! coordinating the Books, Reservations, and Wallets contexts across
//! asynchronous steps, with compensations instead of distributed
//! transactions, duplicate-delivery detection, and a timeout watchdog.

pub mod orchestrator;
pub mod watchdog;

pub use orchestrator::{ReservationPaymentSaga, SAGA_INPUT_TYPES};
pub use watchdog::SagaWatchdog;
