//! # Book Library Reservations
//!
//! The Reservations bounded context: the loan lifecycle aggregate and
//! events, command and query handlers, the projection materializing
//! `reservations_projection`, and the responder that books wallet
//! late-fee outcomes (including purchase-on-threshold) back onto the
//! reservation.

pub mod aggregate;
pub mod commands;
pub mod events;
pub mod projection;
pub mod purchases;
pub mod queries;

pub use aggregate::Reservation;
pub use commands::{CreateReservation, ReservationCommandHandler};
pub use events::{ReservationEvent, ReservationStatus};
pub use projection::ReservationProjectionHandler;
pub use purchases::PurchaseOnLateFeeHandler;
pub use queries::{ReservationListQuery, ReservationQueryHandler};
