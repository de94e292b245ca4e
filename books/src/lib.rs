//! # Book Library Books
//!
//! The Books bounded context: catalogue aggregate and events, command
//! and query handlers, the projection materializing
//! `books_projection`, and the validation responder answering the
//! reservation–payment saga.

pub mod aggregate;
pub mod commands;
pub mod events;
pub mod projection;
pub mod queries;
pub mod validation;

pub use aggregate::{Book, BookPatch};
pub use commands::{BookCommandHandler, CreateBook};
pub use events::BookEvent;
pub use projection::BookProjectionHandler;
pub use queries::{BookListQuery, BookQueryHandler};
pub use validation::BookValidationHandler;
