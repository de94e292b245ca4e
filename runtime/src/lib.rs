//! # Book Library Runtime
//!
//! Runtime pieces shared by every bounded context:
//!
//! - [`retry`]: capped exponential backoff with jitter, and the
//!   conflict-only [`retry::append_batch`] wrapper command handlers use
//!   around event store appends
//! - [`bus`]: the in-process event bus — typed pub/sub with
//!   per-aggregate serialized dispatch, delivery retries,
//!   dead-lettering, and derived `*_FAILED` events

pub mod bus;
pub mod retry;

pub use bus::InProcessEventBus;
pub use retry::{RetryPolicy, RetryableConflict, append_batch, retry_with_policy};
