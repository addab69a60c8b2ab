//! Error types shared across the crate.

use thiserror::Error;

/// Distinguished outcome of an operation that was cancelled before it could
/// produce a value.
///
/// `Cancelled` is never used for generic failures. Envelopes that honor their
/// [`Cancellation`](crate::Cancellation) typically convert it into their own
/// error type with `?` (via `From<Cancelled>`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Error)]
#[error("operation was cancelled")]
pub struct Cancelled;
