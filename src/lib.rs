//! Utilities for observing, reordering and adapting asynchronous work that is
//! already in flight.
//!
//! `reflow` provides a handful of small coordination primitives that sit on top
//! of whatever executor the host application uses. None of them run a scheduler
//! or manage threads of their own; anything that must keep running in the
//! background is handed to a [`Spawner`].
//!
//! Features include:
//! - [`order_by_completion`], which turns `N` independent futures into `N`
//!   futures that resolve in real completion order, each still carrying its
//!   source's success, failure or cancellation
//! - [`EnvelopeStream`], which adapts a long running, callback driven
//!   [`Envelope`] into a pull based, cancellable [`Stream`](futures::Stream)
//! - [`ContextFlow`](context::ContextFlow), which snapshots the ambient
//!   scheduling context and returns to it after arbitrary asynchronous work
//! - [`Cancellation`], the cooperative cancellation signal shared by all of the
//!   above
//!
//! Diagnostics are emitted through [`tracing`]; installing a subscriber is left
//! to the application.

pub mod cancellation;
pub mod completion;
pub mod context;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod task_ext;
pub mod timing;

pub use cancellation::Cancellation;
pub use completion::{Completion, InCompletionOrder, in_completion_order, order_by_completion};
pub use context::ContextFlow;
pub use envelope::{Disposal, Emitter, Envelope, EnvelopeStream, from_envelope};
pub use error::Cancelled;
pub use pool::Spawner;
pub use task_ext::CompletionExt;
