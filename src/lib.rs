//! Chainable deferred values.
//!
//! A [`Promise`] is a placeholder for a result that becomes available later,
//! exactly once, either as a success value or a failure reason. Producer
//! code settles it through a [`Producer`] handle; consumer code chains
//! continuations with [`Promise::then`] and friends, before or after
//! settlement. Continuations never run on the stack that registered them or
//! on the stack that settled the value: they go through the [`scheduler`]
//! and fire on a later turn, in registration order. A continuation that
//! returns another promise (or any [`Thenable`]) is flattened into that
//! value's eventual outcome.
//!
//! # Examples
//!
//! ```
//! use deferred_promise::{scheduler, Promise, Step};
//!
//! let doubled = Promise::<i32, String>::new(|producer| {
//!     producer.resolve(5);
//!     Ok(())
//! })
//! .then(|value| Ok(Step::Value(value * 2)));
//!
//! scheduler::run_until_idle().unwrap();
//! assert_eq!(doubled.try_outcome(), Some(Ok(10)));
//! ```

use thiserror::Error;

pub mod promise;
pub mod scheduler;

pub use promise::{Completion, Producer, Promise, Step, Thenable};

/// Scheduler-level failures. Settlement itself has no error channel: every
/// failure inside a setup routine or continuation becomes the rejection of
/// exactly one promise, and a rejection nothing ever handles is stored
/// silently.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The job queue on this thread is already being drained.
    #[error("scheduler queue is already being drained on this thread")]
    SchedulerBusy,
}
