//! Deferred values whose continuations always run asynchronously, in
//! attachment order, and whose unobserved failures get reported.
//!
//! A [`Promise`] is settled once through its [`Resolver`]. Continuations are
//! attached with [`Promise::then`], [`Promise::catch`] and friends; each one
//! yields a derived promise. Nothing ever runs inline: every continuation goes
//! through the [`scheduler`] of the current thread, which the caller drives
//! with [`scheduler::run`] or [`scheduler::block_on`].
//!
//! ```
//! use promise_engine::{scheduler, Promise};
//!
//! let (resolver, promise) = Promise::<u32>::pending();
//! let doubled = promise.then(|n| Ok(n * 2));
//! resolver.fulfill(21);
//!
//! scheduler::run();
//! assert_eq!(doubled.value(), Some(42));
//! ```
//!
//! A rejection that no continuation observes within the grace period is
//! handed to the hook installed with [`on_possibly_unhandled_rejection`]:
//!
//! ```
//! use promise_engine::{on_possibly_unhandled_rejection, scheduler, Promise, Reason};
//! use std::{cell::Cell, rc::Rc};
//!
//! let reported = Rc::new(Cell::new(0));
//! let counter = reported.clone();
//! on_possibly_unhandled_rejection(move |_reason, _promise| counter.set(counter.get() + 1));
//!
//! let _lost = Promise::<()>::rejected(Reason::new("nobody listens"));
//! let _seen = Promise::<()>::rejected(Reason::new("handled")).catch(|_| Ok(()));
//!
//! scheduler::run();
//! assert_eq!(reported.get(), 1);
//! ```
//!
//! All engine state is per thread: each thread is its own scheduling domain.

pub mod config;
mod dispatch;
pub mod promise;
pub mod reason;
pub mod scheduler;
pub mod tracker;
mod wait;

pub use config::{configure, Clock, Config, Mode};
pub use promise::{Promise, PromiseId, PromiseRef, Resolution, Resolver, State};
pub use reason::Reason;
pub use tracker::{clear_possibly_unhandled_rejection, on_possibly_unhandled_rejection};
pub use wait::Wait;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("the scheduling domain is already configured")]
    AlreadyConfigured,
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },
    #[error("resolution cycle: {0} follows itself")]
    ResolutionCycle(PromiseId),
    #[error("scheduler slot already holds a pending callback")]
    SlotOccupied,
    #[error("no scheduled work can complete the future")]
    Stalled,
}
