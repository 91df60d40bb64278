//! Awaiting a promise from async code.
//!
//! Awaiting attaches a continuation, so an awaited rejection counts as
//! handled: the awaiting code gets it back as `Err`. A `Wait` dropped before
//! it yields its outcome (a lost select, a timeout) hands the obligation back
//! to a fresh derived promise, so a rejection nobody saw is still reported.

use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::thread;

use crate::promise::Promise;
use crate::reason::Reason;

/// Future returned by `Promise::into_future`.
///
/// ```
/// use promise_engine::{scheduler, Promise};
///
/// let (resolver, promise) = Promise::<u8>::pending();
/// scheduler::schedule(move || resolver.fulfill(3));
/// let value = scheduler::block_on(async move { promise.await }).unwrap();
/// assert_eq!(value.unwrap(), 3);
/// ```
#[derive(Debug)]
pub struct Wait<T: Clone + 'static> {
    promise: Promise<T>,
    shared: Option<Rc<RefCell<Shared<T>>>>,
    done: bool,
}

#[derive(Debug)]
struct Shared<T> {
    outcome: Option<Result<T, Reason>>,
    waker: Option<Waker>,
}

impl<T> Shared<T> {
    fn complete(shared: &RefCell<Self>, outcome: Result<T, Reason>) {
        let waker = {
            let mut shared = shared.borrow_mut();
            shared.outcome = Some(outcome);
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake()
        }
    }
}

impl<T: Clone + 'static> Future for Wait<T> {
    type Output = Result<T, Reason>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let shared = match &this.shared {
            Some(shared) => shared.clone(),
            None => {
                let shared = Rc::new(RefCell::new(Shared {
                    outcome: None,
                    waker: None,
                }));
                let on_value = shared.clone();
                let on_reason = shared.clone();
                this.promise.observe(
                    move |value| Shared::complete(&on_value, Ok(value)),
                    move |reason| Shared::complete(&on_reason, Err(reason)),
                );
                this.shared = Some(shared.clone());
                shared
            }
        };
        let mut state = shared.borrow_mut();
        match state.outcome.take() {
            Some(outcome) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: Clone + 'static> Drop for Wait<T> {
    fn drop(&mut self) {
        let Some(shared) = &self.shared else {
            return;
        };
        if self.done || thread::panicking() {
            return;
        }
        if matches!(shared.borrow().outcome, Some(Ok(_))) {
            return;
        }
        let _abandoned = self.promise.derive();
    }
}

impl<T: Clone + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Reason>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        Wait {
            promise: self,
            shared: None,
            done: false,
        }
    }
}
