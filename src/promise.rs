//! Promise state machine.
//!
//! A [`Promise`] is a shared handle to a node that is settled once, either
//! directly through its [`Resolver`] or by following another promise. Every
//! attachment (`then`, `catch`, ...) appends a continuation record and returns
//! the derived promise that record will settle.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::dispatch;
use crate::reason::Reason;
use crate::tracker;
use crate::Error;

/// Process-unique promise identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromiseId(u64);

impl PromiseId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PromiseId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    /// Waiting on another promise whose outcome it will adopt.
    Following,
    Fulfilled,
    Rejected,
}

impl State {
    pub fn is_settled(self) -> bool {
        matches!(self, State::Fulfilled | State::Rejected)
    }
}

/// What a pending promise is resolved with.
pub enum Resolution<T> {
    Value(T),
    /// Adopt the eventual outcome of another promise.
    Follow(Promise<T>),
}

impl<T> From<Promise<T>> for Resolution<T> {
    fn from(promise: Promise<T>) -> Self {
        Resolution::Follow(promise)
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Follow(promise) => f.debug_tuple("Follow").field(promise).finish(),
        }
    }
}

type Outcome<T> = Result<Resolution<T>, Reason>;

struct Continuation<T> {
    on_fulfilled: Box<dyn FnOnce(T)>,
    on_rejected: Box<dyn FnOnce(Reason)>,
}

enum Slot<T> {
    Pending,
    Following(Weak<Node<T>>),
    Fulfilled(T),
    Rejected(Reason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracking {
    /// Not rejected, or rejected while somebody was listening.
    Observed,
    /// Rejected with no continuation; a report is pending.
    Unhandled,
    Reported,
}

struct Inner<T> {
    slot: Slot<T>,
    continuations: Vec<Continuation<T>>,
    tracking: Tracking,
}

impl<T> Inner<T> {
    fn state(&self) -> State {
        match self.slot {
            Slot::Pending => State::Pending,
            Slot::Following(_) => State::Following,
            Slot::Fulfilled(_) => State::Fulfilled,
            Slot::Rejected(_) => State::Rejected,
        }
    }
}

impl<T: Clone> Inner<T> {
    fn outcome(&self) -> Option<Result<T, Reason>> {
        match &self.slot {
            Slot::Fulfilled(value) => Some(Ok(value.clone())),
            Slot::Rejected(reason) => Some(Err(reason.clone())),
            Slot::Pending | Slot::Following(_) => None,
        }
    }
}

struct Node<T> {
    id: PromiseId,
    inner: RefCell<Inner<T>>,
}

/// The view of a promise the failure tracker and the rejection hook get.
pub(crate) trait Tracked {
    fn id(&self) -> PromiseId;
    fn state(&self) -> State;
    /// Hands out the rejection reason once, if the rejection is still
    /// unobserved.
    fn take_unreported(&self) -> Option<Reason>;
}

impl<T> Tracked for Node<T> {
    fn id(&self) -> PromiseId {
        self.id
    }

    fn state(&self) -> State {
        self.inner.borrow().state()
    }

    fn take_unreported(&self) -> Option<Reason> {
        let mut inner = self.inner.borrow_mut();
        if inner.tracking != Tracking::Unhandled {
            return None;
        }
        inner.tracking = Tracking::Reported;
        match &inner.slot {
            Slot::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

/// Type-erased handle to a promise of any value type.
#[derive(Clone)]
pub struct PromiseRef {
    node: Rc<dyn Tracked>,
}

impl PromiseRef {
    pub fn id(&self) -> PromiseId {
        self.node.id()
    }

    pub fn state(&self) -> State {
        self.node.state()
    }

    /// Whether this handle designates `promise`.
    pub fn refers_to<T>(&self, promise: &Promise<T>) -> bool {
        self.id() == promise.id()
    }

    pub(crate) fn take_unreported(&self) -> Option<Reason> {
        self.node.take_unreported()
    }
}

impl fmt::Debug for PromiseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseRef")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// A value or failure that becomes available at most once.
///
/// Cloning yields another handle to the same promise.
pub struct Promise<T> {
    node: Rc<Node<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.node.id)
            .field("state", &self.node.inner.borrow().state())
            .finish()
    }
}

impl<T> Promise<T> {
    pub fn id(&self) -> PromiseId {
        self.node.id
    }

    pub fn state(&self) -> State {
        self.node.inner.borrow().state()
    }

    /// `true` until the promise is fulfilled or rejected, including while it
    /// follows another promise.
    pub fn is_pending(&self) -> bool {
        !self.state().is_settled()
    }

    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    pub fn reason(&self) -> Option<Reason> {
        match &self.node.inner.borrow().slot {
            Slot::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    fn following(&self) -> Option<Promise<T>> {
        match &self.node.inner.borrow().slot {
            Slot::Following(target) => target.upgrade().map(|node| Promise { node }),
            _ => None,
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    fn new_pending() -> Self {
        let promise = Promise {
            node: Rc::new(Node {
                id: PromiseId::next(),
                inner: RefCell::new(Inner {
                    slot: Slot::Pending,
                    continuations: Vec::new(),
                    tracking: Tracking::Observed,
                }),
            }),
        };
        trace!(promise = %promise.id(), "created");
        promise
    }

    /// Creates a pending promise together with the resolver that settles it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_engine::{scheduler, Promise};
    ///
    /// let (resolver, promise) = Promise::<String>::pending();
    /// let greeting = promise.then(|name| Ok(format!("hello {name}")));
    /// resolver.fulfill("🍓".into());
    /// scheduler::run();
    /// assert_eq!(greeting.value().as_deref(), Some("hello 🍓"));
    /// ```
    pub fn pending() -> (Resolver<T>, Promise<T>) {
        let promise = Self::new_pending();
        (
            Resolver {
                promise: promise.clone(),
            },
            promise,
        )
    }

    pub fn fulfilled(value: T) -> Self {
        let promise = Self::new_pending();
        promise.settle(Ok(value));
        promise
    }

    /// An already rejected promise. Unless a continuation is attached before
    /// the grace period ends, the rejection is reported as unhandled.
    pub fn rejected(reason: Reason) -> Self {
        let promise = Self::new_pending();
        promise.settle(Err(reason));
        promise
    }

    pub fn value(&self) -> Option<T> {
        match &self.node.inner.borrow().slot {
            Slot::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Type-erased handle to this promise.
    pub fn to_ref(&self) -> PromiseRef {
        PromiseRef {
            node: self.node.clone(),
        }
    }

    /// Runs `on_fulfilled` with the value; a rejection is relayed untouched.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, Reason> + 'static,
    {
        self.chain(move |value| on_fulfilled(value).map(Resolution::Value), Err)
    }

    /// Like [`Promise::then`], but the derived promise follows the promise
    /// `on_fulfilled` returns.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        self.chain(
            move |value| Ok(Resolution::Follow(on_fulfilled(value))),
            Err,
        )
    }

    /// Runs `on_rejected` with the reason; a value is relayed untouched.
    /// Returning `Err` rejects the derived promise afresh.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> Result<T, Reason> + 'static,
    {
        self.chain(
            |value| Ok(Resolution::Value(value)),
            move |reason| on_rejected(reason).map(Resolution::Value),
        )
    }

    /// Like [`Promise::catch`], but the derived promise follows the promise
    /// `on_rejected` returns.
    pub fn or_else<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> Promise<T> + 'static,
    {
        self.chain(
            |value| Ok(Resolution::Value(value)),
            move |reason| Ok(Resolution::Follow(on_rejected(reason))),
        )
    }

    /// Attaches both a success and a failure callback.
    pub fn then_or<U, F, G>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, Reason> + 'static,
        G: FnOnce(Reason) -> Result<U, Reason> + 'static,
    {
        self.chain(
            move |value| on_fulfilled(value).map(Resolution::Value),
            move |reason| on_rejected(reason).map(Resolution::Value),
        )
    }

    /// A derived promise relaying this one's outcome unchanged.
    pub fn derive(&self) -> Promise<T> {
        self.chain(|value| Ok(Resolution::Value(value)), Err)
    }

    /// Attaches raw callbacks that settle no derived promise.
    pub(crate) fn observe(
        &self,
        on_fulfilled: impl FnOnce(T) + 'static,
        on_rejected: impl FnOnce(Reason) + 'static,
    ) {
        self.attach(Continuation {
            on_fulfilled: Box::new(on_fulfilled),
            on_rejected: Box::new(on_rejected),
        });
    }

    fn chain<U: Clone + 'static>(
        &self,
        on_fulfilled: impl FnOnce(T) -> Outcome<U> + 'static,
        on_rejected: impl FnOnce(Reason) -> Outcome<U> + 'static,
    ) -> Promise<U> {
        let derived = Promise::<U>::new_pending();
        trace!(promise = %self.id(), derived = %derived.id(), "continuation attached");
        let on_value = derived.clone();
        let on_reason = derived.clone();
        self.attach(Continuation {
            on_fulfilled: Box::new(move |value| on_value.complete(on_fulfilled(value))),
            on_rejected: Box::new(move |reason| on_reason.complete(on_rejected(reason))),
        });
        derived
    }

    fn attach(&self, continuation: Continuation<T>) {
        let mut inner = self.node.inner.borrow_mut();
        match inner.outcome() {
            None => inner.continuations.push(continuation),
            Some(Ok(value)) => {
                drop(inner);
                dispatch::invoke(move || (continuation.on_fulfilled)(value));
            }
            Some(Err(reason)) => {
                let retract = inner.tracking == Tracking::Unhandled;
                if retract {
                    inner.tracking = Tracking::Observed;
                }
                drop(inner);
                if retract {
                    tracker::retract(self.id());
                }
                dispatch::invoke(move || (continuation.on_rejected)(reason));
            }
        }
    }

    fn complete(&self, outcome: Outcome<T>) {
        match outcome {
            Ok(resolution) => self.resolve(resolution),
            Err(reason) => self.settle(Err(reason)),
        }
    }

    fn resolve(&self, resolution: Resolution<T>) {
        if self.state() != State::Pending {
            trace!(promise = %self.id(), "ignoring resolution of a resolved promise");
            return;
        }
        match resolution {
            Resolution::Value(value) => self.settle(Ok(value)),
            Resolution::Follow(target) => self.follow(target),
        }
    }

    /// # Panics
    ///
    /// Panics if `target` already follows this promise, directly or through
    /// other promises.
    fn follow(&self, target: Promise<T>) {
        let mut cursor = Some(target.clone());
        while let Some(current) = cursor {
            if current.ptr_eq(self) {
                panic!("{}", Error::ResolutionCycle(self.id()));
            }
            cursor = current.following();
        }
        trace!(promise = %self.id(), target = %target.id(), "following");
        self.node.inner.borrow_mut().slot = Slot::Following(Rc::downgrade(&target.node));
        let on_value = self.clone();
        let on_reason = self.clone();
        target.observe(
            move |value| on_value.settle(Ok(value)),
            move |reason| on_reason.settle(Err(reason)),
        );
    }

    /// Moves a pending or following promise to its final state.
    fn settle(&self, outcome: Result<T, Reason>) {
        let continuations = {
            let mut inner = self.node.inner.borrow_mut();
            if inner.state().is_settled() {
                return;
            }
            let continuations = std::mem::take(&mut inner.continuations);
            match &outcome {
                Ok(value) => inner.slot = Slot::Fulfilled(value.clone()),
                Err(reason) => {
                    inner.slot = Slot::Rejected(reason.clone());
                    if continuations.is_empty() {
                        inner.tracking = Tracking::Unhandled;
                    }
                }
            }
            continuations
        };
        trace!(
            promise = %self.id(),
            fulfilled = outcome.is_ok(),
            continuations = continuations.len(),
            "settled"
        );
        match outcome {
            Ok(value) => {
                for continuation in continuations {
                    let value = value.clone();
                    dispatch::invoke(move || (continuation.on_fulfilled)(value));
                }
            }
            Err(reason) => {
                if continuations.is_empty() {
                    tracker::track(self.to_ref());
                }
                for continuation in continuations {
                    let reason = reason.clone();
                    dispatch::invoke(move || (continuation.on_rejected)(reason));
                }
            }
        }
    }
}

/// The settling side of a promise. Only the first settlement counts; later
/// calls are silently ignored.
pub struct Resolver<T> {
    promise: Promise<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resolver").field(&self.promise).finish()
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn fulfill(&self, value: T) {
        self.promise.resolve(Resolution::Value(value));
    }

    pub fn reject(&self, reason: Reason) {
        if self.promise.state() == State::Pending {
            self.promise.settle(Err(reason));
        }
    }

    /// Fulfils with a value or follows another promise.
    ///
    /// # Panics
    ///
    /// Panics if following `Resolution::Follow` would make the promise
    /// (transitively) follow itself.
    pub fn resolve(&self, resolution: Resolution<T>) {
        self.promise.resolve(resolution);
    }

    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }
}
