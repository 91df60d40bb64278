//! Rejection payloads.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Why a promise was rejected.
///
/// Any `Debug` value can be a reason, not only error types. The payload is
/// shared, never copied or wrapped in another error, so the value a rejecting
/// caller passes in is the very value every failure callback and the
/// unhandled-rejection hook receive ([`Reason::ptr_eq`]).
#[derive(Clone)]
pub struct Reason {
    payload: Rc<dyn Any>,
    describe: fn(&dyn Any, &mut fmt::Formatter<'_>) -> fmt::Result,
    is_error: bool,
}

impl Reason {
    /// Wraps an arbitrary value.
    pub fn new<V: Any + fmt::Debug>(value: V) -> Self {
        Self {
            payload: Rc::new(value),
            describe: describe_debug::<V>,
            is_error: false,
        }
    }

    /// Wraps an error type; `Display` then shows the error message.
    pub fn error<E: std::error::Error + 'static>(error: E) -> Self {
        Self {
            payload: Rc::new(error),
            describe: describe_error::<E>,
            is_error: true,
        }
    }

    /// Whether the payload was supplied as a `std::error::Error`.
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn is<V: Any>(&self) -> bool {
        self.payload.is::<V>()
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.payload.downcast_ref::<V>()
    }

    /// `true` when both reasons carry the very same payload.
    pub fn ptr_eq(&self, other: &Reason) -> bool {
        Rc::ptr_eq(&self.payload, &other.payload)
    }
}

fn describe_debug<V: Any + fmt::Debug>(payload: &dyn Any, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match payload.downcast_ref::<V>() {
        Some(value) => fmt::Debug::fmt(value, f),
        None => f.write_str("<opaque>"),
    }
}

fn describe_error<E: std::error::Error + 'static>(
    payload: &dyn Any,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    match payload.downcast_ref::<E>() {
        Some(error) => fmt::Display::fmt(error, f),
        None => f.write_str("<opaque>"),
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reason(")?;
        (self.describe)(&*self.payload, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.describe)(&*self.payload, f)
    }
}

impl<E: std::error::Error + 'static> From<E> for Reason {
    fn from(error: E) -> Self {
        Reason::error(error)
    }
}
