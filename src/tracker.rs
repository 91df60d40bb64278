//! Possibly-unhandled rejection tracking.
//!
//! A promise rejected while nothing is attached to it gets a report timer
//! armed for the configured grace period. Attaching any continuation before
//! the timer fires cancels the report; the rejection then flows into the
//! derived promise, which is tracked in its own right if it has nothing
//! attached either. Reports therefore end up at the leaves of the derivation
//! graph: one per branch that never handled the failure.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::config;
use crate::promise::{PromiseId, PromiseRef};
use crate::reason::Reason;
use crate::scheduler::{self, TimerHandle};

/// Receives the reason and the promise of every rejection still unhandled
/// when its grace period ends.
pub type Hook = Rc<dyn Fn(&Reason, &PromiseRef)>;

thread_local! {
    static TRACKER: RefCell<Tracker> = RefCell::new(Tracker::default());
}

#[derive(Default)]
struct Tracker {
    hook: Option<Hook>,
    pending: HashMap<PromiseId, TimerHandle>,
}

/// Installs the unhandled-rejection hook, discarding the previous one.
pub fn on_possibly_unhandled_rejection<F>(hook: F)
where
    F: Fn(&Reason, &PromiseRef) + 'static,
{
    TRACKER.with(|tracker| tracker.borrow_mut().hook = Some(Rc::new(hook)));
}

/// Removes the hook. Rejections whose grace period ends while no hook is
/// installed are dropped.
pub fn clear_possibly_unhandled_rejection() {
    TRACKER.with(|tracker| tracker.borrow_mut().hook = None);
}

/// Number of rejections currently inside their grace period.
pub fn pending_reports() -> usize {
    TRACKER.with(|tracker| tracker.borrow().pending.len())
}

pub(crate) fn track(promise: PromiseRef) {
    let grace = config::current().grace_period;
    let id = promise.id();
    let ticket = scheduler::schedule_after(grace, move || report(promise));
    debug!(promise = %id, ?grace, "rejection has no handler yet");
    TRACKER.with(|tracker| tracker.borrow_mut().pending.insert(id, ticket));
}

pub(crate) fn retract(id: PromiseId) {
    let ticket = TRACKER.with(|tracker| tracker.borrow_mut().pending.remove(&id));
    if let Some(ticket) = ticket {
        ticket.cancel();
        debug!(promise = %id, "rejection handled within grace period");
    }
}

fn report(promise: PromiseRef) {
    let hook = TRACKER.with(|tracker| {
        let mut tracker = tracker.borrow_mut();
        tracker.pending.remove(&promise.id());
        tracker.hook.clone()
    });
    let Some(reason) = promise.take_unreported() else {
        return;
    };
    match hook {
        Some(hook) => {
            debug!(promise = %promise.id(), %reason, "reporting possibly unhandled rejection");
            hook(&reason, &promise);
        }
        None => debug!(promise = %promise.id(), %reason, "unhandled rejection, no hook installed"),
    }
}
