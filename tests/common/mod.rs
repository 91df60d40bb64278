#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use promise_engine::{configure, on_possibly_unhandled_rejection, Clock, Config, Mode, PromiseRef, Reason};
use tracing_subscriber::EnvFilter;

pub const GRACE: Duration = Duration::from_millis(20);

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Configures the test thread with a virtual clock and a short grace period.
pub fn lab() {
    lab_with(Mode::Microtask);
}

pub fn lab_with(mode: Mode) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    configure(Config {
        mode,
        clock: Clock::Virtual,
        grace_period: GRACE,
    })
    .expect("each test runs on a fresh thread");
}

/// Collects everything handed to the unhandled-rejection hook.
#[derive(Clone, Default)]
pub struct Reports(Rc<RefCell<Vec<(Reason, PromiseRef)>>>);

impl Reports {
    pub fn install() -> Self {
        let reports = Reports::default();
        let sink = reports.clone();
        on_possibly_unhandled_rejection(move |reason, promise| {
            sink.0.borrow_mut().push((reason.clone(), promise.clone()));
        });
        reports
    }

    pub fn count(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn reasons(&self) -> Vec<Reason> {
        self.0.borrow().iter().map(|(reason, _)| reason.clone()).collect()
    }

    pub fn promises(&self) -> Vec<PromiseRef> {
        self.0.borrow().iter().map(|(_, promise)| promise.clone()).collect()
    }
}
