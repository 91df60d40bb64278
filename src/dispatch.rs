//! Continuation queue sitting between promises and the scheduler.
//!
//! Jobs are batched: the first job pushed into an empty queue requests a
//! single scheduler callback that drains the whole queue, including jobs
//! pushed while draining. At most one request is ever in flight.

use std::cell::RefCell;
use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::config::Mode;
use crate::scheduler;

type Job = Box<dyn FnOnce()>;

thread_local! {
    static QUEUE: RefCell<Queue> = RefCell::new(Queue::default());
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    scheduled: bool,
}

pub(crate) fn invoke(job: impl FnOnce() + 'static) {
    let request = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        queue.jobs.push_back(Box::new(job));
        !std::mem::replace(&mut queue.scheduled, true)
    });
    if request {
        scheduler::schedule(drain);
    }
}

fn drain() {
    let guard = Draining;
    let mut ran = 0usize;
    loop {
        let job = QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            let job = queue.jobs.pop_front();
            if job.is_none() {
                queue.scheduled = false;
            }
            job
        });
        match job {
            Some(job) => {
                job();
                ran += 1;
            }
            None => break,
        }
    }
    std::mem::forget(guard);
    trace!(jobs = ran, "continuation queue drained");
}

/// Keeps the queue serviceable when a job unwinds out of [`drain`].
struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        let leftover = QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            queue.scheduled = false;
            queue.jobs.len()
        });
        warn!(leftover, "continuation panicked while draining the queue");
        // Rescheduling inline would run the leftovers during the unwind.
        if leftover > 0 && scheduler::mode() != Mode::Synchronous {
            QUEUE.with(|queue| queue.borrow_mut().scheduled = true);
            scheduler::schedule(drain);
        }
    }
}
