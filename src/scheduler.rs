//! The deferral primitive every continuation goes through.
//!
//! [`schedule`] never runs its callback before the caller's stack unwinds
//! (except in the degraded [`Mode::Synchronous`]). Rust has no ambient event
//! loop, so each thread owns a scheduler instance holding a ready queue, a
//! single-callback slot and a timer heap, and the application drives it with
//! [`run`], [`run_until_stalled`], [`advance`] or [`block_on`].

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::{self, Clock, Mode};
use crate::Error;

type Callback = Box<dyn FnOnce()>;

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Handle to a callback registered with [`schedule_after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Prevents the timer from firing. Returns `false` if it already fired or
    /// was cancelled before.
    pub fn cancel(self) -> bool {
        with(|scheduler| scheduler.timer_callbacks.remove(&self.0).is_some())
    }
}

struct Scheduler {
    mode: Mode,
    clock: Clock,
    epoch: Instant,
    virtual_now: Duration,
    ready: VecDeque<Callback>,
    slot: Option<Callback>,
    timers: BinaryHeap<Reverse<(Duration, u64)>>,
    timer_callbacks: HashMap<u64, Callback>,
    next_timer: u64,
}

enum Step {
    Ran(Callback),
    Sleep(Duration, Callback),
    Idle,
}

impl Scheduler {
    fn new() -> Self {
        let config = config::current();
        trace!(mode = ?config.mode, clock = ?config.clock, "scheduler initialised");
        Self {
            mode: config.mode,
            clock: config.clock,
            epoch: Instant::now(),
            virtual_now: Duration::ZERO,
            ready: VecDeque::new(),
            slot: None,
            timers: BinaryHeap::new(),
            timer_callbacks: HashMap::new(),
            next_timer: 0,
        }
    }

    fn now(&self) -> Duration {
        match self.clock {
            Clock::System => self.epoch.elapsed(),
            Clock::Virtual => self.virtual_now,
        }
    }

    fn add_timer(&mut self, delay: Duration, callback: Callback) -> TimerHandle {
        let id = self.next_timer;
        self.next_timer += 1;
        let deadline = self.now() + delay;
        self.timers.push(Reverse((deadline, id)));
        self.timer_callbacks.insert(id, callback);
        trace!(timer = id, ?deadline, "timer registered");
        TimerHandle(id)
    }

    fn next_ready(&mut self) -> Option<Callback> {
        self.slot.take().or_else(|| self.ready.pop_front())
    }

    /// Pops the earliest live timer due no later than `limit`. Under the
    /// virtual clock the clock jumps to its deadline; under the system clock
    /// the caller is told how long to sleep.
    fn next_timer(&mut self, limit: Option<Duration>) -> Step {
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if !self.timer_callbacks.contains_key(&id) {
                self.timers.pop();
                continue;
            }
            if limit.is_some_and(|limit| deadline > limit) {
                return Step::Idle;
            }
            self.timers.pop();
            let Some(callback) = self.timer_callbacks.remove(&id) else {
                continue;
            };
            trace!(timer = id, ?deadline, "timer fired");
            return match self.clock {
                Clock::Virtual => {
                    self.virtual_now = self.virtual_now.max(deadline);
                    Step::Ran(callback)
                }
                Clock::System => Step::Sleep(deadline.saturating_sub(self.now()), callback),
            };
        }
        Step::Idle
    }

    fn has_timers(&self) -> bool {
        !self.timer_callbacks.is_empty()
    }
}

fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        f(slot.get_or_insert_with(Scheduler::new))
    })
}

/// Defers `callback` until the current synchronous execution has unwound.
///
/// # Panics
///
/// In [`Mode::SingleSlot`], panics if a previously scheduled callback has not
/// run yet.
pub fn schedule(callback: impl FnOnce() + 'static) {
    let callback: Callback = Box::new(callback);
    let inline = with(|scheduler| match scheduler.mode {
        Mode::Microtask => {
            scheduler.ready.push_back(callback);
            None
        }
        Mode::SingleSlot => {
            if scheduler.slot.is_some() {
                panic!("{}", Error::SlotOccupied);
            }
            scheduler.slot = Some(callback);
            None
        }
        Mode::Timer(delay) => {
            scheduler.add_timer(delay, callback);
            None
        }
        Mode::Synchronous => Some(callback),
    });
    if let Some(callback) = inline {
        callback();
    }
}

/// Runs `callback` once `delay` has elapsed on the scheduler clock.
pub fn schedule_after(delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
    with(|scheduler| scheduler.add_timer(delay, Box::new(callback)))
}

/// Current time on the scheduler clock, measured from the domain's start.
pub fn now() -> Duration {
    with(|scheduler| scheduler.now())
}

/// The deferral mode chosen for this thread.
pub fn mode() -> Mode {
    with(|scheduler| scheduler.mode)
}

/// `true` when neither ready callbacks nor timers are waiting.
pub fn is_idle() -> bool {
    with(|scheduler| {
        scheduler.slot.is_none() && scheduler.ready.is_empty() && !scheduler.has_timers()
    })
}

fn step() -> bool {
    match with(Scheduler::next_ready) {
        Some(callback) => {
            callback();
            true
        }
        None => false,
    }
}

fn fire_timer(limit: Option<Duration>) -> bool {
    match with(|scheduler| scheduler.next_timer(limit)) {
        Step::Ran(callback) => {
            callback();
            true
        }
        Step::Sleep(wait, callback) => {
            if !wait.is_zero() {
                thread::sleep(wait);
            }
            callback();
            true
        }
        Step::Idle => false,
    }
}

/// Runs ready callbacks and every timer already due, without letting time
/// pass. Returns the number of callbacks run.
pub fn run_until_stalled() -> usize {
    let mut ran = 0;
    loop {
        if step() {
            ran += 1;
            continue;
        }
        if fire_timer(Some(now())) {
            ran += 1;
            continue;
        }
        return ran;
    }
}

/// Runs until no callback and no timer is left, moving the clock forward to
/// each timer deadline. Returns the number of callbacks run.
pub fn run() -> usize {
    let mut ran = 0;
    while step() || fire_timer(None) {
        ran += 1;
    }
    ran
}

/// Runs everything due within the next `by` of scheduler time, then leaves
/// the clock at the end of that window.
pub fn advance(by: Duration) -> usize {
    let target = now() + by;
    let mut ran = 0;
    while step() || fire_timer(Some(target)) {
        ran += 1;
    }
    let sleep = with(|scheduler| match scheduler.clock {
        Clock::Virtual => {
            scheduler.virtual_now = scheduler.virtual_now.max(target);
            Duration::ZERO
        }
        Clock::System => target.saturating_sub(scheduler.now()),
    });
    if !sleep.is_zero() {
        thread::sleep(sleep);
    }
    ran
}

struct Signal(AtomicBool);

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }
}

/// Drives this thread's scheduler until `future` completes.
///
/// Returns [`Error::Stalled`] when the future is pending and no callback or
/// timer is left that could wake it.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, Error> {
    let mut future = pin!(future);
    let signal = Arc::new(Signal(AtomicBool::new(true)));
    let waker = Waker::from(signal.clone());
    let mut cx = Context::from_waker(&waker);
    loop {
        if signal.0.swap(false, Ordering::AcqRel) {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
        } else if !(step() || fire_timer(None)) {
            return Err(Error::Stalled);
        }
    }
}
