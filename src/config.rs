//! Per-domain engine configuration.
//!
//! The configuration is fixed the first time the engine is used on a thread,
//! either explicitly through [`configure`] or implicitly from the
//! environment. It is never re-read afterwards.

use std::time::Duration;

use once_cell::unsync::OnceCell;
use tracing::warn;

use crate::Error;

/// Delay used by [`Mode::Timer`] when none is given.
pub const DEFAULT_TIMER_DELAY: Duration = Duration::from_millis(4);

/// Time an unhandled rejection waits for a handler before it is reported.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

const SCHEDULER_VAR: &str = "PROMISE_ENGINE_SCHEDULER";
const TIMER_DELAY_VAR: &str = "PROMISE_ENGINE_TIMER_DELAY_MS";
const GRACE_VAR: &str = "PROMISE_ENGINE_GRACE_MS";
const CLOCK_VAR: &str = "PROMISE_ENGINE_CLOCK";

thread_local! {
    static CURRENT: OnceCell<Config> = OnceCell::new();
}

/// How [`crate::scheduler::schedule`] defers a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// FIFO queue drained after the current call stack unwinds.
    Microtask,
    /// A single pending callback plus a wake-up signal. Scheduling while the
    /// slot is occupied is a contract violation.
    SingleSlot,
    /// Every callback becomes a timer. Adds latency.
    Timer(Duration),
    /// Runs the callback inline. Breaks the never-inline guarantee and only
    /// exists for hosts without any deferral primitive.
    Synchronous,
}

/// Time source for scheduler timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Monotonic wall clock; the driver sleeps until timer deadlines.
    System,
    /// Virtual clock that jumps straight to the next deadline.
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    pub clock: Clock,
    /// Delay between an unhandled rejection and its report.
    pub grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Microtask,
            clock: Clock::System,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl Config {
    /// Reads the configuration from `PROMISE_ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        let timer_delay = match lookup(TIMER_DELAY_VAR) {
            Some(raw) => parse_millis(TIMER_DELAY_VAR, &raw)?,
            None => DEFAULT_TIMER_DELAY,
        };
        if let Some(raw) = lookup(SCHEDULER_VAR) {
            config.mode = match raw.trim().to_ascii_lowercase().as_str() {
                "microtask" => Mode::Microtask,
                "slot" | "single-slot" => Mode::SingleSlot,
                "timer" => Mode::Timer(timer_delay),
                "sync" | "synchronous" => Mode::Synchronous,
                _ => return Err(invalid(SCHEDULER_VAR, raw)),
            };
        }
        if let Some(raw) = lookup(GRACE_VAR) {
            config.grace_period = parse_millis(GRACE_VAR, &raw)?;
        }
        if let Some(raw) = lookup(CLOCK_VAR) {
            config.clock = match raw.trim().to_ascii_lowercase().as_str() {
                "system" => Clock::System,
                "virtual" => Clock::Virtual,
                _ => return Err(invalid(CLOCK_VAR, raw)),
            };
        }
        Ok(config)
    }
}

fn parse_millis(key: &'static str, raw: &str) -> Result<Duration, Error> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, raw.to_owned()))
}

fn invalid(key: &'static str, value: String) -> Error {
    Error::InvalidConfig { key, value }
}

/// Fixes the configuration of the calling thread's scheduling domain.
///
/// Must run before the first promise or scheduler call on this thread.
pub fn configure(config: Config) -> Result<(), Error> {
    CURRENT.with(|cell| cell.set(config).map_err(|_| Error::AlreadyConfigured))
}

/// The configuration in effect for the calling thread, initialising it from
/// the environment on first use.
pub fn current() -> Config {
    current_or(Config::from_env)
}

fn current_or(load: impl FnOnce() -> Result<Config, Error>) -> Config {
    CURRENT.with(|cell| {
        cell.get_or_init(|| {
            load().unwrap_or_else(|err| {
                warn!(%err, "ignoring malformed engine configuration");
                Config::default()
            })
        })
        .clone()
    })
}
