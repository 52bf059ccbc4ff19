//! Compile-time configuration.
//!
//! Every knob is resolved from an `option_env!` define, so configuration is
//! fixed when the crate is compiled, not when the process starts. Unset or
//! unparsable defines fall back to the documented defaults.

use once_cell::sync::Lazy;
use std::thread;

fn parse_usize(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_f64(raw: Option<&str>, default: f64) -> f64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Requested size of the default threadpool (`FIBRA_MAXPROCS`).
///
/// `0` means "one worker per hardware thread, minimum 1", resolved at pool
/// construction.
pub fn default_threadpool_size() -> usize {
    static SIZE: Lazy<usize> = Lazy::new(|| parse_usize(option_env!("FIBRA_MAXPROCS"), 0));
    *SIZE
}

/// Load ratio above which `balance` reschedules work
/// (`FIBRA_BALANCE_RATIO`, default `1.5`).
///
/// The heaviest worker must carry at least this many times the load of the
/// lightest worker before `balance` moves new work off the current thread.
pub fn balance_ratio() -> f64 {
    static RATIO: Lazy<f64> = Lazy::new(|| parse_f64(option_env!("FIBRA_BALANCE_RATIO"), 1.5));
    *RATIO
}

/// Minimum number of retained await workers (`FIBRA_MIN_AWAIT_WORKERS`).
///
/// `0` selects the built-in minimum of one worker. When
/// [`default_threads_disabled`] is set the await pool retains no workers at
/// all and this value is ignored.
pub fn min_await_workers() -> usize {
    static MIN: Lazy<usize> =
        Lazy::new(|| parse_usize(option_env!("FIBRA_MIN_AWAIT_WORKERS"), 0));
    match *MIN {
        0 => 1,
        n => n,
    }
}

/// Whether default background threads are disabled
/// (`FIBRA_DISABLE_DEFAULT_THREADS`).
pub fn default_threads_disabled() -> bool {
    option_env!("FIBRA_DISABLE_DEFAULT_THREADS").is_some()
}

/// Stack size in bytes for newly created coroutines (`FIBRA_STACK_SIZE`,
/// default 64 KiB).
pub fn stack_size() -> usize {
    static SIZE: Lazy<usize> = Lazy::new(|| {
        match parse_usize(option_env!("FIBRA_STACK_SIZE"), 0) {
            0 => 0x10000,
            n => n,
        }
    });
    *SIZE
}

/// Resolves a requested worker count, treating `0` as "hardware
/// concurrency, minimum 1".
pub(crate) fn resolve_worker_count(requested: usize) -> usize {
    if requested != 0 {
        return requested;
    }

    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
