//! # Fibra
//!
//! **Fibra** is a cooperative concurrency runtime built on stackful
//! coroutines: many lightweight tasks multiplexed over a configurable set
//! of OS threads, communicating through typed channels.
//!
//! The runtime provides:
//!
//! - A **scheduler** driving a FIFO run queue of coroutines on one thread
//!   at a time, with suspend/resume/halt lifecycle control
//! - A **threadpool** of schedulers with load-aware worker selection, for
//!   M:N execution across cores
//! - **Channels**, unbuffered (rendezvous) and bounded buffered, with
//!   blocking, non-blocking and iterator consumption and close semantics
//! - **Synchronization** primitives (mutex, condition variable) that park
//!   coroutines instead of blocking threads
//! - An **await bridge** that runs OS-blocking calls on dedicated threads
//!   while the caller keeps its scheduler identity
//! - A **timer service** backing sleeps, timed waits and user timers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fibra::{concurrent, Chan};
//!
//! let results: Chan<u64> = Chan::new();
//!
//! let tx = results.clone();
//! concurrent(move || {
//!     tx.send(fibonacci(30));
//! });
//!
//! // Rendezvous with the worker coroutine.
//! let value = results.recv().unwrap();
//! ```
//!
//! Within a single scheduler execution is strictly cooperative: a
//! coroutine runs until it yields, completes or blocks, and blocking on
//! any of the primitives above suspends only the coroutine, never the
//! thread. Use [`await_blocking`] for calls that block at the OS level.
//!
//! ## Launching coroutines
//!
//! [`concurrent`] schedules on the current thread's scheduler for the
//! fastest communication, [`parallel`] spreads across the current
//! threadpool for CPU throughput, and [`balance`] trades a little
//! scheduling cost for long-term load stability. All three fall back to
//! the lazily created default threadpool outside the runtime.

mod awaiting;
mod config;
mod context;
mod coroutine;
mod park;
mod spin;

pub mod channel;
pub mod scheduler;
pub mod sync;
pub mod threadpool;
pub mod timer;

pub use awaiting::{await_blocking, await_worker_count, is_await};
pub use channel::{Buffered, Chan, Channel, TryResult, Unbuffered};
pub use config::{balance_ratio, default_threadpool_size, min_await_workers};
pub use context::{in_coroutine, in_scheduler, in_threadpool, this_scheduler, this_threadpool};
pub use coroutine::{yield_now, Coroutine};
pub use scheduler::{Lifecycle, LifecycleState, Measurement, Scheduler};
pub use threadpool::{balance, concurrent, default_threadpool, parallel, Threadpool};
pub use timer::{default_timer_service, remove_timer, sleep, timer, TimerId, TimerService};
