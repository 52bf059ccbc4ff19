//! Blocking primitives safe to use from coroutines and threads alike.
//!
//! Unlike their `std` counterparts these never block the OS thread when
//! called from a coroutine: the coroutine parks and its scheduler keeps
//! running other work.

mod condvar;
mod mutex;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
