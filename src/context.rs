//! Thread-local runtime context.
//!
//! Each OS thread tracks which scheduler and threadpool are driving it.
//! Two slots exist for each: the *true* value, owned by the machinery that
//! is really running on the thread, and the *redirected* value, which is
//! what user-facing queries report. The two only diverge inside
//! [`await_blocking`](crate::await_blocking), where a dedicated worker
//! thread impersonates the caller's execution environment.
//!
//! All installs are scoped: a guard restores the previous value on drop, so
//! the context survives panics that unwind through the runtime.

use crate::scheduler::Scheduler;
use crate::threadpool::Threadpool;

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

pub(crate) type SchedulerSlot = Option<Weak<Scheduler>>;
pub(crate) type ThreadpoolSlot = Option<Weak<Threadpool>>;

thread_local! {
    /// Scheduler whose `run()` is actually executing on this thread.
    static TRUE_SCHEDULER: RefCell<SchedulerSlot> = const { RefCell::new(None) };

    /// Scheduler reported by [`this_scheduler`].
    static REDIRECT_SCHEDULER: RefCell<SchedulerSlot> = const { RefCell::new(None) };

    /// Threadpool whose worker this thread is.
    static TRUE_THREADPOOL: RefCell<ThreadpoolSlot> = const { RefCell::new(None) };

    /// Threadpool reported by [`this_threadpool`].
    static REDIRECT_THREADPOOL: RefCell<ThreadpoolSlot> = const { RefCell::new(None) };

    /// Whether a coroutine is currently executing on this thread.
    static IN_COROUTINE: Cell<bool> = const { Cell::new(false) };

    /// Whether this thread is a dedicated await worker.
    static IS_AWAIT: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if the calling context executes inside a running
/// scheduler, honoring the await redirect.
pub fn in_scheduler() -> bool {
    REDIRECT_SCHEDULER.with(|s| s.borrow().is_some())
}

/// The scheduler the calling context runs in, or `None` outside of one.
///
/// Inside [`await_blocking`](crate::await_blocking) this reports the
/// scheduler of the original caller, not the await worker's.
pub fn this_scheduler() -> Option<Arc<Scheduler>> {
    REDIRECT_SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

/// Returns `true` if the calling context executes on a threadpool worker,
/// honoring the await redirect.
pub fn in_threadpool() -> bool {
    REDIRECT_THREADPOOL.with(|t| t.borrow().is_some())
}

/// The threadpool the calling context runs in, or `None` outside of one.
pub fn this_threadpool() -> Option<Arc<Threadpool>> {
    REDIRECT_THREADPOOL.with(|t| t.borrow().as_ref().and_then(Weak::upgrade))
}

/// Returns `true` if the calling context is a coroutine.
pub fn in_coroutine() -> bool {
    IN_COROUTINE.with(Cell::get)
}

/// Returns `true` if the calling thread is a dedicated await worker.
pub fn is_await() -> bool {
    IS_AWAIT.with(Cell::get)
}

/// The scheduler truly driving this thread, ignoring the await redirect.
pub(crate) fn true_scheduler() -> Option<Arc<Scheduler>> {
    TRUE_SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

/// Whether `sch` is the scheduler truly driving this thread.
pub(crate) fn is_true_scheduler(sch: &Scheduler) -> bool {
    TRUE_SCHEDULER.with(|s| {
        s.borrow()
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), sch))
    })
}

/// Swaps both scheduler slots, returning the previous pair
/// `(true, redirected)`.
pub(crate) fn swap_scheduler(
    true_slot: SchedulerSlot,
    redirect_slot: SchedulerSlot,
) -> (SchedulerSlot, SchedulerSlot) {
    let prev_true = TRUE_SCHEDULER.with(|s| s.replace(true_slot));
    let prev_redirect = REDIRECT_SCHEDULER.with(|s| s.replace(redirect_slot));
    (prev_true, prev_redirect)
}

/// Marks this thread as an await worker for the rest of its lifetime.
pub(crate) fn mark_await_worker() {
    IS_AWAIT.with(|f| f.set(true));
}

/// Scope marker for a coroutine resumption. Restores the previous
/// in-coroutine flag on drop, including during unwinding.
pub(crate) struct CoroutineScope {
    prev: bool,
}

pub(crate) fn enter_coroutine() -> CoroutineScope {
    let prev = IN_COROUTINE.with(|f| f.replace(true));
    CoroutineScope { prev }
}

impl Drop for CoroutineScope {
    fn drop(&mut self) {
        let prev = self.prev;
        IN_COROUTINE.with(|f| f.set(prev));
    }
}

/// Scope marker for a threadpool worker thread. Installs the pool into
/// both threadpool slots and restores the previous values on drop.
pub(crate) struct ThreadpoolScope {
    prev_true: ThreadpoolSlot,
    prev_redirect: ThreadpoolSlot,
}

pub(crate) fn enter_threadpool(pool: Weak<Threadpool>) -> ThreadpoolScope {
    let prev_true = TRUE_THREADPOOL.with(|t| t.replace(Some(pool.clone())));
    let prev_redirect = REDIRECT_THREADPOOL.with(|t| t.replace(Some(pool)));
    ThreadpoolScope {
        prev_true,
        prev_redirect,
    }
}

impl Drop for ThreadpoolScope {
    fn drop(&mut self) {
        let prev_true = self.prev_true.take();
        let prev_redirect = self.prev_redirect.take();
        TRUE_THREADPOOL.with(|t| *t.borrow_mut() = prev_true);
        REDIRECT_THREADPOOL.with(|t| *t.borrow_mut() = prev_redirect);
    }
}

/// Scope marker for the await bridge: overrides only the *redirected*
/// scheduler and threadpool so user queries resolve to the original
/// caller's environment. The true slots are untouched.
pub(crate) struct RedirectScope {
    prev_scheduler: SchedulerSlot,
    prev_threadpool: ThreadpoolSlot,
}

pub(crate) fn enter_redirect(
    scheduler: SchedulerSlot,
    threadpool: ThreadpoolSlot,
) -> RedirectScope {
    let prev_scheduler = REDIRECT_SCHEDULER.with(|s| s.replace(scheduler));
    let prev_threadpool = REDIRECT_THREADPOOL.with(|t| t.replace(threadpool));
    RedirectScope {
        prev_scheduler,
        prev_threadpool,
    }
}

impl Drop for RedirectScope {
    fn drop(&mut self) {
        let prev_scheduler = self.prev_scheduler.take();
        let prev_threadpool = self.prev_threadpool.take();
        REDIRECT_SCHEDULER.with(|s| *s.borrow_mut() = prev_scheduler);
        REDIRECT_THREADPOOL.with(|t| *t.borrow_mut() = prev_threadpool);
    }
}
