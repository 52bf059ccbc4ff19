//! The await bridge: run blocking code without stalling coroutines.
//!
//! [`await_blocking`] executes a callable that is expected to block at
//! the OS level (file and socket I/O, `std` locks, foreign libraries) on
//! a dedicated worker thread, parking only the calling coroutine. Every
//! other coroutine on the caller's scheduler keeps running.
//!
//! The bridged callable keeps the caller's identity: `this_scheduler()`
//! and `this_threadpool()` inside it resolve to the caller's environment,
//! so launching further coroutines from bridged code works as if it had
//! never left home. Because the caller stays parked for the duration, the
//! callable may borrow from the caller's stack.

use crate::config;
use crate::context;
use crate::coroutine::Coroutine;
use crate::park::Parkable;
use crate::scheduler::{Lifecycle, Scheduler};
use crate::spin::Spinlock;

use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A dedicated thread driving a private scheduler, executing one bridged
/// call at a time.
struct AwaitWorker {
    scheduler: Arc<Scheduler>,
    handle: Option<JoinHandle<()>>,
}

impl AwaitWorker {
    fn spawn() -> Self {
        let scheduler = Scheduler::new();
        let worker = scheduler.clone();
        let handle = thread::Builder::new()
            .name("fibra-await".into())
            .spawn(move || {
                context::mark_await_worker();
                worker.run();
            })
            .expect("failed to spawn await worker");
        tracing::trace!("await worker started");

        Self {
            scheduler,
            handle: Some(handle),
        }
    }
}

impl Drop for AwaitWorker {
    fn drop(&mut self) {
        self.scheduler.halt();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::trace!("await worker retired");
    }
}

struct PoolState {
    free: VecDeque<AwaitWorker>,
    total: usize,
}

/// Process-wide pool of await workers.
///
/// Workers are checked out per bridged call; on check-in a worker is
/// retained while the free list is under the configured minimum and
/// destroyed otherwise. New workers are created on demand.
struct AwaitPool {
    min_workers: usize,
    lk: Spinlock<PoolState>,
}

impl AwaitPool {
    fn with_min(min_workers: usize) -> Self {
        let free: VecDeque<AwaitWorker> = (0..min_workers).map(|_| AwaitWorker::spawn()).collect();
        Self {
            min_workers,
            lk: Spinlock::new(PoolState {
                total: free.len(),
                free,
            }),
        }
    }

    fn checkout(&self) -> AwaitWorker {
        {
            let mut lk = self.lk.lock();
            if let Some(worker) = lk.free.pop_front() {
                return worker;
            }
            lk.total += 1;
        }
        AwaitWorker::spawn()
    }

    fn checkin(&self, worker: AwaitWorker) {
        let retired = {
            let mut lk = self.lk.lock();
            if lk.free.len() < self.min_workers {
                lk.free.push_back(worker);
                None
            } else {
                lk.total -= 1;
                Some(worker)
            }
        };
        // Halting and joining the retired worker happens unlocked.
        drop(retired);
    }

    fn total(&self) -> usize {
        self.lk.lock().total
    }
}

fn pool() -> &'static AwaitPool {
    static POOL: Lazy<AwaitPool> = Lazy::new(|| {
        if config::default_threads_disabled() {
            AwaitPool::with_min(0)
        } else {
            AwaitPool::with_min(config::min_await_workers())
        }
    });
    &POOL
}

/// Returns `true` when called from code executing on an await worker.
pub fn is_await() -> bool {
    context::is_await()
}

/// Number of live await workers, retained and checked out alike.
pub fn await_worker_count() -> usize {
    pool().total()
}

/// Executes `f`, a blocking callable, and returns its result.
///
/// Called from a coroutine inside a scheduler, `f` runs on a dedicated
/// worker thread while the caller parks; other coroutines on the caller's
/// scheduler are unaffected. Called from anywhere else, or from within
/// another `await_blocking`, `f` simply runs on the current thread, which
/// is already safe to block.
///
/// Within `f`, `this_scheduler()` and `this_threadpool()` report the
/// caller's environment.
pub fn await_blocking<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    if !(context::in_scheduler() && context::in_coroutine()) || context::is_await() {
        // Already on a thread that may block.
        return f();
    }
    bridge(f)
}

/// Unsynchronized pointer into the bridging caller's frame.
struct FramePtr<T: ?Sized>(*mut T);

// Safety: the caller's frame outlives the bridged call; see `bridge`.
unsafe impl<T: ?Sized> Send for FramePtr<T> {}

fn bridge<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let worker = pool().checkout();

    let original_scheduler = context::this_scheduler();
    let original_threadpool = context::this_threadpool();

    let parkable = Parkable::new();
    let rendezvous = Spinlock::new(());
    let mut result: Option<R> = None;

    let result_ptr = FramePtr(&mut result as *mut Option<R>);
    let parkable_ptr = FramePtr(&parkable as *const Parkable as *mut Parkable);
    let rendezvous_ptr = FramePtr(&rendezvous as *const Spinlock<()> as *mut Spinlock<()>);

    let task = move || {
        // Force whole-value capture of these wrappers (not just their inner
        // raw-pointer field) so the closure relies on `FramePtr`'s `Send`
        // impl instead of the field's.
        let result_ptr = result_ptr;
        let parkable_ptr = parkable_ptr;
        let rendezvous_ptr = rendezvous_ptr;
        let value = f();
        // Safety: the caller stays parked until the unpark below, so its
        // frame and these pointers are live; the rendezvous lock orders
        // the result write before the caller's read.
        unsafe {
            *result_ptr.0 = Some(value);
            let mut guard = (*rendezvous_ptr.0).lock();
            (*parkable_ptr.0).unpark(&mut guard);
        }
    };

    // Erase the closure's borrow of this frame. The frame cannot exit
    // before the closure has run: the caller parks below and is only
    // unparked by the closure itself.
    let task: Box<dyn FnOnce() + Send + '_> = Box::new(task);
    let task: Box<dyn FnOnce() + Send + 'static> = unsafe { std::mem::transmute(task) };

    let mut bridged = Coroutine::new(move || task());
    bridged.set_redirect(original_scheduler, original_threadpool);

    // Scheduling and parking happen under the rendezvous lock so the
    // bridged coroutine cannot finish before the caller is parked.
    let guard = rendezvous.lock();
    worker.scheduler.schedule(bridged);
    let guard = parkable.park(guard);
    drop(guard);

    pool().checkin(worker);
    result.expect("await bridge finished without a result")
}
