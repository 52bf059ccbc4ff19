//! Coroutine scheduler.
//!
//! A [`Scheduler`] owns a FIFO run queue of coroutines and drives them on
//! whichever thread calls [`Scheduler::run`]. Coroutines execute until
//! they yield, complete or park; a coroutine that merely yields goes to
//! the back of the queue so long-running work cannot starve its siblings.
//!
//! The scheduler is the root of every blocking operation: parking a
//! coroutine hands it from the run queue to a peer's wait queue, and
//! unparking puts it back. See the [`park`](crate::park) module.

use crate::context::{self, SchedulerSlot};
use crate::coroutine::{self, Coroutine};
use crate::park::{Parkable, ParkableRef};
use crate::spin::{Spinlock, SpinlockGuard};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Execution state shared by schedulers and threadpools.
///
/// `Halted` is terminal. The variant order matters: anything below
/// `Suspended` keeps a run loop going.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Initial state, or suspended and since resumed.
    Ready,
    /// A driver is executing coroutines.
    Running,
    /// Temporarily stopped by `suspend`.
    Suspended,
    /// Permanently stopped by `halt`.
    Halted,
}

/// Lifecycle control shared by [`Scheduler`] and
/// [`Threadpool`](crate::threadpool::Threadpool).
pub trait Lifecycle {
    /// Current lifecycle state.
    fn state(&self) -> LifecycleState;

    /// Temporarily suspends execution. Returns `false` if already halted.
    fn suspend(&self) -> bool;

    /// Resumes execution after a `suspend`.
    fn resume(&self);

    /// Permanently halts execution and waits for the driver to stop.
    fn halt(&self);
}

/// A scheduler's load, packed into one machine word for cheap comparison.
///
/// The high half holds the enqueued count, the low half the scheduled
/// count, both saturating. Enqueued work therefore dominates the ordering
/// and the scheduled count (which includes blocked coroutines) breaks
/// ties.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Measurement(usize);

impl Measurement {
    const HALF_WIDTH: u32 = usize::BITS / 2;
    const RIGHT_MASK: usize = usize::MAX >> Self::HALF_WIDTH;

    /// Packs an enqueued and a scheduled count.
    pub fn new(enqueued: usize, scheduled: usize) -> Self {
        let clamp = |count: usize| count.min(Self::RIGHT_MASK);
        Self(clamp(enqueued) << Self::HALF_WIDTH | clamp(scheduled))
    }

    /// Count of coroutines waiting in the run queue, including the one
    /// currently executing.
    pub fn enqueued(&self) -> usize {
        self.0 >> Self::HALF_WIDTH
    }

    /// Count of all live coroutines on the scheduler, parked included.
    pub fn scheduled(&self) -> usize {
        self.0 & Self::RIGHT_MASK
    }

    /// Count of coroutines blocked on some peer.
    pub fn blocked(&self) -> usize {
        self.scheduled().saturating_sub(self.enqueued())
    }
}

impl From<Measurement> for usize {
    fn from(m: Measurement) -> usize {
        m.0
    }
}

struct State {
    lifecycle: LifecycleState,

    /// Whether some thread currently owns `run`.
    driver_active: bool,

    /// Set once the run queue has been drained after a halt.
    halt_complete: bool,

    /// Live coroutines on this scheduler, parked included.
    scheduled: usize,

    /// Whether a coroutine is executing right now.
    active: bool,

    queue: VecDeque<Box<Coroutine>>,

    /// Driver blocked waiting for `resume`.
    resume_waiter: Option<ParkableRef>,

    /// Driver blocked waiting for work.
    tasks_waiter: Option<ParkableRef>,

    /// Contexts blocked in `halt` waiting for the driver to finish.
    halt_waiters: VecDeque<ParkableRef>,
}

impl State {
    fn can_continue(&self) -> bool {
        self.lifecycle < LifecycleState::Suspended
    }
}

/// An executor owning a FIFO run queue of coroutines.
///
/// All operations are safe to call from anywhere, including from a
/// coroutine running on the scheduler being operated on.
pub struct Scheduler {
    lk: Spinlock<State>,
    self_weak: Weak<Scheduler>,
}

// Safety: all mutable state sits behind the spinlock; the raw parkable
// references it stores point into frames that stay parked while present.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

/// Clears the driver flag when `run` exits, on every path.
struct DriverScope<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for DriverScope<'_> {
    fn drop(&mut self) {
        let mut lk = self.scheduler.lk.lock();
        lk.driver_active = false;
        // An unwinding coroutine leaves the running state behind; clear
        // it so the scheduler can be driven again.
        if lk.lifecycle == LifecycleState::Running {
            lk.lifecycle = LifecycleState::Ready;
        }
    }
}

/// Restores the thread-local scheduler context when `run` exits.
struct ContextScope {
    saved: Option<(SchedulerSlot, SchedulerSlot)>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some((true_slot, redirect_slot)) = self.saved.take() {
            context::swap_scheduler(true_slot, redirect_slot);
        }
    }
}

/// Repairs the bookkeeping for a coroutine that panicked mid-run.
struct PanicRepair<'a> {
    scheduler: &'a Scheduler,
    armed: bool,
}

impl Drop for PanicRepair<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut lk = self.scheduler.lk.lock();
            lk.active = false;
            lk.scheduled -= 1;
        }
    }
}

impl Scheduler {
    /// Creates a new scheduler in the `Ready` state.
    pub fn new() -> Arc<Scheduler> {
        Arc::new_cyclic(|weak| Scheduler {
            lk: Spinlock::new(State {
                lifecycle: LifecycleState::Ready,
                driver_active: false,
                halt_complete: false,
                scheduled: 0,
                active: false,
                queue: VecDeque::new(),
                resume_waiter: None,
                tasks_waiter: None,
                halt_waiters: VecDeque::new(),
            }),
            self_weak: weak.clone(),
        })
    }

    /// Enqueues a coroutine. Silently dropped if the scheduler is halted.
    pub fn schedule(&self, co: Coroutine) {
        let mut lk = self.lk.lock();
        if lk.lifecycle == LifecycleState::Halted {
            return;
        }
        lk.scheduled += 1;
        lk.queue.push_back(Box::new(co));
        Self::tasks_notify(&mut lk);
    }

    /// Enqueues several coroutines under one lock acquisition, preserving
    /// their order in the run queue.
    pub fn schedule_many<I>(&self, coroutines: I)
    where
        I: IntoIterator<Item = Coroutine>,
    {
        let mut lk = self.lk.lock();
        if lk.lifecycle == LifecycleState::Halted {
            return;
        }
        for co in coroutines {
            lk.scheduled += 1;
            lk.queue.push_back(Box::new(co));
        }
        Self::tasks_notify(&mut lk);
    }

    /// Wraps a callable into a coroutine and enqueues it.
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Coroutine::new(f));
    }

    /// Puts a previously parked coroutine back on the run queue.
    ///
    /// Unlike `schedule` this does not touch the scheduled count: the
    /// coroutine never stopped being counted while parked.
    pub(crate) fn enqueue_parked(&self, co: Box<Coroutine>) {
        let mut lk = self.lk.lock();
        if lk.lifecycle == LifecycleState::Halted {
            drop(lk);
            drop(co);
            return;
        }
        lk.queue.push_back(co);
        Self::tasks_notify(&mut lk);
    }

    /// Snapshot of the current scheduling load.
    pub fn measure(&self) -> Measurement {
        let lk = self.lk.lock();
        Measurement::new(lk.queue.len() + lk.active as usize, lk.scheduled)
    }

    /// Drives the scheduler on the calling thread.
    ///
    /// Blocks until `suspend` or `halt` is called, returning `true` for a
    /// suspension and `false` for a halt. While another thread is inside
    /// `run` this returns `false` immediately.
    ///
    /// When called from a coroutine already running under another
    /// scheduler on this thread, the scheduler runs in child mode: it
    /// yields to the parent after every coroutine and parks the parent's
    /// coroutine instead of blocking the thread while its queue is empty.
    ///
    /// A panic escaping one of the scheduled coroutines propagates out of
    /// `run` after the thread-local context has been restored and the
    /// offending coroutine destroyed; the scheduler remains usable.
    pub fn run(&self) -> bool {
        {
            let mut lk = self.lk.lock();
            if lk.driver_active {
                return false;
            }
            lk.driver_active = true;
        }
        let _driver = DriverScope { scheduler: self };

        let me = Some(self.self_weak.clone());
        let parent = context::swap_scheduler(me.clone(), me);
        let is_child = parent.0.is_some();
        let _context = ContextScope {
            saved: Some(parent.clone()),
        };

        let mut lk = self.lk.lock();

        while lk.lifecycle == LifecycleState::Suspended {
            lk = self.resume_wait(lk);
        }

        if lk.lifecycle == LifecycleState::Ready {
            lk.lifecycle = LifecycleState::Running;
            lk = if is_child {
                self.child_loop(lk, &parent)
            } else {
                self.root_loop(lk)
            };
        }

        if lk.lifecycle == LifecycleState::Suspended {
            // Reset one-shot flags so `run` can be called again.
            lk.halt_complete = false;
            lk.tasks_waiter = None;
            true
        } else {
            let drained = if lk.halt_complete {
                Vec::new()
            } else {
                Self::finalize_halt(&mut lk)
            };
            drop(lk);
            if !drained.is_empty() {
                tracing::trace!(dropped = drained.len(), "halted scheduler dropped queued coroutines");
            }
            false
        }
    }

    fn root_loop<'a>(&'a self, mut lk: SpinlockGuard<'a, State>) -> SpinlockGuard<'a, State> {
        while lk.can_continue() {
            if let Some(co) = lk.queue.pop_front() {
                lk = self.execute(lk, co);
            } else {
                while lk.queue.is_empty() && lk.can_continue() {
                    lk = self.tasks_wait(lk);
                }
            }
        }
        lk
    }

    fn child_loop<'a>(
        &'a self,
        mut lk: SpinlockGuard<'a, State>,
        parent: &(SchedulerSlot, SchedulerSlot),
    ) -> SpinlockGuard<'a, State> {
        while lk.can_continue() {
            if let Some(co) = lk.queue.pop_front() {
                lk = self.execute(lk, co);
                drop(lk);

                // Give the parent scheduler a slice. The parent context
                // must be visible and our lock released while we yield.
                let mine = context::swap_scheduler(parent.0.clone(), parent.1.clone());
                coroutine::yield_now();
                context::swap_scheduler(mine.0, mine.1);

                lk = self.lk.lock();
            } else {
                let mine = context::swap_scheduler(parent.0.clone(), parent.1.clone());
                while lk.queue.is_empty() && lk.can_continue() {
                    lk = self.tasks_wait(lk);
                }
                context::swap_scheduler(mine.0, mine.1);
            }
        }
        lk
    }

    /// Runs one coroutine and settles its fate: handed to a peer, dropped
    /// on completion, or requeued at the tail.
    fn execute<'a>(
        &'a self,
        mut lk: SpinlockGuard<'a, State>,
        mut co: Box<Coroutine>,
    ) -> SpinlockGuard<'a, State> {
        lk.active = true;
        drop(lk);

        let mut repair = PanicRepair {
            scheduler: self,
            armed: true,
        };
        co.run();
        repair.armed = false;

        if let Some(continuation) = co.take_park_request() {
            // Hand the coroutine to its peer. The destination slots live
            // in the suspended coroutine's own frame; the peer's lock is
            // still held and is released by the cleanup call, after which
            // the peer owns the coroutine.
            unsafe {
                *continuation.coroutine = Some(co);
                *continuation.source = self.self_weak.clone();
                (continuation.cleanup)(continuation.payload);
            }
            let mut lk = self.lk.lock();
            lk.active = false;
            lk
        } else if co.complete() {
            drop(co);
            let mut lk = self.lk.lock();
            lk.active = false;
            lk.scheduled -= 1;
            lk
        } else {
            let mut lk = self.lk.lock();
            lk.active = false;
            lk.queue.push_back(co);
            lk
        }
    }

    /// Blocks the driver until work arrives. In child mode the parent's
    /// context is installed, so this parks the parent's coroutine; in
    /// root mode it blocks the OS thread.
    fn tasks_wait<'a>(&'a self, mut lk: SpinlockGuard<'a, State>) -> SpinlockGuard<'a, State> {
        let parkable = Parkable::new();
        lk.tasks_waiter = Some(ParkableRef::new(&parkable));
        let mut lk = parkable.park(lk);

        // Reclaim the running state if a suspend/resume pair slipped in
        // while we were waiting.
        if lk.lifecycle == LifecycleState::Ready {
            lk.lifecycle = LifecycleState::Running;
        }
        lk
    }

    fn resume_wait<'a>(&'a self, mut lk: SpinlockGuard<'a, State>) -> SpinlockGuard<'a, State> {
        let parkable = Parkable::new();
        lk.resume_waiter = Some(ParkableRef::new(&parkable));
        parkable.park(lk)
    }

    fn tasks_notify(lk: &mut SpinlockGuard<'_, State>) {
        if let Some(waiter) = lk.tasks_waiter.take() {
            // Safety: the waiter was registered under this lock and its
            // frame is still parked.
            unsafe { waiter.unpark(lk) };
        }
    }

    fn resume_notify(lk: &mut SpinlockGuard<'_, State>) {
        if let Some(waiter) = lk.resume_waiter.take() {
            // Safety: as in `tasks_notify`.
            unsafe { waiter.unpark(lk) };
        }
    }

    /// Drains the run queue and releases everyone blocked in `halt`.
    /// Returns the drained coroutines so they can be dropped unlocked.
    fn finalize_halt(lk: &mut SpinlockGuard<'_, State>) -> Vec<Box<Coroutine>> {
        let drained: Vec<Box<Coroutine>> = lk.queue.drain(..).collect();
        lk.scheduled -= drained.len();
        lk.halt_complete = true;
        while let Some(waiter) = lk.halt_waiters.pop_front() {
            // Safety: halt waiters stay parked until this point.
            unsafe { waiter.unpark(lk) };
        }
        drained
    }
}

impl Lifecycle for Scheduler {
    fn state(&self) -> LifecycleState {
        self.lk.lock().lifecycle
    }

    fn suspend(&self) -> bool {
        let mut lk = self.lk.lock();
        if lk.lifecycle == LifecycleState::Halted {
            return false;
        }
        lk.lifecycle = LifecycleState::Suspended;
        // Kick the driver out of its idle wait so `run` can return.
        Self::tasks_notify(&mut lk);
        true
    }

    fn resume(&self) {
        let mut lk = self.lk.lock();
        if lk.lifecycle == LifecycleState::Suspended {
            lk.lifecycle = LifecycleState::Ready;
            Self::resume_notify(&mut lk);
        }
    }

    fn halt(&self) {
        let mut lk = self.lk.lock();
        if lk.halt_complete {
            return;
        }
        lk.lifecycle = LifecycleState::Halted;
        Self::resume_notify(&mut lk);

        if context::in_coroutine() && context::is_true_scheduler(self) {
            // Halting from a coroutine this scheduler is driving: yield
            // so the run loop can observe the state. This coroutine is
            // destroyed with the rest of the queue and never resumes.
            drop(lk);
            coroutine::yield_now();
            return;
        }

        Self::tasks_notify(&mut lk);

        if !lk.driver_active {
            // No thread is inside `run`; finish the halt here.
            let drained = Self::finalize_halt(&mut lk);
            drop(lk);
            drop(drained);
            return;
        }

        while !lk.halt_complete {
            let parkable = Parkable::new();
            lk.halt_waiters.push_back(ParkableRef::new(&parkable));
            lk = parkable.park(lk);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lk = self.lk.lock();
        f.debug_struct("Scheduler")
            .field("lifecycle", &lk.lifecycle)
            .field("enqueued", &lk.queue.len())
            .field("scheduled", &lk.scheduled)
            .finish()
    }
}
