//! The park/unpark protocol underlying every blocking operation.
//!
//! A blocking operation creates a [`Parkable`] on its own frame, registers
//! a pointer to it with the peer that will eventually wake it (a channel,
//! a mutex, a condition variable), and calls [`Parkable::park`] with the
//! peer's lock held. The peer later calls [`Parkable::unpark`], still
//! under its lock, to resume the suspended context.
//!
//! How the suspension happens depends on the caller:
//!
//! 1. a coroutine running inside a scheduler hands itself to the peer
//!    through a [`Continuation`],
//! 2. a coroutine running outside any scheduler spins on a polled flag,
//!    yielding between checks,
//! 3. a bare thread blocks on a private condition variable.
//!
//! The continuation handoff is the delicate case. The parking coroutine
//! stashes destination slots inside its own (about to be suspended) frame,
//! leaks the peer's lock guard and yields the continuation to its
//! scheduler. The scheduler moves the coroutine into the destination slot,
//! records a weak reference to itself and only then releases the peer's
//! lock. From that point the coroutine belongs to the peer; unparking it
//! upgrades the weak reference and puts it back on its source scheduler's
//! run queue. Because every slot access happens with the peer's lock held,
//! the handoff can neither double-schedule the coroutine nor lose a wakeup.

use crate::context;
use crate::coroutine::{self, Coroutine};
use crate::scheduler::Scheduler;
use crate::spin::{self, SpinlockGuard};

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex, Weak};

/// One-shot record transferring a suspending coroutine to its peer.
pub(crate) struct Continuation {
    /// Destination slot for the suspended coroutine.
    pub(crate) coroutine: *mut Option<Box<Coroutine>>,

    /// Destination slot for a weak reference to the source scheduler.
    pub(crate) source: *mut Weak<Scheduler>,

    /// Opaque payload handed to `cleanup`.
    pub(crate) payload: *const (),

    /// Runs after the coroutine has been moved into place; releases the
    /// peer's lock.
    pub(crate) cleanup: unsafe fn(*const ()),
}

// Safety: the continuation is produced by a suspending coroutine and
// consumed by its scheduler on the same thread; the pointers it carries
// are only dereferenced there and under the peer's lock.
unsafe impl Send for Continuation {}

/// A parked (or about to park) execution context.
///
/// Lives on the frame of the blocking call; its lifetime strictly encloses
/// every [`ParkableRef`] a peer holds to it.
pub(crate) struct Parkable {
    state: UnsafeCell<ParkState>,
}

enum ParkState {
    Idle,
    Scheduled(ScheduledWait),
    Polled(PolledWait),
    Thread(ThreadWait),
}

/// Waiting context for a coroutine suspended inside a scheduler.
struct ScheduledWait {
    coroutine: Option<Box<Coroutine>>,
    source: Weak<Scheduler>,
}

/// Waiting context for a coroutine driven outside any scheduler.
struct PolledWait {
    ready: bool,
}

/// Waiting context for a bare OS thread.
struct ThreadWait {
    signal: Mutex<bool>,
    cv: Condvar,
}

impl ThreadWait {
    fn new() -> Self {
        Self {
            signal: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut signaled = self.signal.lock().unwrap();
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    fn notify(&self) {
        *self.signal.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

impl Parkable {
    pub(crate) fn new() -> Self {
        Self {
            state: UnsafeCell::new(ParkState::Idle),
        }
    }

    /// Suspends the calling context until [`unpark`](Self::unpark).
    ///
    /// `guard` is the peer's lock, held by the caller; it is released
    /// while suspended and reacquired before this returns. May only be
    /// called once per parkable.
    pub(crate) fn park<'a, T>(&self, guard: SpinlockGuard<'a, T>) -> SpinlockGuard<'a, T> {
        let lock = guard.spinlock();

        if context::in_coroutine() && context::true_scheduler().is_some() {
            let (co_slot, src_slot) = {
                // Safety: the peer's lock is held; peers only touch the
                // state under that same lock.
                let state = unsafe { &mut *self.state.get() };
                debug_assert!(matches!(state, ParkState::Idle), "parkable parked twice");
                *state = ParkState::Scheduled(ScheduledWait {
                    coroutine: None,
                    source: Weak::new(),
                });
                match state {
                    ParkState::Scheduled(wait) => (
                        &mut wait.coroutine as *mut Option<Box<Coroutine>>,
                        &mut wait.source as *mut Weak<Scheduler>,
                    ),
                    _ => unreachable!(),
                }
            };

            let continuation = Continuation {
                coroutine: co_slot,
                source: src_slot,
                payload: lock.word() as *const (),
                cleanup: spin::release_raw,
            };

            // The lock stays held across the suspension; the scheduler
            // releases it through the continuation's cleanup once the
            // coroutine has been handed to the peer.
            std::mem::forget(guard);
            coroutine::suspend_with(continuation);

            lock.lock()
        } else if context::in_coroutine() {
            {
                // Safety: as above.
                let state = unsafe { &mut *self.state.get() };
                debug_assert!(matches!(state, ParkState::Idle), "parkable parked twice");
                *state = ParkState::Polled(PolledWait { ready: false });
            }

            let mut guard = guard;
            loop {
                drop(guard);
                coroutine::yield_now();
                guard = lock.lock();

                // Safety: read back under the reacquired peer lock.
                let ready = match unsafe { &*self.state.get() } {
                    ParkState::Polled(wait) => wait.ready,
                    _ => unreachable!(),
                };
                if ready {
                    return guard;
                }
            }
        } else {
            let wait = {
                // Safety: as above.
                let state = unsafe { &mut *self.state.get() };
                debug_assert!(matches!(state, ParkState::Idle), "parkable parked twice");
                *state = ParkState::Thread(ThreadWait::new());
                match state {
                    ParkState::Thread(wait) => wait as *const ThreadWait,
                    _ => unreachable!(),
                }
            };

            drop(guard);
            // Safety: `self` lives on this frame and outlives the wait;
            // `ThreadWait` synchronizes internally.
            unsafe { (*wait).wait() };

            lock.lock()
        }
    }

    /// Resumes the parked context. The caller must hold the same peer
    /// lock that was held around `park`.
    ///
    /// # Panics
    ///
    /// Panics if the parkable was never parked.
    pub(crate) fn unpark<T>(&self, _guard: &mut SpinlockGuard<'_, T>) {
        let handoff = {
            // Safety: the caller holds the peer lock.
            let state = unsafe { &mut *self.state.get() };
            match state {
                ParkState::Idle => panic!("cannot unpark a parkable that is not parked"),
                ParkState::Scheduled(wait) => match wait.source.upgrade() {
                    // A dead source scheduler makes the unpark a no-op.
                    Some(scheduler) => wait.coroutine.take().map(|co| (scheduler, co)),
                    None => None,
                },
                ParkState::Polled(wait) => {
                    wait.ready = true;
                    None
                }
                ParkState::Thread(wait) => {
                    wait.notify();
                    None
                }
            }
        };

        // Requeue outside the state borrow: enqueueing may drop the
        // coroutine (halted scheduler), which tears down the very frame
        // the state lives on.
        if let Some((scheduler, co)) = handoff {
            scheduler.enqueue_parked(co);
        }
    }
}

/// Unsynchronized pointer to a [`Parkable`] owned by a blocked frame.
///
/// Valid only while the owning frame is parked; every dereference happens
/// under the peer's lock.
#[derive(Clone, Copy)]
pub(crate) struct ParkableRef(*const Parkable);

// Safety: see the type docs; the pointee is pinned to a suspended frame.
unsafe impl Send for ParkableRef {}

impl ParkableRef {
    pub(crate) fn new(parkable: &Parkable) -> Self {
        Self(parkable as *const Parkable)
    }

    /// Unparks the referenced parkable.
    ///
    /// # Safety
    ///
    /// The owning frame must still be parked, and `guard` must be the
    /// peer lock that covered the corresponding `park`.
    pub(crate) unsafe fn unpark<T>(&self, guard: &mut SpinlockGuard<'_, T>) {
        (*self.0).unpark(guard);
    }
}
