//! Coroutine-aware condition variable.

use crate::park::{Parkable, ParkableRef};
use crate::spin::{Spinlock, SpinlockGuard};
use crate::sync::Mutex;
use crate::timer::default_timer_service;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Raw pointer into a waiting frame, written only under the condvar lock.
#[derive(Clone, Copy)]
struct FlagPtr(*mut bool);

// Safety: dereferenced only under the condvar lock while the owning frame
// is parked.
unsafe impl Send for FlagPtr {}

#[derive(Clone, Copy)]
struct CondvarPtr(*const Condvar);

// Safety: the timed waiter synchronously removes its timer before its
// frame (and the condvar borrow) can go away, so the pointer is live
// whenever the timer callback runs.
unsafe impl Send for CondvarPtr {}

struct Waiter {
    key: usize,

    parkable: ParkableRef,

    /// Timed waits share this guard flag with their timer: whichever of
    /// the notify and the timeout fires first clears it, turning the
    /// loser into a no-op.
    guard_flag: Option<FlagPtr>,
}

struct State {
    queue: VecDeque<Waiter>,
    free_keys: Vec<usize>,
    key_source: usize,
}

impl State {
    /// Hands out a key unique among current waiters.
    fn borrow_key(&mut self) -> usize {
        match self.free_keys.pop() {
            Some(key) => key,
            None => {
                let key = self.key_source;
                self.key_source += 1;
                key
            }
        }
    }

    fn return_key(&mut self, key: usize) {
        self.free_keys.push(key);
    }

    /// Fires one waiter entry: honors the guard flag, then unparks.
    fn fire(waiter: Waiter, lk: &mut SpinlockGuard<'_, State>) {
        match waiter.guard_flag {
            // Safety: the waiting frame is parked and the lock is held.
            None => unsafe { waiter.parkable.unpark(lk) },
            Some(flag) => unsafe {
                if *flag.0 {
                    *flag.0 = false;
                    waiter.parkable.unpark(lk);
                }
            },
        }
    }
}

/// A condition variable usable from both coroutines and threads.
///
/// Waits are paired with a [`Mutex`] held by the caller; timed waits race
/// a timer on the default timer service against the notification.
pub struct Condvar {
    lk: Spinlock<State>,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            lk: Spinlock::new(State {
                queue: VecDeque::new(),
                free_keys: Vec::new(),
                key_source: 0,
            }),
        }
    }

    /// Releases `mutex`, parks until notified, then reacquires `mutex`.
    ///
    /// The caller must hold `mutex`.
    pub fn wait(&self, mutex: &Mutex) {
        let parkable = Parkable::new();

        let mut lk = self.lk.lock();
        mutex.unlock();

        let key = lk.borrow_key();
        lk.queue.push_back(Waiter {
            key,
            parkable: ParkableRef::new(&parkable),
            guard_flag: None,
        });

        let mut lk = parkable.park(lk);
        lk.return_key(key);
        drop(lk);

        mutex.lock();
    }

    /// Waits as long as `condition` returns `true`.
    pub fn wait_while<F>(&self, mutex: &Mutex, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(mutex);
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns `true` if the wait timed out before a notification
    /// arrived. The timer is synchronously removed before this returns,
    /// so its callback cannot run afterwards.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> bool {
        let parkable = Parkable::new();
        let mut notify_available = true;
        let mut timed_out = false;

        let mut lk = self.lk.lock();
        mutex.unlock();

        let key = lk.borrow_key();
        lk.queue.push_back(Waiter {
            key,
            parkable: ParkableRef::new(&parkable),
            guard_flag: Some(FlagPtr(&mut notify_available)),
        });

        let this = CondvarPtr(self);
        let available = FlagPtr(&mut notify_available);
        let expired = FlagPtr(&mut timed_out);
        let id = default_timer_service().timer(Instant::now() + timeout, move || {
            // Force whole-value capture of these wrappers (not just their
            // inner raw-pointer field) so the closure relies on the
            // wrapper's `Send` impl instead of the field's.
            let this = this;
            let available = available;
            let expired = expired;
            // Safety: the waiting frame stays parked until notified or
            // timed out, and the timer is synchronously removed before
            // the frame exits; all writes happen under the condvar lock.
            unsafe {
                let cv = &*this.0;
                let mut lk = cv.lk.lock();
                if *available.0 {
                    *expired.0 = true;
                    Self::notify_with_key(&mut lk, key);
                }
            }
        });

        let mut lk = parkable.park(lk);
        lk.return_key(key);
        drop(lk);

        // Synchronous: does not return while the callback is executing.
        default_timer_service().remove(&id);

        mutex.lock();
        timed_out
    }

    /// Waits as long as `condition` returns `true`, restarting the full
    /// timeout on every wakeup. Returns `true` if a wait timed out while
    /// the condition still held.
    pub fn wait_timeout_while<F>(&self, mutex: &Mutex, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        while condition() {
            if self.wait_timeout(mutex, timeout) {
                return true;
            }
        }
        false
    }

    /// Wakes the first waiter, if any.
    pub fn notify_one(&self) {
        let mut lk = self.lk.lock();
        if let Some(waiter) = lk.queue.pop_front() {
            State::fire(waiter, &mut lk);
        }
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) {
        let mut lk = self.lk.lock();
        while let Some(waiter) = lk.queue.pop_front() {
            State::fire(waiter, &mut lk);
        }
    }

    /// Wakes the specific waiter registered under `key`, used by the
    /// timeout path.
    fn notify_with_key(lk: &mut SpinlockGuard<'_, State>, key: usize) {
        if let Some(index) = lk.queue.iter().position(|w| w.key == key) {
            let waiter = lk.queue.remove(index).expect("waiter vanished under lock");
            State::fire(waiter, lk);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
