//! Coroutine-aware mutex.

use crate::park::{Parkable, ParkableRef};
use crate::spin::Spinlock;

use std::collections::VecDeque;

struct State {
    acquired: bool,
    waiters: VecDeque<ParkableRef>,
}

/// A mutual-exclusion lock usable from both coroutines and threads.
///
/// Contended `lock` calls park the caller in FIFO order instead of
/// blocking the OS thread. The mutex does not own the data it protects;
/// pair it with [`Condvar`](crate::sync::Condvar) or use
/// [`lock_guarded`](Mutex::lock_guarded) for scoped locking.
pub struct Mutex {
    lk: Spinlock<State>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            lk: Spinlock::new(State {
                acquired: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Locks the mutex, parking until it can be acquired.
    pub fn lock(&self) {
        let mut lk = self.lk.lock();
        if !lk.acquired {
            lk.acquired = true;
            return;
        }

        // Wait until an unlock hands the mutex over. Another context may
        // grab it between our wakeup and the check, so loop.
        loop {
            let parkable = Parkable::new();
            lk.waiters.push_back(ParkableRef::new(&parkable));
            lk = parkable.park(lk);
            if !lk.acquired {
                break;
            }
        }
        lk.acquired = true;
    }

    /// Attempts to lock without blocking. Returns `true` on acquisition.
    pub fn try_lock(&self) -> bool {
        let mut lk = self.lk.lock();
        if lk.acquired {
            false
        } else {
            lk.acquired = true;
            true
        }
    }

    /// Unlocks the mutex, waking the first parked waiter if any.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub fn unlock(&self) {
        let mut lk = self.lk.lock();
        if !lk.acquired {
            panic!("cannot unlock an already unlocked mutex");
        }
        lk.acquired = false;
        if let Some(waiter) = lk.waiters.pop_front() {
            // Safety: the waiter was registered under this lock and its
            // frame is still parked.
            unsafe { waiter.unpark(&mut lk) };
        }
    }

    /// Locks the mutex and returns a guard that unlocks on drop.
    pub fn lock_guarded(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`Mutex::lock_guarded`].
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let m = Mutex::new();
        m.lock();
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    #[should_panic(expected = "already unlocked")]
    fn unlocking_unlocked_mutex_panics() {
        Mutex::new().unlock();
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let m = Mutex::new();
        {
            let _guard = m.lock_guarded();
            assert!(!m.try_lock());
        }
        assert!(m.try_lock());
    }
}
