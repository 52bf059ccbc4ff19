//! Minimal spinlock used to guard every shared structure in the runtime.
//!
//! All critical sections in this crate are short and never yield, so a
//! spinlock beats a full OS mutex. The one exception to the "guard is
//! dropped to unlock" rule is the park handoff: a parking coroutine leaks
//! its guard across the suspension point and the scheduler releases the
//! lock through [`Spinlock::force_unlock`] once the coroutine has been
//! handed to its peer.

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spinlock protecting a value of type `T`.
pub(crate) struct Spinlock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `locked`.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired.
    pub(crate) fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }

        SpinlockGuard { lock: self }
    }

    /// Acquires the lock only if it is free.
    #[allow(dead_code)]
    pub(crate) fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// The caller must own the lock through a previously forgotten guard,
    /// and no guard for it may be live.
    pub(crate) unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Pointer to the lock word, used by the park continuation to release
    /// the lock from the scheduler after a coroutine handoff.
    pub(crate) fn word(&self) -> *const AtomicBool {
        &self.locked
    }
}

/// Releases the lock word behind `word` as if by [`Spinlock::force_unlock`].
///
/// # Safety
///
/// `word` must point at the lock word of a live, currently held `Spinlock`
/// whose guard has been forgotten.
pub(crate) unsafe fn release_raw(word: *const ()) {
    (*(word as *const AtomicBool)).store(false, Ordering::Release);
}

/// RAII guard for [`Spinlock`]. Unlocks on drop.
pub(crate) struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> SpinlockGuard<'a, T> {
    /// The lock this guard belongs to.
    pub(crate) fn spinlock(&self) -> &'a Spinlock<T> {
        self.lock
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard owns the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard owns the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
