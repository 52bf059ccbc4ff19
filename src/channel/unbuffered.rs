//! Rendezvous channel.
//!
//! An unbuffered channel transfers each value directly from the sender's
//! frame to the receiver's frame; neither side proceeds until both have
//! arrived. This is the safest default way for coroutines to communicate
//! and to hand off state.

use crate::channel::{Channel, TryResult};
use crate::coroutine;
use crate::park::{Parkable, ParkableRef};
use crate::spin::Spinlock;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

/// A sender blocked waiting for a receiver.
///
/// `value` points at the `Option<T>` on the parked sender's frame; the
/// receiver that pairs with it moves the value straight out. `failed` is
/// set instead when the channel closes. Both pointers are only touched
/// under the channel lock while the sender is parked.
struct SendWaiter<T> {
    parkable: ParkableRef,
    value: *mut Option<T>,
    failed: *mut bool,
}

/// A receiver blocked waiting for a sender; mirror of [`SendWaiter`].
struct RecvWaiter<T> {
    parkable: ParkableRef,
    slot: *mut Option<T>,
    failed: *mut bool,
}

// Safety: the raw pointers reference parked frames and are dereferenced
// only under the channel lock; see the field docs.
unsafe impl<T: Send> Send for SendWaiter<T> {}
unsafe impl<T: Send> Send for RecvWaiter<T> {}

struct State<T> {
    closed: bool,
    parked_send: VecDeque<SendWaiter<T>>,
    parked_recv: VecDeque<RecvWaiter<T>>,
}

/// An unbuffered (rendezvous) channel of `T`.
///
/// Clones share the same channel; the channel lives as long as any clone.
pub struct Unbuffered<T> {
    ctx: Arc<Spinlock<State<T>>>,
}

impl<T> Clone for Unbuffered<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<T: Send> Unbuffered<T> {
    pub fn new() -> Self {
        Self {
            ctx: Arc::new(Spinlock::new(State {
                closed: false,
                parked_send: VecDeque::new(),
                parked_recv: VecDeque::new(),
            })),
        }
    }

    /// Sends a value, blocking until a receiver takes it.
    ///
    /// Returns `false` if the channel was or became closed during the
    /// wait; the value is lost in that case.
    pub fn send(&self, value: T) -> bool {
        self.send_impl(value, true).is_success()
    }

    /// Attempts to send without blocking.
    pub fn try_send(&self, value: T) -> TryResult {
        self.send_impl(value, false)
    }

    /// Receives a value, blocking until a sender provides one.
    ///
    /// Returns `None` if the channel was or became closed during the
    /// wait.
    pub fn recv(&self) -> Option<T> {
        self.recv_impl(true).success()
    }

    /// Attempts to receive without blocking.
    pub fn try_recv(&self) -> TryResult<T> {
        self.recv_impl(false)
    }

    /// Closes the channel, failing every parked sender and receiver.
    pub fn close(&self) {
        let mut lk = self.ctx.lock();
        lk.closed = true;

        while let Some(waiter) = lk.parked_send.pop_front() {
            // Safety: the waiter's frame is parked; we hold the lock.
            unsafe {
                *waiter.failed = true;
                waiter.parkable.unpark(&mut lk);
            }
        }
        while let Some(waiter) = lk.parked_recv.pop_front() {
            // Safety: as above.
            unsafe {
                *waiter.failed = true;
                waiter.parkable.unpark(&mut lk);
            }
        }
    }

    /// Whether the channel has been closed.
    pub fn closed(&self) -> bool {
        self.ctx.lock().closed
    }

    fn send_impl(&self, value: T, block: bool) -> TryResult {
        let mut lk = self.ctx.lock();

        if lk.closed {
            return TryResult::Closed;
        }

        if let Some(waiter) = lk.parked_recv.pop_front() {
            // Deliver straight into the parked receiver's frame.
            // Safety: the receiver stays parked until the unpark below
            // and its frame outlives the park; the lock is held.
            unsafe {
                *waiter.slot = Some(value);
                waiter.parkable.unpark(&mut lk);
            }
        } else if block {
            let mut outgoing = Some(value);
            let mut failed = false;
            let parkable = Parkable::new();
            lk.parked_send.push_back(SendWaiter {
                parkable: ParkableRef::new(&parkable),
                value: &mut outgoing,
                failed: &mut failed,
            });
            lk = parkable.park(lk);

            if failed {
                return TryResult::Closed;
            }
        } else {
            drop(lk);
            // Let other coroutines run before reporting the failure.
            coroutine::yield_now();
            return TryResult::Failure;
        }

        drop(lk);
        // Let other coroutines run.
        coroutine::yield_now();
        TryResult::Success(())
    }

    fn recv_impl(&self, block: bool) -> TryResult<T> {
        let mut lk = self.ctx.lock();

        if lk.closed {
            return TryResult::Closed;
        }

        let received;
        if let Some(waiter) = lk.parked_send.pop_front() {
            // Move the value straight out of the parked sender's frame.
            // Safety: the sender stays parked until the unpark below and
            // its frame outlives the park; the lock is held.
            let value = unsafe { (*waiter.value).take() };
            unsafe { waiter.parkable.unpark(&mut lk) };
            received = value.expect("parked sender carries no value");
        } else if block {
            let mut incoming: Option<T> = None;
            let mut failed = false;
            let parkable = Parkable::new();
            lk.parked_recv.push_back(RecvWaiter {
                parkable: ParkableRef::new(&parkable),
                slot: &mut incoming,
                failed: &mut failed,
            });
            lk = parkable.park(lk);

            if failed {
                return TryResult::Closed;
            }
            received = incoming.take().expect("receiver resumed without a value");
        } else {
            drop(lk);
            // Let other coroutines run before reporting the failure.
            coroutine::yield_now();
            return TryResult::Failure;
        }

        drop(lk);
        // Let other coroutines run.
        coroutine::yield_now();
        TryResult::Success(received)
    }
}

impl<T: Send + 'static> Unbuffered<T> {
    /// Single-pass iterator draining the channel until it is closed.
    pub fn iter(&self) -> crate::channel::Iter<T> {
        crate::channel::Iter::new(Arc::new(self.clone()))
    }
}

impl<T: Send> Default for Unbuffered<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Channel<T> for Unbuffered<T> {
    fn send(&self, value: T) -> bool {
        Unbuffered::send(self, value)
    }

    fn recv(&self) -> Option<T> {
        Unbuffered::recv(self)
    }

    fn try_send(&self, value: T) -> TryResult {
        Unbuffered::try_send(self, value)
    }

    fn try_recv(&self) -> TryResult<T> {
        Unbuffered::try_recv(self)
    }

    fn close(&self) {
        Unbuffered::close(self)
    }

    fn closed(&self) -> bool {
        Unbuffered::closed(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Send + 'static> IntoIterator for &Unbuffered<T> {
    type Item = T;
    type IntoIter = crate::channel::Iter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
