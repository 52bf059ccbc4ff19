//! Bounded buffered channel.
//!
//! Values travel through a fixed-capacity ring buffer: senders only block
//! once the buffer is full, receivers only block while it is empty. After
//! every successful operation the channel wakes at most one parked peer
//! whose condition has become satisfiable.

use crate::channel::{Channel, TryResult};
use crate::coroutine;
use crate::park::{Parkable, ParkableRef};
use crate::spin::{Spinlock, SpinlockGuard};

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

/// A sender blocked on a full buffer.
///
/// `value` points at the `Option<T>` on the parked sender's frame; the
/// peer that frees a slot moves the value into the buffer on the sender's
/// behalf. Pointers are only touched under the channel lock while the
/// sender is parked.
struct SendWaiter<T> {
    parkable: ParkableRef,
    value: *mut Option<T>,
    failed: *mut bool,
}

/// A receiver blocked on an empty buffer; the peer that produces a value
/// pops the buffer into `slot` on the receiver's behalf.
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
    capacity: usize,
    buffer: VecDeque<T>,
    parked_send: VecDeque<SendWaiter<T>>,
    parked_recv: VecDeque<RecvWaiter<T>>,
}

impl<T> State<T> {
    fn full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    /// Wakes one parked receiver if the buffer has a value for it.
    fn wake_one_receiver(lk: &mut SpinlockGuard<'_, Self>) {
        if lk.buffer.is_empty() || lk.parked_recv.is_empty() {
            return;
        }
        let waiter = lk.parked_recv.pop_front().expect("receiver queue drained");
        let value = lk.buffer.pop_front().expect("buffer drained");
        // Safety: the receiver stays parked until the unpark below and
        // its frame outlives the park; the lock is held.
        unsafe {
            *waiter.slot = Some(value);
            waiter.parkable.unpark(lk);
        }
    }

    /// Wakes one parked sender if the buffer has room for its value.
    fn wake_one_sender(lk: &mut SpinlockGuard<'_, Self>) {
        if lk.full() || lk.parked_send.is_empty() {
            return;
        }
        let waiter = lk.parked_send.pop_front().expect("sender queue drained");
        // Safety: as in `wake_one_receiver`.
        let value = unsafe { (*waiter.value).take() }.expect("parked sender carries no value");
        lk.buffer.push_back(value);
        unsafe { waiter.parkable.unpark(lk) };
    }
}

/// A bounded buffered channel of `T`.
///
/// Clones share the same channel; the channel lives as long as any clone.
pub struct Buffered<T> {
    ctx: Arc<Spinlock<State<T>>>,
}

impl<T> Clone for Buffered<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<T: Send> Buffered<T> {
    /// Creates a channel with the given capacity. A capacity of `0` is
    /// coerced to `1`.
    pub fn new(capacity: usize) -> Self {
        Self {
            ctx: Arc::new(Spinlock::new(State {
                closed: false,
                capacity: capacity.max(1),
                buffer: VecDeque::with_capacity(capacity.max(1)),
                parked_send: VecDeque::new(),
                parked_recv: VecDeque::new(),
            })),
        }
    }

    /// Sends a value, blocking while the buffer is full.
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

    /// Receives a value, blocking while the buffer is empty.
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

    /// Number of values currently buffered.
    pub fn size(&self) -> usize {
        self.ctx.lock().buffer.len()
    }

    /// Whether the buffer holds no values.
    pub fn empty(&self) -> bool {
        self.ctx.lock().buffer.is_empty()
    }

    /// Whether the buffer is at capacity.
    pub fn full(&self) -> bool {
        self.ctx.lock().full()
    }

    /// Maximum number of buffered values.
    pub fn capacity(&self) -> usize {
        self.ctx.lock().capacity
    }

    /// Number of free buffer slots.
    pub fn reserve(&self) -> usize {
        let lk = self.ctx.lock();
        lk.capacity - lk.buffer.len()
    }

    fn send_impl(&self, value: T, block: bool) -> TryResult {
        let mut lk = self.ctx.lock();

        if lk.closed {
            return TryResult::Closed;
        }

        if lk.full() {
            if block {
                let mut outgoing = Some(value);
                let mut failed = false;
                let parkable = Parkable::new();
                lk.parked_send.push_back(SendWaiter {
                    parkable: ParkableRef::new(&parkable),
                    value: &mut outgoing,
                    failed: &mut failed,
                });
                // Whoever frees a slot moves `outgoing` into the buffer
                // before unparking us.
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
        } else {
            lk.buffer.push_back(value);
        }

        if !lk.closed {
            State::wake_one_receiver(&mut lk);
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
        match lk.buffer.pop_front() {
            Some(value) => received = value,
            None if block => {
                let mut incoming: Option<T> = None;
                let mut failed = false;
                let parkable = Parkable::new();
                lk.parked_recv.push_back(RecvWaiter {
                    parkable: ParkableRef::new(&parkable),
                    slot: &mut incoming,
                    failed: &mut failed,
                });
                // Whoever produces a value pops the buffer into
                // `incoming` before unparking us.
                lk = parkable.park(lk);

                if failed {
                    return TryResult::Closed;
                }
                received = incoming.take().expect("receiver resumed without a value");
            }
            None => {
                drop(lk);
                // Let other coroutines run before reporting the failure.
                coroutine::yield_now();
                return TryResult::Failure;
            }
        }

        if !lk.closed {
            State::wake_one_sender(&mut lk);
        }

        drop(lk);
        // Let other coroutines run.
        coroutine::yield_now();
        TryResult::Success(received)
    }
}

impl<T: Send + 'static> Buffered<T> {
    /// Single-pass iterator draining the channel until it is closed.
    pub fn iter(&self) -> crate::channel::Iter<T> {
        crate::channel::Iter::new(Arc::new(self.clone()))
    }
}

impl<T: Send + 'static> Channel<T> for Buffered<T> {
    fn send(&self, value: T) -> bool {
        Buffered::send(self, value)
    }

    fn recv(&self) -> Option<T> {
        Buffered::recv(self)
    }

    fn try_send(&self, value: T) -> TryResult {
        Buffered::try_send(self, value)
    }

    fn try_recv(&self) -> TryResult<T> {
        Buffered::try_recv(self)
    }

    fn close(&self) {
        Buffered::close(self)
    }

    fn closed(&self) -> bool {
        Buffered::closed(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Send + 'static> IntoIterator for &Buffered<T> {
    type Item = T;
    type IntoIter = crate::channel::Iter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
