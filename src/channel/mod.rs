//! Typed channels for coroutine communication.
//!
//! Two concrete kinds exist: [`Unbuffered`] rendezvous channels, where a
//! send and a receive must meet before either proceeds, and [`Buffered`]
//! channels, which move values through a fixed-capacity ring with
//! backpressure. [`Chan`] erases the kind behind a shared handle.
//!
//! Channels are cheap value types: cloning a channel clones a handle to
//! the same shared context, so they can be captured by `move` closures
//! freely. All operations take `&self`.

mod buffered;
mod unbuffered;

pub use buffered::Buffered;
pub use unbuffered::Unbuffered;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of a non-blocking channel operation.
#[derive(Debug, PartialEq, Eq)]
pub enum TryResult<T = ()> {
    /// The channel is closed; the operation failed permanently.
    Closed,
    /// The operation completed.
    Success(T),
    /// The operation could not proceed without blocking.
    Failure,
}

impl<T> TryResult<T> {
    pub fn is_closed(&self) -> bool {
        matches!(self, TryResult::Closed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TryResult::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TryResult::Failure)
    }

    /// The success payload, if any.
    pub fn success(self) -> Option<T> {
        match self {
            TryResult::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Common interface over both channel kinds, used through [`Chan`].
pub trait Channel<T: Send + 'static>: Send + Sync {
    /// Blocking send. Returns `false` if the channel was or became closed.
    fn send(&self, value: T) -> bool;

    /// Blocking receive. Returns `None` once the channel is closed.
    fn recv(&self) -> Option<T>;

    /// Non-blocking send.
    fn try_send(&self, value: T) -> TryResult;

    /// Non-blocking receive.
    fn try_recv(&self) -> TryResult<T>;

    /// Closes the channel, waking every parked sender and receiver.
    /// Closing is one-way and idempotent.
    fn close(&self);

    /// Whether the channel has been closed.
    fn closed(&self) -> bool;

    /// Type-erased view of the concrete channel, for downcasts.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A handle to a channel of either kind.
///
/// Default construction produces an unbuffered channel.
pub struct Chan<T: Send + 'static> {
    inner: Arc<dyn Channel<T>>,
}

impl<T: Send + 'static> Chan<T> {
    /// Creates a handle over a fresh unbuffered channel.
    pub fn new() -> Self {
        Self::from(Unbuffered::new())
    }

    /// Downcasts to the unbuffered channel this handle wraps, if it is
    /// one.
    pub fn to_unbuffered(&self) -> Option<Unbuffered<T>> {
        self.inner
            .clone()
            .as_any()
            .downcast::<Unbuffered<T>>()
            .ok()
            .map(|ch| (*ch).clone())
    }

    /// Downcasts to the buffered channel this handle wraps, if it is one.
    pub fn to_buffered(&self) -> Option<Buffered<T>> {
        self.inner
            .clone()
            .as_any()
            .downcast::<Buffered<T>>()
            .ok()
            .map(|ch| (*ch).clone())
    }

    /// Blocking send. Returns `false` if the channel was or became closed.
    pub fn send(&self, value: T) -> bool {
        self.inner.send(value)
    }

    /// Blocking receive. Returns `None` once the channel is closed.
    pub fn recv(&self) -> Option<T> {
        self.inner.recv()
    }

    /// Non-blocking send.
    pub fn try_send(&self, value: T) -> TryResult {
        self.inner.try_send(value)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> TryResult<T> {
        self.inner.try_recv()
    }

    /// Closes the channel.
    pub fn close(&self) {
        self.inner.close()
    }

    /// Whether the channel has been closed.
    pub fn closed(&self) -> bool {
        self.inner.closed()
    }

    /// Single-pass iterator draining the channel until it is closed.
    pub fn iter(&self) -> Iter<T> {
        Iter::new(self.inner.clone())
    }

    /// Whether two handles share the same channel.
    pub fn same_channel(&self, other: &Chan<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Send + 'static> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Chan<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> From<Unbuffered<T>> for Chan<T> {
    fn from(ch: Unbuffered<T>) -> Self {
        Self {
            inner: Arc::new(ch),
        }
    }
}

impl<T: Send + 'static> From<Buffered<T>> for Chan<T> {
    fn from(ch: Buffered<T>) -> Self {
        Self {
            inner: Arc::new(ch),
        }
    }
}

impl<T: Send + 'static> IntoIterator for &Chan<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Iter<T> {
        self.iter()
    }
}

/// Single-pass iterator over a channel.
///
/// Each advance performs a blocking receive; the iterator ends once the
/// channel is closed and drained. Clones share the same end state.
pub struct Iter<T: Send + 'static> {
    channel: Arc<dyn Channel<T>>,
    done: Arc<AtomicBool>,
}

impl<T: Send + 'static> Iter<T> {
    pub(crate) fn new(channel: Arc<dyn Channel<T>>) -> Self {
        Self {
            channel,
            done: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T: Send + 'static> Clone for Iter<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            done: self.done.clone(),
        }
    }
}

impl<T: Send + 'static> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done.load(Ordering::Acquire) {
            return None;
        }
        match self.channel.recv() {
            Some(value) => Some(value),
            None => {
                self.done.store(true, Ordering::Release);
                None
            }
        }
    }
}
