//! Stackful coroutines.
//!
//! A [`Coroutine`] owns a callable and the stack it runs on. Driving it
//! with [`Coroutine::run`] executes the callable until it finishes or
//! yields; a suspended coroutine can be moved between threads and resumed
//! later. Schedulers communicate with their coroutines through the yield
//! payload: a plain [`yield_now`] carries nothing, a blocking operation
//! carries the park continuation that hands the coroutine to its peer.

use crate::config;
use crate::context;
use crate::park::Continuation;
use crate::scheduler::Scheduler;
use crate::spin::Spinlock;
use crate::threadpool::Threadpool;

use generator::{Generator, Gn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Value a coroutine passes back to its driver on every suspension.
///
/// `None` is a cooperative yield; `Some` requests a park.
pub(crate) type ParkMsg = Option<Continuation>;

type PanicSlot = Arc<Spinlock<Option<Box<dyn Any + Send>>>>;

/// A resumable unit of execution with its own stack.
pub struct Coroutine {
    gen: Generator<'static, (), ParkMsg>,

    /// Panic payload captured inside the coroutine, re-raised by `run`.
    panic: PanicSlot,

    /// Park continuation produced by the most recent resumption.
    park_request: Option<Continuation>,

    /// Original execution environment to impersonate while running.
    ///
    /// Installed around every resumption; only the await bridge sets this.
    redirect: Option<(Option<Arc<Scheduler>>, Option<Arc<Threadpool>>)>,
}

// Safety: a suspended coroutine is exclusively owned by one holder (a run
// queue, a parked-queue slot or the executing worker frame) and is only
// ever resumed by one thread at a time.
unsafe impl Send for Coroutine {}

impl Coroutine {
    /// Creates a coroutine running `f` on a stack of the configured size.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack(config::stack_size(), f)
    }

    /// Creates a coroutine with an explicit stack size in bytes.
    pub fn with_stack<F>(stack_size: usize, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let panic: PanicSlot = Arc::new(Spinlock::new(None));
        let slot = panic.clone();

        // The body never unwinds across the stack switch: panics are
        // captured here and re-raised by `run` on the driving side.
        //
        // `new_opt` (not the scoped variant) is required here: it wires up
        // the generator's return slot that the global `yield_with`/
        // `yield_now` functions read from, which is how `suspend_with` and
        // `coroutine::yield_now` communicate with this generator.
        let gen = Gn::<()>::new_opt(stack_size, move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                slot.lock().replace(payload);
            }
            None
        });

        Self {
            gen,
            panic,
            park_request: None,
            redirect: None,
        }
    }

    /// Resumes the coroutine until it completes or suspends.
    ///
    /// Returns immediately if the coroutine is already complete.
    ///
    /// # Panics
    ///
    /// Re-raises any panic that escaped the coroutine's callable, after
    /// the thread-local coroutine marker has been restored.
    pub fn run(&mut self) {
        if self.complete() {
            return;
        }

        let message = {
            let _scope = context::enter_coroutine();
            let _redirect = self.redirect.as_ref().map(|(sch, pool)| {
                context::enter_redirect(
                    sch.as_ref().map(Arc::downgrade),
                    pool.as_ref().map(Arc::downgrade),
                )
            });
            self.gen.resume()
        };

        if let Some(Some(continuation)) = message {
            self.park_request = Some(continuation);
        }

        if let Some(payload) = self.panic.lock().take() {
            panic::resume_unwind(payload);
        }
    }

    /// Returns `true` once the callable has finished.
    pub fn complete(&self) -> bool {
        self.gen.is_done()
    }

    /// Takes the park continuation produced by the last resumption, if any.
    pub(crate) fn take_park_request(&mut self) -> Option<Continuation> {
        self.park_request.take()
    }

    /// Makes every resumption impersonate the given scheduler and
    /// threadpool for user-facing queries.
    pub(crate) fn set_redirect(
        &mut self,
        scheduler: Option<Arc<Scheduler>>,
        threadpool: Option<Arc<Threadpool>>,
    ) {
        self.redirect = Some((scheduler, threadpool));
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("complete", &self.complete())
            .finish()
    }
}

/// Yields the calling coroutine back to its driver.
///
/// Outside of a coroutine this degrades to an OS thread yield.
pub fn yield_now() {
    if context::in_coroutine() {
        generator::yield_with::<ParkMsg>(None);
    } else {
        std::thread::yield_now();
    }
}

/// Suspends the calling coroutine with a park request.
///
/// Must only be called from a coroutine driven by a scheduler; the
/// scheduler consumes the continuation right after the suspension.
pub(crate) fn suspend_with(continuation: Continuation) {
    generator::yield_with::<ParkMsg>(Some(continuation));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_to_completion() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        let mut co = Coroutine::new(move || flag.store(true, Ordering::Relaxed));

        assert!(!co.complete());
        co.run();
        assert!(co.complete());
        assert!(hit.load(Ordering::Relaxed));
    }

    #[test]
    fn yield_suspends_and_resumes() {
        let mut co = Coroutine::new(|| {
            yield_now();
            yield_now();
        });

        co.run();
        assert!(!co.complete());
        co.run();
        assert!(!co.complete());
        co.run();
        assert!(co.complete());
    }

    #[test]
    fn in_coroutine_is_scoped_to_run() {
        assert!(!context::in_coroutine());

        let mut co = Coroutine::new(|| {
            assert!(context::in_coroutine());
            yield_now();
        });

        co.run();
        assert!(!context::in_coroutine());
        co.run();
    }

    #[test]
    fn panics_propagate_out_of_run() {
        let mut co = Coroutine::new(|| panic!("boom"));
        let err = std::panic::catch_unwind(AssertUnwindSafe(|| co.run()));
        assert!(err.is_err());
        assert!(co.complete());
    }
}
