//! Asynchronous timer service.
//!
//! A [`TimerService`] runs on its own thread and executes callbacks at
//! deadlines. Callbacks run outside the service lock, on the service
//! thread; the free [`timer`] helper therefore reschedules user callbacks
//! onto the caller's scheduler so they run as coroutines.
//!
//! [`remove`](TimerService::remove) is synchronous: if the target timer's
//! callback is executing, the call blocks until it has finished, so after
//! a successful return the callback can no longer run.

use crate::context;
use crate::park::Parkable;
use crate::spin::Spinlock;

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identity token for a scheduled timer.
///
/// The token stays valid until the timer fires or is removed.
#[derive(Clone)]
pub struct TimerId {
    valid: Arc<AtomicBool>,
}

impl TimerId {
    fn new() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

impl PartialEq for TimerId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.valid, &other.valid)
    }
}

impl Eq for TimerId {}

impl std::fmt::Debug for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerId")
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct Entry {
    deadline: Instant,
    id: TimerId,
    callback: Box<dyn FnOnce() + Send>,
}

struct State {
    continue_running: bool,

    /// Timer whose callback is executing right now.
    executing: Option<TimerId>,

    /// Pending timers, ordered soonest deadline first. Insertion keeps
    /// registration order among equal deadlines.
    timers: Vec<Entry>,
}

struct Shared {
    state: Mutex<State>,
    /// Wakes the service thread for new timers or shutdown.
    cv: Condvar,
    /// Wakes `remove` callers once an executing callback has finished.
    remove_cv: Condvar,
}

/// A deadline-callback service on a dedicated thread.
pub struct TimerService {
    shared: Arc<Shared>,
    thread: Spinlock<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Starts a timer service on a new thread.
    pub fn spawn() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                continue_running: true,
                executing: None,
                timers: Vec::new(),
            }),
            cv: Condvar::new(),
            remove_cv: Condvar::new(),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("fibra-timer".into())
            .spawn(move || Self::run_loop(&worker))
            .expect("failed to spawn timer thread");
        tracing::trace!("timer service started");

        Self {
            shared,
            thread: Spinlock::new(Some(handle)),
        }
    }

    /// Schedules `callback` to run at `deadline` on the service thread.
    pub fn timer<F>(&self, deadline: Instant, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TimerId::new();
        let mut state = self.shared.state.lock().unwrap();

        let position = state
            .timers
            .partition_point(|entry| entry.deadline <= deadline);
        state.timers.insert(
            position,
            Entry {
                deadline,
                id: id.clone(),
                callback: Box::new(callback),
            },
        );

        drop(state);
        self.shared.cv.notify_one();
        id
    }

    /// Removes a pending timer.
    ///
    /// Returns `true` if the timer was found and removed. If the timer's
    /// callback is currently executing, blocks until it has finished and
    /// returns `false`. After this returns the callback cannot run.
    pub fn remove(&self, id: &TimerId) -> bool {
        let mut state = self.shared.state.lock().unwrap();

        if state.executing.as_ref() == Some(id) {
            while state.executing.as_ref() == Some(id) {
                state = self.shared.remove_cv.wait(state).unwrap();
            }
            return false;
        }

        if id.is_valid() {
            id.invalidate();
            if let Some(position) = state.timers.iter().position(|entry| &entry.id == id) {
                let entry = state.timers.remove(position);
                drop(state);
                // The callback's drop may wake a sleeper; keep it outside
                // the service lock.
                drop(entry);
                return true;
            }
        }

        false
    }

    /// Returns `true` while the timer is pending or its callback runs.
    pub fn running(&self, id: &TimerId) -> bool {
        let state = self.shared.state.lock().unwrap();
        id.is_valid() || state.executing.as_ref() == Some(id)
    }

    /// Drops every pending timer without executing it.
    ///
    /// Callbacks that encode a wakeup in their drop (such as the one
    /// behind [`sleep`]) still release their waiter.
    pub fn clear(&self) {
        let drained: Vec<Entry> = {
            let mut state = self.shared.state.lock().unwrap();
            state.timers.drain(..).collect()
        };
        for entry in &drained {
            entry.id.invalidate();
        }
        drop(drained);
    }

    /// Number of pending timers.
    pub fn count(&self) -> usize {
        self.shared.state.lock().unwrap().timers.len()
    }

    /// Stops the service thread and joins it. Pending timers are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.continue_running {
                return;
            }
            state.continue_running = false;
        }
        self.shared.cv.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        tracing::trace!("timer service stopped");
    }

    fn run_loop(shared: &Shared) {
        let mut state = shared.state.lock().unwrap();

        while state.continue_running {
            // Execute everything due. Deadlines are re-read after every
            // callback because callbacks may register new timers.
            loop {
                let now = Instant::now();
                if !state
                    .timers
                    .first()
                    .is_some_and(|entry| entry.deadline <= now)
                {
                    break;
                }
                let due = state.timers.remove(0);

                due.id.invalidate();
                state.executing = Some(due.id);
                let callback = due.callback;

                // Callbacks run unlocked so they may use this service.
                drop(state);
                callback();
                state = shared.state.lock().unwrap();

                state.executing = None;
                shared.remove_cv.notify_all();

                if !state.continue_running {
                    return;
                }
            }

            state = match state.timers.first().map(|entry| entry.deadline) {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        continue;
                    }
                    let (guard, _timeout) = shared
                        .cv
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    guard
                }
                None => shared.cv.wait(state).unwrap(),
            };
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The process-wide timer service backing [`timer`] and [`sleep`].
pub fn default_timer_service() -> &'static TimerService {
    static SERVICE: Lazy<TimerService> = Lazy::new(TimerService::spawn);
    &SERVICE
}

/// Schedules `callback` to run after `delay`.
///
/// When called from inside a scheduler the callback is rescheduled onto
/// that scheduler as a coroutine; otherwise it runs on the timer thread.
pub fn timer<F>(delay: Duration, callback: F) -> TimerId
where
    F: FnOnce() + Send + 'static,
{
    let target = context::this_scheduler();
    default_timer_service().timer(Instant::now() + delay, move || match target {
        Some(scheduler) => scheduler.schedule_fn(callback),
        None => callback(),
    })
}

/// Removes a timer started with [`timer`]. See [`TimerService::remove`].
pub fn remove_timer(id: &TimerId) -> bool {
    default_timer_service().remove(id)
}

/// Number of timers pending on the default service.
pub fn count_timers() -> usize {
    default_timer_service().count()
}

/// Blocks the calling coroutine or thread for `duration`.
///
/// Returns `true` if the full duration elapsed, `false` if the sleeper
/// was released early because the default timer service dropped its
/// pending timers.
pub fn sleep(duration: Duration) -> bool {
    /// Wakes the sleeper when dropped, whether the timer fired or was
    /// cleared.
    struct Resumer {
        parkable: *const Parkable,
        lock: *const Spinlock<()>,
    }

    // Safety: the sleeping frame stays parked until the drop below runs.
    unsafe impl Send for Resumer {}

    impl Drop for Resumer {
        fn drop(&mut self) {
            // Safety: the pointers reference the parked sleeper's frame.
            unsafe {
                let mut guard = (*self.lock).lock();
                (*self.parkable).unpark(&mut guard);
            }
        }
    }

    struct FlagPtr(*mut bool);
    // Safety: written before the resumer releases the sleeper.
    unsafe impl Send for FlagPtr {}

    let parkable = Parkable::new();
    let lock = Spinlock::new(());
    let mut elapsed = false;

    let resumer = Resumer {
        parkable: &parkable,
        lock: &lock,
    };
    let flag = FlagPtr(&mut elapsed);

    let guard = lock.lock();
    default_timer_service().timer(Instant::now() + duration, move || {
        // Force whole-value capture of `flag` (not just its inner
        // raw-pointer field) so the closure relies on `FlagPtr`'s `Send`
        // impl instead of the field's.
        let flag = flag;
        // Reaching the callback at all means the deadline passed; a
        // cleared timer only drops `resumer`.
        // Safety: the sleeper is still parked at this point.
        unsafe { *flag.0 = true };
        drop(resumer);
    });

    let guard = parkable.park(guard);
    drop(guard);
    elapsed
}
