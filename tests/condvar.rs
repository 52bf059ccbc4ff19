use fibra::sync::{Condvar, Mutex};
use fibra::{Coroutine, Lifecycle, Scheduler};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Shared {
    mutex: Mutex,
    cv: Condvar,
    ready: AtomicBool,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: Mutex::new(),
            cv: Condvar::new(),
            ready: AtomicBool::new(false),
        })
    }
}

#[test]
fn notify_one_wakes_a_waiting_coroutine() {
    let sch = Scheduler::new();
    let shared = Shared::new();
    let woke = Arc::new(AtomicBool::new(false));

    {
        let shared = shared.clone();
        let woke = woke.clone();
        let halter = sch.clone();
        sch.schedule(Coroutine::new(move || {
            shared.mutex.lock();
            shared
                .cv
                .wait_while(&shared.mutex, || !shared.ready.load(Ordering::Relaxed));
            shared.mutex.unlock();
            woke.store(true, Ordering::Relaxed);
            halter.halt();
        }));
    }

    {
        let shared = shared.clone();
        sch.schedule(Coroutine::new(move || {
            shared.mutex.lock();
            shared.ready.store(true, Ordering::Relaxed);
            shared.mutex.unlock();
            shared.cv.notify_one();
        }));
    }

    assert!(!sch.run());
    assert!(woke.load(Ordering::Relaxed));
}

#[test]
fn notify_all_wakes_every_waiter() {
    let sch = Scheduler::new();
    let shared = Shared::new();
    let woken = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let shared = shared.clone();
        let woken = woken.clone();
        sch.schedule(Coroutine::new(move || {
            shared.mutex.lock();
            shared
                .cv
                .wait_while(&shared.mutex, || !shared.ready.load(Ordering::Relaxed));
            shared.mutex.unlock();
            woken.fetch_add(1, Ordering::Relaxed);
        }));
    }

    {
        let shared = shared.clone();
        sch.schedule(Coroutine::new(move || {
            shared.mutex.lock();
            shared.ready.store(true, Ordering::Relaxed);
            shared.mutex.unlock();
            shared.cv.notify_all();
        }));
    }

    let watch = woken.clone();
    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || {
        while watch.load(Ordering::Relaxed) < 3 {
            fibra::yield_now();
        }
        halter.halt();
    }));

    assert!(!sch.run());
    assert_eq!(woken.load(Ordering::Relaxed), 3);
}

#[test]
fn wait_timeout_expires_without_notification() {
    let shared = Shared::new();

    shared.mutex.lock();
    let started = Instant::now();
    let timed_out = shared.cv.wait_timeout(&shared.mutex, Duration::from_millis(50));
    shared.mutex.unlock();

    assert!(timed_out);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn wait_timeout_sees_an_early_notification() {
    let shared = Shared::new();

    let notifier = {
        let shared = shared.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shared.mutex.lock();
            shared.ready.store(true, Ordering::Relaxed);
            shared.mutex.unlock();
            shared.cv.notify_one();
        })
    };

    shared.mutex.lock();
    let timed_out = shared
        .cv
        .wait_timeout_while(&shared.mutex, Duration::from_secs(10), || {
            !shared.ready.load(Ordering::Relaxed)
        });
    shared.mutex.unlock();

    assert!(!timed_out);
    notifier.join().unwrap();
}

#[test]
fn timed_wait_works_from_a_coroutine() {
    let sch = Scheduler::new();
    let shared = Shared::new();
    let timed_out = Arc::new(AtomicBool::new(false));

    {
        let shared = shared.clone();
        let timed_out = timed_out.clone();
        let halter = sch.clone();
        sch.schedule(Coroutine::new(move || {
            shared.mutex.lock();
            let expired = shared.cv.wait_timeout(&shared.mutex, Duration::from_millis(30));
            shared.mutex.unlock();
            timed_out.store(expired, Ordering::Relaxed);
            halter.halt();
        }));
    }

    assert!(!sch.run());
    assert!(timed_out.load(Ordering::Relaxed));
}
