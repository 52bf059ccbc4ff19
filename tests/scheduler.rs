use fibra::{Coroutine, Lifecycle, LifecycleState, Scheduler, Unbuffered};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn halt_from_within_returns_false_and_drops_queued() {
    let sch = Scheduler::new();
    let executed = Arc::new(AtomicUsize::new(0));

    let halter = sch.clone();
    let count = executed.clone();
    sch.schedule(Coroutine::new(move || {
        count.fetch_add(1, Ordering::Relaxed);
        halter.halt();
        unreachable!("halted coroutine must not resume");
    }));

    let count = executed.clone();
    sch.schedule(Coroutine::new(move || {
        count.fetch_add(1, Ordering::Relaxed);
    }));

    assert!(!sch.run());
    assert_eq!(executed.load(Ordering::Relaxed), 1);
    assert_eq!(sch.state(), LifecycleState::Halted);
}

#[test]
fn suspend_returns_true_and_resume_reenters() {
    let sch = Scheduler::new();
    let steps = Arc::new(AtomicUsize::new(0));

    let suspender = sch.clone();
    let count = steps.clone();
    sch.schedule(Coroutine::new(move || {
        count.fetch_add(1, Ordering::Relaxed);
        assert!(suspender.suspend());
    }));

    assert!(sch.run());
    assert_eq!(steps.load(Ordering::Relaxed), 1);

    let halter = sch.clone();
    let count = steps.clone();
    sch.schedule(Coroutine::new(move || {
        count.fetch_add(1, Ordering::Relaxed);
        halter.halt();
    }));

    sch.resume();
    assert!(!sch.run());
    assert_eq!(steps.load(Ordering::Relaxed), 2);
}

#[test]
fn suspend_after_halt_returns_false() {
    let sch = Scheduler::new();
    sch.halt();
    assert!(!sch.suspend());
}

#[test]
fn halt_without_driver_completes_immediately() {
    let sch = Scheduler::new();
    sch.schedule(Coroutine::new(|| unreachable!("never driven")));
    sch.halt();
    assert_eq!(sch.state(), LifecycleState::Halted);
    assert!(!sch.run());
}

#[test]
fn schedule_after_halt_is_dropped() {
    let sch = Scheduler::new();
    sch.halt();
    sch.schedule(Coroutine::new(|| unreachable!("scheduled after halt")));
    assert_eq!(sch.measure().scheduled(), 0);
}

#[test]
fn schedule_many_preserves_order() {
    let sch = Scheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let coroutines: Vec<Coroutine> = (0..5)
        .map(|i| {
            let order = order.clone();
            Coroutine::new(move || order.lock().unwrap().push(i))
        })
        .collect();
    sch.schedule_many(coroutines);

    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || halter.halt()));

    assert!(!sch.run());
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn yielding_coroutines_interleave_fifo() {
    let sch = Scheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
        let order = order.clone();
        sch.schedule(Coroutine::new(move || {
            for round in 0..3 {
                order.lock().unwrap().push(format!("{name}{round}"));
                fibra::yield_now();
            }
        }));
    }

    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || halter.halt()));

    assert!(!sch.run());
    assert_eq!(
        *order.lock().unwrap(),
        vec!["a0", "b0", "a1", "b1", "a2", "b2"]
    );
}

#[test]
fn this_scheduler_resolves_to_the_driving_scheduler() {
    let sch = Scheduler::new();
    let matched = Arc::new(AtomicBool::new(false));

    let me = sch.clone();
    let flag = matched.clone();
    sch.schedule(Coroutine::new(move || {
        assert!(fibra::in_scheduler());
        assert!(fibra::in_coroutine());
        let current = fibra::this_scheduler().expect("inside a scheduler");
        flag.store(Arc::ptr_eq(&current, &me), Ordering::Relaxed);
        me.halt();
    }));

    assert!(!sch.run());
    assert!(matched.load(Ordering::Relaxed));
}

#[test]
fn second_concurrent_run_returns_false() {
    let sch = Scheduler::new();

    let driver = sch.clone();
    let handle = thread::spawn(move || driver.run());

    // Give the spawned driver time to claim the scheduler.
    thread::sleep(Duration::from_millis(100));
    assert!(!sch.run());

    sch.halt();
    assert!(!handle.join().unwrap());
}

#[test]
fn measure_tracks_enqueued_and_parked() {
    let sch = Scheduler::new();
    let ch: Unbuffered<i32> = Unbuffered::new();

    let rx = ch.clone();
    sch.schedule(Coroutine::new(move || {
        // Parks until the channel closes.
        assert_eq!(rx.recv(), None);
    }));

    assert_eq!(sch.measure().enqueued(), 1);
    assert_eq!(sch.measure().scheduled(), 1);

    let driver = sch.clone();
    let handle = thread::spawn(move || driver.run());

    {
        let sch = sch.clone();
        wait_until("receiver to park", move || sch.measure().blocked() == 1);
    }
    let parked = sch.measure();
    assert_eq!(parked.enqueued(), 0);
    assert_eq!(parked.scheduled(), 1);

    ch.close();
    {
        let sch = sch.clone();
        wait_until("receiver to finish", move || sch.measure().scheduled() == 0);
    }

    sch.halt();
    handle.join().unwrap();
}

#[test]
fn panicking_coroutine_propagates_and_scheduler_survives() {
    let sch = Scheduler::new();
    sch.schedule(Coroutine::new(|| panic!("kaboom")));

    let driver = sch.clone();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || driver.run()));
    assert!(outcome.is_err());

    // The scheduler is still usable after the panic was caught.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || {
        flag.store(true, Ordering::Relaxed);
        halter.halt();
    }));
    assert!(!sch.run());
    assert!(ran.load(Ordering::Relaxed));
}

#[test]
fn child_scheduler_runs_inside_parent_coroutine() {
    let parent = Scheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    let parent_handle = parent.clone();
    parent.schedule(Coroutine::new(move || {
        log.lock().unwrap().push("parent:start");

        let child = Scheduler::new();
        let child_handle = child.clone();
        let child_log = log.clone();
        child.schedule(Coroutine::new(move || {
            child_log.lock().unwrap().push("child:task");
            child_handle.halt();
        }));

        assert!(!child.run());
        log.lock().unwrap().push("parent:end");
        parent_handle.halt();
    }));

    assert!(!parent.run());
    assert_eq!(
        *order.lock().unwrap(),
        vec!["parent:start", "child:task", "parent:end"]
    );
}

#[test]
fn halt_from_foreign_thread_waits_for_driver() {
    let sch = Scheduler::new();

    let spinner = sch.clone();
    sch.schedule(Coroutine::new(move || loop {
        if spinner.state() == LifecycleState::Halted {
            break;
        }
        fibra::yield_now();
    }));

    let driver = sch.clone();
    let handle = thread::spawn(move || driver.run());
    thread::sleep(Duration::from_millis(50));

    // Blocks until the driver has fully stopped.
    sch.halt();
    assert_eq!(sch.state(), LifecycleState::Halted);
    assert!(!handle.join().unwrap());
}
