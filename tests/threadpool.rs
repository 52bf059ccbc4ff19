use fibra::{Lifecycle, LifecycleState, Threadpool, Unbuffered};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
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
fn zero_workers_means_hardware_concurrency() {
    let expected = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let pool = Threadpool::new(0);
    assert_eq!(pool.size(), expected);
    pool.halt();
}

#[test]
fn worker_indices_are_stable() {
    let pool = Threadpool::new(3);
    let workers = pool.workers();
    assert_eq!(workers.len(), 3);
    for (index, worker) in workers.iter().enumerate() {
        assert!(Arc::ptr_eq(worker, &pool.worker_at(index)));
    }
    pool.halt();
}

#[test]
fn tasks_run_on_all_workers() {
    let pool = Threadpool::new(2);
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..32 {
        let completed = completed.clone();
        pool.worker().schedule_fn(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    {
        let completed = completed.clone();
        wait_until("all tasks to finish", move || {
            completed.load(Ordering::Relaxed) == 32
        });
    }
    pool.halt();
}

#[test]
fn worker_selection_prefers_the_least_loaded() {
    let pool = Threadpool::new(4);
    let gate: Unbuffered<()> = Unbuffered::new();

    // Pin some blocked load onto worker 0.
    for _ in 0..8 {
        let rx = gate.clone();
        pool.worker_at(0).schedule_fn(move || {
            rx.recv();
        });
    }
    {
        let pool = pool.clone();
        wait_until("load to park on worker 0", move || {
            pool.worker_at(0).measure().scheduled() == 8
        });
    }

    // An idle worker must win over the loaded one.
    let choice = pool.worker();
    assert!(!Arc::ptr_eq(&choice, &pool.worker_at(0)));

    gate.close();
    pool.halt();
}

#[test]
fn balance_keeps_the_load_spread_bounded() {
    let pool = Threadpool::new(4);
    let gate: Unbuffered<()> = Unbuffered::new();
    let launched = Arc::new(AtomicUsize::new(0));

    // From a single worker, launch 100 tasks that all block on one
    // channel, letting `balance` pick each task's destination.
    {
        let gate = gate.clone();
        let launched = launched.clone();
        pool.worker_at(0).schedule_fn(move || {
            for _ in 0..100 {
                let rx = gate.clone();
                fibra::balance(move || {
                    rx.recv();
                });
                launched.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    {
        let pool = pool.clone();
        wait_until("all tasks to park", move || {
            let scheduled: usize = (0..4).map(|i| pool.worker_at(i).measure().scheduled()).sum();
            let enqueued: usize = (0..4).map(|i| pool.worker_at(i).measure().enqueued()).sum();
            scheduled == 100 && enqueued == 0
        });
    }

    let loads: Vec<usize> = (0..4)
        .map(|i| pool.worker_at(i).measure().scheduled())
        .collect();
    let most = *loads.iter().max().unwrap();
    let least = *loads.iter().min().unwrap();
    assert!(
        (most as f64) <= (least.max(1) as f64) * fibra::balance_ratio() + 2.0,
        "load spread too wide: {loads:?}"
    );

    gate.close();
    {
        let pool = pool.clone();
        wait_until("tasks to drain", move || {
            (0..4).map(|i| pool.worker_at(i).measure().scheduled()).sum::<usize>() == 0
        });
    }
    pool.halt();
}

#[test]
fn concurrent_stays_on_the_current_scheduler() {
    let pool = Threadpool::new(2);
    let matched = Arc::new(AtomicUsize::new(0));

    {
        let matched = matched.clone();
        pool.worker_at(1).schedule_fn(move || {
            let me = fibra::this_scheduler().expect("on a worker");
            let matched = matched.clone();
            fibra::concurrent(move || {
                let child_home = fibra::this_scheduler().expect("on a worker");
                if Arc::ptr_eq(&me, &child_home) {
                    matched.fetch_add(1, Ordering::Relaxed);
                }
            });
        });
    }

    {
        let matched = matched.clone();
        wait_until("child to run on its parent's scheduler", move || {
            matched.load(Ordering::Relaxed) == 1
        });
    }
    pool.halt();
}

#[test]
fn suspend_and_resume_broadcast_to_all_workers() {
    let pool = Threadpool::new(2);

    assert!(pool.suspend());
    wait_until("workers to settle suspended", {
        let pool = pool.clone();
        move || pool.state() == LifecycleState::Suspended
    });

    // Work scheduled while suspended only runs after resume.
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = ran.clone();
        pool.worker_at(0).schedule_fn(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ran.load(Ordering::Relaxed), 0);

    pool.resume();
    {
        let ran = ran.clone();
        wait_until("suspended work to run after resume", move || {
            ran.load(Ordering::Relaxed) == 1
        });
    }

    pool.halt();
    assert_eq!(pool.state(), LifecycleState::Halted);
}

#[test]
fn halted_pool_drops_new_work() {
    let pool = Threadpool::new(1);
    pool.halt();

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    pool.worker_at(0).schedule_fn(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::Relaxed), 0);
}
