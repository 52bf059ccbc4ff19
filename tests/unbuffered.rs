use fibra::{Chan, Coroutine, Lifecycle, Scheduler, TryResult, Unbuffered};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn rendezvous_between_two_coroutines() {
    let sch = Scheduler::new();
    let ch: Unbuffered<i32> = Unbuffered::new();

    let tx = ch.clone();
    sch.schedule(Coroutine::new(move || {
        assert!(tx.send(7));
    }));

    let rx = ch.clone();
    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || {
        assert_eq!(rx.recv(), Some(7));
        halter.halt();
    }));

    assert!(!sch.run());
}

#[test]
fn values_arrive_in_send_order() {
    let sch = Scheduler::new();
    let ch: Unbuffered<usize> = Unbuffered::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let tx = ch.clone();
    sch.schedule(Coroutine::new(move || {
        for i in 0..10 {
            assert!(tx.send(i));
        }
    }));

    let rx = ch.clone();
    let log = seen.clone();
    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || {
        for _ in 0..10 {
            log.lock().unwrap().push(rx.recv().unwrap());
        }
        halter.halt();
    }));

    assert!(!sch.run());
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn ping_pong_ten_rounds() {
    const ROUNDS: usize = 10;

    let sch = Scheduler::new();
    let ping: Unbuffered<usize> = Unbuffered::new();
    let pong: Unbuffered<usize> = Unbuffered::new();
    let transfers = Arc::new(AtomicUsize::new(0));
    let partner_done = Arc::new(AtomicBool::new(false));

    {
        let (ping, pong) = (ping.clone(), pong.clone());
        let transfers = transfers.clone();
        let partner_done = partner_done.clone();
        sch.schedule(Coroutine::new(move || {
            for round in 0..ROUNDS {
                let value = ping.recv().unwrap();
                assert_eq!(value, round);
                transfers.fetch_add(1, Ordering::Relaxed);
                assert!(pong.send(value));
                transfers.fetch_add(1, Ordering::Relaxed);
            }
            partner_done.store(true, Ordering::Relaxed);
        }));
    }

    {
        let (ping, pong) = (ping.clone(), pong.clone());
        let transfers = transfers.clone();
        let halter = sch.clone();
        sch.schedule(Coroutine::new(move || {
            for round in 0..ROUNDS {
                assert!(ping.send(round));
                transfers.fetch_add(1, Ordering::Relaxed);
                assert_eq!(pong.recv(), Some(round));
                transfers.fetch_add(1, Ordering::Relaxed);
            }
            // Let the partner finish its bookkeeping before halting.
            while !partner_done.load(Ordering::Relaxed) {
                fibra::yield_now();
            }
            halter.halt();
        }));
    }

    assert!(!sch.run());
    assert_eq!(transfers.load(Ordering::Relaxed), 4 * ROUNDS);
}

#[test]
fn close_unblocks_all_parked_receivers() {
    let sch = Scheduler::new();
    let channels: Vec<Unbuffered<i32>> = (0..3).map(|_| Unbuffered::new()).collect();
    let done: Chan<()> = Chan::from(fibra::Buffered::new(3));

    for ch in &channels {
        let rx = ch.clone();
        let ack = done.clone();
        sch.schedule(Coroutine::new(move || {
            assert_eq!(rx.recv(), None);
            assert!(ack.send(()));
        }));
    }

    {
        let channels = channels.clone();
        sch.schedule(Coroutine::new(move || {
            for ch in &channels {
                ch.close();
            }
        }));
    }

    {
        let done = done.clone();
        let halter = sch.clone();
        sch.schedule(Coroutine::new(move || {
            for _ in 0..3 {
                done.recv().unwrap();
            }
            halter.halt();
        }));
    }

    assert!(!sch.run());
    assert!(channels.iter().all(|ch| ch.closed()));
}

#[test]
fn close_unblocks_parked_senders() {
    let sch = Scheduler::new();
    let ch: Unbuffered<i32> = Unbuffered::new();
    let failures = Arc::new(AtomicUsize::new(0));

    for value in 0..2 {
        let tx = ch.clone();
        let failures = failures.clone();
        sch.schedule(Coroutine::new(move || {
            if !tx.send(value) {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    let closer = ch.clone();
    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || {
        closer.close();
        halter.halt();
    }));

    assert!(!sch.run());
    assert_eq!(failures.load(Ordering::Relaxed), 2);
}

#[test]
fn closing_twice_is_a_no_op() {
    let ch: Unbuffered<i32> = Unbuffered::new();
    ch.close();
    ch.close();
    assert!(ch.closed());
}

#[test]
fn try_ops_fail_cleanly_without_a_peer() {
    let ch: Unbuffered<i32> = Unbuffered::new();
    assert_eq!(ch.try_send(1), TryResult::Failure);
    assert!(ch.try_recv().is_failure());

    ch.close();
    assert_eq!(ch.try_send(1), TryResult::Closed);
    assert!(ch.try_recv().is_closed());
}

#[test]
fn try_recv_loop_lets_the_sender_run() {
    let sch = Scheduler::new();
    let ch: Unbuffered<i32> = Unbuffered::new();
    let failures = Arc::new(AtomicUsize::new(0));

    // The receiver spins on try_recv. Each failed attempt yields, which
    // is the only reason the sender ever gets a slice on this scheduler.
    {
        let rx = ch.clone();
        let failures = failures.clone();
        let halter = sch.clone();
        sch.schedule(Coroutine::new(move || {
            let value = loop {
                match rx.try_recv() {
                    TryResult::Success(v) => break v,
                    TryResult::Failure => {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                    TryResult::Closed => panic!("channel unexpectedly closed"),
                }
            };
            assert_eq!(value, 42);
            halter.halt();
        }));
    }

    let tx = ch.clone();
    sch.schedule(Coroutine::new(move || {
        assert!(tx.send(42));
    }));

    assert!(!sch.run());
    assert!(failures.load(Ordering::Relaxed) >= 1);
}

#[test]
fn rendezvous_across_threads() {
    let ch: Unbuffered<String> = Unbuffered::new();

    let tx = ch.clone();
    let sender = thread::spawn(move || {
        assert!(tx.send(String::from("hello")));
    });

    assert_eq!(ch.recv().as_deref(), Some("hello"));
    sender.join().unwrap();
}

#[test]
fn iterator_drains_until_close() {
    let sch = Scheduler::new();
    let ch: Unbuffered<usize> = Unbuffered::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let tx = ch.clone();
    sch.schedule(Coroutine::new(move || {
        for i in 0..5 {
            assert!(tx.send(i));
        }
        tx.close();
    }));

    let rx = ch.clone();
    let log = seen.clone();
    let halter = sch.clone();
    sch.schedule(Coroutine::new(move || {
        for value in &rx {
            log.lock().unwrap().push(value);
        }
        halter.halt();
    }));

    assert!(!sch.run());
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}
