//! Threadpool: a fixed set of worker threads, each driving a scheduler.
//!
//! Work placed on a threadpool runs with genuine parallelism across
//! workers while staying cooperative within each one. New work goes to
//! the least-loaded worker, found by scanning [`Scheduler::measure`]
//! snapshots from a rotating start index.
//!
//! The free functions [`concurrent`], [`parallel`] and [`balance`] are
//! the recommended entry points for launching coroutines; they differ
//! only in which scheduler they pick.

use crate::config;
use crate::context;
use crate::coroutine::Coroutine;
use crate::scheduler::{Lifecycle, LifecycleState, Scheduler};
use crate::spin::Spinlock;

use once_cell::sync::Lazy;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

struct PoolState {
    /// Next worker to probe first in [`Threadpool::worker`]. Rotated to
    /// spread measurement cost, not to implement round-robin placement.
    probe_index: usize,
}

/// A fixed collection of schedulers, each driven by its own OS thread.
pub struct Threadpool {
    lk: Spinlock<PoolState>,

    /// Immutable after construction, so indexed access needs no lock.
    workers: Vec<Arc<Scheduler>>,

    handles: Spinlock<Vec<JoinHandle<()>>>,
    self_weak: Weak<Threadpool>,
}

impl Threadpool {
    /// Creates a pool with `worker_count` workers; `0` means one worker
    /// per hardware thread, minimum one.
    pub fn new(worker_count: usize) -> Arc<Threadpool> {
        let count = config::resolve_worker_count(worker_count);

        let pool = Arc::new_cyclic(|weak: &Weak<Threadpool>| Threadpool {
            lk: Spinlock::new(PoolState { probe_index: 0 }),
            workers: (0..count).map(|_| Scheduler::new()).collect(),
            handles: Spinlock::new(Vec::with_capacity(count)),
            self_weak: weak.clone(),
        });

        for (index, scheduler) in pool.workers.iter().enumerate() {
            let scheduler = scheduler.clone();
            let weak = pool.self_weak.clone();
            let handle = thread::Builder::new()
                .name(format!("fibra-worker-{index}"))
                .spawn(move || {
                    let _scope = context::enter_threadpool(weak);
                    tracing::trace!(worker = index, "threadpool worker started");
                    while scheduler.run() {}
                    tracing::trace!(worker = index, "threadpool worker stopped");
                })
                .expect("failed to spawn threadpool worker");
            pool.handles.lock().push(handle);
        }

        pool
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// The worker scheduler at a stable index.
    pub fn worker_at(&self, index: usize) -> Arc<Scheduler> {
        self.workers[index].clone()
    }

    /// All worker schedulers.
    pub fn workers(&self) -> Vec<Arc<Scheduler>> {
        self.workers.to_vec()
    }

    /// The least-loaded worker at the time of the call.
    ///
    /// Scans from a rotating start index and returns the first idle
    /// worker immediately; otherwise the lightest one found.
    pub fn worker(&self) -> Arc<Scheduler> {
        let count = self.workers.len();
        let start = self.next_probe_index();

        let mut best_index = start;
        let mut best_weight = self.workers[start].measure();

        for index in (start + 1..count).chain(0..start) {
            let weight = self.workers[index].measure();
            if usize::from(weight) == 0 {
                return self.workers[index].clone();
            }
            if weight < best_weight {
                best_weight = weight;
                best_index = index;
            }
        }

        self.workers[best_index].clone()
    }

    /// Least-loaded worker if the pool is imbalanced past the configured
    /// balance ratio, `None` otherwise.
    pub(crate) fn rebalance_target(&self) -> Option<Arc<Scheduler>> {
        let mut least_index = 0;
        let mut least = self.workers[0].measure();
        let mut most = least;

        for (index, worker) in self.workers.iter().enumerate().skip(1) {
            let weight = worker.measure();
            if weight < least {
                least_index = index;
                least = weight;
            } else if weight > most {
                most = weight;
            }
        }

        // An idle lightest worker divides to infinity, forcing a
        // rebalance; an entirely idle pool divides to NaN and does not.
        let ratio = most.scheduled() as f64 / least.scheduled() as f64;
        if ratio >= config::balance_ratio() {
            Some(self.workers[least_index].clone())
        } else {
            None
        }
    }

    fn next_probe_index(&self) -> usize {
        let mut lk = self.lk.lock();
        let index = lk.probe_index;
        lk.probe_index = (index + 1) % self.workers.len();
        index
    }
}

impl Lifecycle for Threadpool {
    fn state(&self) -> LifecycleState {
        let _lk = self.lk.lock();
        // All workers transition together, so the first one stands in
        // for the pool.
        self.workers[0].state()
    }

    fn suspend(&self) -> bool {
        let _lk = self.lk.lock();
        let mut all = true;
        for worker in &self.workers {
            all &= worker.suspend();
        }
        all
    }

    fn resume(&self) {
        let _lk = self.lk.lock();
        for worker in &self.workers {
            worker.resume();
        }
    }

    fn halt(&self) {
        {
            let _lk = self.lk.lock();
            for worker in &self.workers {
                if worker.state() != LifecycleState::Halted {
                    worker.halt();
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!(workers = self.workers.len(), "threadpool halted");
    }
}

impl Drop for Threadpool {
    fn drop(&mut self) {
        self.halt();
    }
}

impl std::fmt::Debug for Threadpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threadpool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// The process-wide default threadpool, created on first use and sized by
/// [`config::default_threadpool_size`].
pub fn default_threadpool() -> Arc<Threadpool> {
    static POOL: Lazy<Arc<Threadpool>> =
        Lazy::new(|| Threadpool::new(config::default_threadpool_size()));
    POOL.clone()
}

/// A fixed scheduler from the default threadpool, used as the fallback
/// destination for `concurrent` outside any scheduler.
fn default_scheduler() -> Arc<Scheduler> {
    static SCHEDULER: Lazy<Arc<Scheduler>> = Lazy::new(|| default_threadpool().worker_at(0));
    SCHEDULER.clone()
}

/// Scheduler `concurrent` would use: the current thread's scheduler when
/// there is one, for the cheapest possible communication, else a default
/// threadpool scheduler.
pub fn concurrent_scheduler() -> Arc<Scheduler> {
    context::this_scheduler().unwrap_or_else(default_scheduler)
}

/// Scheduler `parallel` would use: the least-loaded worker of the current
/// threadpool, else of the default threadpool.
pub fn parallel_scheduler() -> Arc<Scheduler> {
    match context::this_threadpool() {
        Some(pool) => pool.worker(),
        None => default_threadpool().worker(),
    }
}

/// Scheduler `balance` would use: the least-loaded worker when the
/// current threadpool's load spread exceeds the balance ratio, else the
/// same choice as [`concurrent_scheduler`].
pub fn balance_scheduler() -> Arc<Scheduler> {
    match context::this_threadpool() {
        Some(pool) => pool
            .rebalance_target()
            .unwrap_or_else(concurrent_scheduler),
        None => default_threadpool().worker(),
    }
}

/// Launches `f` as a coroutine, preferring the current thread's scheduler
/// for the lowest communication latency.
pub fn concurrent<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    concurrent_scheduler().schedule(Coroutine::new(f));
}

/// Launches `f` as a coroutine on the least-loaded threadpool worker,
/// preferring CPU spread over communication latency.
pub fn parallel<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    parallel_scheduler().schedule(Coroutine::new(f));
}

/// Launches `f` as a coroutine, rebalancing onto the least-loaded worker
/// only when the current pool's load spread calls for it.
pub fn balance<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    balance_scheduler().schedule(Coroutine::new(f));
}
