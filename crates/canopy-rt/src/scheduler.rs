//! Fixed-pool work-stealing scheduler.
//!
//! One deque per worker; the launching thread participates as worker 0 and
//! workers 1..N run on spawned threads. Each worker loops: pop its own
//! deque (LIFO), steal round-robin from the others (FIFO), drain the
//! external injector, and only then back off toward sleep.
//!
//! Sleep/wake is mediated by a generation counter so that the cost of
//! waking is paid by threads transitioning from idle to busy, not by every
//! push. A worker about to sleep declares itself, re-probes every queue,
//! and then waits on the generation with a bounded timeout; a worker that
//! finds work after sleepers have declared bumps the generation and
//! notifies. The timeout bounds the damage of any lost notification.
//!
//! A stop flag, typically raised by the final continuation of the phase's
//! root fork/join, ends the loops: workers observing it drain nothing
//! further and exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::arena;
use crate::deque::WorkStealingDeque;
use crate::error::RuntimeError;
use crate::task::RawTask;
use crate::termination::TerminationBarrier;

const SLEEP_TIMEOUT: Duration = Duration::from_secs(1);

struct SleepGate {
    /// Bumped by wakers; sleepers wait for it to move.
    generation: CachePadded<AtomicU64>,
    /// Bumped by each worker declaring sleep; busy workers compare it
    /// against a cached value to decide whether a wake is owed.
    declared: CachePadded<AtomicU64>,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SleepGate {
    fn new() -> SleepGate {
        SleepGate {
            generation: CachePadded::new(AtomicU64::new(0)),
            declared: CachePadded::new(AtomicU64::new(0)),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn wake_all(&self) {
        let _guard = self.mutex.lock();
        self.generation.fetch_add(1, Ordering::Release);
        self.condvar.notify_all();
    }
}

pub(crate) struct Shared {
    deques: Box<[WorkStealingDeque]>,
    injector: SegQueue<RawTask>,
    stop: AtomicBool,
    sleep: SleepGate,
    termination: TerminationBarrier,
}

/// Handle to the pool. Single-phase: start it, run work to completion, let
/// the final continuation request stop, then join.
pub struct Scheduler {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Bring up a pool of `worker_count` workers. Workers 1..N are spawned;
    /// worker 0 is the calling thread and participates via [`Scheduler::run`].
    pub fn start(worker_count: usize) -> Result<Scheduler, RuntimeError> {
        if worker_count == 0 {
            return Err(RuntimeError::NoWorkers);
        }
        let deques = (0..worker_count)
            .map(|_| WorkStealingDeque::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shared = Arc::new(Shared {
            deques,
            injector: SegQueue::new(),
            stop: AtomicBool::new(false),
            sleep: SleepGate::new(),
            termination: TerminationBarrier::new(0),
        });
        let mut handles = Vec::with_capacity(worker_count.saturating_sub(1));
        for index in 1..worker_count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("canopy-worker-{index}"))
                .spawn(move || {
                    arena::initialize();
                    Worker::new(shared, index).run();
                    arena::finalize();
                })
                .map_err(RuntimeError::Spawn)?;
            handles.push(handle);
        }
        log::info!("scheduler started with {} workers", worker_count);
        Ok(Scheduler { shared, handles })
    }

    /// Default pool size for this host.
    pub fn default_worker_count() -> usize {
        num_cpus::get().max(2)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.deques.len()
    }

    /// Participate as worker 0 until stop. `startup` runs first on this
    /// thread with the worker handle, and is the place to schedule the
    /// phase's root task.
    pub fn run<F: FnOnce(&Worker)>(&self, startup: F) {
        if !arena::is_initialized() {
            arena::initialize();
        }
        let worker = Worker::new(self.shared.clone(), 0);
        startup(&worker);
        worker.run();
    }

    /// Submit a task from outside the pool.
    pub fn inject(&self, task: RawTask) {
        self.shared.injector.push(task);
        self.shared.sleep.wake_all();
    }

    /// Raise the stop flag and wake every sleeper.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// All started workers are currently asleep or exited.
    pub fn is_quiescent(&self) -> bool {
        self.shared.termination.is_terminated()
    }

    /// Join the spawned workers. Call after stop has been requested.
    pub fn join(mut self) {
        for handle in self.handles.drain(..) {
            handle.join().expect("worker thread panicked");
        }
        log::info!("scheduler joined");
    }
}

impl Shared {
    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.sleep.wake_all();
    }
}

/// Per-thread execution context handed to every task resumption.
pub struct Worker {
    shared: Arc<Shared>,
    index: usize,
    seen_declared: std::cell::Cell<u64>,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, index: usize) -> Worker {
        Worker {
            shared,
            index,
            seen_declared: std::cell::Cell::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Schedule a task onto this worker's own deque.
    pub fn schedule(&self, task: RawTask) {
        self.shared.deques[self.index].push(task);
    }

    /// Raise the pool's stop flag. Used by final continuations.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// Pay the wake debt after an idle-to-busy transition: if any peer has
    /// declared sleep since we last looked, bump the generation and notify.
    fn note_busy(&self) {
        let declared = self.shared.sleep.declared.load(Ordering::Relaxed);
        if declared != self.seen_declared.get() {
            self.seen_declared.set(declared);
            self.shared.sleep.wake_all();
        }
    }

    fn execute(&self, task: RawTask) {
        let mut current = task;
        loop {
            // Symmetric transfer: a completed latch hands back its
            // continuation and we run it without touching the deque.
            match unsafe { current.resume(self) } {
                Some(next) => current = next,
                None => break,
            }
        }
    }

    fn find_work(&self) -> Option<RawTask> {
        let deques = &self.shared.deques;
        if let Some(task) = deques[self.index].pop() {
            return Some(task);
        }
        for offset in 1..deques.len() {
            let victim = (self.index + offset) % deques.len();
            if let Some(task) = deques[victim].steal() {
                return Some(task);
            }
        }
        self.shared.injector.pop()
    }

    fn has_visible_work(&self) -> bool {
        let deques = &self.shared.deques;
        deques.iter().enumerate().any(|(other, deque)| {
            if other == self.index {
                deque.can_pop()
            } else {
                deque.can_steal()
            }
        }) || !self.shared.injector.is_empty()
    }

    /// Declare sleep, re-probe everything, then wait for the generation to
    /// move or the timeout to lapse.
    fn sleep(&self) {
        let gate = &self.shared.sleep;
        let observed = gate.generation.load(Ordering::Relaxed);
        gate.declared.fetch_add(1, Ordering::Relaxed);
        self.shared.termination.set_inactive();
        if self.shared.termination.is_terminated() {
            log::trace!("worker {}: pool quiescent", self.index);
        }
        if !self.has_visible_work() && !self.shared.stop.load(Ordering::Acquire) {
            let mut guard = gate.mutex.lock();
            while gate.generation.load(Ordering::Relaxed) == observed
                && !self.shared.stop.load(Ordering::Acquire)
            {
                let result = gate
                    .condvar
                    .wait_for(&mut guard, SLEEP_TIMEOUT);
                if result.timed_out() {
                    break;
                }
            }
        }
        self.shared.termination.set_active();
    }

    pub(crate) fn run(&self) {
        log::debug!("worker {} entering loop", self.index);
        self.shared.termination.set_active();
        let mut backoff = Backoff::new();
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            if let Some(task) = self.find_work() {
                self.note_busy();
                self.execute(task);
                backoff = Backoff::new();
                continue;
            }
            if backoff.is_completed() {
                self.sleep();
                backoff = Backoff::new();
            } else {
                backoff.snooze();
            }
        }
        self.shared.termination.set_inactive();
        log::debug!("worker {} exiting", self.index);
    }
}
