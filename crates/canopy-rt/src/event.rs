//! Awaitable one-shot synchronizers.
//!
//! Lighter-weight cousins of the fork/join latch for tasks that want to
//! wait on a condition rather than on child completions. All of them park
//! a continuation handle in an atomic word and schedule it onto the
//! releasing worker's deque when the condition fires; none of them block a
//! thread.

use std::sync::atomic::{fence, AtomicIsize, AtomicUsize, Ordering};

use crate::latch::Wait;
use crate::scheduler::Worker;
use crate::task::RawTask;

const NONSIGNALED: usize = 0;
const SIGNALED: usize = 1;

/// Single-consumer manual-reset event.
///
/// One task may wait; any thread may set. Setting an already-set event is
/// a no-op. `reset` only succeeds between waits.
pub struct ManualResetEvent {
    state: AtomicUsize,
}

impl ManualResetEvent {
    pub const fn new() -> ManualResetEvent {
        ManualResetEvent {
            state: AtomicUsize::new(NONSIGNALED),
        }
    }

    /// Signal the event, scheduling the awaiter if one is parked.
    pub fn set(&self, worker: &Worker) {
        let observed = self.state.swap(SIGNALED, Ordering::Release);
        match observed {
            NONSIGNALED | SIGNALED => {}
            address => {
                fence(Ordering::Acquire);
                worker.schedule(unsafe { RawTask::from_addr(address) });
            }
        }
    }

    /// Drop the signal. Establishes no ordering.
    pub fn reset(&self) {
        let _ = self.state.compare_exchange(
            SIGNALED,
            NONSIGNALED,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Proceed if already signaled, otherwise park `continuation`.
    pub fn try_wait(&self, continuation: RawTask) -> Wait {
        if self.state.load(Ordering::Acquire) == SIGNALED {
            return Wait::Ready;
        }
        match self.state.compare_exchange(
            NONSIGNALED,
            continuation.addr(),
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Wait::Pending,
            Err(_) => Wait::Ready,
        }
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        ManualResetEvent::new()
    }
}

/// Single-consumer countdown: the inner event fires when the count reaches
/// zero.
pub struct CountdownEvent {
    count: AtomicIsize,
    inner: ManualResetEvent,
}

impl CountdownEvent {
    pub const fn new(count: isize) -> CountdownEvent {
        CountdownEvent {
            count: AtomicIsize::new(count),
            inner: ManualResetEvent::new(),
        }
    }

    pub fn decrement(&self, worker: &Worker) {
        let remaining = self.count.fetch_sub(1, Ordering::Release) - 1;
        debug_assert!(remaining >= 0, "countdown below zero");
        if remaining == 0 {
            fence(Ordering::Acquire);
            self.inner.set(worker);
        }
    }

    pub fn try_wait(&self, continuation: RawTask) -> Wait {
        self.inner.try_wait(continuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::Latch;
    use crate::scheduler::Scheduler;
    use crate::task::{allocate, fork, Frame, Step};
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicBool;

    struct SetterStep {
        event: *const ManualResetEvent,
        latch: *const Latch,
    }
    unsafe impl Send for SetterStep {}

    impl Step for SetterStep {
        fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
            let state = unsafe { Frame::state(frame) };
            unsafe {
                (*state.event).set(worker);
                (*state.latch).complete()
            }
        }
    }

    struct WaiterStep {
        event: *const ManualResetEvent,
        woke: *const AtomicBool,
        latch: *const Latch,
    }
    unsafe impl Send for WaiterStep {}

    impl Step for WaiterStep {
        fn resume(frame: NonNull<Frame<Self>>, _worker: &Worker) -> Option<RawTask> {
            let state = unsafe { Frame::state(frame) };
            let event = unsafe { &*state.event };
            if !unsafe { (*state.woke).load(Ordering::Relaxed) } {
                // First resumption: either proceed or park until set.
                unsafe { (*state.woke).store(true, Ordering::Relaxed) };
                if event.try_wait(Frame::handle(frame)) == Wait::Pending {
                    return None;
                }
            }
            unsafe { (*state.latch).complete() }
        }
    }

    struct FinishStep {
        done: *const AtomicBool,
    }
    unsafe impl Send for FinishStep {}

    impl Step for FinishStep {
        fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
            let state = unsafe { Frame::state(frame) };
            unsafe { (*state.done).store(true, Ordering::Release) };
            worker.request_stop();
            None
        }
    }

    #[test]
    fn set_resumes_a_parked_waiter() {
        let pool = Scheduler::start(2).unwrap();
        let event = ManualResetEvent::new();
        let woke = AtomicBool::new(false);
        let done = AtomicBool::new(false);
        let latch = Latch::new();
        pool.run(|worker| {
            fork(
                worker,
                &latch,
                WaiterStep {
                    event: &event,
                    woke: &woke,
                    latch: &latch,
                },
            );
            fork(
                worker,
                &latch,
                SetterStep {
                    event: &event,
                    latch: &latch,
                },
            );
            let finish = allocate(FinishStep { done: &done });
            if latch.try_wait(finish) == Wait::Ready {
                done.store(true, Ordering::Release);
                worker.request_stop();
            }
        });
        assert!(done.load(Ordering::Acquire));
        assert!(woke.load(Ordering::Relaxed));
        pool.join();
    }

    #[test]
    fn set_before_wait_is_ready() {
        let event = ManualResetEvent::new();
        event.state.store(SIGNALED, Ordering::Relaxed);
        let header: &'static mut crate::task::Header =
            Box::leak(Box::new(crate::task::Header::dead()));
        let continuation = unsafe { RawTask::from_ptr(header) };
        assert_eq!(event.try_wait(continuation), Wait::Ready);
        event.reset();
        assert_eq!(event.state.load(Ordering::Relaxed), NONSIGNALED);
    }
}
