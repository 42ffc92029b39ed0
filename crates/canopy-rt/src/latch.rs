//! Fork/join latch.
//!
//! A counting synchronizer that resumes exactly one continuation when all
//! registered forks have completed. The registration count (`pending`) is
//! owner-only and non-atomic: during the fork phase a single task owns the
//! latch and increments it per fork. The atomic `count` only absorbs
//! `pending` when the owner awaits, which lets the fork loop run entirely
//! inside the scheduler instead of suspending per fork. Completions may
//! arrive before the await, driving `count` negative; the fold at await
//! time makes the sum come out right.
//!
//! The continuation word encodes three states: `NONSIGNALED`, `SIGNALED`,
//! or the address of the awaiting task. Completion publishes `SIGNALED`
//! with release ordering and hands back any installed task; the await
//! installs with a release CAS whose failure means completion already won
//! and the awaiter proceeds inline.
//!
//! A latch is good for exactly one await. Awaiting twice is a programming
//! error and trips a debug assertion.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicIsize, AtomicUsize, Ordering};

use crate::task::RawTask;

const NONSIGNALED: usize = 0;
const SIGNALED: usize = 1;

/// Outcome of [`Latch::try_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// All forks already completed; continue inline.
    Ready,
    /// The continuation is installed and will be resumed by the last
    /// completion.
    Pending,
}

pub struct Latch {
    count: AtomicIsize,
    continuation: AtomicUsize,
    pending: Cell<isize>,
    awaited: Cell<bool>,
}

// `pending` and `awaited` are owner-only during the fork phase; everything
// cross-thread is atomic.
unsafe impl Send for Latch {}
unsafe impl Sync for Latch {}

impl Latch {
    pub const fn new() -> Latch {
        Latch {
            count: AtomicIsize::new(0),
            continuation: AtomicUsize::new(NONSIGNALED),
            pending: Cell::new(0),
            awaited: Cell::new(false),
        }
    }

    /// Owner only: note one forked child. Folded into `count` at await.
    pub fn register_fork(&self) {
        self.pending.set(self.pending.get() + 1);
    }

    /// Number of forks registered and not yet awaited into.
    pub fn pending(&self) -> isize {
        self.pending.get()
    }

    /// One child completed. Returns the continuation to run when this was
    /// the last outstanding completion.
    pub fn complete(&self) -> Option<RawTask> {
        let observed = self.count.fetch_sub(1, Ordering::Release);
        if observed != 1 {
            return None;
        }
        fence(Ordering::Acquire);
        self.take_continuation()
    }

    fn take_continuation(&self) -> Option<RawTask> {
        let observed = self.continuation.swap(SIGNALED, Ordering::Release);
        debug_assert_ne!(observed, SIGNALED, "latch signaled twice");
        if observed == NONSIGNALED {
            None
        } else {
            fence(Ordering::Acquire);
            Some(unsafe { RawTask::from_addr(observed) })
        }
    }

    /// Owner only: fold `pending` into `count` and either proceed (all
    /// children already finished, or none were forked) or install
    /// `continuation` for the last completion to resume.
    pub fn try_wait(&self, continuation: RawTask) -> Wait {
        debug_assert!(!self.awaited.replace(true), "latch awaited twice");
        let pending = self.pending.replace(0);
        if pending == 0 {
            return Wait::Ready;
        }
        let count = self.count.fetch_add(pending, Ordering::Relaxed) + pending;
        if count == 0 {
            fence(Ordering::Acquire);
            return Wait::Ready;
        }
        match self.continuation.compare_exchange(
            NONSIGNALED,
            continuation.addr(),
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Wait::Pending,
            // Completion raced us to the signal; resume inline.
            Err(_) => Wait::Ready,
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Header;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::thread;

    fn handle() -> RawTask {
        let header: &'static mut Header = Box::leak(Box::new(Header::dead()));
        unsafe { RawTask::from_ptr(header) }
    }

    #[test]
    fn zero_forks_is_immediately_ready() {
        let latch = Latch::new();
        assert_eq!(latch.try_wait(handle()), Wait::Ready);
    }

    #[test]
    fn completions_before_await_short_circuit() {
        let latch = Latch::new();
        latch.register_fork();
        latch.register_fork();
        assert_eq!(latch.complete(), None);
        assert_eq!(latch.complete(), None);
        assert_eq!(latch.try_wait(handle()), Wait::Ready);
    }

    #[test]
    fn last_completion_hands_back_the_continuation() {
        let latch = Latch::new();
        latch.register_fork();
        latch.register_fork();
        let continuation = handle();
        assert_eq!(latch.try_wait(continuation), Wait::Pending);
        assert_eq!(latch.complete(), None);
        assert_eq!(latch.complete(), Some(continuation));
    }

    /// Sixty-four completions from four threads resume the continuation
    /// exactly once, whether or not they race the await.
    #[test]
    fn exactly_one_resumption_under_contention() {
        for _ in 0..200 {
            let latch = Latch::new();
            let resumed = Counter::new(0);
            for _ in 0..64 {
                latch.register_fork();
            }
            let continuation = handle();
            thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        for _ in 0..16 {
                            if latch.complete().is_some() {
                                resumed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                }
                if latch.try_wait(continuation) == Wait::Ready {
                    resumed.fetch_add(1, Ordering::Relaxed);
                }
            });
            assert_eq!(resumed.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    #[should_panic(expected = "latch awaited twice")]
    #[cfg(debug_assertions)]
    fn second_await_is_rejected() {
        let latch = Latch::new();
        let _ = latch.try_wait(handle());
        let _ = latch.try_wait(handle());
    }
}
