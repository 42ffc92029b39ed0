//! Continuation tasks.
//!
//! A task is an arena-allocated state machine standing in for a suspendable
//! function. Its frame begins with a [`Header`] whose first word is the
//! resume function pointer, so the pointer-sized handle [`RawTask`] is all
//! the scheduler ever moves around: deque slots, latch continuation words,
//! and the injector all traffic in single words.
//!
//! Lifecycle:
//! - [`fork`] registers the child on a parent latch and schedules it onto
//!   the current worker's deque (the initial suspend).
//! - The body runs when a worker resumes the handle. Multi-stage tasks
//!   record their stage in the frame and re-install themselves as a latch
//!   continuation to wait for forked children.
//! - Completion decrements the parent latch; if that was the last
//!   completion, resume returns the latch's continuation and the worker
//!   runs it immediately (symmetric transfer). Frames are never freed
//!   individually; the arena reclaims them at the next phase boundary.

use std::ptr::NonNull;

use crate::arena;
use crate::latch::Latch;
use crate::scheduler::Worker;

/// First words of every task frame: the resume entry point.
#[repr(C)]
pub struct Header {
    resume: unsafe fn(NonNull<Header>, &Worker) -> Option<RawTask>,
}

impl Header {
    /// A handle that must never be resumed. Placeholder for tests and
    /// diagnostics.
    pub(crate) fn dead() -> Header {
        unsafe fn never(_frame: NonNull<Header>, _worker: &Worker) -> Option<RawTask> {
            unreachable!("dead task resumed")
        }
        Header { resume: never }
    }
}

/// Pointer-sized task handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RawTask(NonNull<Header>);

// Handles move freely between workers; the frames they point at are only
// ever resumed by one worker at a time.
unsafe impl Send for RawTask {}
unsafe impl Sync for RawTask {}

impl RawTask {
    pub fn as_ptr(self) -> *mut Header {
        self.0.as_ptr()
    }

    /// # Safety
    /// `ptr` must point at a live task frame (or never be resumed).
    pub unsafe fn from_ptr(ptr: *mut Header) -> RawTask {
        RawTask(NonNull::new_unchecked(ptr))
    }

    /// Address form, used by the latch to pack a handle into its
    /// continuation word. Frames are at least word-aligned, so addresses
    /// never collide with the latch sentinels.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// `addr` must have come from [`RawTask::addr`].
    pub unsafe fn from_addr(addr: usize) -> RawTask {
        RawTask(NonNull::new_unchecked(addr as *mut Header))
    }

    /// Run one resumption. Returns the task to run next, if the resumed
    /// task handed one over.
    ///
    /// # Safety
    /// The handle must point at a live frame, and only one worker may
    /// resume it at a time.
    pub unsafe fn resume(self, worker: &Worker) -> Option<RawTask> {
        (self.0.as_ref().resume)(self.0, worker)
    }
}

/// A task frame: header followed by the state machine.
#[repr(C)]
pub struct Frame<S> {
    header: Header,
    state: S,
}

impl<S: Step> Frame<S> {
    /// The frame's own handle, for re-installing as a latch continuation.
    pub fn handle(frame: NonNull<Frame<S>>) -> RawTask {
        RawTask(frame.cast())
    }

    /// The state behind a frame pointer.
    ///
    /// # Safety
    /// Caller must be the (sole) resuming worker of this frame.
    pub unsafe fn state<'a>(frame: NonNull<Frame<S>>) -> &'a mut S {
        &mut (*frame.as_ptr()).state
    }
}

/// State machine body of a task.
///
/// `resume` is entered every time the scheduler runs the task: once after
/// the initial suspend, and once per continuation installed on a latch.
/// Returning `Some(next)` transfers control to `next` without touching the
/// deque.
pub trait Step: Send + 'static {
    fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask>
    where
        Self: Sized;
}

unsafe fn trampoline<S: Step>(header: NonNull<Header>, worker: &Worker) -> Option<RawTask> {
    S::resume(header.cast(), worker)
}

/// Allocate a frame for `state` from this thread's arena and return its
/// handle. The task is not scheduled.
pub fn allocate<S: Step>(state: S) -> RawTask {
    let frame = arena::alloc(Frame {
        header: Header {
            resume: trampoline::<S>,
        },
        state,
    });
    RawTask(frame.cast())
}

/// Fork a child task: register it on `latch`, then schedule it onto the
/// current worker's deque.
pub fn fork<S: Step>(worker: &Worker, latch: &Latch, state: S) {
    latch.register_fork();
    worker.schedule(allocate(state));
}
