//! Canopy-RT: a work-stealing fork/join scheduler with continuation tasks.
//!
//! The runtime executes millions of small continuation-style tasks across a
//! fixed pool of worker threads with minimal per-task overhead:
//!
//! - [`Scheduler`]: the fixed pool. Worker 0 is the launching thread;
//!   workers 1..N are spawned. Sleep/wake is generation-counted so the
//!   idle-to-busy transition pays the wake cost, and a stop flag raised by
//!   the phase's final continuation tears the pool down.
//! - [`WorkStealingDeque`]: per-worker Chase–Lev deque of task handles.
//!   Owner end LIFO, thief end FIFO.
//! - [`Latch`]: the fork/join synchronizer. Fork registrations are
//!   owner-local and folded into the atomic count at await; the last
//!   completion resumes the single installed continuation.
//! - [`Step`]/[`RawTask`]: tasks as arena-allocated state machines headed
//!   by a resume function pointer, resumed with symmetric transfer.
//! - [`arena`]: the thread-local bump allocator that owns task frames for
//!   the duration of a phase.
//! - [`ManualResetEvent`]/[`CountdownEvent`]: one-shot awaitable
//!   synchronizers for conditions that are not child completions.
//! - [`TerminationBarrier`]: active-worker counting for quiescence
//!   detection.
//!
//! Memory reclamation of shared structures is delegated to the narrow
//! interface in `canopy-gc`; the deque hands outgrown arrays to it and
//! otherwise nothing here is collected.

pub mod arena;
mod deque;
mod error;
mod event;
mod latch;
mod scheduler;
mod task;
mod termination;

pub use deque::{CircularArray, WorkStealingDeque};
pub use error::RuntimeError;
pub use event::{CountdownEvent, ManualResetEvent};
pub use latch::{Latch, Wait};
pub use scheduler::{Scheduler, Worker};
pub use task::{allocate, fork, Frame, Header, RawTask, Step};
pub use termination::TerminationBarrier;
