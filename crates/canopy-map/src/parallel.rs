//! Parallel map operations as continuation tasks.
//!
//! Each operation walks the 64-ary structure of the trie (or partitions a
//! key range into 64-ary blocks) and forks one child task per independent
//! sub-range onto a fresh inner latch, then awaits the latch with its own
//! gather stage as the continuation. The per-node fan-out keeps task
//! granularity aligned with node granularity, which is what makes the
//! runtime's arena-backed frames and latch fold worthwhile.
//!
//! Operations:
//! - [`parallel_generate`]: synthesize a subtree over a closed key range
//!   from a function of the key.
//! - [`parallel_merge_left`]: trie x trie merge, left value wins.
//! - [`parallel_merge_right`]: trie x frozen-skiplist merge, skiplist
//!   value wins. Sub-ranges present only in the skiplist are converted to
//!   dense trie subtrees by persist subtasks driven by cursor refinement.
//!
//! Every entry point owns its pool for exactly one fork/join phase: the
//! root latch's continuation raises the stop flag, the pool is joined, and
//! the result is read from the phase root on the caller's stack.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use canopy_rt::{allocate, fork, Frame, Latch, RawTask, Scheduler, Step, Wait, Worker};

use crate::skiplist::{Cursor, FrozenSkipMap};
use crate::trie::{
    branch_shift, digit, disagree_above, high_mask, slot_count, Node, NodeRef, PersistentIntMap,
};

/// Values that may cross task frames: copied into dense gather arrays and
/// shared between workers.
pub trait ParallelValue: Copy + Send + Sync + 'static {}
impl<T: Copy + Send + Sync + 'static> ParallelValue for T {}

type Slot<V> = *mut Option<NodeRef<V>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fork,
    Gather,
    /// Await completed for a delegated subtask that wrote the target
    /// itself; just signal the parent.
    Finish,
}

#[inline]
fn block_low(prefix: u64, shift: u32, slot: u64) -> u64 {
    prefix | (slot << shift)
}

#[inline]
fn block_high(prefix: u64, shift: u32, slot: u64) -> u64 {
    prefix | !((!slot).wrapping_shl(shift))
}

/// Root anchor for one fork/join phase, living on the caller's stack.
struct PhaseRoot<V: 'static> {
    latch: Latch,
    target: UnsafeCell<Option<NodeRef<V>>>,
}

unsafe impl<V> Sync for PhaseRoot<V> {}

/// Continuation of the phase root: all work is done, bring the pool down.
struct StopStep;

impl Step for StopStep {
    fn resume(_frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
        worker.request_stop();
        None
    }
}

/// Run one fork/join phase to completion on `pool` and return the root of
/// the produced subtree. `spawn_root` must fork exactly the phase's root
/// task against the given latch.
fn run_phase<V, F>(pool: Scheduler, spawn_root: F) -> Option<NodeRef<V>>
where
    V: 'static,
    F: for<'a> FnOnce(&'a Worker, &'a Latch, Slot<V>),
{
    let root: PhaseRoot<V> = PhaseRoot {
        latch: Latch::new(),
        target: UnsafeCell::new(None),
    };
    pool.run(|worker| {
        spawn_root(worker, &root.latch, root.target.get());
        let finish = allocate(StopStep);
        if root.latch.try_wait(finish) == Wait::Ready {
            worker.request_stop();
        }
    });
    let result = unsafe { *root.target.get() };
    pool.join();
    canopy_gc::mutator_handshake();
    log::debug!(
        "fork/join phase complete, produced {} root",
        if result.is_some() { "a" } else { "no" }
    );
    result
}

/// Subtree synthesis over `[lo, hi]` from a function of the key.
struct Generate<V: 'static, F: 'static> {
    outer: *const Latch,
    target: Slot<V>,
    lo: u64,
    hi: u64,
    func: *const F,
    prefix: u64,
    shift: u32,
    stage: Stage,
    inner: Latch,
    results: [Option<NodeRef<V>>; 64],
}

unsafe impl<V: Send + Sync, F: Sync> Send for Generate<V, F> {}

impl<V, F> Generate<V, F>
where
    V: ParallelValue,
    F: Fn(u64) -> V + Sync + 'static,
{
    fn gather(&mut self) -> Option<RawTask> {
        unsafe {
            *self.target = Node::from_children_array(self.prefix, self.shift, &self.results);
            (*self.outer).complete()
        }
    }
}

impl<V, F> Step for Generate<V, F>
where
    V: ParallelValue,
    F: Fn(u64) -> V + Sync + 'static,
{
    fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
        let this = unsafe { Frame::state(frame) };
        match this.stage {
            Stage::Fork => {
                if this.lo == this.hi {
                    // A clipped range can degenerate to one key.
                    let value = unsafe { (*this.func)(this.lo) };
                    unsafe {
                        *this.target = Some(Node::leaf(this.lo, value));
                        return (*this.outer).complete();
                    }
                }
                let shift = branch_shift(this.lo ^ this.hi);
                let prefix = this.lo & high_mask(shift);
                this.prefix = prefix;
                this.shift = shift;
                if shift == 0 {
                    let mut values: [Option<V>; 64] = [None; 64];
                    for slot in digit(this.lo, 0)..=digit(this.hi, 0) {
                        let key = prefix | slot;
                        values[slot as usize] = Some(unsafe { (*this.func)(key) });
                    }
                    unsafe {
                        *this.target = Node::from_values_array(prefix, &values);
                        return (*this.outer).complete();
                    }
                }
                for slot in 0..slot_count(shift) {
                    let key_low = block_low(prefix, shift, slot);
                    let key_high = block_high(prefix, shift, slot);
                    if key_low > this.hi || key_high < this.lo {
                        continue;
                    }
                    fork(
                        worker,
                        &this.inner,
                        Generate {
                            outer: &this.inner,
                            target: &mut this.results[slot as usize],
                            lo: key_low.max(this.lo),
                            hi: key_high.min(this.hi),
                            func: this.func,
                            prefix: 0,
                            shift: 0,
                            stage: Stage::Fork,
                            inner: Latch::new(),
                            results: [None; 64],
                        },
                    );
                }
                this.stage = Stage::Gather;
                match this.inner.try_wait(Frame::handle(frame)) {
                    Wait::Pending => None,
                    Wait::Ready => this.gather(),
                }
            }
            Stage::Gather => this.gather(),
            Stage::Finish => unreachable!("generate has no delegated stage"),
        }
    }
}

/// Convert the skiplist contents within `[lo, hi]` into a trie subtree.
/// The cursor points at the first in-range key; the range is known
/// nonempty.
struct Persist<V: 'static> {
    outer: *const Latch,
    cursor: Cursor<u64, V>,
    target: Slot<V>,
    lo: u64,
    hi: u64,
    prefix: u64,
    shift: u32,
    stage: Stage,
    inner: Latch,
    results: [Option<NodeRef<V>>; 64],
}

unsafe impl<V: Send + Sync> Send for Persist<V> {}

impl<V: ParallelValue> Persist<V> {
    fn gather(&mut self) -> Option<RawTask> {
        unsafe {
            *self.target = Node::from_children_array(self.prefix, self.shift, &self.results);
            (*self.outer).complete()
        }
    }
}

impl<V: ParallelValue> Step for Persist<V> {
    fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
        let this = unsafe { Frame::state(frame) };
        match this.stage {
            Stage::Fork => {
                if this.lo == this.hi {
                    let mut cursor = this.cursor;
                    let found = cursor.find(&this.lo).map(|node| *node.value());
                    unsafe {
                        *this.target = found.map(|value| Node::leaf(this.lo, value));
                        return (*this.outer).complete();
                    }
                }
                let shift = branch_shift(this.lo ^ this.hi);
                let prefix = this.lo & high_mask(shift);
                this.prefix = prefix;
                this.shift = shift;
                if shift == 0 {
                    // Dense by construction: probe each key in the block.
                    let mut values: [Option<V>; 64] = [None; 64];
                    let mut cursor = this.cursor;
                    for slot in digit(this.lo, 0)..=digit(this.hi, 0) {
                        let key = prefix | slot;
                        if let Some(node) = cursor.find(&key) {
                            values[slot as usize] = Some(*node.value());
                        }
                    }
                    unsafe {
                        *this.target = Node::from_values_array(prefix, &values);
                        return (*this.outer).complete();
                    }
                }
                for slot in 0..slot_count(shift) {
                    let key_low = block_low(prefix, shift, slot).max(this.lo);
                    let key_high = block_high(prefix, shift, slot).min(this.hi);
                    if key_low > key_high {
                        continue;
                    }
                    let mut cursor = this.cursor;
                    if cursor.refine_closed_range(&key_low, &key_high) {
                        fork(
                            worker,
                            &this.inner,
                            Persist {
                                outer: &this.inner,
                                cursor,
                                target: &mut this.results[slot as usize],
                                lo: key_low,
                                hi: key_high,
                                prefix: 0,
                                shift: 0,
                                stage: Stage::Fork,
                                inner: Latch::new(),
                                results: [None; 64],
                            },
                        );
                    }
                }
                this.stage = Stage::Gather;
                match this.inner.try_wait(Frame::handle(frame)) {
                    Wait::Pending => None,
                    Wait::Ready => this.gather(),
                }
            }
            Stage::Gather => this.gather(),
            Stage::Finish => unreachable!("persist has no delegated stage"),
        }
    }
}

/// Merge a trie subtree with the skiplist contents of `[lo, hi]`, skiplist
/// values winning collisions.
struct MergeRight<V: 'static> {
    outer: *const Latch,
    trie: Option<NodeRef<V>>,
    cursor: Cursor<u64, V>,
    target: Slot<V>,
    lo: u64,
    hi: u64,
    prefix: u64,
    shift: u32,
    stage: Stage,
    inner: Latch,
    results: [Option<NodeRef<V>>; 64],
}

unsafe impl<V: Send + Sync> Send for MergeRight<V> {}

impl<V: ParallelValue> MergeRight<V> {
    fn gather(&mut self) -> Option<RawTask> {
        unsafe {
            *self.target = Node::from_children_array(self.prefix, self.shift, &self.results);
            (*self.outer).complete()
        }
    }

    fn await_inner(&mut self, frame: NonNull<Frame<Self>>) -> Option<RawTask> {
        match self.inner.try_wait(Frame::handle(frame)) {
            Wait::Pending => None,
            Wait::Ready => match self.stage {
                Stage::Gather => self.gather(),
                Stage::Finish => unsafe { (*self.outer).complete() },
                Stage::Fork => unreachable!(),
            },
        }
    }
}

impl<V: ParallelValue> Step for MergeRight<V> {
    fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
        let this = unsafe { Frame::state(frame) };
        match this.stage {
            Stage::Gather => return this.gather(),
            Stage::Finish => return unsafe { (*this.outer).complete() },
            Stage::Fork => {}
        }

        // Narrow the skiplist to our range first.
        let mut cursor = this.cursor;
        if !cursor.refine_closed_range(&this.lo, &this.hi) {
            // Nothing on the right: the trie subtree is reused as-is.
            unsafe {
                *this.target = this.trie;
                return (*this.outer).complete();
            }
        }
        this.cursor = cursor;

        let trie = match this.trie {
            None => {
                // Nothing on the left: persist the skiplist range.
                this.stage = Stage::Finish;
                fork(
                    worker,
                    &this.inner,
                    Persist {
                        outer: &this.inner,
                        cursor: this.cursor,
                        target: this.target,
                        lo: this.lo,
                        hi: this.hi,
                        prefix: 0,
                        shift: 0,
                        stage: Stage::Fork,
                        inner: Latch::new(),
                        results: [None; 64],
                    },
                );
                return this.await_inner(frame);
            }
            Some(node) => node,
        };

        let trie_low = trie.key_low();
        let trie_high = trie.key_high();
        debug_assert!(this.lo <= trie_low && trie_high <= this.hi);

        if this.lo < trie_low || this.hi > trie_high {
            // The range is wider than the trie node: partition the range
            // itself, with the whole trie landing in a single slot.
            let shift = branch_shift(this.lo ^ this.hi);
            debug_assert!(shift > trie.shift());
            let prefix = this.lo & high_mask(shift);
            this.prefix = prefix;
            this.shift = shift;
            let trie_slot = digit(trie.prefix(), shift);
            for slot in 0..slot_count(shift) {
                let key_low = block_low(prefix, shift, slot).max(this.lo);
                let key_high = block_high(prefix, shift, slot).min(this.hi);
                if key_low > key_high {
                    continue;
                }
                let in_left = slot == trie_slot;
                let mut cursor = this.cursor;
                let in_right = cursor.refine_closed_range(&key_low, &key_high);
                if in_left && !in_right {
                    this.results[slot as usize] = Some(trie);
                } else if !in_left && in_right {
                    fork(
                        worker,
                        &this.inner,
                        Persist {
                            outer: &this.inner,
                            cursor,
                            target: &mut this.results[slot as usize],
                            lo: key_low,
                            hi: key_high,
                            prefix: 0,
                            shift: 0,
                            stage: Stage::Fork,
                            inner: Latch::new(),
                            results: [None; 64],
                        },
                    );
                } else if in_left && in_right {
                    fork(
                        worker,
                        &this.inner,
                        MergeRight {
                            outer: &this.inner,
                            trie: Some(trie),
                            cursor,
                            target: &mut this.results[slot as usize],
                            lo: key_low,
                            hi: key_high,
                            prefix: 0,
                            shift: 0,
                            stage: Stage::Fork,
                            inner: Latch::new(),
                            results: [None; 64],
                        },
                    );
                }
            }
            this.stage = Stage::Gather;
            return this.await_inner(frame);
        }

        if trie.shift() > 0 {
            // Aligned branch: walk the trie's own slots.
            this.prefix = trie.prefix();
            this.shift = trie.shift();
            let mut packed = 0usize;
            for slot in 0..slot_count(trie.shift()) {
                let bit = 1u64 << slot;
                let key_low = block_low(trie.prefix(), trie.shift(), slot);
                let key_high = block_high(trie.prefix(), trie.shift(), slot);
                let in_left = trie.bitmap() & bit != 0;
                let mut cursor = this.cursor;
                let in_right = cursor.refine_closed_range(&key_low, &key_high);
                if in_left && !in_right {
                    // Structural sharing: adopt the child by reference.
                    this.results[slot as usize] = Some(trie.child(packed));
                    packed += 1;
                } else if !in_left && in_right {
                    fork(
                        worker,
                        &this.inner,
                        Persist {
                            outer: &this.inner,
                            cursor,
                            target: &mut this.results[slot as usize],
                            lo: key_low,
                            hi: key_high,
                            prefix: 0,
                            shift: 0,
                            stage: Stage::Fork,
                            inner: Latch::new(),
                            results: [None; 64],
                        },
                    );
                } else if in_left && in_right {
                    fork(
                        worker,
                        &this.inner,
                        MergeRight {
                            outer: &this.inner,
                            trie: Some(trie.child(packed)),
                            cursor,
                            target: &mut this.results[slot as usize],
                            lo: key_low,
                            hi: key_high,
                            prefix: 0,
                            shift: 0,
                            stage: Stage::Fork,
                            inner: Latch::new(),
                            results: [None; 64],
                        },
                    );
                    packed += 1;
                }
            }
            this.stage = Stage::Gather;
            return this.await_inner(frame);
        }

        // Leaf block: trie values first, skiplist overrides second.
        let mut values: [Option<V>; 64] = [None; 64];
        let mut packed = 0usize;
        for slot in 0..64u64 {
            if trie.bitmap() & (1u64 << slot) != 0 {
                values[slot as usize] = Some(*trie.value(packed));
                packed += 1;
            }
        }
        let mut cursor = this.cursor;
        for slot in 0..64u64 {
            let key = trie.prefix() | slot;
            if let Some(node) = cursor.lower_bound(&key) {
                if *node.key() == key {
                    values[slot as usize] = Some(*node.value());
                }
            }
        }
        unsafe {
            *this.target = Node::from_values_array(trie.prefix(), &values);
            (*this.outer).complete()
        }
    }
}

/// Merge two trie subtrees, left value winning collisions.
struct MergeLeftPar<V: 'static> {
    outer: *const Latch,
    left: Option<NodeRef<V>>,
    right: Option<NodeRef<V>>,
    target: Slot<V>,
    /// Shallower node kept aside for the adopt gather.
    parent: Option<NodeRef<V>>,
    prefix: u64,
    shift: u32,
    stage: LeftStage,
    inner: Latch,
    results: [Option<NodeRef<V>>; 64],
}

unsafe impl<V: Send + Sync> Send for MergeLeftPar<V> {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LeftStage {
    Fork,
    GatherChildren,
    /// Single merged child to splice back into the shallower parent.
    GatherAdopt,
}

impl<V: ParallelValue> MergeLeftPar<V> {
    fn gather_children(&mut self) -> Option<RawTask> {
        unsafe {
            *self.target = Node::from_children_array(self.prefix, self.shift, &self.results);
            (*self.outer).complete()
        }
    }

    fn gather_adopt(&mut self) -> Option<RawTask> {
        let parent = self.parent.expect("adopt gather without parent");
        let child = self.results[0].expect("adopt gather without child");
        unsafe {
            *self.target = Some(parent.clone_with_child(child));
            (*self.outer).complete()
        }
    }

    fn await_inner(&mut self, frame: NonNull<Frame<Self>>) -> Option<RawTask> {
        match self.inner.try_wait(Frame::handle(frame)) {
            Wait::Pending => None,
            Wait::Ready => match self.stage {
                LeftStage::GatherChildren => self.gather_children(),
                LeftStage::GatherAdopt => self.gather_adopt(),
                LeftStage::Fork => unreachable!(),
            },
        }
    }
}

impl<V: ParallelValue> Step for MergeLeftPar<V> {
    fn resume(frame: NonNull<Frame<Self>>, worker: &Worker) -> Option<RawTask> {
        let this = unsafe { Frame::state(frame) };
        match this.stage {
            LeftStage::GatherChildren => return this.gather_children(),
            LeftStage::GatherAdopt => return this.gather_adopt(),
            LeftStage::Fork => {}
        }

        let (left, right) = match (this.left, this.right) {
            (left, None) => {
                unsafe {
                    *this.target = left;
                    return (*this.outer).complete();
                }
            }
            (None, right) => {
                unsafe {
                    *this.target = right;
                    return (*this.outer).complete();
                }
            }
            (Some(left), Some(right)) => (left, right),
        };

        let top = left.shift().max(right.shift());
        if disagree_above(left.prefix(), right.prefix(), top) {
            unsafe {
                *this.target = Some(Node::with_two_children(left, right));
                return (*this.outer).complete();
            }
        }

        if left.shift() == right.shift() {
            if left.shift() == 0 {
                // Leaf collision block: not worth a fork.
                unsafe {
                    *this.target = Node::merge_left(Some(left), Some(right));
                    return (*this.outer).complete();
                }
            }
            this.prefix = left.prefix();
            this.shift = left.shift();
            let mut packed_left = 0usize;
            let mut packed_right = 0usize;
            for slot in 0..64u64 {
                let bit = 1u64 << slot;
                let in_left = left.bitmap() & bit != 0;
                let in_right = right.bitmap() & bit != 0;
                if in_left && in_right {
                    fork(
                        worker,
                        &this.inner,
                        MergeLeftPar {
                            outer: &this.inner,
                            left: Some(left.child(packed_left)),
                            right: Some(right.child(packed_right)),
                            target: &mut this.results[slot as usize],
                            parent: None,
                            prefix: 0,
                            shift: 0,
                            stage: LeftStage::Fork,
                            inner: Latch::new(),
                            results: [None; 64],
                        },
                    );
                    packed_left += 1;
                    packed_right += 1;
                } else if in_left {
                    this.results[slot as usize] = Some(left.child(packed_left));
                    packed_left += 1;
                } else if in_right {
                    this.results[slot as usize] = Some(right.child(packed_right));
                    packed_right += 1;
                }
            }
            this.stage = LeftStage::GatherChildren;
            return this.await_inner(frame);
        }

        // Shallower node adopts the deeper one's merged slot, keeping the
        // left-right orientation intact.
        if left.shift() > right.shift() {
            let bit = 1u64 << digit(right.prefix(), left.shift());
            this.parent = Some(left);
            if left.bitmap() & bit != 0 {
                let packed = (left.bitmap() & (bit - 1)).count_ones() as usize;
                fork(
                    worker,
                    &this.inner,
                    MergeLeftPar {
                        outer: &this.inner,
                        left: Some(left.child(packed)),
                        right: Some(right),
                        target: &mut this.results[0],
                        parent: None,
                        prefix: 0,
                        shift: 0,
                        stage: LeftStage::Fork,
                        inner: Latch::new(),
                        results: [None; 64],
                    },
                );
                this.stage = LeftStage::GatherAdopt;
                this.await_inner(frame)
            } else {
                unsafe {
                    *this.target = Some(left.clone_with_child(right));
                    (*this.outer).complete()
                }
            }
        } else {
            let bit = 1u64 << digit(left.prefix(), right.shift());
            this.parent = Some(right);
            if right.bitmap() & bit != 0 {
                let packed = (right.bitmap() & (bit - 1)).count_ones() as usize;
                fork(
                    worker,
                    &this.inner,
                    MergeLeftPar {
                        outer: &this.inner,
                        left: Some(left),
                        right: Some(right.child(packed)),
                        target: &mut this.results[0],
                        parent: None,
                        prefix: 0,
                        shift: 0,
                        stage: LeftStage::Fork,
                        inner: Latch::new(),
                        results: [None; 64],
                    },
                );
                this.stage = LeftStage::GatherAdopt;
                this.await_inner(frame)
            } else {
                unsafe {
                    *this.target = Some(right.clone_with_child(left));
                    (*this.outer).complete()
                }
            }
        }
    }
}

/// Build a map over `[lo, hi]` with `value = func(key)` for every key,
/// running on `pool` for one phase.
pub fn parallel_generate<V, F>(
    pool: Scheduler,
    lo: u64,
    hi: u64,
    func: &F,
) -> PersistentIntMap<V>
where
    V: ParallelValue,
    F: Fn(u64) -> V + Sync + 'static,
{
    assert!(lo <= hi);
    let root = run_phase(pool, |worker, outer, target| {
        fork(
            worker,
            outer,
            Generate {
                outer,
                target,
                lo,
                hi,
                func,
                prefix: 0,
                shift: 0,
                stage: Stage::Fork,
                inner: Latch::new(),
                results: [None; 64],
            },
        );
    });
    PersistentIntMap::from_root(root)
}

/// Merge a trie with a frozen skiplist, skiplist values winning
/// collisions, running on `pool` for one phase.
pub fn parallel_merge_right<V: ParallelValue>(
    pool: Scheduler,
    trie: &PersistentIntMap<V>,
    frozen: &FrozenSkipMap<u64, V>,
) -> PersistentIntMap<V> {
    let trie_root = trie.root();
    let cursor = frozen.cursor();
    let root = run_phase(pool, |worker, outer, target| {
        fork(
            worker,
            outer,
            MergeRight {
                outer,
                trie: trie_root,
                cursor,
                target,
                lo: 0,
                hi: u64::MAX,
                prefix: 0,
                shift: 0,
                stage: Stage::Fork,
                inner: Latch::new(),
                results: [None; 64],
            },
        );
    });
    PersistentIntMap::from_root(root)
}

/// Merge two tries, left values winning collisions, running on `pool` for
/// one phase.
pub fn parallel_merge_left<V: ParallelValue>(
    pool: Scheduler,
    left: &PersistentIntMap<V>,
    right: &PersistentIntMap<V>,
) -> PersistentIntMap<V> {
    let left_root = left.root();
    let right_root = right.root();
    let root = run_phase(pool, |worker, outer, target| {
        fork(
            worker,
            outer,
            MergeLeftPar {
                outer,
                left: left_root,
                right: right_root,
                target,
                parent: None,
                prefix: 0,
                shift: 0,
                stage: LeftStage::Fork,
                inner: Latch::new(),
                results: [None; 64],
            },
        );
    });
    PersistentIntMap::from_root(root)
}
