//! Chase–Lev work-stealing deque over task handles.
//!
//! Lock-free, unbounded, single-producer multi-consumer: the owning worker
//! pushes and pops at the bottom, thieves steal at the top. The owner end is
//! LIFO (cache-hot, work-first); the thief end is FIFO, so thieves take the
//! oldest continuations, which tend to be the largest subtrees.
//!
//! D. Chase and Y. Lev. Dynamic circular work-stealing deque. SPAA 2005.
//!
//! N. M. Lê, A. Pop, A. Cohen, F. Zappa Nardelli. Correct and efficient
//! work-stealing for weak memory models. PPoPP 2013.
//!
//! The backing circular array is a collected object: when the owner grows
//! the deque, the outgrown array is handed to the collector with `shade`
//! because a thief may still be reading it.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use canopy_gc::{Marker, Scan};

use crate::task::{Header, RawTask};

const INITIAL_CAPACITY: usize = 16;

/// Power-of-two ring of atomic task-handle slots.
pub struct CircularArray {
    mask: usize,
    slots: Box<[AtomicPtr<Header>]>,
}

impl CircularArray {
    fn new(capacity: usize) -> &'static CircularArray {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        canopy_gc::alloc(CircularArray {
            mask: capacity - 1,
            slots,
        })
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn slot(&self, index: isize) -> &AtomicPtr<Header> {
        &self.slots[index as usize & self.mask]
    }
}

impl Scan for CircularArray {
    fn scan(&self, _marker: &mut Marker) {
        // Task handles are arena-owned, not collected; no outgoing edges.
    }
}

struct OwnerSide {
    array: AtomicPtr<CircularArray>,
    bottom: AtomicIsize,
    cached_top: Cell<isize>,
}

/// The deque proper. Owner fields and the thief counter live on separate
/// cache lines.
#[repr(C)]
pub struct WorkStealingDeque {
    owner: CachePadded<OwnerSide>,
    top: CachePadded<AtomicIsize>,
}

// The only non-atomic field is `cached_top`, which the owner alone touches.
unsafe impl Send for WorkStealingDeque {}
unsafe impl Sync for WorkStealingDeque {}

impl WorkStealingDeque {
    pub fn new() -> WorkStealingDeque {
        let array = CircularArray::new(INITIAL_CAPACITY);
        WorkStealingDeque {
            owner: CachePadded::new(OwnerSide {
                array: AtomicPtr::new(array as *const CircularArray as *mut CircularArray),
                bottom: AtomicIsize::new(0),
                cached_top: Cell::new(0),
            }),
            top: CachePadded::new(AtomicIsize::new(0)),
        }
    }

    /// Owner only. Appends at the bottom, growing the ring if the cached top
    /// (refreshed at most once) says it is full.
    pub fn push(&self, item: RawTask) {
        let bottom = self.owner.bottom.load(Ordering::Relaxed);
        let mut array = unsafe { &*self.owner.array.load(Ordering::Relaxed) };
        let capacity = array.capacity() as isize;
        debug_assert!(bottom - self.owner.cached_top.get() <= capacity);
        if bottom - self.owner.cached_top.get() == capacity {
            self.owner.cached_top.set(self.top.load(Ordering::Acquire));
            if bottom - self.owner.cached_top.get() == capacity {
                array = self.grow(array, self.owner.cached_top.get(), bottom);
            }
        }
        array.slot(bottom).store(item.as_ptr(), Ordering::Relaxed);
        fence(Ordering::Release);
        self.owner.bottom.store(bottom + 1, Ordering::Relaxed);
    }

    #[cold]
    fn grow(
        &self,
        old: &'static CircularArray,
        top: isize,
        bottom: isize,
    ) -> &'static CircularArray {
        let bigger = CircularArray::new(old.capacity() << 1);
        let mut index = top;
        while index != bottom {
            let item = old.slot(index).load(Ordering::Relaxed);
            bigger.slot(index).store(item, Ordering::Relaxed);
            index += 1;
        }
        // A thief may still hold a reference to the old ring.
        canopy_gc::shade(old);
        self.owner.array.store(
            bigger as *const CircularArray as *mut CircularArray,
            Ordering::Release,
        );
        bigger
    }

    /// Owner only. Takes the most recently pushed item; on the single-element
    /// race with a thief, a seq-cst CAS on `top` decides.
    pub fn pop(&self) -> Option<RawTask> {
        let bottom = self.owner.bottom.load(Ordering::Relaxed);
        let array = unsafe { &*self.owner.array.load(Ordering::Relaxed) };
        let new_bottom = bottom - 1;
        self.owner.bottom.store(new_bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);
        self.owner.cached_top.set(top);
        debug_assert!(top <= bottom);
        let size = new_bottom - top;
        if size < 0 {
            self.owner.bottom.store(bottom, Ordering::Relaxed);
            return None;
        }
        let item = array.slot(new_bottom).load(Ordering::Relaxed);
        if size > 0 {
            return Some(unsafe { RawTask::from_ptr(item) });
        }
        let won = self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.owner.bottom.store(bottom, Ordering::Relaxed);
        if won {
            Some(unsafe { RawTask::from_ptr(item) })
        } else {
            None
        }
    }

    /// Any thief. Takes the oldest item, or nothing on emptiness or a lost
    /// race (the caller moves on either way).
    pub fn steal(&self) -> Option<RawTask> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.owner.bottom.load(Ordering::Acquire);
        if top >= bottom {
            return None;
        }
        let array = unsafe { &*self.owner.array.load(Ordering::Acquire) };
        let item = array.slot(top).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(unsafe { RawTask::from_ptr(item) })
        } else {
            None
        }
    }

    /// Owner-side emptiness probe for quiescence detection. Does not pop.
    pub fn can_pop(&self) -> bool {
        let bottom = self.owner.bottom.load(Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);
        self.owner.cached_top.set(top);
        debug_assert!(top <= bottom);
        top < bottom
    }

    /// Thief-side emptiness probe for quiescence detection.
    pub fn can_steal(&self) -> bool {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.owner.bottom.load(Ordering::Acquire);
        top < bottom
    }
}

impl Default for WorkStealingDeque {
    fn default() -> Self {
        WorkStealingDeque::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Header;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    // Distinct, never-resumed handles for exercising the deque alone.
    fn tokens(count: usize) -> Vec<RawTask> {
        (0..count)
            .map(|_| {
                let header: &'static mut Header = Box::leak(Box::new(Header::dead()));
                unsafe { RawTask::from_ptr(header) }
            })
            .collect()
    }

    #[test]
    fn owner_sees_lifo_order() {
        let deque = WorkStealingDeque::new();
        let items = tokens(3);
        for &item in &items {
            deque.push(item);
        }
        assert_eq!(deque.pop(), Some(items[2]));
        assert_eq!(deque.pop(), Some(items[1]));
        assert_eq!(deque.pop(), Some(items[0]));
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn thief_sees_fifo_order() {
        let deque = WorkStealingDeque::new();
        let items = tokens(3);
        for &item in &items {
            deque.push(item);
        }
        assert_eq!(deque.steal(), Some(items[0]));
        assert_eq!(deque.steal(), Some(items[1]));
        assert_eq!(deque.steal(), Some(items[2]));
        assert_eq!(deque.steal(), None);
    }

    #[test]
    fn growth_preserves_contents() {
        let deque = WorkStealingDeque::new();
        let items = tokens(INITIAL_CAPACITY * 8);
        for &item in &items {
            deque.push(item);
        }
        let mut drained = Vec::new();
        while let Some(item) = deque.pop() {
            drained.push(item);
        }
        drained.reverse();
        assert_eq!(drained, items);
    }

    #[test]
    fn emptiness_probes_agree() {
        let deque = WorkStealingDeque::new();
        assert!(!deque.can_pop());
        assert!(!deque.can_steal());
        let items = tokens(1);
        deque.push(items[0]);
        assert!(deque.can_pop());
        assert!(deque.can_steal());
    }

    /// One owner pushing and popping against several thieves: every pushed
    /// token comes out exactly once, across all parties.
    #[test]
    fn stealing_race_is_a_permutation() {
        const TOKENS: usize = 200_000;
        const THIEVES: usize = 8;

        let deque = Arc::new(WorkStealingDeque::new());
        let items = tokens(TOKENS);
        let expected: HashSet<usize> = items.iter().map(|t| t.addr()).collect();

        let stolen: Vec<_> = (0..THIEVES)
            .map(|_| Arc::new(parking_lot::Mutex::new(Vec::new())))
            .collect();
        let live_thieves = Arc::new(AtomicUsize::new(THIEVES));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for bucket in stolen.iter().cloned() {
            let deque = deque.clone();
            let done = done.clone();
            let live = live_thieves.clone();
            handles.push(thread::spawn(move || {
                loop {
                    if let Some(item) = deque.steal() {
                        bucket.lock().push(item.addr());
                    } else if done.load(Ordering::Acquire) == 1 && !deque.can_steal() {
                        break;
                    }
                }
                live.fetch_sub(1, Ordering::Release);
            }));
        }

        let mut popped = Vec::new();
        for (index, &item) in items.iter().enumerate() {
            deque.push(item);
            if index % 3 == 0 {
                if let Some(taken) = deque.pop() {
                    popped.push(taken.addr());
                }
            }
        }
        while let Some(taken) = deque.pop() {
            popped.push(taken.addr());
        }
        done.store(1, Ordering::Release);
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();
        for address in popped
            .into_iter()
            .chain(stolen.iter().flat_map(|b| b.lock().clone()))
        {
            assert!(seen.insert(address), "token delivered twice");
        }
        assert_eq!(seen, expected);
    }
}
