//! Thread-local bump arena for per-phase allocations.
//!
//! Task frames live only until the end of the fork/join phase that created
//! them. Bump-allocating them from a per-thread slab and resetting the slab
//! at the phase boundary is much cheaper than individual malloc/free, and
//! the collector never has to look at them.
//!
//! The arena is a chain of slabs; each new slab doubles the committed size.
//! [`advance`] keeps the (largest) head slab, resets its bump pointer, and
//! frees the rest. Objects placed here are never dropped, so they must not
//! have drop glue; [`alloc`] enforces that at compile time.

use std::alloc::{alloc as raw_alloc, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::mem;
use std::ptr::{self, NonNull};

/// Allocation granule. Sizes are rounded up to this, which also bounds the
/// alignment the arena can serve.
pub const MAX_ALIGN: usize = 16;

const INITIAL_SLAB_BYTES: usize = 1 << 20;
const SLAB_HEADER_BYTES: usize = 32;

#[repr(C)]
struct Slab {
    /// Next allocation. Grows monotonically until the slab is reset.
    begin: *mut u8,
    /// First byte past the slab.
    end: *mut u8,
    /// Earlier, smaller slab in the chain.
    predecessor: *mut Slab,
}

thread_local! {
    static HEAD: Cell<*mut Slab> = const { Cell::new(ptr::null_mut()) };
}

fn slab_layout(total_bytes: usize) -> Layout {
    Layout::from_size_align(total_bytes, MAX_ALIGN).expect("slab layout")
}

unsafe fn new_slab(total_bytes: usize, predecessor: *mut Slab) -> *mut Slab {
    debug_assert!(total_bytes > SLAB_HEADER_BYTES);
    let layout = slab_layout(total_bytes);
    let base = raw_alloc(layout);
    if base.is_null() {
        handle_alloc_error(layout);
    }
    let slab = base as *mut Slab;
    (*slab).begin = base.add(SLAB_HEADER_BYTES);
    (*slab).end = base.add(total_bytes);
    (*slab).predecessor = predecessor;
    slab
}

unsafe fn free_slab(slab: *mut Slab) {
    let total = (*slab).end as usize - slab as usize;
    dealloc(slab as *mut u8, slab_layout(total));
}

/// Create this thread's arena. Must be called exactly once per thread before
/// any allocation; calling it twice is a programming error.
pub fn initialize() {
    HEAD.with(|head| {
        assert!(head.get().is_null(), "arena already initialized");
        head.set(unsafe { new_slab(INITIAL_SLAB_BYTES, ptr::null_mut()) });
    });
}

/// Whether this thread's arena exists.
pub fn is_initialized() -> bool {
    HEAD.with(|head| !head.get().is_null())
}

/// Destroy this thread's arena and everything still in it.
pub fn finalize() {
    HEAD.with(|head| {
        let mut slab = head.get();
        assert!(!slab.is_null(), "arena not initialized");
        head.set(ptr::null_mut());
        let mut total = 0usize;
        while !slab.is_null() {
            unsafe {
                total += (*slab).end as usize - slab as usize;
                let predecessor = (*slab).predecessor;
                free_slab(slab);
                slab = predecessor;
            }
        }
        log::debug!("arena finalized, {} bytes committed over lifetime", total);
    });
}

/// Phase boundary: reset the head slab and free its predecessors.
///
/// Callable only when every object allocated since the last `advance` is
/// unreachable.
pub fn advance() {
    HEAD.with(|head| {
        let slab = head.get();
        assert!(!slab.is_null(), "arena not initialized");
        unsafe {
            (*slab).begin = (slab as *mut u8).add(SLAB_HEADER_BYTES);
            let mut predecessor = (*slab).predecessor;
            (*slab).predecessor = ptr::null_mut();
            while !predecessor.is_null() {
                let next = (*predecessor).predecessor;
                free_slab(predecessor);
                predecessor = next;
            }
        }
    });
}

#[cold]
fn allocate_cold(size: usize) -> *mut u8 {
    HEAD.with(|head| {
        let slab = head.get();
        assert!(!slab.is_null(), "arena not initialized");
        unsafe {
            let mut total = ((*slab).end as usize - slab as usize) << 1;
            while total - SLAB_HEADER_BYTES < size {
                total <<= 1;
            }
            let bigger = new_slab(total, slab);
            (*bigger).begin = (bigger as *mut u8).add(SLAB_HEADER_BYTES + size);
            head.set(bigger);
            (bigger as *mut u8).add(SLAB_HEADER_BYTES)
        }
    })
}

/// Bump-allocate `size` bytes. `size` must already be a multiple of
/// [`MAX_ALIGN`]; the result is aligned to it.
pub fn allocate(size: usize) -> *mut u8 {
    debug_assert_eq!(size % MAX_ALIGN, 0);
    HEAD.with(|head| {
        let slab = head.get();
        assert!(!slab.is_null(), "arena not initialized");
        unsafe {
            let begin = (*slab).begin;
            if (*slab).end as usize - begin as usize >= size {
                (*slab).begin = begin.add(size);
                begin
            } else {
                allocate_cold(size)
            }
        }
    })
}

/// Place `value` in the arena. The value is never dropped, so `T` must not
/// have drop glue, and its alignment must fit the arena granule.
pub fn alloc<T>(value: T) -> NonNull<T> {
    const {
        assert!(!mem::needs_drop::<T>());
        assert!(mem::align_of::<T>() <= MAX_ALIGN);
    }
    let size = (mem::size_of::<T>() + MAX_ALIGN - 1) & !(MAX_ALIGN - 1);
    let raw = allocate(size.max(MAX_ALIGN)) as *mut T;
    unsafe {
        raw.write(value);
        NonNull::new_unchecked(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_arena(f: impl FnOnce()) {
        initialize();
        f();
        finalize();
    }

    #[test]
    fn bump_allocations_are_disjoint() {
        with_arena(|| {
            let a = allocate(64);
            let b = allocate(64);
            assert_eq!(a as usize + 64, b as usize);
            assert_eq!(a as usize % MAX_ALIGN, 0);
        });
    }

    #[test]
    fn grows_past_the_first_slab() {
        with_arena(|| {
            let mut last = ptr::null_mut();
            for _ in 0..64 {
                last = allocate(128 * 1024);
            }
            assert!(!last.is_null());
        });
    }

    #[test]
    fn advance_resets_the_head_slab() {
        with_arena(|| {
            let first = allocate(64);
            allocate(4 * 1024 * 1024);
            advance();
            let again = allocate(64);
            // The largest slab survives the advance and serves from its start.
            assert_eq!(again as usize % MAX_ALIGN, 0);
            assert_ne!(first, ptr::null_mut());
        });
    }

    #[test]
    fn typed_allocation_round_trips() {
        with_arena(|| {
            let value = alloc([7u64; 5]);
            assert_eq!(unsafe { value.as_ref() }[4], 7);
        });
    }
}
