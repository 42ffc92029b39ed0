//! Reclamation interface for shared immutable object graphs.
//!
//! The runtime and the map structures publish immutable nodes that are shared
//! across threads by reference. Reclaiming those graphs is the job of a
//! collector that is deliberately out of scope here; this crate defines the
//! narrow surface the rest of the system needs from *any* collector:
//!
//! - [`Scan`]: one method per object kind that enumerates its outgoing
//!   references. Implemented by trie nodes, skiplist nodes and heads, and the
//!   deque's circular arrays.
//! - [`shade`]: the mutator-side write barrier. An object whose last
//!   published reference has been overwritten (or that lost a publication
//!   race) is handed to the collector rather than freed in place.
//! - [`mutator_handshake`]: a periodic safe-point marker.
//! - [`alloc`]: allocation of a collected object, returning a shared
//!   reference valid until the collector proves it unreachable.
//!
//! The bundled collector is a stub: it retains retired objects in a bag and
//! never frees, which is trivially correct under the required publication
//! rule (a reference published with a release store stays valid until the
//! next quiescence). A tracing collector can replace it behind the same four
//! entry points.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Capability implemented by every collected object kind.
///
/// `scan` reports each outgoing reference to the marker exactly once per
/// edge. Objects with no outgoing references (leaf values, raw buffers)
/// implement it as a no-op.
pub trait Scan: Send + Sync {
    fn scan(&self, marker: &mut Marker);
}

/// Collector-side visitor handed to [`Scan::scan`].
///
/// Deduplicates by address, so cyclic or diamond-shaped graphs terminate.
pub struct Marker {
    pending: Vec<&'static dyn Scan>,
    visited: HashSet<*const ()>,
}

impl Marker {
    fn new() -> Marker {
        Marker {
            pending: Vec::new(),
            visited: HashSet::new(),
        }
    }

    /// Report one outgoing reference.
    pub fn visit(&mut self, object: &'static dyn Scan) {
        let address = object as *const dyn Scan as *const ();
        if self.visited.insert(address) {
            self.pending.push(object);
        }
    }
}

static RETIRED: Mutex<Vec<&'static dyn Scan>> = Mutex::new(Vec::new());
static HANDSHAKES: AtomicU64 = AtomicU64::new(0);

/// Allocate a collected object and return a shared reference to it.
///
/// Allocation failure is fatal: the workload is considered unviable once the
/// heap is exhausted.
pub fn alloc<T: Scan + 'static>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Write barrier: retire an object whose reference was overwritten or that
/// lost a publication race. The collector decides when it actually dies.
pub fn shade(object: &'static dyn Scan) {
    RETIRED.lock().push(object);
}

/// Number of objects currently parked in the retired bag.
pub fn retired_count() -> usize {
    RETIRED.lock().len()
}

/// Mutator safe-point. Cheap enough to call on phase boundaries.
pub fn mutator_handshake() {
    let n = HANDSHAKES.fetch_add(1, Ordering::Relaxed);
    log::trace!("mutator handshake {}", n + 1);
}

/// Number of safe-points observed so far.
pub fn handshake_count() -> u64 {
    HANDSHAKES.load(Ordering::Relaxed)
}

/// Walk the graph below `root` and count distinct reachable objects,
/// including `root` itself.
///
/// Diagnostic only; used by tests to observe structural sharing.
pub fn reachable_count(root: &'static dyn Scan) -> usize {
    let mut marker = Marker::new();
    marker.visit(root);
    while let Some(object) = marker.pending.pop() {
        object.scan(&mut marker);
    }
    marker.visited.len()
}
