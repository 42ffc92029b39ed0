//! Insert-only concurrent skiplist with a frozen read view.
//!
//! Tailored to a two-phase workload: many threads `emplace` concurrently,
//! the structure is frozen once, and readers then run cursor-based range
//! queries against the immutable form. Neither half supports erase.
//!
//! Successor arrays are right-sized per node at allocation. Node height is
//! sampled as h = 1 + ctz(x | 1 << 12) where x folds a 24-bit uniform draw
//! so each low bit is set with probability 3/4: a geometric distribution
//! with p(n) = 3 * 4^-n and ceiling 13. That sits close to the
//! e^-1-optimal expected search steps while keeping the arrays small; the
//! price is more variance than p = 1/2.
//!
//! W. Pugh. Skip lists: a probabilistic alternative to balanced trees.
//! CACM 1990.
//!
//! Freezing is an ownership move: the frozen view wraps the same head, and
//! no copy occurs. A frozen cursor carries the whole "search path
//! positioned here" state in two words, so parallel subqueries copy a
//! cursor and refine it instead of re-descending from the head.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use canopy_gc::{Marker, Scan};

/// Head successor width; also the hard ceiling on node height.
const MAX_HEIGHT: usize = 33;
/// Height sampling ceiling: 1 + 12 levels covers 4^12 = 2^24 elements.
const HEIGHT_CEILING_BIT: u32 = 12;

thread_local! {
    static HEIGHT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

fn sample_height() -> usize {
    let draw: u32 = HEIGHT_RNG.with(|rng| rng.borrow_mut().gen::<u32>()) & 0x00ff_ffff;
    // Fold the top half onto the bottom: each low bit set with p = 3/4.
    let folded = (draw | (draw >> 12)) | (1 << HEIGHT_CEILING_BIT);
    1 + folded.trailing_zeros() as usize
}

type Link<K, V> = AtomicPtr<SkipNode<K, V>>;

#[derive(Debug)]
pub struct SkipNode<K: 'static, V: 'static> {
    key: K,
    value: V,
    next: Box<[Link<K, V>]>,
}

impl<K: PartialEq, V: PartialEq> PartialEq for SkipNode<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

impl<K, V> SkipNode<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    fn height(&self) -> usize {
        self.next.len()
    }
}

impl<K: Send + Sync + 'static, V: Send + Sync + 'static> Scan for SkipNode<K, V> {
    fn scan(&self, marker: &mut Marker) {
        for link in self.next.iter() {
            let successor = link.load(Ordering::Relaxed);
            if let Some(successor) = unsafe { successor.as_ref() } {
                marker.visit(successor);
            }
        }
    }
}

/// Keyless list head: the current top level and a full-width successor
/// array. `top` only grows.
pub struct Head<K: 'static, V: 'static> {
    top: AtomicUsize,
    next: [Link<K, V>; MAX_HEIGHT],
}

impl<K: Send + Sync + 'static, V: Send + Sync + 'static> Scan for Head<K, V> {
    fn scan(&self, marker: &mut Marker) {
        for link in self.next.iter() {
            let successor = link.load(Ordering::Relaxed);
            if let Some(successor) = unsafe { successor.as_ref() } {
                marker.visit(successor);
            }
        }
    }
}

/// The concurrent, insert-only half.
pub struct SkipMap<K: 'static, V: 'static> {
    head: &'static Head<K, V>,
}

// The head is shared by reference; all mutation is CAS-based.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for SkipMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipMap<K, V> {}

impl<K, V> SkipMap<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> SkipMap<K, V> {
        SkipMap {
            head: canopy_gc::alloc(Head {
                top: AtomicUsize::new(1),
                next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            }),
        }
    }

    /// Link `node` in front of `expected` at `level`, rescanning forward on
    /// contention. Returns the resident node for the key and whether it is
    /// the one we tried to link.
    fn link_level(
        level: usize,
        mut array: &'static [Link<K, V>],
        mut expected: *mut SkipNode<K, V>,
        node: &'static SkipNode<K, V>,
    ) -> (&'static SkipNode<K, V>, bool) {
        loop {
            node.next[level].store(expected, Ordering::Release);
            match array[level].compare_exchange(
                expected,
                node as *const SkipNode<K, V> as *mut SkipNode<K, V>,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return (node, true),
                Err(mut observed) => {
                    // Someone linked ahead of us; walk forward until we are
                    // again in front of the insertion point.
                    loop {
                        let ahead = match unsafe { observed.as_ref() } {
                            None => {
                                expected = observed;
                                break;
                            }
                            Some(ahead) => ahead,
                        };
                        if node.key < ahead.key {
                            expected = observed;
                            break;
                        }
                        if !(ahead.key < node.key) {
                            return (ahead, false);
                        }
                        array = &ahead.next;
                        observed = array[level].load(Ordering::Acquire);
                    }
                }
            }
        }
    }

    /// Single recursive descent: scan forward at each level, allocate and
    /// link at the bottom, then link the upper levels on the way back up.
    fn emplace_at(
        level: usize,
        mut array: &'static [Link<K, V>],
        entry: &mut Option<(K, V)>,
    ) -> (&'static SkipNode<K, V>, bool) {
        let candidate = loop {
            let candidate = array[level].load(Ordering::Acquire);
            let ahead = match unsafe { candidate.as_ref() } {
                None => break candidate,
                Some(ahead) => ahead,
            };
            let key = &entry.as_ref().expect("entry consumed early").0;
            if key < &ahead.key {
                break candidate;
            }
            if !(&ahead.key < key) {
                return (ahead, false);
            }
            array = &ahead.next;
        };
        if level == 0 {
            let (key, value) = entry.take().expect("entry consumed early");
            let height = sample_height();
            let node = canopy_gc::alloc(SkipNode {
                key,
                value,
                next: (0..height)
                    .map(|_| AtomicPtr::new(ptr::null_mut()))
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            });
            let (resident, installed) = Self::link_level(0, array, candidate, node);
            if !installed {
                // Lost the duplicate race; the collector owns the loser.
                canopy_gc::shade(node);
            }
            (resident, installed)
        } else {
            let (resident, installed) = Self::emplace_at(level - 1, array, entry);
            if installed && level < resident.height() {
                let (_, linked) = Self::link_level(level, array, candidate, resident);
                debug_assert!(linked, "duplicate key appeared above level 0");
            }
            (resident, installed)
        }
    }

    /// Insert `key` if absent. Returns the resident node and whether this
    /// call installed it; on a duplicate the given value is discarded.
    pub fn emplace(&self, key: K, value: V) -> (&'static SkipNode<K, V>, bool) {
        let top = self.head.top.load(Ordering::Relaxed);
        debug_assert!(top >= 1);
        let mut entry = Some((key, value));
        let (resident, installed) = Self::emplace_at(top - 1, &self.head.next, &mut entry);
        if installed && resident.height() > top {
            // Raise the head. `top` only grows, so no re-read is needed.
            self.head.top.fetch_max(resident.height(), Ordering::Relaxed);
            for level in top..resident.height() {
                Self::link_level(level, &self.head.next, ptr::null_mut(), resident);
            }
        }
        (resident, installed)
    }

    /// One-way transition to the immutable form. The same head bytes serve
    /// both layouts; no copy occurs.
    pub fn freeze(self) -> FrozenSkipMap<K, V> {
        FrozenSkipMap { head: self.head }
    }
}

impl<K, V> Default for SkipMap<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        SkipMap::new()
    }
}

/// The immutable half. Cheap to copy; all queries go through cursors.
pub struct FrozenSkipMap<K: 'static, V: 'static> {
    head: &'static Head<K, V>,
}

impl<K, V> Clone for FrozenSkipMap<K, V> {
    fn clone(&self) -> Self {
        FrozenSkipMap { head: self.head }
    }
}

impl<K, V> Copy for FrozenSkipMap<K, V> {}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for FrozenSkipMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for FrozenSkipMap<K, V> {}

impl<K, V> FrozenSkipMap<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Cursor at the top of the head's search path.
    pub fn cursor(&self) -> Cursor<K, V> {
        Cursor {
            next: &self.head.next,
            level: self.head.top.load(Ordering::Relaxed) - 1,
        }
    }

    pub fn iter(&self) -> Iter<K, V> {
        Iter {
            node: self.head.next[0].load(Ordering::Relaxed),
        }
    }

    pub fn find(&self, query: &K) -> Option<&'static SkipNode<K, V>> {
        self.cursor().find(query)
    }

    pub fn lower_bound(&self, query: &K) -> Option<&'static SkipNode<K, V>> {
        self.cursor().lower_bound(query)
    }

    /// Whether any key lies in the closed range `[lo, hi]`.
    pub fn intersects_closed_range(&self, lo: &K, hi: &K) -> bool {
        self.cursor().refine_closed_range(lo, hi)
    }
}

/// A position on the search path: the successor array currently under the
/// cursor and the level within it. Copy a cursor to branch a subquery.
pub struct Cursor<K: 'static, V: 'static> {
    next: &'static [Link<K, V>],
    level: usize,
}

impl<K, V> Clone for Cursor<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Cursor<K, V> {}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for Cursor<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Cursor<K, V> {}

impl<K, V> Cursor<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn load(&self) -> Option<&'static SkipNode<K, V>> {
        unsafe { self.next[self.level].load(Ordering::Relaxed).as_ref() }
    }

    pub fn is_bottom(&self) -> bool {
        self.level == 0
    }

    pub fn descend(&mut self) {
        debug_assert!(self.level > 0);
        self.level -= 1;
    }

    pub fn advance(&mut self) {
        let node = self.load().expect("advance past the end");
        self.next = &node.next;
    }

    pub fn as_iter(&self) -> Iter<K, V> {
        Iter {
            node: self.next[0].load(Ordering::Relaxed),
        }
    }

    /// Refine toward `[lo, hi]`: advance when the pointee is left of the
    /// range, descend otherwise. True exactly when a key lies in the range,
    /// with the cursor stopped at level 0 on the first such key; false once
    /// the bottom proves the range empty. An in-range pointee above the
    /// bottom still descends, because only the bottom level is
    /// authoritative about the first key at or after `lo`.
    pub fn refine_closed_range(&mut self, lo: &K, hi: &K) -> bool {
        loop {
            match self.load() {
                None => {
                    if self.is_bottom() {
                        return false;
                    }
                    self.descend();
                }
                Some(node) => {
                    if &node.key < lo {
                        self.next = &node.next;
                    } else if self.is_bottom() {
                        return !(hi < &node.key);
                    } else {
                        self.descend();
                    }
                }
            }
        }
    }

    /// First node with key not less than `query`, or `None` past the end.
    pub fn lower_bound(&mut self, query: &K) -> Option<&'static SkipNode<K, V>> {
        loop {
            match self.load() {
                None => {
                    if self.is_bottom() {
                        return None;
                    }
                    self.descend();
                }
                Some(node) => {
                    if query < &node.key {
                        if self.is_bottom() {
                            return Some(node);
                        }
                        self.descend();
                    } else if &node.key < query {
                        self.next = &node.next;
                    } else {
                        return Some(node);
                    }
                }
            }
        }
    }

    /// Exact-match lookup.
    pub fn find(&mut self, query: &K) -> Option<&'static SkipNode<K, V>> {
        loop {
            match self.load() {
                None => {
                    if self.is_bottom() {
                        return None;
                    }
                    self.descend();
                }
                Some(node) => {
                    if query < &node.key {
                        if self.is_bottom() {
                            return None;
                        }
                        self.descend();
                    } else if &node.key < query {
                        self.next = &node.next;
                    } else {
                        return Some(node);
                    }
                }
            }
        }
    }

    /// Position just before the first key not less than `query`, returning
    /// the exact match when present. Dual of [`Cursor::lower_bound`] for
    /// walks that approach from the left.
    pub fn reverse_lower_bound(&mut self, query: &K) -> Option<&'static SkipNode<K, V>> {
        loop {
            match self.load() {
                Some(node) if &node.key < query => self.next = &node.next,
                Some(node) if !(query < &node.key) => return Some(node),
                other => {
                    if self.is_bottom() {
                        return other;
                    }
                    self.descend();
                }
            }
        }
    }
}

pub struct Iter<K: 'static, V: 'static> {
    node: *mut SkipNode<K, V>,
}

impl<K: 'static, V: 'static> Iterator for Iter<K, V> {
    type Item = (&'static K, &'static V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = unsafe { self.node.as_ref() }?;
        self.node = node.next[0].load(Ordering::Relaxed);
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn emplace_then_iterate_in_order() {
        let map = SkipMap::new();
        let mut keys: Vec<u64> = (0..500).map(|i| i * 7 % 499).collect();
        keys.shuffle(&mut rand::thread_rng());
        for &key in &keys {
            map.emplace(key, key + 1);
        }
        let frozen = map.freeze();
        let drained: Vec<u64> = frozen.iter().map(|(&k, _)| k).collect();
        let expected: Vec<u64> = keys.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        assert_eq!(drained, expected);
        for (&key, &value) in frozen.iter() {
            assert_eq!(value, key + 1);
        }
    }

    #[test]
    fn duplicate_emplace_returns_the_resident_node() {
        let map = SkipMap::new();
        let (first, installed) = map.emplace(9u64, 1u64);
        assert!(installed);
        let (second, installed) = map.emplace(9u64, 2u64);
        assert!(!installed);
        assert!(std::ptr::eq(first, second));
        assert_eq!(*second.value(), 1);
    }

    #[test]
    fn concurrent_duplicates_install_exactly_once() {
        let map = SkipMap::new();
        let installs = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for key in 0..200u64 {
                        if map.emplace(key, key).1 {
                            installs.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(installs.load(Ordering::Relaxed), 200);
        let frozen = map.freeze();
        assert_eq!(frozen.iter().count(), 200);
    }

    #[test]
    fn concurrent_inserts_from_four_threads_freeze_ordered() {
        let map = SkipMap::new();
        thread::scope(|scope| {
            for key in [5u64, 10, 15, 20] {
                let map = &map;
                scope.spawn(move || {
                    map.emplace(key, key * 100);
                });
            }
        });
        let frozen = map.freeze();
        let keys: Vec<u64> = frozen.iter().map(|(&k, _)| k).collect();
        assert_eq!(keys, vec![5, 10, 15, 20]);

        let mut cursor = frozen.cursor();
        assert!(cursor.refine_closed_range(&11, &19));
        assert_eq!(cursor.as_iter().next().map(|(&k, _)| k), Some(15));

        let mut cursor = frozen.cursor();
        assert!(!cursor.refine_closed_range(&6, &9));
    }

    #[test]
    fn cursor_queries_agree_with_model() {
        let map = SkipMap::new();
        for key in (0..1000u64).step_by(10) {
            map.emplace(key, key);
        }
        let frozen = map.freeze();

        assert_eq!(frozen.find(&500).map(|n| *n.key()), Some(500));
        assert_eq!(frozen.find(&501), None);
        assert_eq!(frozen.lower_bound(&501).map(|n| *n.key()), Some(510));
        assert_eq!(frozen.lower_bound(&991), None);
        assert!(frozen.intersects_closed_range(&195, &205));
        assert!(!frozen.intersects_closed_range(&991, &999));

        let mut cursor = frozen.cursor();
        assert_eq!(cursor.reverse_lower_bound(&340).map(|n| *n.key()), Some(340));
    }

    #[test]
    fn refined_cursor_copies_refine_independently() {
        let map = SkipMap::new();
        for key in 0..4096u64 {
            map.emplace(key, key);
        }
        let frozen = map.freeze();
        let mut wide = frozen.cursor();
        assert!(wide.refine_closed_range(&1024, &3071));
        let mut left = wide;
        let mut right = wide;
        assert!(left.refine_closed_range(&1024, &2047));
        assert!(right.refine_closed_range(&2048, &3071));
        assert_eq!(left.as_iter().next().map(|(&k, _)| k), Some(1024));
        assert_eq!(right.as_iter().next().map(|(&k, _)| k), Some(2048));
    }

    #[test]
    fn sampled_heights_stay_within_ceiling() {
        for _ in 0..10_000 {
            let height = sample_height();
            assert!((1..=1 + HEIGHT_CEILING_BIT as usize).contains(&height));
        }
    }
}
