//! Persistent 64-ary integer trie.
//!
//! A hash-array-mapped trie over `u64` keys with 6-bit digits: every node
//! covers the closed key range `[prefix, prefix | low_mask(shift + 6)]`,
//! split into 64 sub-ranges addressed by the digit at `shift`. Occupancy is
//! a 64-bit bitmap; children and values are stored packed, indexed by
//! popcount below the digit's bit. The top level uses `shift = 60`, where
//! only four key bits remain and the node degenerates to 16 usable slots.
//!
//! Nodes are immutable once published and shared structurally: updates copy
//! the path from the root and reference everything else by pointer.
//! Allocation goes through the reclamation heap, and `scan` enumerates the
//! children of branch nodes for the collector.
//!
//! Two collapses keep the structure canonical: a constructed node with no
//! slots is the empty map, and a branch with a single child *is* that
//! child. Sequential merge is take-left on key collisions; the right-biased
//! dual is the same merge with its arguments swapped.

use canopy_gc::{Marker, Scan};

pub type NodeRef<V> = &'static Node<V>;

/// Digit of `key` at bit position `shift`.
#[inline]
pub(crate) fn digit(key: u64, shift: u32) -> u64 {
    (key >> shift) & 63
}

/// Mask keeping the key bits above the digit at `shift`. Zero at
/// `shift = 60`, where no bits remain above the top digit.
#[inline]
pub(crate) fn high_mask(shift: u32) -> u64 {
    (!63u64).wrapping_shl(shift)
}

/// Mask of the key bits covered by a node at `shift` (digit and below).
#[inline]
pub(crate) fn low_mask(shift: u32) -> u64 {
    !high_mask(shift)
}

/// Position in the packed array for the slot whose bit is `bit`.
#[inline]
pub(crate) fn packed_index(bitmap: u64, bit: u64) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

/// True when `a` and `b` cannot share a node at `shift`: their keys differ
/// above the digit there.
#[inline]
pub(crate) fn disagree_above(a: u64, b: u64, shift: u32) -> bool {
    ((a ^ b) >> shift) >> 6 != 0
}

/// The digit position at which two distinct prefixes first differ, rounded
/// down to a multiple of 6.
#[inline]
pub(crate) fn branch_shift(delta: u64) -> u32 {
    debug_assert_ne!(delta, 0);
    ((63 - delta.leading_zeros()) / 6) * 6
}

/// Number of addressable slots at `shift`: 64 everywhere except the top
/// level, where only 16 digits exist.
#[inline]
pub(crate) fn slot_count(shift: u32) -> u64 {
    ((63u64 << shift) >> shift) + 1
}

enum Entries<V: 'static> {
    Children(Box<[NodeRef<V>]>),
    Values(Box<[V]>),
}

pub struct Node<V: 'static> {
    prefix: u64,
    shift: u32,
    bitmap: u64,
    entries: Entries<V>,
}

impl<V: Send + Sync + 'static> Scan for Node<V> {
    fn scan(&self, marker: &mut Marker) {
        if let Entries::Children(children) = &self.entries {
            for &child in children.iter() {
                marker.visit(child);
            }
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Node<V> {
    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn bitmap(&self) -> u64 {
        self.bitmap
    }

    /// Smallest key this node can cover.
    pub fn key_low(&self) -> u64 {
        self.prefix
    }

    /// Largest key this node can cover.
    pub fn key_high(&self) -> u64 {
        self.prefix | low_mask(self.shift)
    }

    pub(crate) fn child(&self, packed: usize) -> NodeRef<V> {
        match &self.entries {
            Entries::Children(children) => children[packed],
            Entries::Values(_) => unreachable!("value leaf has no children"),
        }
    }

    pub(crate) fn value(&self, packed: usize) -> &V {
        match &self.entries {
            Entries::Values(values) => &values[packed],
            Entries::Children(_) => unreachable!("branch has no values"),
        }
    }

    fn make_branch(prefix: u64, shift: u32, bitmap: u64, children: Box<[NodeRef<V>]>) -> NodeRef<V> {
        debug_assert!(shift > 0 && shift < 64 && shift % 6 == 0);
        debug_assert_eq!(prefix & !high_mask(shift), 0);
        debug_assert_ne!(bitmap, 0);
        debug_assert_eq!(bitmap.count_ones() as usize, children.len());
        canopy_gc::alloc(Node {
            prefix,
            shift,
            bitmap,
            entries: Entries::Children(children),
        })
    }

    fn make_values(prefix: u64, bitmap: u64, values: Box<[V]>) -> NodeRef<V> {
        debug_assert_eq!(prefix & 63, 0);
        debug_assert_ne!(bitmap, 0);
        debug_assert_eq!(bitmap.count_ones() as usize, values.len());
        canopy_gc::alloc(Node {
            prefix,
            shift: 0,
            bitmap,
            entries: Entries::Values(values),
        })
    }

    /// Leaf holding a single key.
    pub fn leaf(key: u64, value: V) -> NodeRef<V> {
        Self::make_values(key & !63, 1u64 << (key & 63), Box::new([value]))
    }

    /// Branch node from a dense, slot-indexed array of optional children.
    /// Empty collapses to `None`; a single child collapses to that child.
    pub fn from_children_array(
        prefix: u64,
        shift: u32,
        array: &[Option<NodeRef<V>>; 64],
    ) -> Option<NodeRef<V>> {
        let mut bitmap = 0u64;
        for (slot, entry) in array.iter().enumerate() {
            if entry.is_some() {
                bitmap |= 1u64 << slot;
            }
        }
        if bitmap == 0 {
            return None;
        }
        if bitmap.count_ones() == 1 {
            return array[bitmap.trailing_zeros() as usize];
        }
        let children = array
            .iter()
            .filter_map(|entry| *entry)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Some(Self::make_branch(prefix, shift, bitmap, children))
    }

    /// Leaf node from a dense, digit-indexed array of optional values.
    /// Empty collapses to `None`; single values are not collapsed.
    pub fn from_values_array(prefix: u64, array: &[Option<V>; 64]) -> Option<NodeRef<V>> {
        let mut bitmap = 0u64;
        for (slot, entry) in array.iter().enumerate() {
            if entry.is_some() {
                bitmap |= 1u64 << slot;
            }
        }
        if bitmap == 0 {
            return None;
        }
        let values = array
            .iter()
            .filter_map(|entry| entry.clone())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Some(Self::make_values(prefix, bitmap, values))
    }

    /// Minimal common ancestor of two subtrees with disjoint prefixes.
    pub fn with_two_children(p: NodeRef<V>, q: NodeRef<V>) -> NodeRef<V> {
        let delta = p.prefix ^ q.prefix;
        let shift = branch_shift(delta);
        debug_assert!(shift > p.shift && shift > q.shift);
        let prefix = p.prefix & high_mask(shift);
        let bit_p = 1u64 << digit(p.prefix, shift);
        let bit_q = 1u64 << digit(q.prefix, shift);
        debug_assert_ne!(bit_p, bit_q);
        let bitmap = bit_p | bit_q;
        let children: Box<[NodeRef<V>]> = if bit_p < bit_q {
            Box::new([p, q])
        } else {
            Box::new([q, p])
        };
        Self::make_branch(prefix, shift, bitmap, children)
    }

    /// Copy of this branch with `child` inserted at (or replacing) the slot
    /// its prefix selects.
    pub fn clone_with_child(&self, child: NodeRef<V>) -> NodeRef<V> {
        debug_assert!(self.shift > 0);
        debug_assert!(child.shift < self.shift);
        debug_assert!(!disagree_above(child.prefix, self.prefix, self.shift));
        let bit = 1u64 << digit(child.prefix, self.shift);
        let at = packed_index(self.bitmap, bit);
        let bitmap = self.bitmap | bit;
        let old = match &self.entries {
            Entries::Children(children) => children,
            Entries::Values(_) => unreachable!(),
        };
        let mut children = Vec::with_capacity(bitmap.count_ones() as usize);
        children.extend_from_slice(&old[..at]);
        children.push(child);
        let skip = usize::from(self.bitmap & bit != 0);
        children.extend_from_slice(&old[at + skip..]);
        Self::make_branch(self.prefix, self.shift, bitmap, children.into_boxed_slice())
    }

    /// Copy of this value leaf with `value` inserted at (or replacing) the
    /// key's digit.
    pub fn clone_with_value(&self, key: u64, value: V) -> NodeRef<V> {
        debug_assert_eq!(self.shift, 0);
        debug_assert!(!disagree_above(key, self.prefix, 0));
        let bit = 1u64 << (key & 63);
        let at = packed_index(self.bitmap, bit);
        let bitmap = self.bitmap | bit;
        let old = match &self.entries {
            Entries::Values(values) => values,
            Entries::Children(_) => unreachable!(),
        };
        let mut values = Vec::with_capacity(bitmap.count_ones() as usize);
        values.extend_from_slice(&old[..at]);
        values.push(value);
        let skip = usize::from(self.bitmap & bit != 0);
        values.extend_from_slice(&old[at + skip..]);
        Self::make_values(self.prefix, bitmap, values.into_boxed_slice())
    }

    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        let mut node = self;
        loop {
            if disagree_above(node.prefix, key, node.shift) {
                return None;
            }
            let bit = 1u64 << digit(key, node.shift);
            if node.bitmap & bit == 0 {
                return None;
            }
            let at = packed_index(node.bitmap, bit);
            if node.shift == 0 {
                return Some(node.value(at));
            }
            node = node.child(at);
        }
    }

    /// Path-copying insert. The result shares every node not on the key's
    /// path with `self`.
    pub fn insert_or_replace(&'static self, key: u64, value: V) -> NodeRef<V> {
        if disagree_above(self.prefix, key, self.shift) {
            return Self::with_two_children(self, Self::leaf(key, value));
        }
        if self.shift == 0 {
            return self.clone_with_value(key, value);
        }
        let bit = 1u64 << digit(key, self.shift);
        let child = if self.bitmap & bit != 0 {
            self.child(packed_index(self.bitmap, bit))
                .insert_or_replace(key, value)
        } else {
            Self::leaf(key, value)
        };
        self.clone_with_child(child)
    }

    /// Merge two subtrees, keeping the left value wherever a key occurs in
    /// both.
    pub fn merge_left(a: Option<NodeRef<V>>, b: Option<NodeRef<V>>) -> Option<NodeRef<V>> {
        match (a, b) {
            (a, None) => a,
            (None, b) => b,
            (Some(a), Some(b)) => Some(Self::merge_left_nodes(a, b)),
        }
    }

    fn merge_left_nodes(a: NodeRef<V>, b: NodeRef<V>) -> NodeRef<V> {
        let top = a.shift.max(b.shift);
        if disagree_above(a.prefix, b.prefix, top) {
            // Disjoint ranges: a new parent adopts both.
            return Self::with_two_children(a, b);
        }
        if a.shift > b.shift {
            // a is an ancestor of b's range.
            let bit = 1u64 << digit(b.prefix, a.shift);
            let merged = if a.bitmap & bit != 0 {
                Self::merge_left_nodes(a.child(packed_index(a.bitmap, bit)), b)
            } else {
                b
            };
            return a.clone_with_child(merged);
        }
        if b.shift > a.shift {
            let bit = 1u64 << digit(a.prefix, b.shift);
            let merged = if b.bitmap & bit != 0 {
                Self::merge_left_nodes(a, b.child(packed_index(b.bitmap, bit)))
            } else {
                a
            };
            return b.clone_with_child(merged);
        }
        // Siblings: identical prefix and shift.
        debug_assert_eq!(a.prefix, b.prefix);
        let union = a.bitmap | b.bitmap;
        if a.shift > 0 {
            let mut children = Vec::with_capacity(union.count_ones() as usize);
            let mut rest = union;
            let mut at_a = 0usize;
            let mut at_b = 0usize;
            while rest != 0 {
                let bit = rest & rest.wrapping_neg();
                rest ^= bit;
                let in_a = a.bitmap & bit != 0;
                let in_b = b.bitmap & bit != 0;
                if in_a && in_b {
                    children.push(Self::merge_left_nodes(a.child(at_a), b.child(at_b)));
                    at_a += 1;
                    at_b += 1;
                } else if in_a {
                    children.push(a.child(at_a));
                    at_a += 1;
                } else {
                    children.push(b.child(at_b));
                    at_b += 1;
                }
            }
            Self::make_branch(a.prefix, a.shift, union, children.into_boxed_slice())
        } else {
            let mut values = Vec::with_capacity(union.count_ones() as usize);
            let mut rest = union;
            let mut at_a = 0usize;
            let mut at_b = 0usize;
            while rest != 0 {
                let bit = rest & rest.wrapping_neg();
                rest ^= bit;
                let in_a = a.bitmap & bit != 0;
                let in_b = b.bitmap & bit != 0;
                if in_a && in_b {
                    // Collision: the left value survives.
                    values.push(a.value(at_a).clone());
                    at_a += 1;
                    at_b += 1;
                } else if in_a {
                    values.push(a.value(at_a).clone());
                    at_a += 1;
                } else {
                    values.push(b.value(at_b).clone());
                    at_b += 1;
                }
            }
            Self::make_values(a.prefix, union, values.into_boxed_slice())
        }
    }

    /// Narrow `node` to the closed range `[lo, hi]`: descend while the
    /// range stays within a single slot, then return the node if any slot
    /// the range touches is populated.
    pub fn for_closed_range(node: NodeRef<V>, lo: u64, hi: u64) -> Option<NodeRef<V>> {
        debug_assert!(lo <= hi);
        let mut node = node;
        loop {
            if hi < node.key_low() || lo > node.key_high() {
                return None;
            }
            let a = lo >> node.shift;
            let b = hi >> node.shift;
            if a != b || node.shift == 0 {
                let digit_a = (a & 63) as u32;
                let digit_b = (b & 63) as u32;
                let span = (!0u64).wrapping_shl(digit_a) ^ (!1u64).wrapping_shl(digit_b);
                return if node.bitmap & span != 0 { Some(node) } else { None };
            }
            let bit = 1u64 << (a & 63);
            if node.bitmap & bit == 0 {
                return None;
            }
            node = node.child(packed_index(node.bitmap, bit));
        }
    }

    /// Walk the subtree checking every structural invariant. Debug builds
    /// only; release builds compile it away at the call sites.
    pub fn assert_invariant(&self) {
        assert!(self.shift < 64 && self.shift % 6 == 0);
        assert_eq!(self.prefix & low_mask(self.shift), 0);
        assert_ne!(self.bitmap, 0);
        match &self.entries {
            Entries::Values(values) => {
                assert_eq!(self.shift, 0);
                assert_eq!(values.len(), self.bitmap.count_ones() as usize);
            }
            Entries::Children(children) => {
                assert!(self.shift > 0);
                assert_eq!(children.len(), self.bitmap.count_ones() as usize);
                assert!(children.len() > 1, "single-child branch must collapse");
                let mut packed = 0usize;
                for slot in 0..64u64 {
                    if self.bitmap & (1u64 << slot) == 0 {
                        continue;
                    }
                    let child = children[packed];
                    packed += 1;
                    assert!(child.shift < self.shift);
                    assert_eq!(child.prefix >> self.shift, (self.prefix >> self.shift) | slot);
                    child.assert_invariant();
                }
            }
        }
    }

    /// Count the entries in the subtree.
    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Values(values) => values.len(),
            Entries::Children(children) => children.iter().map(|child| child.len()).sum(),
        }
    }
}

/// A persistent map from `u64` to `V`. Copying the handle is free and
/// shares all structure; mutation rebinds the root.
pub struct PersistentIntMap<V: 'static> {
    root: Option<NodeRef<V>>,
}

impl<V: 'static> Clone for PersistentIntMap<V> {
    fn clone(&self) -> Self {
        PersistentIntMap { root: self.root }
    }
}

impl<V: 'static> Copy for PersistentIntMap<V> {}

impl<V: Clone + Send + Sync + 'static> Default for PersistentIntMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> PersistentIntMap<V> {
    pub const fn new() -> Self {
        PersistentIntMap { root: None }
    }

    pub const fn from_root(root: Option<NodeRef<V>>) -> Self {
        PersistentIntMap { root }
    }

    pub fn root(&self) -> Option<NodeRef<V>> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn len(&self) -> usize {
        self.root.map_or(0, |root| root.len())
    }

    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: u64) -> Option<&'static V> {
        self.root.and_then(|root| root.get(key))
    }

    pub fn insert_or_replace(&mut self, key: u64, value: V) {
        self.root = Some(match self.root {
            Some(root) => root.insert_or_replace(key, value),
            None => Node::leaf(key, value),
        });
    }

    /// The subtree whose coverage is narrowed to `[lo, hi]`, sharing all
    /// structure with `self`.
    pub fn submap_for_closed_range(&self, lo: u64, hi: u64) -> Self {
        PersistentIntMap {
            root: self.root.and_then(|root| Node::for_closed_range(root, lo, hi)),
        }
    }

    pub fn assert_invariant(&self) {
        if let Some(root) = self.root {
            root.assert_invariant();
        }
    }
}

/// Merge, left value winning on key collisions.
pub fn merge_left<V: Clone + Send + Sync + 'static>(
    a: &PersistentIntMap<V>,
    b: &PersistentIntMap<V>,
) -> PersistentIntMap<V> {
    PersistentIntMap::from_root(Node::merge_left(a.root(), b.root()))
}

/// Merge, right value winning on key collisions.
pub fn merge_right<V: Clone + Send + Sync + 'static>(
    a: &PersistentIntMap<V>,
    b: &PersistentIntMap<V>,
) -> PersistentIntMap<V> {
    merge_left(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    #[test]
    fn round_trip_random_keys() {
        let mut rng = SmallRng::seed_from_u64(0x0c0ffee);
        let mut map = PersistentIntMap::new();
        let mut model = BTreeMap::new();
        for _ in 0..4000 {
            let key = rng.gen::<u64>() >> rng.gen_range(0..40);
            let value = rng.gen::<u64>();
            map.insert_or_replace(key, value);
            model.insert(key, value);
        }
        map.assert_invariant();
        for (&key, &value) in &model {
            assert_eq!(map.get(key), Some(&value));
        }
        for _ in 0..1000 {
            let key = rng.gen::<u64>();
            assert_eq!(map.get(key).copied(), model.get(&key).copied());
        }
    }

    #[test]
    fn replace_overwrites_in_place() {
        let mut map = PersistentIntMap::new();
        map.insert_or_replace(42, 1u64);
        map.insert_or_replace(42, 2);
        assert_eq!(map.get(42), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn merge_left_prefers_left_values() {
        let mut a = PersistentIntMap::new();
        a.insert_or_replace(1, 10u64);
        a.insert_or_replace(2, 20);
        let mut b = PersistentIntMap::new();
        b.insert_or_replace(2, 200u64);
        b.insert_or_replace(3, 30);
        let c = merge_left(&a, &b);
        assert_eq!(c.get(1), Some(&10));
        assert_eq!(c.get(2), Some(&20));
        assert_eq!(c.get(3), Some(&30));
        let d = merge_right(&a, &b);
        assert_eq!(d.get(2), Some(&200));
    }

    #[test]
    fn merge_with_self_is_extensionally_identity() {
        let mut a = PersistentIntMap::new();
        for key in [3u64, 77, 4096, 1 << 40] {
            a.insert_or_replace(key, key * 2);
        }
        let merged = merge_left(&a, &a);
        merged.assert_invariant();
        assert_eq!(merged.len(), a.len());
        for key in [3u64, 77, 4096, 1 << 40] {
            assert_eq!(merged.get(key), a.get(key));
        }
    }

    #[test]
    fn disjoint_merge_shares_subtrees_by_identity() {
        let mut low = PersistentIntMap::new();
        for key in 0..64u64 {
            low.insert_or_replace(key, key);
        }
        let mut high = PersistentIntMap::new();
        for key in 0..64u64 {
            high.insert_or_replace(key | (1 << 30), key);
        }
        let merged = merge_left(&low, &high);
        merged.assert_invariant();
        let root = merged.root().unwrap();
        assert!(root.shift() > 0);
        let shared: Vec<_> = (0..root.bitmap().count_ones() as usize)
            .map(|at| root.child(at))
            .collect();
        assert!(shared
            .iter()
            .any(|&child| std::ptr::eq(child, low.root().unwrap())));
        assert!(shared
            .iter()
            .any(|&child| std::ptr::eq(child, high.root().unwrap())));
    }

    #[test]
    fn range_projection_narrows_to_covering_node() {
        let mut map = PersistentIntMap::new();
        for key in (0..4096u64).step_by(3) {
            map.insert_or_replace(key, key);
        }
        let sub = map.submap_for_closed_range(100, 200);
        assert!(sub.root().is_some());
        assert!(sub.contains(102));
        let empty = map.submap_for_closed_range(1 << 40, (1 << 40) + 5);
        assert!(empty.is_empty());
    }

    #[test]
    fn structural_sharing_after_insert() {
        let mut map = PersistentIntMap::new();
        for key in 0..256u64 {
            map.insert_or_replace(key, key);
        }
        let before = map;
        map.insert_or_replace(1 << 50, 7);
        // The old root is one child of the new root, by identity.
        let root = map.root().unwrap();
        let kept = (0..root.bitmap().count_ones() as usize)
            .map(|at| root.child(at))
            .any(|child| std::ptr::eq(child, before.root().unwrap()));
        assert!(kept);
        assert_eq!(before.get(1 << 50), None);
    }

    #[test]
    fn top_level_digits_split_correctly() {
        let mut map = PersistentIntMap::new();
        map.insert_or_replace(0, 1u64);
        map.insert_or_replace(u64::MAX, 2);
        map.assert_invariant();
        assert_eq!(map.get(0), Some(&1));
        assert_eq!(map.get(u64::MAX), Some(&2));
        let root = map.root().unwrap();
        assert_eq!(root.shift(), 60);
        assert_eq!(root.prefix(), 0);
    }
}
