//! Canopy-Map: a persistent 64-ary integer trie and an insert-only
//! concurrent skiplist, built for fork/join computation on the canopy
//! runtime.
//!
//! The [`PersistentIntMap`] is a bitmap-compressed trie over `u64` keys
//! with structural sharing: lookups walk at most eleven levels, updates
//! copy only the root path, and merges reference unchanged subtrees by
//! pointer. The [`SkipMap`] absorbs concurrent inserts and then freezes,
//! one way, into a [`FrozenSkipMap`] whose cursors support range-refined
//! queries without re-descending from the head.
//!
//! [`parallel_generate`], [`parallel_merge_left`] and
//! [`parallel_merge_right`] run generation and both merge orientations as
//! continuation-task graphs over a `canopy_rt::Scheduler`, including the
//! trie x frozen-skiplist merge that converts skiplist ranges into trie
//! subtrees in place.

mod parallel;
#[cfg(test)]
mod proptests;
mod skiplist;
mod trie;

pub use parallel::{parallel_generate, parallel_merge_left, parallel_merge_right, ParallelValue};
pub use skiplist::{Cursor, FrozenSkipMap, Iter, SkipMap, SkipNode};
pub use trie::{merge_left, merge_right, Node, NodeRef, PersistentIntMap};
