//! Model-based property tests for the persistent trie.

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::trie::{merge_left, merge_right, PersistentIntMap};

fn sparse_key() -> impl Strategy<Value = u64> {
    // Mix dense low keys with sparse high ones so both deep and shallow
    // branch shapes appear.
    prop_oneof![
        0u64..4096,
        any::<u64>(),
        any::<u64>().prop_map(|k| k & 0xffff_0000_0000_ffff),
    ]
}

proptest! {
    #[test]
    fn round_trips_against_a_btree_model(
        entries in proptest::collection::vec((sparse_key(), any::<u64>()), 0..400),
        probes in proptest::collection::vec(sparse_key(), 0..100),
    ) {
        let mut map = PersistentIntMap::new();
        let mut model = BTreeMap::new();
        for (key, value) in entries {
            map.insert_or_replace(key, value);
            model.insert(key, value);
        }
        map.assert_invariant();
        prop_assert_eq!(map.len(), model.len());
        for (&key, &value) in &model {
            prop_assert_eq!(map.get(key), Some(&value));
        }
        for key in probes {
            prop_assert_eq!(map.get(key).copied(), model.get(&key).copied());
        }
    }

    #[test]
    fn merge_orientations_agree_with_the_model(
        left in proptest::collection::vec((sparse_key(), any::<u64>()), 0..200),
        right in proptest::collection::vec((sparse_key(), any::<u64>()), 0..200),
    ) {
        let mut a = PersistentIntMap::new();
        let mut model_a = BTreeMap::new();
        for (key, value) in left {
            a.insert_or_replace(key, value);
            model_a.insert(key, value);
        }
        let mut b = PersistentIntMap::new();
        let mut model_b = BTreeMap::new();
        for (key, value) in right {
            b.insert_or_replace(key, value);
            model_b.insert(key, value);
        }

        let left_wins = merge_left(&a, &b);
        left_wins.assert_invariant();
        let mut model_left = model_b.clone();
        model_left.extend(model_a.iter().map(|(&k, &v)| (k, v)));
        prop_assert_eq!(left_wins.len(), model_left.len());
        for (&key, &value) in &model_left {
            prop_assert_eq!(left_wins.get(key), Some(&value));
        }

        let right_wins = merge_right(&a, &b);
        let mut model_right = model_a.clone();
        model_right.extend(model_b.iter().map(|(&k, &v)| (k, v)));
        for (&key, &value) in &model_right {
            prop_assert_eq!(right_wins.get(key), Some(&value));
        }
    }
}
