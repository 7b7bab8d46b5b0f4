// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Randomized edit scripts against a model map, checking the committed
//! tree's structural invariants after every version.

use aptos_keyvalue::MemoryStore;
use aptos_merkle_avl::{FlushPolicy, MerkleAvlTree, NodeDb, NodeHash, StoreOptions};
use proptest::{collection::vec, prelude::*};
use std::{collections::BTreeMap, num::NonZeroUsize, sync::Arc};

#[derive(Clone, Debug)]
enum Op {
    Set(u16, Vec<u8>),
    Remove(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..48, vec(any::<u8>(), 0..6)).prop_map(|(k, v)| Op::Set(k, v)),
        1 => (0u16..48).prop_map(Op::Remove),
    ]
}

struct SubtreeInfo {
    height: u8,
    size: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

/// Walks a committed subtree by hash, asserting the AVL balance, height,
/// size and key-ordering invariants on every node.
fn check_subtree(ndb: &NodeDb<MemoryStore>, hash: &NodeHash) -> SubtreeInfo {
    let node = ndb.get_node(hash).unwrap();
    if node.is_leaf() {
        assert_eq!(node.size(), 1);
        assert!(node.value().is_some());
        return SubtreeInfo {
            height: 0,
            size: 1,
            min_key: node.key().to_vec(),
            max_key: node.key().to_vec(),
        };
    }

    let left = check_subtree(ndb, &node.left_hash().unwrap());
    let right = check_subtree(ndb, &node.right_hash().unwrap());

    assert_eq!(node.height(), 1 + left.height.max(right.height));
    assert_eq!(node.size(), left.size + right.size);
    let balance = i32::from(left.height) - i32::from(right.height);
    assert!(balance.abs() <= 1, "unbalanced node: {balance}");

    // Left subtree strictly below the boundary; the boundary is the
    // smallest key on the right.
    assert!(left.max_key.as_slice() < node.key());
    assert_eq!(right.min_key.as_slice(), node.key());

    SubtreeInfo {
        height: node.height(),
        size: node.size(),
        min_key: left.min_key,
        max_key: right.max_key,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn tree_matches_model_and_stays_balanced(
        scripts in vec(vec(op_strategy(), 1..40), 1..6),
    ) {
        let options = StoreOptions {
            cache_size: NonZeroUsize::new(256).unwrap(),
            flush_policy: FlushPolicy::Atomic,
        };
        let mut tree = MerkleAvlTree::new(Arc::new(MemoryStore::new()), &options);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for script in scripts {
            for op in script {
                match op {
                    Op::Set(key, value) => {
                        let key = key.to_be_bytes().to_vec();
                        let updated = tree.set(&key, &value).unwrap();
                        prop_assert_eq!(updated, model.insert(key, value).is_some());
                    },
                    Op::Remove(key) => {
                        let key = key.to_be_bytes().to_vec();
                        let removed = tree.remove(&key).unwrap();
                        prop_assert_eq!(removed, model.remove(&key));
                    },
                }
            }
            let (_, root) = tree.save_version().unwrap();

            prop_assert_eq!(tree.size(), model.len() as u64);
            for (key, value) in &model {
                let got = tree.get(key).unwrap();
                prop_assert_eq!(got.as_ref(), Some(value));
            }

            // In-order iteration reproduces the model exactly.
            let mut iterated = Vec::new();
            tree.iterate(&mut |k, v| {
                iterated.push((k.to_vec(), v.to_vec()));
                false
            }).unwrap();
            let expected: Vec<_> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            prop_assert_eq!(iterated, expected);

            // Structural invariants of the committed version.
            if let Some(root) = root {
                let info = check_subtree(tree.node_db(), &root);
                prop_assert_eq!(info.size, model.len() as u64);
            } else {
                prop_assert!(model.is_empty());
            }
        }
    }

    #[test]
    fn historical_versions_stay_intact(
        first in vec((0u16..16, vec(any::<u8>(), 1..4)), 1..12),
        second in vec((0u16..16, vec(any::<u8>(), 1..4)), 1..12),
    ) {
        let options = StoreOptions {
            cache_size: NonZeroUsize::new(256).unwrap(),
            flush_policy: FlushPolicy::Atomic,
        };
        let mut tree = MerkleAvlTree::new(Arc::new(MemoryStore::new()), &options);

        let mut model_v1 = BTreeMap::new();
        for (key, value) in first {
            let key = key.to_be_bytes().to_vec();
            tree.set(&key, &value).unwrap();
            model_v1.insert(key, value);
        }
        tree.save_version().unwrap();

        for (key, value) in second {
            let key = key.to_be_bytes().to_vec();
            tree.set(&key, &value).unwrap();
        }
        tree.save_version().unwrap();

        // Version 1 reads are unaffected by version 2 writes.
        for (key, value) in &model_v1 {
            let got = tree.get_versioned(1, key).unwrap();
            prop_assert_eq!(got.as_ref(), Some(value));
        }
    }
}
