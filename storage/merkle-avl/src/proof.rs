// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Merkle membership proofs.
//!
//! A proof carries the leaf's version and, for every inner node on the path
//! from the leaf up to the root, the fields needed to recompute that node's
//! hash with the child hash filled in from below: the sibling hash sits on
//! its real side, the descended side is left empty. Verification therefore
//! needs nothing but the proof, the key/value pair and the trusted root
//! hash.

use crate::{
    node::{self, NodeHash},
    tree::MerkleAvlTree,
    Error, Result,
};
use aptos_keyvalue::KeyValueStore;

/// One step of the path, leaf to root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProofInnerNode {
    pub height: u8,
    pub size: u64,
    pub version: u64,
    pub key: Vec<u8>,
    /// Hash of the left child, absent when the path descended left.
    pub left: Option<NodeHash>,
    /// Hash of the right child, absent when the path descended right.
    pub right: Option<NodeHash>,
}

/// Proof that a key/value pair is a leaf of the tree with a given root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MembershipProof {
    /// Version of the proven leaf node.
    pub leaf_version: u64,
    /// Inner nodes from the leaf's parent up to the root.
    pub path: Vec<ProofInnerNode>,
}

impl MembershipProof {
    /// Recomputes the root hash from the leaf up and compares it against
    /// `root_hash`.
    pub fn verify(&self, key: &[u8], value: &[u8], root_hash: &NodeHash) -> Result<()> {
        let mut running = node::hash_leaf(self.leaf_version, key, value)?;
        for step in &self.path {
            if step.height == 0 {
                return Err(Error::InvalidProof("leaf node on inner path".to_string()));
            }
            running = match (&step.left, &step.right) {
                (None, Some(right)) => node::hash_inner(
                    step.height,
                    step.size,
                    step.version,
                    &step.key,
                    &running,
                    right,
                )?,
                (Some(left), None) => node::hash_inner(
                    step.height,
                    step.size,
                    step.version,
                    &step.key,
                    left,
                    &running,
                )?,
                _ => {
                    return Err(Error::InvalidProof(
                        "path step must carry exactly one sibling hash".to_string(),
                    ))
                },
            };
        }
        if running == *root_hash {
            Ok(())
        } else {
            Err(Error::InvalidProof(format!(
                "computed root {running}, expected {root_hash}"
            )))
        }
    }
}

impl<S: KeyValueStore> MerkleAvlTree<S> {
    /// Value and membership proof for `key` at the latest committed
    /// version. `None` when the key is absent (or the version is empty).
    pub fn get_with_proof(&self, key: &[u8]) -> Result<Option<(Vec<u8>, MembershipProof)>> {
        self.get_versioned_with_proof(self.version(), key)
    }

    /// Value and membership proof for `key` at a committed version.
    pub fn get_versioned_with_proof(
        &self,
        version: u64,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, MembershipProof)>> {
        let Some(mut node) = self.version_root(version)? else {
            return Ok(None);
        };
        let mut path = Vec::new();
        loop {
            if node.is_leaf() {
                if node.key() != key {
                    return Ok(None);
                }
                let value = node
                    .value()
                    .ok_or_else(|| Error::corruption("leaf node without a value"))?
                    .to_vec();
                path.reverse();
                return Ok(Some((
                    value,
                    MembershipProof {
                        leaf_version: node.version(),
                        path,
                    },
                )));
            }

            let left_hash = node
                .left_hash()
                .ok_or_else(|| Error::corruption("persisted inner node without left hash"))?;
            let right_hash = node
                .right_hash()
                .ok_or_else(|| Error::corruption("persisted inner node without right hash"))?;
            let descend_left = key < node.key();
            let (next, left, right) = if descend_left {
                (left_hash, None, Some(right_hash))
            } else {
                (right_hash, Some(left_hash), None)
            };
            path.push(ProofInnerNode {
                height: node.height(),
                size: node.size(),
                version: node.version(),
                key: node.key().to_vec(),
                left,
                right,
            });
            node = self.ndb.get_node(&next)?;
        }
    }
}
