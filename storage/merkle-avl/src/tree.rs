// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The versioned copy-on-write AVL tree.
//!
//! Mutations clone every node on the path from the affected leaf to the
//! root; untouched subtrees stay shared by hash. Each persisted node that a
//! mutation supersedes goes into the orphan map under the version that
//! introduced it, and the whole map is written out at the next
//! [`MerkleAvlTree::save_version`].
//!
//! Inner nodes carry the smallest key of their right subtree, so lookups
//! descend left on strictly-smaller and right otherwise, and only leaves
//! store values.

use crate::{
    node::{ChildSlot, Node, NodeHash, Side},
    node_db::NodeDb,
    Error, Result, StoreOptions,
};
use aptos_keyvalue::KeyValueStore;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::debug;

/// Callback for in-order traversals; returning `true` stops the walk.
pub type IterFn<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> bool;

enum RemoveOutcome {
    /// Key absent below this node; the subtree is handed back untouched.
    NotFound(Box<Node>),
    /// Key removed. `new` is the replacement subtree (`None` when the whole
    /// subtree was the removed leaf); `new_key` propagates the boundary key
    /// an ancestor needs to adopt.
    Removed {
        new: Option<ChildSlot>,
        new_key: Option<Vec<u8>>,
        value: Vec<u8>,
    },
}

pub struct MerkleAvlTree<S> {
    pub(crate) ndb: NodeDb<S>,
    root: Option<Box<Node>>,
    /// Latest committed version; 0 before the first commit.
    version: u64,
    /// Nodes superseded since the last commit, keyed by the version that
    /// introduced them.
    orphans: HashMap<NodeHash, u64>,
    /// Committed roots; `None` marks a version committed with an empty tree.
    versions: BTreeMap<u64, Option<NodeHash>>,
}

impl<S: KeyValueStore> MerkleAvlTree<S> {
    /// A tree over an empty (or ignored) backend. Use [`Self::open`] to
    /// recover committed state.
    pub fn new(store: Arc<S>, options: &StoreOptions) -> Self {
        Self {
            ndb: NodeDb::new(store, options),
            root: None,
            version: 0,
            orphans: HashMap::new(),
            versions: BTreeMap::new(),
        }
    }

    /// Opens the backend and loads every committed root, positioning the
    /// working tree at the latest version.
    pub fn open(store: Arc<S>, options: &StoreOptions) -> Result<Self> {
        let mut tree = Self::new(store, options);
        tree.load()?;
        Ok(tree)
    }

    /// Reloads committed roots from the backend.
    pub fn load(&mut self) -> Result<()> {
        self.versions = self.ndb.roots()?.into_iter().collect();
        let (version, root) = match self.versions.iter().next_back() {
            None => (0, None),
            Some((version, None)) => (*version, None),
            Some((version, Some(hash))) => {
                let node = self.ndb.get_node(hash)?;
                (*version, Some(Box::new((*node).clone())))
            },
        };
        self.version = version;
        self.root = root;
        self.orphans.clear();
        debug!(version, versions = self.versions.len(), "loaded tree");
        Ok(())
    }

    /// Latest committed version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Versions currently queryable.
    pub fn versions(&self) -> Vec<u64> {
        self.versions.keys().copied().collect()
    }

    /// Number of leaves in the working tree.
    pub fn size(&self) -> u64 {
        self.root.as_ref().map_or(0, |root| root.size)
    }

    pub fn height(&self) -> u8 {
        self.root.as_ref().map_or(0, |root| root.height)
    }

    /// Root hash of the latest committed version.
    pub fn root_hash(&self) -> Option<NodeHash> {
        self.versions.get(&self.version).copied().flatten()
    }

    /// Hash of the working (possibly uncommitted) root.
    pub fn working_root_hash(&mut self) -> Result<Option<NodeHash>> {
        match self.root.as_deref_mut() {
            None => Ok(None),
            Some(root) => Ok(Some(root.hash_with_count()?.0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn node_db(&self) -> &NodeDb<S> {
        &self.ndb
    }

    /// The version the next commit will create.
    fn working_version(&self) -> u64 {
        self.version + 1
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.root {
            None => Ok(None),
            Some(root) => self.get_rec(root, key),
        }
    }

    /// Point read against a committed version.
    pub fn get_versioned(&self, version: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.version_root(version)? {
            None => Ok(None),
            Some(root) => self.get_rec(&root, key),
        }
    }

    fn get_rec(&self, node: &Node, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if node.is_leaf() {
            return Ok(if node.key.as_slice() == key {
                node.value.clone()
            } else {
                None
            });
        }
        let side = if key < node.key.as_slice() {
            Side::Left
        } else {
            Side::Right
        };
        match node.child_node(side) {
            Some(child) => self.get_rec(child, key),
            None => {
                let child = self.child_from_db(node, side)?;
                self.get_rec(&child, key)
            },
        }
    }

    pub(crate) fn version_root(&self, version: u64) -> Result<Option<Arc<Node>>> {
        let hash = self
            .versions
            .get(&version)
            .ok_or(Error::VersionNotFound(version))?;
        match hash {
            None => Ok(None),
            Some(hash) => Ok(Some(self.ndb.get_node(hash)?)),
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Inserts or updates a key. Returns `true` when an existing value was
    /// replaced.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        match self.root.take() {
            None => {
                self.root = Some(Box::new(Node::leaf(
                    key.to_vec(),
                    value.to_vec(),
                    self.working_version(),
                )));
                Ok(false)
            },
            Some(root) => {
                let (root, updated) = self.set_rec(root, key, value)?;
                self.root = Some(root);
                Ok(updated)
            },
        }
    }

    fn set_rec(&mut self, node: Box<Node>, key: &[u8], value: &[u8]) -> Result<(Box<Node>, bool)> {
        let working_version = self.working_version();
        if node.is_leaf() {
            return Ok(match key.cmp(&node.key) {
                Ordering::Less => {
                    let leaf = Node::leaf(key.to_vec(), value.to_vec(), working_version);
                    let mut inner = Node::inner(
                        node.key.clone(),
                        working_version,
                        ChildSlot::from_node(Box::new(leaf)),
                        ChildSlot::from_node(node),
                    );
                    inner.height = 1;
                    inner.size = 2;
                    (Box::new(inner), false)
                },
                Ordering::Greater => {
                    let leaf = Node::leaf(key.to_vec(), value.to_vec(), working_version);
                    let mut inner = Node::inner(
                        key.to_vec(),
                        working_version,
                        ChildSlot::from_node(node),
                        ChildSlot::from_node(Box::new(leaf)),
                    );
                    inner.height = 1;
                    inner.size = 2;
                    (Box::new(inner), false)
                },
                Ordering::Equal => {
                    self.add_orphan(&node);
                    let leaf = Node::leaf(key.to_vec(), value.to_vec(), working_version);
                    (Box::new(leaf), true)
                },
            });
        }

        let mut node = self.working_copy(node);
        let side = if key < node.key.as_slice() {
            Side::Left
        } else {
            Side::Right
        };
        let child = self.detach_child(&mut node, side)?;
        let (child, updated) = self.set_rec(child, key, value)?;
        node.set_child(side, child);
        if updated {
            // Same shape, same heights; nothing to rebalance.
            return Ok((node, true));
        }
        self.calc_height_and_size(&mut node)?;
        let node = self.balance(node)?;
        Ok((node, false))
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.root.take() {
            None => Ok(None),
            Some(root) => match self.remove_rec(root, key)? {
                RemoveOutcome::NotFound(root) => {
                    self.root = Some(root);
                    Ok(None)
                },
                RemoveOutcome::Removed { new, value, .. } => {
                    self.root = match new {
                        None => None,
                        Some(slot) => Some(self.materialize(slot)?),
                    };
                    Ok(Some(value))
                },
            },
        }
    }

    fn remove_rec(&mut self, mut node: Box<Node>, key: &[u8]) -> Result<RemoveOutcome> {
        if node.is_leaf() {
            if node.key.as_slice() != key {
                return Ok(RemoveOutcome::NotFound(node));
            }
            self.add_orphan(&node);
            let value = node
                .value
                .take()
                .ok_or_else(|| Error::corruption("leaf node without a value"))?;
            return Ok(RemoveOutcome::Removed {
                new: None,
                new_key: None,
                value,
            });
        }

        if key < node.key.as_slice() {
            let left = self.detach_child(&mut node, Side::Left)?;
            match self.remove_rec(left, key)? {
                RemoveOutcome::NotFound(left) => {
                    node.put_slot(Side::Left, ChildSlot::from_node(left));
                    Ok(RemoveOutcome::NotFound(node))
                },
                RemoveOutcome::Removed { new: None, value, .. } => {
                    // The left subtree was the removed leaf: this node
                    // collapses into its right child, and its key becomes
                    // the boundary an ancestor must adopt.
                    self.add_orphan(&node);
                    let right = node.take_slot(Side::Right);
                    let boundary = std::mem::take(&mut node.key);
                    Ok(RemoveOutcome::Removed {
                        new: Some(right),
                        new_key: Some(boundary),
                        value,
                    })
                },
                RemoveOutcome::Removed {
                    new: Some(slot),
                    new_key,
                    value,
                } => {
                    let mut node = self.working_copy(node);
                    node.put_slot(Side::Left, slot);
                    self.calc_height_and_size(&mut node)?;
                    let node = self.balance(node)?;
                    Ok(RemoveOutcome::Removed {
                        new: Some(ChildSlot::from_node(node)),
                        new_key,
                        value,
                    })
                },
            }
        } else {
            let right = self.detach_child(&mut node, Side::Right)?;
            match self.remove_rec(right, key)? {
                RemoveOutcome::NotFound(right) => {
                    node.put_slot(Side::Right, ChildSlot::from_node(right));
                    Ok(RemoveOutcome::NotFound(node))
                },
                RemoveOutcome::Removed { new: None, value, .. } => {
                    self.add_orphan(&node);
                    let left = node.take_slot(Side::Left);
                    Ok(RemoveOutcome::Removed {
                        new: Some(left),
                        new_key: None,
                        value,
                    })
                },
                RemoveOutcome::Removed {
                    new: Some(slot),
                    new_key,
                    value,
                } => {
                    let mut node = self.working_copy(node);
                    node.put_slot(Side::Right, slot);
                    if let Some(boundary) = new_key {
                        node.key = boundary;
                    }
                    self.calc_height_and_size(&mut node)?;
                    let node = self.balance(node)?;
                    Ok(RemoveOutcome::Removed {
                        new: Some(ChildSlot::from_node(node)),
                        new_key: None,
                        value,
                    })
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Commit & pruning
    // ------------------------------------------------------------------

    /// Persists the working tree as the next version: hash, write the new
    /// branch, record orphans, record the root, then flush — all in one
    /// pending batch (one backend commit under `FlushPolicy::Atomic`).
    pub fn save_version(&mut self) -> Result<(u64, Option<NodeHash>)> {
        let version = self.working_version();
        let mut root_hash = None;
        let mut nodes_hashed = 0;
        match self.root.as_deref_mut() {
            Some(root) => {
                let (hash, count) = root.hash_with_count()?;
                nodes_hashed = count;
                self.ndb.save_branch(root)?;
                self.ndb.save_orphans(&self.orphans)?;
                if root.version == version {
                    self.ndb.save_root(root)?;
                } else {
                    // The root predates this version: either nothing
                    // changed since the last commit, or a removal
                    // collapsed the root onto an older subtree.
                    self.ndb.save_root_hash(version, &hash)?;
                }
                root_hash = Some(hash);
            },
            None => {
                self.ndb.save_orphans(&self.orphans)?;
                self.ndb.save_empty_root(version)?;
            },
        }
        self.ndb.commit()?;

        self.version = version;
        self.versions.insert(version, root_hash);
        self.orphans.clear();
        debug!(version, root = ?root_hash, nodes_hashed, "saved version");
        Ok((version, root_hash))
    }

    /// Drops a historical version: its orphaned nodes are deleted from the
    /// backend along with its root entry. The latest version cannot be
    /// dropped.
    pub fn delete_version(&mut self, version: u64) -> Result<()> {
        if !self.versions.contains_key(&version) {
            return Err(Error::VersionNotFound(version));
        }
        if version == self.version {
            return Err(Error::DeleteLatestVersion(version));
        }
        self.ndb.delete_orphans(version)?;
        self.ndb.delete_root(version)?;
        self.ndb.commit()?;
        self.versions.remove(&version);
        debug!(version, "deleted version");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// In-order traversal of the working tree. Returns `true` if the
    /// callback stopped the walk.
    pub fn iterate(&self, f: IterFn<'_>) -> Result<bool> {
        self.iterate_range(None, None, true, f)
    }

    /// Traversal over `[start, end)` in key order (reversed when
    /// `ascending` is false).
    pub fn iterate_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        f: IterFn<'_>,
    ) -> Result<bool> {
        match &self.root {
            None => Ok(false),
            Some(root) => self.traverse_in_range(root, start, end, ascending, f),
        }
    }

    /// Range traversal against a committed version.
    pub fn iterate_range_versioned(
        &self,
        version: u64,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        f: IterFn<'_>,
    ) -> Result<bool> {
        match self.version_root(version)? {
            None => Ok(false),
            Some(root) => self.traverse_in_range(&root, start, end, ascending, f),
        }
    }

    fn traverse_in_range(
        &self,
        node: &Node,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        f: IterFn<'_>,
    ) -> Result<bool> {
        if node.is_leaf() {
            let after_start = start.is_none_or(|s| node.key.as_slice() >= s);
            let before_end = end.is_none_or(|e| node.key.as_slice() < e);
            if after_start && before_end {
                let value = node
                    .value
                    .as_deref()
                    .ok_or_else(|| Error::corruption("leaf node without a value"))?;
                return Ok(f(&node.key, value));
            }
            return Ok(false);
        }

        // Left subtree holds keys < node.key, right subtree keys >= node.key.
        let sides: [Side; 2] = if ascending {
            [Side::Left, Side::Right]
        } else {
            [Side::Right, Side::Left]
        };
        for side in sides {
            let in_range = match side {
                Side::Left => start.is_none_or(|s| s < node.key.as_slice()),
                Side::Right => end.is_none_or(|e| e > node.key.as_slice()),
            };
            if !in_range {
                continue;
            }
            let stopped = match node.child_node(side) {
                Some(child) => self.traverse_in_range(child, start, end, ascending, &mut *f)?,
                None => {
                    let child = self.child_from_db(node, side)?;
                    self.traverse_in_range(&child, start, end, ascending, &mut *f)?
                },
            };
            if stopped {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn child_from_db(&self, node: &Node, side: Side) -> Result<Arc<Node>> {
        let hash = node
            .child_hash(side)
            .ok_or_else(|| Error::corruption("inner node without a child reference"))?;
        self.ndb.get_node(&hash)
    }

    /// Records a persisted node as superseded. Nodes created since the last
    /// commit simply drop.
    fn add_orphan(&mut self, node: &Node) {
        if !node.persisted {
            return;
        }
        debug_assert!(node.hash.is_some(), "persisted node without hash");
        if let Some(hash) = node.hash {
            self.orphans.insert(hash, node.version);
        }
    }

    /// Turns a node into a mutable member of the working version, orphaning
    /// the persisted original.
    fn working_copy(&mut self, mut node: Box<Node>) -> Box<Node> {
        if node.persisted {
            self.add_orphan(&node);
            node.version = self.working_version();
            node.persisted = false;
        }
        node.hash = None;
        node
    }

    /// Detaches a child as an owned node, reading it from the node db when
    /// only the hash is held.
    fn detach_child(&self, parent: &mut Node, side: Side) -> Result<Box<Node>> {
        let slot = parent.take_slot(side);
        self.materialize(slot)
    }

    fn materialize(&self, slot: ChildSlot) -> Result<Box<Node>> {
        if let Some(node) = slot.node {
            return Ok(node);
        }
        let hash = slot
            .hash
            .ok_or_else(|| Error::corruption("dereferencing an empty child slot"))?;
        Ok(Box::new((*self.ndb.get_node(&hash)?).clone()))
    }

    fn child_stats(&self, node: &Node, side: Side) -> Result<(u8, u64)> {
        if let Some(child) = node.child_node(side) {
            return Ok((child.height, child.size));
        }
        let child = self.child_from_db(node, side)?;
        Ok((child.height, child.size))
    }

    fn calc_height_and_size(&self, node: &mut Node) -> Result<()> {
        let (left_height, left_size) = self.child_stats(node, Side::Left)?;
        let (right_height, right_size) = self.child_stats(node, Side::Right)?;
        node.height = 1 + left_height.max(right_height);
        node.size = left_size + right_size;
        Ok(())
    }

    fn balance_factor(&self, node: &Node) -> Result<i32> {
        let (left_height, _) = self.child_stats(node, Side::Left)?;
        let (right_height, _) = self.child_stats(node, Side::Right)?;
        Ok(i32::from(left_height) - i32::from(right_height))
    }

    fn child_balance_factor(&self, node: &Node, side: Side) -> Result<i32> {
        match node.child_node(side) {
            Some(child) => self.balance_factor(child),
            None => {
                let child = self.child_from_db(node, side)?;
                self.balance_factor(&child)
            },
        }
    }

    /// Restores the AVL invariant at `node` with a single or double
    /// rotation. `node` is already a working copy with fresh height/size.
    fn balance(&mut self, mut node: Box<Node>) -> Result<Box<Node>> {
        let balance = self.balance_factor(&node)?;
        if balance > 1 {
            if self.child_balance_factor(&node, Side::Left)? >= 0 {
                // Left-left.
                self.rotate(node, Side::Right)
            } else {
                // Left-right.
                let left = self.detach_child(&mut node, Side::Left)?;
                let left = self.rotate(left, Side::Left)?;
                node.set_child(Side::Left, left);
                self.rotate(node, Side::Right)
            }
        } else if balance < -1 {
            if self.child_balance_factor(&node, Side::Right)? <= 0 {
                // Right-right.
                self.rotate(node, Side::Left)
            } else {
                // Right-left.
                let right = self.detach_child(&mut node, Side::Right)?;
                let right = self.rotate(right, Side::Right)?;
                node.set_child(Side::Right, right);
                self.rotate(node, Side::Left)
            }
        } else {
            Ok(node)
        }
    }

    /// Rotates `node` in `direction`, promoting the opposite child. Both
    /// participants become working copies (orphaning their persisted
    /// originals); the demoted node keeps the promoted child's inner
    /// subtree on the vacated side.
    fn rotate(&mut self, node: Box<Node>, direction: Side) -> Result<Box<Node>> {
        let mut node = self.working_copy(node);
        let from = direction.opposite();
        let promoted = self.detach_child(&mut node, from)?;
        let mut promoted = self.working_copy(promoted);

        let transfer = promoted.take_slot(direction);
        node.put_slot(from, transfer);
        self.calc_height_and_size(&mut node)?;

        promoted.set_child(direction, node);
        self.calc_height_and_size(&mut promoted)?;
        Ok(promoted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{FlushPolicy, StoreOptions};
    use aptos_keyvalue::MemoryStore;
    use std::num::NonZeroUsize;

    fn options() -> StoreOptions {
        StoreOptions {
            cache_size: NonZeroUsize::new(100).unwrap(),
            flush_policy: FlushPolicy::Atomic,
        }
    }

    fn tree() -> MerkleAvlTree<MemoryStore> {
        MerkleAvlTree::new(Arc::new(MemoryStore::new()), &options())
    }

    fn entries(tree: &MerkleAvlTree<MemoryStore>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        tree.iterate(&mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            false
        })
        .unwrap();
        out
    }

    #[test]
    fn set_get_remove() {
        let mut tree = tree();
        assert!(!tree.set(b"b", b"2").unwrap());
        assert!(!tree.set(b"a", b"1").unwrap());
        assert!(!tree.set(b"c", b"3").unwrap());
        assert_eq!(tree.size(), 3);

        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(b"missing").unwrap(), None);

        // Updating reports replacement and keeps the size.
        assert!(tree.set(b"b", b"22").unwrap());
        assert_eq!(tree.size(), 3);
        assert_eq!(tree.get(b"b").unwrap(), Some(b"22".to_vec()));

        assert_eq!(tree.remove(b"b").unwrap(), Some(b"22".to_vec()));
        assert_eq!(tree.remove(b"b").unwrap(), None);
        assert_eq!(tree.get(b"b").unwrap(), None);
        assert_eq!(tree.size(), 2);
    }

    #[test]
    fn removing_last_leaf_empties_the_tree() {
        let mut tree = tree();
        tree.set(b"only", b"one").unwrap();
        assert_eq!(tree.remove(b"only").unwrap(), Some(b"one".to_vec()));
        assert!(tree.is_empty());
        assert_eq!(tree.size(), 0);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut tree = tree();
        for key in [5u8, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
            tree.set(&[key], &[key]).unwrap();
        }
        let keys: Vec<u8> = entries(&tree).into_iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, (0..10).collect::<Vec<u8>>());

        let mut descending = Vec::new();
        tree.iterate_range(None, None, false, &mut |k, _| {
            descending.push(k[0]);
            false
        })
        .unwrap();
        assert_eq!(descending, (0..10).rev().collect::<Vec<u8>>());
    }

    #[test]
    fn range_bounds_are_half_open() {
        let mut tree = tree();
        for key in 0..10u8 {
            tree.set(&[key], &[key]).unwrap();
        }
        let mut seen = Vec::new();
        tree.iterate_range(Some(&[3]), Some(&[7]), true, &mut |k, _| {
            seen.push(k[0]);
            false
        })
        .unwrap();
        assert_eq!(seen, vec![3, 4, 5, 6]);
    }

    #[test]
    fn iteration_stops_when_asked() {
        let mut tree = tree();
        for key in 0..10u8 {
            tree.set(&[key], &[key]).unwrap();
        }
        let mut seen = 0;
        let stopped = tree
            .iterate(&mut |_, _| {
                seen += 1;
                seen == 4
            })
            .unwrap();
        assert!(stopped);
        assert_eq!(seen, 4);
    }

    #[test]
    fn stays_balanced_under_sequential_inserts() {
        let mut tree = tree();
        for key in 0..128u32 {
            tree.set(&key.to_be_bytes(), b"v").unwrap();
        }
        // A balanced tree of 128 leaves has height 7..=9; a degenerate
        // insert-ordered tree would reach 127.
        assert_eq!(tree.size(), 128);
        assert!(tree.height() <= 9, "height {}", tree.height());
    }

    #[test]
    fn remove_propagates_boundary_keys() {
        let mut tree = tree();
        for key in [b"a", b"b", b"c", b"d"] {
            tree.set(key, b"v").unwrap();
        }
        // Removing a leftmost leaf of a right subtree forces an ancestor to
        // adopt a new boundary; iteration order must survive it.
        tree.remove(b"c").unwrap();
        let keys: Vec<Vec<u8>> = entries(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
        for key in [&b"a"[..], b"b", b"d"] {
            assert_eq!(tree.get(key).unwrap(), Some(b"v".to_vec()));
        }
    }

    #[test]
    fn working_hash_is_deterministic_and_version_sensitive() {
        let mut a = tree();
        let mut b = tree();
        for t in [&mut a, &mut b] {
            t.set(b"x", b"1").unwrap();
            t.set(b"y", b"2").unwrap();
        }
        assert_eq!(a.working_root_hash().unwrap(), b.working_root_hash().unwrap());

        // Committing advances the version embedded in the nodes, so the
        // same logical contents at a later version hash differently.
        let mut c = tree();
        c.set(b"dummy", b"d").unwrap();
        c.save_version().unwrap();
        c.remove(b"dummy").unwrap();
        c.set(b"x", b"1").unwrap();
        c.set(b"y", b"2").unwrap();
        assert_ne!(a.working_root_hash().unwrap(), c.working_root_hash().unwrap());
    }

    #[test]
    fn mutations_before_first_commit_produce_no_orphans() {
        let mut tree = tree();
        tree.set(b"a", b"1").unwrap();
        tree.set(b"b", b"2").unwrap();
        tree.set(b"a", b"updated").unwrap();
        tree.remove(b"b").unwrap();
        tree.save_version().unwrap();
        assert!(tree.node_db().orphans().unwrap().is_empty());
    }
}
