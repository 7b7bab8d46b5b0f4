// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Persistence layer mapping node hashes to serialized nodes, plus the
//! per-version root and orphan bookkeeping that makes pruning safe.
//!
//! Keyspace:
//!
//! * `<hash>` (raw digest bytes) — serialized node;
//! * `roots/<version>` (decimal) — root hash of a committed version, empty
//!   value for a version committed with an empty tree;
//! * `orphans/<version>/<hex hash>` — hash (raw bytes) of a node introduced
//!   at `<version>` that a newer version no longer references.
//!
//! All operations serialize on one mutex; reads go through an LRU cache of
//! decoded nodes before touching the backend.

use crate::{
    batch::BatchWithFlusher,
    cache::NodeCache,
    node::{Node, NodeHash},
    Error, Result, StoreOptions,
};
use aptos_keyvalue::KeyValueStore;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt::Write as _, sync::Arc};
use tracing::debug;

const ROOTS_PREFIX: &str = "roots/";
const ORPHANS_PREFIX: &str = "orphans/";

fn root_key(version: u64) -> Vec<u8> {
    format!("{ROOTS_PREFIX}{version}").into_bytes()
}

fn orphan_key(version: u64, hash: &NodeHash) -> Vec<u8> {
    format!("{ORPHANS_PREFIX}{version}/{hash}").into_bytes()
}

fn orphan_version_prefix(version: u64) -> Vec<u8> {
    format!("{ORPHANS_PREFIX}{version}/").into_bytes()
}

fn is_bookkeeping_key(key: &[u8]) -> bool {
    key.starts_with(ROOTS_PREFIX.as_bytes()) || key.starts_with(ORPHANS_PREFIX.as_bytes())
}

fn parse_root_version(key: &[u8]) -> Result<u64> {
    let suffix = &key[ROOTS_PREFIX.len()..];
    std::str::from_utf8(suffix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::corruption(format!("malformed root key {:?}", key)))
}

struct Inner<S> {
    batch: BatchWithFlusher<S>,
    cache: NodeCache,
}

/// The node database. All backend I/O of the engine funnels through here.
pub struct NodeDb<S> {
    store: Arc<S>,
    inner: Mutex<Inner<S>>,
}

impl<S: KeyValueStore> NodeDb<S> {
    pub fn new(store: Arc<S>, options: &StoreOptions) -> Self {
        let batch = BatchWithFlusher::new(store.clone(), options.flush_policy);
        Self {
            store,
            inner: Mutex::new(Inner {
                batch,
                cache: NodeCache::new(options.cache_size),
            }),
        }
    }

    /// Fetches a decoded node, cache first. A missing hash is corruption:
    /// the tree only dereferences hashes it wrote itself or received from a
    /// verified root.
    pub fn get_node(&self, hash: &NodeHash) -> Result<Arc<Node>> {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.cache.get(hash) {
            return Ok(node);
        }

        let bytes = self
            .store
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::corruption(format!("node {hash} missing from backend")))?;
        let mut node = Node::decode(&bytes)
            .map_err(|e| Error::corruption(format!("decoding node {hash}: {e}")))?;
        node.hash = Some(*hash);
        node.persisted = true;

        let node = Arc::new(node);
        inner.cache.put(*hash, node.clone());
        Ok(node)
    }

    /// Queues a node for persistence. The node must be hashed and not yet
    /// persisted; it is stamped persisted and cached on the way out.
    pub fn save_node(&self, node: &mut Node) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::save_node_locked(&mut inner, node)
    }

    fn save_node_locked(inner: &mut Inner<S>, node: &mut Node) -> Result<()> {
        let hash = node
            .hash
            .ok_or_else(|| Error::corruption("saving a node that was never hashed"))?;
        if node.persisted {
            return Err(Error::corruption(format!("node {hash} saved twice")));
        }
        let bytes = node.encode()?;
        inner.batch.put(hash.as_bytes(), &bytes)?;
        node.persisted = true;
        inner.cache.put(hash, Arc::new(node.detached_clone()));
        Ok(())
    }

    /// Persists an unpersisted subtree depth-first, children before parent,
    /// clearing each transient child reference as soon as its subtree is
    /// queued. No parent is ever written pointing at an unwritten child.
    pub fn save_branch(&self, node: &mut Node) -> Result<()> {
        self.save_branch_with(node, &mut |_| {})
    }

    /// Like [`Self::save_branch`], invoking `callback` on every node right
    /// before it is saved.
    pub fn save_branch_with(
        &self,
        node: &mut Node,
        callback: &mut dyn FnMut(&mut Node),
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::save_branch_locked(&mut inner, node, callback)
    }

    fn save_branch_locked(
        inner: &mut Inner<S>,
        node: &mut Node,
        callback: &mut dyn FnMut(&mut Node),
    ) -> Result<()> {
        if node.hash.is_none() {
            node.hash_with_count()?;
        }
        if node.persisted {
            return Ok(());
        }

        // Dropping each box right after its subtree is queued releases the
        // in-memory tree incrementally and leaves hash-only references.
        if let Some(mut left) = node.left_node.take() {
            Self::save_branch_locked(inner, &mut left, callback)?;
        }
        if let Some(mut right) = node.right_node.take() {
            Self::save_branch_locked(inner, &mut right, callback)?;
        }

        callback(node);
        Self::save_node_locked(inner, node)
    }

    /// Records every `(hash, version)` pair under the orphan keyspace.
    pub fn save_orphans(&self, orphans: &HashMap<NodeHash, u64>) -> Result<()> {
        let mut inner = self.inner.lock();
        for (hash, version) in orphans {
            inner
                .batch
                .put(&orphan_key(*version, hash), hash.as_bytes())?;
        }
        Ok(())
    }

    /// Deletes every orphan entry of `version` together with the node it
    /// names, and uncaches those nodes.
    pub fn delete_orphans(&self, version: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut pruned = 0u64;
        for entry in self.store.prefix_iterator(&orphan_version_prefix(version))? {
            let (key, value) = entry?;
            let hash = NodeHash::from_slice(&value)
                .map_err(|_| Error::corruption(format!("malformed orphan entry {:?}", key)))?;
            inner.batch.delete(&key)?;
            inner.batch.delete(hash.as_bytes())?;
            inner.cache.remove(&hash);
            pruned += 1;
        }
        debug!(version, pruned, "deleted orphans");
        Ok(())
    }

    /// Deletes one orphan entry without touching the node, for nodes a
    /// later mutation has resurrected.
    pub fn unorphan(&self, hash: &NodeHash, version: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.batch.delete(&orphan_key(version, hash))?;
        Ok(())
    }

    /// Records the root entry for the node's version.
    pub fn save_root(&self, root: &Node) -> Result<()> {
        let hash = root
            .hash
            .ok_or_else(|| Error::corruption("root hash must not be empty"))?;
        self.save_root_hash(root.version, &hash)
    }

    /// Records a root entry for `version` pointing at an already-persisted
    /// node, for versions whose root predates them (a commit without tree
    /// changes, or a root collapsed onto an older subtree).
    pub fn save_root_hash(&self, version: u64, hash: &NodeHash) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.batch.put(&root_key(version), hash.as_bytes())?;
        Ok(())
    }

    /// Records that `version` was committed with an empty tree.
    pub fn save_empty_root(&self, version: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.batch.put(&root_key(version), &[])?;
        Ok(())
    }

    /// Deletes the root entry only; the version's nodes are released
    /// through [`Self::delete_orphans`].
    pub fn delete_root(&self, version: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.batch.delete(&root_key(version))?;
        Ok(())
    }

    /// Root hash of a committed version. `Ok(None)` is a version committed
    /// empty; an absent entry is [`Error::VersionNotFound`].
    pub fn root_hash(&self, version: u64) -> Result<Option<NodeHash>> {
        match self.store.get(&root_key(version))? {
            None => Err(Error::VersionNotFound(version)),
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Ok(Some(NodeHash::from_slice(&bytes)?)),
        }
    }

    /// All committed roots, by version.
    pub fn roots(&self) -> Result<Vec<(u64, Option<NodeHash>)>> {
        let mut roots = Vec::new();
        for entry in self.store.prefix_iterator(ROOTS_PREFIX.as_bytes())? {
            let (key, value) = entry?;
            let version = parse_root_version(&key)?;
            let hash = if value.is_empty() {
                None
            } else {
                Some(NodeHash::from_slice(&value)?)
            };
            roots.push((version, hash));
        }
        roots.sort_by_key(|(version, _)| *version);
        Ok(roots)
    }

    /// Flushes the pending batch atomically; the next write starts a fresh
    /// batch. Calling with nothing pending does not touch the backend.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.batch.write()?;
        Ok(())
    }

    pub(crate) fn cached_nodes(&self) -> usize {
        self.inner.lock().cache.len()
    }

    // ------------------------------------------------------------------
    // Diagnostic traversals. These scan the whole backend; test and
    // tooling use only.
    // ------------------------------------------------------------------

    /// Every backend key, including bookkeeping entries.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for entry in self.store.iterator()? {
            keys.push(entry?.0);
        }
        Ok(keys)
    }

    /// Every persisted node, sorted by node key.
    pub fn nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for entry in self.store.iterator()? {
            let (key, value) = entry?;
            if is_bookkeeping_key(&key) {
                continue;
            }
            let mut node = Node::decode(&value)
                .map_err(|e| Error::corruption(format!("undecodable node entry: {e}")))?;
            node.hash = Some(NodeHash::from_slice(&key)?);
            node.persisted = true;
            nodes.push(node);
        }
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    pub fn leaf_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes()?.into_iter().filter(Node::is_leaf).collect())
    }

    /// Hashes of every orphaned node, across all versions.
    pub fn orphans(&self) -> Result<Vec<NodeHash>> {
        let mut orphans = Vec::new();
        for entry in self.store.prefix_iterator(ORPHANS_PREFIX.as_bytes())? {
            orphans.push(NodeHash::from_slice(&entry?.1)?);
        }
        Ok(orphans)
    }

    /// Total number of backend entries, bookkeeping included.
    pub fn size(&self) -> Result<usize> {
        let mut size = 0;
        for entry in self.store.iterator()? {
            entry?;
            size += 1;
        }
        Ok(size)
    }

    /// Human-readable dump of roots, orphans and nodes.
    pub fn dump(&self) -> Result<String> {
        let mut out = String::from("-\n");
        for (version, hash) in self.roots()? {
            match hash {
                Some(hash) => writeln!(out, "roots/{version}: {hash}"),
                None => writeln!(out, "roots/{version}: <empty>"),
            }
            .map_err(|e| Error::corruption(e.to_string()))?;
        }
        out.push('\n');
        for entry in self.store.prefix_iterator(ORPHANS_PREFIX.as_bytes())? {
            let (key, value) = entry?;
            writeln!(out, "{}: {}", String::from_utf8_lossy(&key), hex::encode(value))
                .map_err(|e| Error::corruption(e.to_string()))?;
        }
        out.push('\n');
        for node in self.nodes()? {
            let hash = node.hash.map(|h| h.to_string()).unwrap_or_default();
            match node.value() {
                Some(value) => writeln!(
                    out,
                    "{hash}: {} = {:<16} h={} version={}",
                    String::from_utf8_lossy(&node.key),
                    String::from_utf8_lossy(value),
                    node.height,
                    node.version,
                ),
                None => writeln!(
                    out,
                    "{hash}: {} {:<16} h={} version={}",
                    String::from_utf8_lossy(&node.key),
                    "",
                    node.height,
                    node.version,
                ),
            }
            .map_err(|e| Error::corruption(e.to_string()))?;
        }
        out.push('-');
        Ok(out)
    }
}
