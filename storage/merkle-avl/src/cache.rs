// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::node::{Node, NodeHash};
use lru::LruCache;
use std::{num::NonZeroUsize, sync::Arc};

/// Strict LRU of decoded nodes, bounded by element count.
///
/// Not synchronized on its own; the node db serializes access under its
/// mutex.
pub(crate) struct NodeCache {
    inner: LruCache<NodeHash, Arc<Node>>,
}

impl NodeCache {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// A hit marks the entry most recently used.
    pub(crate) fn get(&mut self, hash: &NodeHash) -> Option<Arc<Node>> {
        self.inner.get(hash).cloned()
    }

    /// Inserts at the most-recently-used end, evicting the least recently
    /// used entry when over capacity.
    pub(crate) fn put(&mut self, hash: NodeHash, node: Arc<Node>) {
        self.inner.put(hash, node);
    }

    /// Drops the entry if present. Called when the backing node is deleted
    /// so a stale decode cannot outlive its storage.
    pub(crate) fn remove(&mut self, hash: &NodeHash) {
        self.inner.pop(hash);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}
