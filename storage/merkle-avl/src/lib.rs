// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! A versioned, authenticated key-value store backed by an immutable
//! height-balanced (AVL) binary search tree, persisted content-addressed
//! over an unordered byte key-value backend.
//!
//! Every call to [`MerkleAvlTree::save_version`] produces a new tree version
//! identified by the cryptographic hash of its root. Mutations copy only the
//! nodes on the path from the affected leaf to the root; untouched subtrees
//! are shared by hash across versions. Superseded nodes are recorded as
//! orphans keyed by the version that introduced them, so that dropping a
//! version releases exactly the nodes no live root can reach.
//!
//! Layering, bottom up:
//!
//! * [`BatchWithFlusher`] — a write batch that commits itself whenever the
//!   buffered byte cost crosses a threshold, bounding peak memory during
//!   bulk loads.
//! * [`node`] — the node representation, its deterministic wire codec and
//!   the Merkle hash.
//! * [`NodeDb`] — persistence for nodes, roots and orphans, fronted by an
//!   LRU cache of decoded nodes.
//! * [`MerkleAvlTree`] — the copy-on-write AVL tree with commit, pruning,
//!   range iteration and proof generation.

mod batch;
mod cache;
pub mod node;
mod node_db;
mod proof;
mod tree;

pub use batch::BatchWithFlusher;
pub use node::{Node, NodeHash, HASH_LEN};
pub use node_db::NodeDb;
pub use proof::{MembershipProof, ProofInnerNode};
pub use tree::MerkleAvlTree;

use std::num::NonZeroUsize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// Backend I/O failure; the pending batch is intact and the call may be
    /// retried.
    #[error("storage backend: {0}")]
    Store(#[from] aptos_keyvalue::StoreError),

    /// Invariant violation: missing node for a known hash, double save,
    /// undecodable trusted bytes, empty root hash. Continued operation is
    /// not possible; the store must be treated as corrupt.
    #[error("state corruption: {0}")]
    Corruption(String),

    #[error("version {0} was not found")]
    VersionNotFound(u64),

    #[error("cannot delete the latest version {0}")]
    DeleteLatestVersion(u64),

    #[error("proof verification failed: {0}")]
    InvalidProof(String),
}

impl Error {
    /// The single construction point for fatal invariant violations.
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

/// When the pending batch is committed to the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushPolicy {
    /// Never flush until [`NodeDb::commit`]: every saved version is one
    /// atomic backend batch. Peak batch memory is unbounded.
    Atomic,
    /// Flush whenever the buffered byte cost reaches `threshold`. Bounds
    /// memory, but a commit larger than the threshold spans several backend
    /// batches; a crash in between can leave nodes without a root entry.
    /// Callers that need all-or-nothing versions must size the threshold
    /// above their worst-case version.
    Bounded { threshold: usize },
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Maximum number of decoded nodes kept in memory.
    pub cache_size: NonZeroUsize,
    pub flush_policy: FlushPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_size: const { NonZeroUsize::new(10_000).unwrap() },
            flush_policy: FlushPolicy::Atomic,
        }
    }
}
