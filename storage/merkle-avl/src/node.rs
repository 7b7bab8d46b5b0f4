// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Tree nodes and their deterministic wire codec.
//!
//! A node serializes as `height | size | version | key | body`, where the
//! body is the value for a leaf and the two child hashes for an inner node.
//! Integers are unsigned little-endian (LEB128) varints; byte strings are
//! varint-length-prefixed. The node hash is the truncated SHA-256 digest of
//! exactly this serialization, so the encoding is part of the wire contract
//! and must stay byte-exact.

use crate::{Error, Result};
use integer_encoding::{VarIntReader, VarIntWriter};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    io::{Cursor, Read},
};

/// Nodes are addressed by a 20-byte truncated SHA-256 digest.
pub const HASH_LEN: usize = 20;

#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeHash([u8; HASH_LEN]);

impl NodeHash {
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| Error::corruption(format!("hash of length {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({})", hex::encode(self.0))
    }
}

/// Which side of an inner node a child hangs on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    pub(crate) fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A child reference detached from its parent: a hash for persisted
/// subtrees, an owned node for subtrees built since the last commit.
#[derive(Debug)]
pub(crate) struct ChildSlot {
    pub(crate) hash: Option<NodeHash>,
    pub(crate) node: Option<Box<Node>>,
}

impl ChildSlot {
    pub(crate) fn from_node(node: Box<Node>) -> Self {
        if node.persisted {
            ChildSlot {
                hash: node.hash,
                node: None,
            }
        } else {
            ChildSlot {
                hash: None,
                node: Some(node),
            }
        }
    }
}

/// A tree node. `height == 0` means leaf (and `value` is always present);
/// anything else is an inner node carrying child references.
///
/// Inner nodes reference children exclusively by hash once persisted. The
/// `left_node`/`right_node` boxes exist only between construction and the
/// first save; [`crate::NodeDb::save_branch`] clears each one right after
/// the child subtree hits the pending batch.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) version: u64,
    pub(crate) height: u8,
    pub(crate) size: u64,
    pub(crate) hash: Option<NodeHash>,
    pub(crate) left_hash: Option<NodeHash>,
    pub(crate) right_hash: Option<NodeHash>,
    pub(crate) left_node: Option<Box<Node>>,
    pub(crate) right_node: Option<Box<Node>>,
    pub(crate) persisted: bool,
}

impl Node {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>, version: u64) -> Self {
        Node {
            key,
            value: Some(value),
            version,
            height: 0,
            size: 1,
            hash: None,
            left_hash: None,
            right_hash: None,
            left_node: None,
            right_node: None,
            persisted: false,
        }
    }

    /// A fresh inner node over two children. `key` must be the smallest key
    /// of the right subtree.
    pub(crate) fn inner(
        key: Vec<u8>,
        version: u64,
        left: ChildSlot,
        right: ChildSlot,
    ) -> Self {
        let mut node = Node {
            key,
            value: None,
            version,
            height: 0,
            size: 0,
            hash: None,
            left_hash: None,
            right_hash: None,
            left_node: None,
            right_node: None,
            persisted: false,
        };
        node.put_slot(Side::Left, left);
        node.put_slot(Side::Right, right);
        node
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// `Some` for leaves, `None` for inner nodes.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// Number of leaves in the subtree.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> Option<NodeHash> {
        self.hash
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn left_hash(&self) -> Option<NodeHash> {
        self.left_hash
    }

    pub fn right_hash(&self) -> Option<NodeHash> {
        self.right_hash
    }

    pub(crate) fn child_hash(&self, side: Side) -> Option<NodeHash> {
        match side {
            Side::Left => self.left_hash,
            Side::Right => self.right_hash,
        }
    }

    pub(crate) fn child_node(&self, side: Side) -> Option<&Node> {
        match side {
            Side::Left => self.left_node.as_deref(),
            Side::Right => self.right_node.as_deref(),
        }
    }

    pub(crate) fn take_slot(&mut self, side: Side) -> ChildSlot {
        match side {
            Side::Left => ChildSlot {
                hash: self.left_hash.take(),
                node: self.left_node.take(),
            },
            Side::Right => ChildSlot {
                hash: self.right_hash.take(),
                node: self.right_node.take(),
            },
        }
    }

    /// Reattaches a child. Persisted nodes collapse to their hash so that
    /// transient boxes never point at saved subtrees.
    pub(crate) fn put_slot(&mut self, side: Side, slot: ChildSlot) {
        let slot = match slot.node {
            Some(node) if node.persisted => ChildSlot {
                hash: node.hash,
                node: None,
            },
            node => ChildSlot { hash: slot.hash, node },
        };
        match side {
            Side::Left => {
                self.left_hash = slot.hash;
                self.left_node = slot.node;
            },
            Side::Right => {
                self.right_hash = slot.hash;
                self.right_node = slot.node;
            },
        }
    }

    pub(crate) fn set_child(&mut self, side: Side, child: Box<Node>) {
        self.put_slot(
            side,
            ChildSlot {
                hash: None,
                node: Some(child),
            },
        );
    }

    /// Serializes the node for storage and hashing. Inner nodes must have
    /// both child hashes computed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self.value.as_deref() {
            Some(value) => {
                encode_fields(self.height, self.size, self.version, &self.key, Body::Leaf { value })
            },
            None => {
                let left = self
                    .left_hash
                    .as_ref()
                    .ok_or_else(|| Error::corruption("encoding inner node without left hash"))?;
                let right = self
                    .right_hash
                    .as_ref()
                    .ok_or_else(|| Error::corruption("encoding inner node without right hash"))?;
                encode_fields(
                    self.height,
                    self.size,
                    self.version,
                    &self.key,
                    Body::Inner { left, right },
                )
            },
        }
    }

    /// Decodes a node from its canonical serialization. The result carries
    /// no transient children and is not yet stamped persisted; the node db
    /// does that after checking where the bytes came from.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let height = read_varint_u64(&mut reader)?;
        let height =
            u8::try_from(height).map_err(|_| Error::corruption(format!("node height {height}")))?;
        let size = read_varint_u64(&mut reader)?;
        let version = read_varint_u64(&mut reader)?;
        let key = read_bytes(&mut reader)?;

        let mut node = Node {
            key,
            value: None,
            version,
            height,
            size,
            hash: None,
            left_hash: None,
            right_hash: None,
            left_node: None,
            right_node: None,
            persisted: false,
        };
        if height == 0 {
            if size != 1 {
                return Err(Error::corruption(format!("leaf node with size {size}")));
            }
            node.value = Some(read_bytes(&mut reader)?);
        } else {
            node.left_hash = Some(NodeHash::from_slice(&read_bytes(&mut reader)?)?);
            node.right_hash = Some(NodeHash::from_slice(&read_bytes(&mut reader)?)?);
        }
        if reader.position() != bytes.len() as u64 {
            return Err(Error::corruption("trailing bytes after node"));
        }
        Ok(node)
    }

    /// Ensures this node and every transient descendant has its hash
    /// computed, children first. Returns the hash and the number of nodes
    /// hashed by this call (0 if the subtree was already hashed).
    pub fn hash_with_count(&mut self) -> Result<(NodeHash, u64)> {
        if let Some(hash) = self.hash {
            return Ok((hash, 0));
        }
        let mut count = 1;
        if !self.is_leaf() {
            if let Some(left) = self.left_node.as_mut() {
                let (hash, hashed) = left.hash_with_count()?;
                self.left_hash = Some(hash);
                count += hashed;
            }
            if let Some(right) = self.right_node.as_mut() {
                let (hash, hashed) = right.hash_with_count()?;
                self.right_hash = Some(hash);
                count += hashed;
            }
        }
        let hash = hash_of(&self.encode()?);
        self.hash = Some(hash);
        Ok((hash, count))
    }

    /// Field-wise copy without the transient children. This is what enters
    /// the node cache.
    pub(crate) fn detached_clone(&self) -> Node {
        Node {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            height: self.height,
            size: self.size,
            hash: self.hash,
            left_hash: self.left_hash,
            right_hash: self.right_hash,
            left_node: None,
            right_node: None,
            persisted: self.persisted,
        }
    }
}

enum Body<'a> {
    Leaf { value: &'a [u8] },
    Inner { left: &'a NodeHash, right: &'a NodeHash },
}

fn encode_fields(height: u8, size: u64, version: u64, key: &[u8], body: Body<'_>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(key.len() + 64);
    write_varint_u64(&mut buf, height as u64)?;
    write_varint_u64(&mut buf, size)?;
    write_varint_u64(&mut buf, version)?;
    write_bytes(&mut buf, key)?;
    match body {
        Body::Leaf { value } => write_bytes(&mut buf, value)?,
        Body::Inner { left, right } => {
            write_bytes(&mut buf, left.as_bytes())?;
            write_bytes(&mut buf, right.as_bytes())?;
        },
    }
    Ok(buf)
}

fn hash_of(encoded: &[u8]) -> NodeHash {
    let digest = Sha256::digest(encoded);
    let mut truncated = [0u8; HASH_LEN];
    truncated.copy_from_slice(&digest[..HASH_LEN]);
    NodeHash(truncated)
}

/// Hash a leaf from its raw fields, without building a `Node`. Used by
/// proof verification, which must reproduce storage hashes exactly.
pub(crate) fn hash_leaf(version: u64, key: &[u8], value: &[u8]) -> Result<NodeHash> {
    Ok(hash_of(&encode_fields(0, 1, version, key, Body::Leaf { value })?))
}

/// Hash an inner node from its raw fields.
pub(crate) fn hash_inner(
    height: u8,
    size: u64,
    version: u64,
    key: &[u8],
    left: &NodeHash,
    right: &NodeHash,
) -> Result<NodeHash> {
    Ok(hash_of(&encode_fields(height, size, version, key, Body::Inner { left, right })?))
}

fn write_varint_u64(buf: &mut Vec<u8>, n: u64) -> Result<()> {
    buf.write_varint(n)
        .map_err(|e| Error::corruption(format!("varint write: {e}")))?;
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    write_varint_u64(buf, bytes.len() as u64)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_varint_u64(reader: &mut Cursor<&[u8]>) -> Result<u64> {
    reader
        .read_varint::<u64>()
        .map_err(|e| Error::corruption(format!("varint read: {e}")))
}

fn read_bytes(reader: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = read_varint_u64(reader)?;
    let len = usize::try_from(len).map_err(|_| Error::corruption("byte string length"))?;
    if len > reader.get_ref().len().saturating_sub(reader.position() as usize) {
        return Err(Error::corruption("byte string length past end of input"));
    }
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::corruption(format!("byte string read: {e}")))?;
    Ok(bytes)
}
