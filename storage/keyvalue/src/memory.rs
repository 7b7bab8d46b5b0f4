// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{KeyValueStore, KvIterator, Result, WriteBatch, WriteOp};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// In-memory backend used in tests and tooling.
///
/// Cloning is cheap and clones share the same underlying map, so a store
/// handed to an engine stays inspectable from the outside.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Smallest byte string strictly greater than every string starting with
/// `prefix`, or `None` if the prefix is all `0xff`.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.inner.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                },
                WriteOp::Delete { key } => {
                    map.remove(&key);
                },
            }
        }
        Ok(())
    }

    fn iterator(&self) -> Result<KvIterator<'_>> {
        // Snapshot under the read lock; entries are owned copies.
        let entries: Vec<_> = self
            .inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> Result<KvIterator<'_>> {
        if prefix.is_empty() {
            return self.iterator();
        }
        let map = self.inner.read();
        let range: Vec<_> = match prefix_end(prefix) {
            Some(end) => map
                .range(prefix.to_vec()..end)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => map
                .range(prefix.to_vec()..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(Box::new(range.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(iter: KvIterator<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
        iter.map(|entry| entry.unwrap()).collect()
    }

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));

        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"a".to_vec(), b"2".to_vec());
        batch.delete(b"b".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn prefix_iteration_is_exact() {
        let store = MemoryStore::new();
        for key in ["orphans/1/aa", "orphans/1/bb", "orphans/10/cc", "roots/1"] {
            store.put(key.as_bytes(), b"x").unwrap();
        }

        let hits = collect(store.prefix_iterator(b"orphans/1/").unwrap());
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(k, _)| k.starts_with(b"orphans/1/")));
    }

    #[test]
    fn prefix_end_handles_trailing_ff() {
        assert_eq!(prefix_end(b"\x01\xff"), Some(vec![0x02]));
        assert_eq!(prefix_end(b"\xff\xff"), None);

        let store = MemoryStore::new();
        store.put(b"\xff\xff\x01", b"x").unwrap();
        store.put(b"\xfe", b"y").unwrap();
        let hits = collect(store.prefix_iterator(b"\xff\xff").unwrap());
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::new();
        let alias = store.clone();
        store.put(b"k", b"v").unwrap();
        assert_eq!(alias.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
