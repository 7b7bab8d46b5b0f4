// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{KeyValueStore, KvIterator, Result, WriteBatch};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wrapper counting backend calls, used by tests asserting cache behavior
/// and flush quanta (e.g. "repeated reads must not touch the backend").
#[derive(Debug, Default)]
pub struct InstrumentedStore<S> {
    inner: S,
    gets: AtomicUsize,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    batch_commits: AtomicUsize,
    iterators: AtomicUsize,
}

impl<S> InstrumentedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            batch_commits: AtomicUsize::new(0),
            iterators: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of atomic batch commits the backend has seen.
    pub fn batch_commits(&self) -> usize {
        self.batch_commits.load(Ordering::Relaxed)
    }

    pub fn iterators(&self) -> usize {
        self.iterators.load(Ordering::Relaxed)
    }
}

impl<S: KeyValueStore> KeyValueStore for InstrumentedStore<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.inner.delete(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.batch_commits.fetch_add(1, Ordering::Relaxed);
        self.inner.write_batch(batch)
    }

    fn iterator(&self) -> Result<KvIterator<'_>> {
        self.iterators.fetch_add(1, Ordering::Relaxed);
        self.inner.iterator()
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> Result<KvIterator<'_>> {
        self.iterators.fetch_add(1, Ordering::Relaxed);
        self.inner.prefix_iterator(prefix)
    }
}
