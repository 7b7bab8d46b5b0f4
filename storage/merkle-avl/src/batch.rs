// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::FlushPolicy;
use aptos_keyvalue::{KeyValueStore, StoreError, WriteBatch};
use std::sync::Arc;
use tracing::trace;

/// A write batch that commits itself to the backend whenever the buffered
/// byte cost reaches the configured threshold.
///
/// This bounds peak write-buffer memory when committing very large batches,
/// at the price of atomicity across the whole logical batch: each flush is
/// its own backend commit. The threshold is advisory; an operation larger
/// than the threshold still goes through, in a batch of its own.
///
/// After a backend write error the batch is poisoned and every further call
/// returns the same error.
pub struct BatchWithFlusher<S> {
    store: Arc<S>,
    pending: WriteBatch,
    threshold: Option<usize>,
    poisoned: Option<StoreError>,
}

impl<S: KeyValueStore> BatchWithFlusher<S> {
    pub fn new(store: Arc<S>, policy: FlushPolicy) -> Self {
        let threshold = match policy {
            FlushPolicy::Atomic => None,
            FlushPolicy::Bounded { threshold } => Some(threshold),
        };
        Self {
            store,
            pending: WriteBatch::new(),
            threshold,
            poisoned: None,
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_poisoned()?;
        let cost = key.len() + value.len();
        self.pre_flush(cost)?;
        self.pending.put(key.to_vec(), value.to_vec());
        self.post_flush()
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.check_poisoned()?;
        self.pre_flush(key.len())?;
        self.pending.delete(key.to_vec());
        self.post_flush()
    }

    /// Commits whatever is still buffered. A no-op on the backend when
    /// nothing is pending, so writing twice in a row costs one commit.
    pub fn write(&mut self) -> Result<(), StoreError> {
        self.check_poisoned()?;
        self.flush()
    }

    /// Byte cost of the operations not yet flushed.
    pub fn pending_bytes(&self) -> usize {
        self.pending.size_in_bytes()
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    fn check_poisoned(&self) -> Result<(), StoreError> {
        match &self.poisoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Flushes ahead of an insertion that would push the buffer over the
    /// threshold, so an oversized operation lands in a batch of its own.
    fn pre_flush(&mut self, incoming: usize) -> Result<(), StoreError> {
        if let Some(threshold) = self.threshold {
            if !self.pending.is_empty() && self.pending.size_in_bytes() + incoming > threshold {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn post_flush(&mut self) -> Result<(), StoreError> {
        if let Some(threshold) = self.threshold {
            if self.pending.size_in_bytes() >= threshold {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        trace!(ops = batch.len(), bytes = batch.size_in_bytes(), "flushing write batch");
        if let Err(err) = self.store.write_batch(batch) {
            self.poisoned = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aptos_keyvalue::{InstrumentedStore, MemoryStore, Result as StoreResult};

    fn flusher(threshold: usize) -> (Arc<InstrumentedStore<MemoryStore>>, BatchWithFlusher<InstrumentedStore<MemoryStore>>) {
        let store = Arc::new(InstrumentedStore::new(MemoryStore::new()));
        let batch = BatchWithFlusher::new(store.clone(), FlushPolicy::Bounded { threshold });
        (store, batch)
    }

    fn make_key(nonce: u16) -> Vec<u8> {
        nonce.to_be_bytes().to_vec()
    }

    #[test]
    fn entry_of_exactly_threshold_bytes_flushes_immediately() {
        let (store, mut batch) = flusher(100);
        batch.put(b"abcd", &[0u8; 96]).unwrap();
        assert_eq!(store.batch_commits(), 1);
        assert_eq!(batch.pending_bytes(), 0);
    }

    #[test]
    fn under_threshold_stream_flushes_only_on_write() {
        let (store, mut batch) = flusher(1_000);
        for nonce in 0..9u16 {
            batch.put(&make_key(nonce), &[0u8; 98]).unwrap();
        }
        assert_eq!(store.batch_commits(), 0);
        assert_eq!(batch.pending_ops(), 9);

        batch.write().unwrap();
        assert_eq!(store.batch_commits(), 1);
        assert_eq!(store.inner().len(), 9);
    }

    #[test]
    fn oversized_entry_gets_its_own_batch() {
        let (store, mut batch) = flusher(100);
        batch.put(&make_key(0), &[0u8; 10]).unwrap();
        // 500 bytes > threshold: the 12 pending bytes flush first, then the
        // big entry flushes alone.
        batch.put(&make_key(1), &[0u8; 500]).unwrap();
        assert_eq!(store.batch_commits(), 2);
        assert_eq!(batch.pending_bytes(), 0);
    }

    #[test]
    fn empty_write_skips_the_backend() {
        let (store, mut batch) = flusher(100);
        batch.write().unwrap();
        batch.write().unwrap();
        assert_eq!(store.batch_commits(), 0);
    }

    #[test]
    fn deletes_count_key_bytes() {
        let (store, mut batch) = flusher(4);
        batch.delete(&[0u8; 3]).unwrap();
        assert_eq!(store.batch_commits(), 0);
        batch.delete(&[1u8; 1]).unwrap();
        assert_eq!(store.batch_commits(), 1);
    }

    // Port of the original ten-megabyte batching exercise: a thousand
    // ~10 KB values through ascending thresholds, everything readable
    // afterwards regardless of how many flush quanta it took. The payload
    // stays just under the largest threshold so that run is one commit.
    #[test]
    fn ten_megabytes_across_thresholds() {
        for threshold in [100_000usize, 1_000_000, 10_000_000] {
            let (store, mut batch) = flusher(threshold);
            let value = vec![0u8; 9_990];
            for nonce in 0..1_000u16 {
                batch.put(&make_key(nonce), &value).unwrap();
            }
            batch.write().unwrap();

            assert_eq!(store.inner().len(), 1_000);
            if threshold == 10_000_000 {
                assert_eq!(store.batch_commits(), 1);
            } else {
                assert!(store.batch_commits() > 1);
            }
            for nonce in 0..1_000u16 {
                assert_eq!(store.get(&make_key(nonce)).unwrap(), Some(value.clone()));
            }
        }
    }

    #[test]
    fn atomic_policy_never_auto_flushes() {
        let store = Arc::new(InstrumentedStore::new(MemoryStore::new()));
        let mut batch = BatchWithFlusher::new(store.clone(), FlushPolicy::Atomic);
        for nonce in 0..100u16 {
            batch.put(&make_key(nonce), &[0u8; 10_000]).unwrap();
        }
        assert_eq!(store.batch_commits(), 0);
        batch.write().unwrap();
        assert_eq!(store.batch_commits(), 1);
    }

    #[derive(Debug, Default)]
    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn put(&self, _key: &[u8], _value: &[u8]) -> StoreResult<()> {
            Ok(())
        }
        fn delete(&self, _key: &[u8]) -> StoreResult<()> {
            Ok(())
        }
        fn write_batch(&self, _batch: aptos_keyvalue::WriteBatch) -> StoreResult<()> {
            Err(StoreError::Io("disk full".to_string()))
        }
        fn iterator(&self) -> StoreResult<aptos_keyvalue::KvIterator<'_>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn backend_error_poisons_the_batch() {
        let mut batch = BatchWithFlusher::new(Arc::new(FailingStore), FlushPolicy::Atomic);
        batch.put(b"k", b"v").unwrap();
        let err = batch.write().unwrap_err();
        assert_eq!(err, StoreError::Io("disk full".to_string()));

        // Every further use reports the same failure.
        let again = batch.put(b"k2", b"v2").unwrap_err();
        assert_eq!(again, err);
    }
}
