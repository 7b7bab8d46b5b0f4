// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_keyvalue::MemoryStore;
use aptos_merkle_avl::{BatchWithFlusher, FlushPolicy};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

// Writes ten megabytes (1,000 entries of 10 KB each) through the flusher at
// different thresholds, mirroring the original batching benchmark.
fn bench_flusher(c: &mut Criterion) {
    let value = vec![0u8; 10_000];
    for threshold in [100_000usize, 1_000_000, 10_000_000] {
        c.bench_function(&format!("batch_with_flusher/threshold={threshold}"), |b| {
            b.iter(|| {
                let store = Arc::new(MemoryStore::new());
                let mut batch =
                    BatchWithFlusher::new(store, FlushPolicy::Bounded { threshold });
                for nonce in 0..1_000u16 {
                    batch.put(&nonce.to_be_bytes(), &value).unwrap();
                }
                batch.write().unwrap();
            })
        });
    }
}

criterion_group!(benches, bench_flusher);
criterion_main!(benches);
