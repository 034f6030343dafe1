//! Cache hot path benchmarks

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kumofs::dircache::DirCache;
use kumofs::path::DirEntry;
use kumofs::read::{RangeFetcher, ReadAheadCache};
use kumofs::StorageError;
use std::time::Duration;

struct InMemory(Bytes);

#[async_trait]
impl RangeFetcher for InMemory {
    async fn fetch_ranges(&self, start: u64, lengths: &[u64]) -> Result<Vec<Bytes>, StorageError> {
        let mut offset = start as usize;
        Ok(lengths
            .iter()
            .map(|len| {
                let end = (offset + *len as usize).min(self.0.len());
                let part = self.0.slice(offset.min(end)..end);
                offset += *len as usize;
                part
            })
            .collect())
    }
}

fn listing(n: usize) -> Vec<DirEntry> {
    (0..n)
        .map(|i| DirEntry::directory("bench", &format!("dir/sub{}/", i)))
        .collect()
}

fn benchmark_dircache(c: &mut Criterion) {
    let mut group = c.benchmark_group("dircache");

    for size in [10, 100, 1000].iter() {
        let cache = DirCache::new(Some(Duration::from_secs(3600)));
        cache.put("bench/dir", listing(*size));
        group.bench_with_input(format!("get_{}_entries", size), size, |b, _| {
            b.iter(|| black_box(cache.get(black_box("bench/dir"))));
        });
    }

    let cache = DirCache::new(None);
    let entries = listing(100);
    group.bench_function("put_100_entries", |b| {
        b.iter(|| cache.put(black_box("bench/dir"), entries.clone()));
    });

    group.bench_function("invalidate_deep_path", |b| {
        b.iter(|| {
            cache.put("bench/a/b/c", Vec::new());
            cache.invalidate(Some(black_box("bench/a/b/c/d")));
        });
    });

    group.finish();
}

fn benchmark_readahead(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let data = Bytes::from(vec![7u8; 4 * 1024 * 1024]);
    let mut group = c.benchmark_group("readahead");

    for read_size in [4 * 1024u64, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*read_size));
        group.bench_with_input(
            format!("sequential_{}_bytes", read_size),
            read_size,
            |b, &read_size| {
                b.to_async(&runtime).iter(|| {
                    let data = data.clone();
                    async move {
                        let size = data.len() as u64;
                        let mut cache = ReadAheadCache::new(InMemory(data), 1024 * 1024, size);
                        let mut offset = 0;
                        while offset < 1024 * 1024 {
                            let chunk = cache
                                .fetch(Some(offset), Some(offset + read_size))
                                .await
                                .unwrap();
                            black_box(chunk);
                            offset += read_size;
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_dircache, benchmark_readahead);
criterion_main!(benches);
