//! Read-ahead / random access byte cache
//!
//! Keeps at most two contiguous chunks: the range most recently fetched from
//! the backend and the read-ahead block that follows it. A request covered by
//! the window is answered without I/O. Anything else clears the window and is
//! fetched afresh with one vector request `[requested, read_ahead]`.

use crate::error::StorageError;
use crate::metrics;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Vector-capable range reader: returns one buffer per requested length,
/// laid out back to back from `start`. Buffers may come back short at EOF.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch_ranges(&self, start: u64, lengths: &[u64]) -> Result<Vec<Bytes>, StorageError>;
}

/// One retained half-open range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
    pub data: Bytes,
}

/// Per-handle read-ahead cache
pub struct ReadAheadCache<F> {
    fetcher: F,
    block_size: u64,
    size: u64,
    window: VecDeque<Chunk>,
    hit_count: u64,
    miss_count: u64,
}

impl<F: RangeFetcher> ReadAheadCache<F> {
    pub fn new(fetcher: F, block_size: u64, size: u64) -> Self {
        Self {
            fetcher,
            block_size,
            size,
            window: VecDeque::with_capacity(2),
            hit_count: 0,
            miss_count: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count
    }

    /// Retained chunks, served range first
    pub fn chunks(&self) -> &VecDeque<Chunk> {
        &self.window
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Bytes `[start, end)`, both defaulting to the whole file
    pub async fn fetch(
        &mut self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Bytes, StorageError> {
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(self.size).min(self.size);
        if start >= self.size || start >= end {
            return Ok(Bytes::new());
        }

        if let Some(data) = self.from_window(start, end) {
            self.hit_count += 1;
            metrics::record_readahead(true);
            return Ok(data);
        }

        self.miss_count += 1;
        metrics::record_readahead(false);
        self.window.clear();

        let requested = end - start;
        let read_ahead = self.block_size.min(self.size - end);
        let lengths: Vec<u64> = if read_ahead > 0 {
            vec![requested, read_ahead]
        } else {
            vec![requested]
        };

        let parts = self.fetcher.fetch_ranges(start, &lengths).await?;
        if parts.len() != lengths.len() {
            return Err(StorageError::Protocol(format!(
                "vector read returned {} parts for {} ranges",
                parts.len(),
                lengths.len()
            )));
        }

        let mut offset = start;
        for data in parts {
            if data.is_empty() {
                continue;
            }
            let chunk_end = offset + data.len() as u64;
            self.window.push_back(Chunk {
                start: offset,
                end: chunk_end,
                data,
            });
            offset = chunk_end;
        }

        Ok(self
            .window
            .front()
            .filter(|chunk| chunk.start == start)
            .map(|chunk| chunk.data.clone())
            .unwrap_or_default())
    }

    fn from_window(&self, start: u64, end: u64) -> Option<Bytes> {
        for chunk in &self.window {
            if chunk.start == start && chunk.end == end {
                return Some(chunk.data.clone());
            }
            if chunk.start <= start && end <= chunk.end {
                let from = (start - chunk.start) as usize;
                let to = (end - chunk.start) as usize;
                return Some(chunk.data.slice(from..to));
            }
        }

        // Straddling the served chunk and its read-ahead successor
        if let (Some(first), Some(second)) = (self.window.front(), self.window.get(1)) {
            if first.end == second.start
                && first.start <= start
                && start < first.end
                && second.start < end
                && end <= second.end
            {
                let mut joined = BytesMut::with_capacity((end - start) as usize);
                joined.extend_from_slice(&first.data[(start - first.start) as usize..]);
                joined.extend_from_slice(&second.data[..(end - second.start) as usize]);
                return Some(joined.freeze());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Serves slices of an in-memory buffer and logs every call
    struct VectorFetcher {
        data: Bytes,
        calls: Mutex<Vec<(u64, Vec<u64>)>>,
    }

    impl VectorFetcher {
        fn new() -> Self {
            Self::with_len(100)
        }

        fn with_len(len: usize) -> Self {
            Self {
                data: Bytes::from((0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RangeFetcher for VectorFetcher {
        async fn fetch_ranges(
            &self,
            start: u64,
            lengths: &[u64],
        ) -> Result<Vec<Bytes>, StorageError> {
            self.calls.lock().push((start, lengths.to_vec()));
            let mut current = start as usize;
            Ok(lengths
                .iter()
                .map(|len| {
                    let end = (current + *len as usize).min(self.data.len());
                    let part = self.data.slice(current.min(end)..end);
                    current += *len as usize;
                    part
                })
                .collect())
        }
    }

    fn cache() -> ReadAheadCache<VectorFetcher> {
        ReadAheadCache::new(VectorFetcher::new(), 10, 100)
    }

    fn source(range: std::ops::Range<u8>) -> Vec<u8> {
        range.collect()
    }

    #[tokio::test]
    async fn test_initial_state() {
        let cache = cache();
        assert!(cache.chunks().is_empty());
        assert_eq!(cache.hit_count(), 0);
        assert_eq!(cache.miss_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_with_readahead() {
        let mut cache = cache();
        let result = cache.fetch(Some(0), Some(5)).await.unwrap();
        assert_eq!(&result[..], &source(0..5)[..]);

        assert_eq!(*cache.fetcher().calls.lock(), vec![(0, vec![5, 10])]);
        let chunks: Vec<_> = cache.chunks().iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(chunks, vec![(0, 5), (5, 15)]);
        assert_eq!(&cache.chunks()[1].data[..], &source(5..15)[..]);
    }

    #[tokio::test]
    async fn test_hit_fully_contained() {
        let mut cache = cache();
        cache.fetch(Some(0), Some(5)).await.unwrap();

        let result = cache.fetch(Some(5), Some(10)).await.unwrap();
        assert_eq!(&result[..], &source(5..10)[..]);
        assert_eq!(cache.fetcher().calls.lock().len(), 1);
        assert_eq!(cache.hit_count(), 1);
    }

    #[tokio::test]
    async fn test_hit_spanning_chunks() {
        let mut cache = cache();
        cache.fetch(Some(0), Some(5)).await.unwrap();

        let result = cache.fetch(Some(2), Some(8)).await.unwrap();
        assert_eq!(&result[..], &source(2..8)[..]);
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.fetcher().calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_read_ahead_identity() {
        let mut cache = cache();
        cache.fetch(Some(0), Some(5)).await.unwrap();

        let exact = cache.fetch(Some(5), Some(15)).await.unwrap();
        assert_eq!(&exact[..], &source(5..15)[..]);
        // Same backing memory as the retained chunk: no copy was made
        assert_eq!(exact.as_ptr(), cache.chunks()[1].data.as_ptr());
        assert_eq!(exact.len(), cache.chunks()[1].data.len());
        assert_eq!(cache.fetcher().calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_backward_seek_clears_window() {
        let mut cache = cache();
        cache.fetch(Some(50), Some(60)).await.unwrap();
        assert_eq!(cache.chunks()[0].start, 50);

        let result = cache.fetch(Some(20), Some(30)).await.unwrap();
        assert_eq!(&result[..], &source(20..30)[..]);
        assert_eq!(cache.fetcher().calls.lock()[1].0, 20);
        assert_eq!(cache.chunks()[0].start, 20);
        assert_eq!(cache.miss_count(), 2);
    }

    #[tokio::test]
    async fn test_seek_back_then_far_forward() {
        let mut cache = ReadAheadCache::new(VectorFetcher::with_len(2000), 10, 2000);
        cache.fetch(Some(50), Some(60)).await.unwrap();
        cache.fetch(Some(20), Some(30)).await.unwrap();

        let result = cache.fetch(Some(1000), Some(1010)).await.unwrap();
        assert_eq!(&result[..], &cache.fetcher().data[1000..1010]);
        assert_eq!(
            *cache.fetcher().calls.lock(),
            vec![(50, vec![10, 10]), (20, vec![10, 10]), (1000, vec![10, 10])]
        );
        let chunks: Vec<_> = cache.chunks().iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(chunks, vec![(1000, 1010), (1010, 1020)]);
        assert_eq!(cache.miss_count(), 3);
        assert_eq!(cache.hit_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_seek_miss() {
        let mut cache = cache();
        cache.fetch(Some(0), Some(5)).await.unwrap();

        let result = cache.fetch(Some(50), Some(55)).await.unwrap();
        assert_eq!(&result[..], &source(50..55)[..]);
        assert_eq!(cache.chunks().len(), 2);
        assert_eq!(cache.chunks()[0].start, 50);
        assert_eq!(cache.fetcher().calls.lock()[1], (50, vec![5, 10]));
    }

    #[tokio::test]
    async fn test_eof_truncation() {
        let mut cache = cache();
        let result = cache.fetch(Some(95), Some(100)).await.unwrap();
        assert_eq!(&result[..], &source(95..100)[..]);
        assert_eq!(*cache.fetcher().calls.lock(), vec![(95, vec![5])]);
        assert_eq!(cache.chunks().len(), 1);
    }

    #[tokio::test]
    async fn test_read_ahead_clamped_near_eof() {
        let mut cache = cache();
        cache.fetch(Some(85), Some(93)).await.unwrap();
        assert_eq!(*cache.fetcher().calls.lock(), vec![(85, vec![8, 7])]);
    }

    #[tokio::test]
    async fn test_whole_file() {
        let mut cache = cache();
        let result = cache.fetch(None, None).await.unwrap();
        assert_eq!(&result[..], &source(0..100)[..]);
    }

    #[tokio::test]
    async fn test_out_of_bounds() {
        let mut cache = cache();
        assert!(cache.fetch(Some(150), Some(200)).await.unwrap().is_empty());
        assert!(cache.fetcher().calls.lock().is_empty());
    }
}
