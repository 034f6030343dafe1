//! Readable handle over one remote object

use super::readahead::{RangeFetcher, ReadAheadCache};
use crate::error::StorageError;
use crate::metrics;
use crate::path::ObjectPath;
use crate::transport::{header_value, ApiUrls, HttpExecutor, HttpRequest};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use reqwest::header::RANGE;
use std::io::SeekFrom;

/// Bytes scanned per step when searching for a delimiter
const DELIMITER_SCAN: usize = 64 * 1024;

/// Serves a vector request with one ranged `alt=media` GET, split into the
/// requested lengths
pub struct HttpRangeFetcher {
    executor: HttpExecutor,
    url: String,
    generation: Option<String>,
    path: String,
}

impl HttpRangeFetcher {
    pub fn new(executor: HttpExecutor, urls: &ApiUrls, object: &ObjectPath) -> Self {
        Self {
            executor,
            url: urls.object(object.bucket(), object.key()),
            generation: object.generation.clone(),
            path: object.object.path(),
        }
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch_ranges(&self, start: u64, lengths: &[u64]) -> Result<Vec<Bytes>, StorageError> {
        let total: u64 = lengths.iter().sum();
        if total == 0 {
            return Ok(lengths.iter().map(|_| Bytes::new()).collect());
        }

        let mut request = HttpRequest::get(self.url.clone())
            .query("alt", "media")
            .header(
                RANGE,
                header_value(&format!("bytes={}-{}", start, start + total - 1))?,
            );
        if let Some(generation) = &self.generation {
            request = request.query("generation", generation.clone());
        }

        let body = match self.executor.call(request, &self.path).await {
            Ok(response) => response.body,
            Err(StorageError::Http { code: 416, .. }) => Bytes::new(),
            Err(e) => return Err(e),
        };
        metrics::record_download_bytes(body.len() as u64);

        let mut offset = 0usize;
        Ok(lengths
            .iter()
            .map(|len| {
                let from = offset.min(body.len());
                let to = (offset + *len as usize).min(body.len());
                offset += *len as usize;
                body.slice(from..to)
            })
            .collect())
    }
}

/// Read-only, seekable handle. Not safe for concurrent use by two callers.
pub struct ObjectReader<F = HttpRangeFetcher> {
    cache: ReadAheadCache<F>,
    position: u64,
    path: String,
}

impl<F: RangeFetcher> ObjectReader<F> {
    pub fn new(fetcher: F, path: impl Into<String>, size: u64, block_size: u64) -> Self {
        Self {
            cache: ReadAheadCache::new(fetcher, block_size, size),
            position: 0,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.cache.size()
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn cache(&self) -> &ReadAheadCache<F> {
        &self.cache
    }

    /// Read up to `n` bytes from the current position; empty at EOF
    pub async fn read(&mut self, n: usize) -> Result<Bytes, StorageError> {
        let end = self.position.saturating_add(n as u64);
        let data = self.cache.fetch(Some(self.position), Some(end)).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Read from the current position to the end of the object
    pub async fn read_to_end(&mut self) -> Result<Bytes, StorageError> {
        let data = self.cache.fetch(Some(self.position), None).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Read through the next `\n` inclusive, or to the end of the object.
    /// Empty only at EOF.
    pub async fn read_line(&mut self) -> Result<Bytes, StorageError> {
        let step = self.cache.block_size().max(1) as usize;
        let mut line = BytesMut::new();
        loop {
            let data = self.read(step).await?;
            if data.is_empty() {
                break;
            }
            if let Some(idx) = data.iter().position(|b| *b == b'\n') {
                // Give back what follows the newline
                self.position -= (data.len() - idx - 1) as u64;
                line.extend_from_slice(&data[..=idx]);
                break;
            }
            line.extend_from_slice(&data);
        }
        Ok(line.freeze())
    }

    /// Every remaining line, as [`ObjectReader::read_line`] returns them
    pub async fn read_lines(&mut self) -> Result<Vec<Bytes>, StorageError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Consume the handle into a stream of its remaining lines
    pub fn lines(self) -> impl Stream<Item = Result<Bytes, StorageError>> {
        stream::try_unfold(self, |mut reader| async move {
            let line = reader.read_line().await?;
            Ok::<_, StorageError>(if line.is_empty() {
                None
            } else {
                Some((line, reader))
            })
        })
    }

    /// Offset just past the first `delimiter` at or after `from`, or the
    /// object size if there is none. Offset 0 is always a boundary.
    async fn seek_delimiter(&mut self, from: u64, delimiter: &[u8]) -> Result<u64, StorageError> {
        if from == 0 {
            return Ok(0);
        }
        self.position = from;
        let mut carry: Vec<u8> = Vec::new();
        loop {
            let window_start = self.position - carry.len() as u64;
            let data = self.read(DELIMITER_SCAN).await?;
            if data.is_empty() {
                return Ok(self.size());
            }
            let mut window = std::mem::take(&mut carry);
            window.extend_from_slice(&data);
            if let Some(idx) = window
                .windows(delimiter.len())
                .position(|w| w == delimiter)
            {
                return Ok(window_start + (idx + delimiter.len()) as u64);
            }
            // A delimiter may straddle two scans
            let keep = (delimiter.len() - 1).min(window.len());
            carry = window[window.len() - keep..].to_vec();
        }
    }

    /// Read `length` bytes from `offset`, or to EOF when `length` is `None`.
    ///
    /// With a delimiter, both ends move forward to just past the next
    /// delimiter, so consecutive blocks split a record stream without
    /// overlap or loss. The returned block includes its closing delimiter.
    /// Leaves the position at the end of the block.
    pub async fn read_block(
        &mut self,
        offset: u64,
        length: Option<u64>,
        delimiter: Option<&[u8]>,
    ) -> Result<Bytes, StorageError> {
        let size = self.size();
        let end = length
            .map_or(size, |len| offset.saturating_add(len))
            .min(size);

        let (start, end) = match delimiter.filter(|d| !d.is_empty()) {
            Some(delimiter) => {
                let start = self.seek_delimiter(offset, delimiter).await?;
                let end = if end >= size {
                    size
                } else {
                    self.seek_delimiter(end, delimiter).await?
                };
                (start, end.max(start))
            }
            None => (offset.min(size), end.max(offset.min(size))),
        };

        self.position = start;
        let data = self.cache.fetch(Some(start), Some(end)).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Move the position. Seeking past the end is allowed; reads there are
    /// empty. Seeking before byte 0 is rejected.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            StorageError::InvalidArgument(format!("seek before start of {}", self.path))
        })?;
        self.position = target;
        Ok(target)
    }
}
