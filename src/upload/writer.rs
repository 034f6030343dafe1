//! Buffered writable handle for one object

use super::{simple_upload, ResumableUpload, UploadResult};
use crate::checker::{Consistency, ConsistencyChecker};
use crate::config::MIN_CHUNK_SIZE;
use crate::dircache::DirCache;
use crate::error::StorageError;
use crate::path::ObjectKey;
use crate::transport::{ApiUrls, HttpExecutor};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;

/// Options for [`ObjectWriter`]
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    /// Overrides the configured upload chunk size
    pub chunk_size: Option<usize>,
    /// Overrides the configured consistency check
    pub consistency: Option<Consistency>,
}

/// Largest multiple of 256 KiB not above `n`
fn align_down(n: usize) -> usize {
    n - n % MIN_CHUNK_SIZE
}

/// Writable handle. Data is buffered until a full chunk is available; the
/// object only becomes visible once [`ObjectWriter::close`] succeeds.
///
/// A handle is not meant for concurrent use.
pub struct ObjectWriter {
    executor: HttpExecutor,
    urls: ApiUrls,
    cache: Arc<DirCache>,
    object: ObjectKey,
    options: WriteOptions,
    chunk_size: usize,
    checker: Option<ConsistencyChecker>,
    buffer: BytesMut,
    upload: Option<ResumableUpload>,
    written: u64,
    closed: bool,
    failed: bool,
}

impl ObjectWriter {
    pub(crate) fn new(
        executor: HttpExecutor,
        urls: ApiUrls,
        cache: Arc<DirCache>,
        object: ObjectKey,
        options: WriteOptions,
        chunk_size: usize,
        max_request_size: usize,
        consistency: Consistency,
    ) -> Self {
        let chunk_size = align_down(options.chunk_size.unwrap_or(chunk_size).min(max_request_size))
            .max(MIN_CHUNK_SIZE);
        let consistency = options.consistency.unwrap_or(consistency);
        Self {
            executor,
            urls,
            cache,
            object,
            options,
            chunk_size,
            checker: Some(ConsistencyChecker::new(consistency)),
            buffer: BytesMut::new(),
            upload: None,
            written: 0,
            closed: false,
            failed: false,
        }
    }

    pub fn path(&self) -> String {
        self.object.path()
    }

    /// Bytes accepted by `write` so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a chunk failed to upload; the handle then rejects every call
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::InvalidArgument(format!(
                "writer for {} is closed",
                self.object
            )));
        }
        if self.failed {
            return Err(StorageError::InvalidArgument(format!(
                "writer for {} failed and was discarded",
                self.object
            )));
        }
        Ok(())
    }

    async fn session(&mut self) -> Result<&mut ResumableUpload, StorageError> {
        if self.upload.is_none() {
            let checker = self
                .checker
                .take()
                .unwrap_or_else(|| ConsistencyChecker::new(Consistency::None));
            let upload = ResumableUpload::initiate(
                &self.executor,
                &self.urls,
                &self.object.bucket,
                &self.object.key,
                self.options.content_type.as_deref(),
                self.options.metadata.as_ref(),
                checker,
            )
            .await?;
            self.upload = Some(upload);
        }
        self.upload
            .as_mut()
            .ok_or_else(|| StorageError::Protocol("upload session missing".into()))
    }

    async fn send_non_final(&mut self, len: usize) -> Result<(), StorageError> {
        let chunk = self.buffer.split_to(len).freeze();
        let result = match self.session().await {
            Ok(upload) => upload.send_chunk(chunk, false).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            // The chunk is gone from the buffer, so the object can no longer be completed
            self.failed = true;
            self.buffer.clear();
            if let Some(upload) = self.upload.as_mut() {
                upload.discard().await;
            }
            self.cache.invalidate(Some(&self.object.path()));
            tracing::warn!(path = %self.object, error = %e, "Chunk upload failed, write abandoned");
            return Err(e);
        }
        Ok(())
    }

    /// Buffer `data`, sending full chunks as they become available
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        self.ensure_open()?;
        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;

        // Keep at least one byte back so close() always has a final chunk to send
        while self.buffer.len() > self.chunk_size {
            self.send_non_final(self.chunk_size).await?;
        }
        Ok(data.len())
    }

    /// Send every complete 256 KiB region currently buffered
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        loop {
            let len = align_down(self.buffer.len()).min(self.chunk_size);
            if len == 0 {
                return Ok(());
            }
            self.send_non_final(len).await?;
        }
    }

    async fn finish(&mut self) -> Result<UploadResult, StorageError> {
        let data = self.buffer.split().freeze();

        if self.upload.is_none() && data.len() <= self.chunk_size {
            let checker = self
                .checker
                .take()
                .unwrap_or_else(|| ConsistencyChecker::new(Consistency::None));
            let object = simple_upload(
                &self.executor,
                &self.urls,
                &self.object.bucket,
                &self.object.key,
                data,
                self.options.content_type.as_deref(),
                self.options.metadata.as_ref(),
                checker,
            )
            .await?;
            return Ok(UploadResult {
                object,
                bytes_written: self.written,
                chunk_round_trips: 0,
            });
        }

        let path = self.object.path();
        let written = self.written;
        let upload = self.session().await?;
        let object = upload
            .send_chunk(data, true)
            .await?
            .ok_or_else(|| StorageError::Protocol(format!("{} was not sealed", path)))?;
        Ok(UploadResult {
            object,
            bytes_written: written,
            chunk_round_trips: upload.round_trips(),
        })
    }

    /// Finalize the object. On failure the session is cancelled.
    pub async fn close(&mut self) -> Result<UploadResult, StorageError> {
        self.ensure_open()?;
        self.closed = true;

        let result = self.finish().await;
        self.cache.invalidate(Some(&self.object.path()));

        if result.is_err() {
            if let Some(upload) = self.upload.as_mut() {
                upload.discard().await;
            }
        }
        result
    }

    /// Abandon the write; nothing becomes visible under the target key
    pub async fn discard(&mut self) {
        if self.closed || self.failed {
            return;
        }
        self.closed = true;
        self.buffer.clear();
        if let Some(upload) = self.upload.as_mut() {
            upload.discard().await;
        }
        self.cache.invalidate(Some(&self.object.path()));
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if !self.closed && !self.failed && self.written > 0 {
            tracing::warn!(
                path = %self.object,
                bytes = self.written,
                "Writer dropped without close; data was not committed"
            );
        }
    }
}
