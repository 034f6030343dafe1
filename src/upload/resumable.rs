//! Resumable upload state machine
//!
//! `Uninitiated -> SessionOpen -> (ChunkSent)* -> Finalized | Discarded`
//!
//! Every chunk carries `Content-Range: bytes {start}-{end}/{total|*}`. The
//! backend answers 308 while the object is incomplete, reporting what it has
//! persisted so far in `Range: bytes=0-{n}`, and 200/201 with the object
//! resource once sealed. A 308 may acknowledge fewer bytes than were sent;
//! the unaccepted tail is resent from the new offset, and only accepted bytes
//! reach the consistency checker.

use super::{NewObject, DEFAULT_CONTENT_TYPE};
use crate::checker::{ConsistencyChecker, ObjectMetadata};
use crate::config::MIN_CHUNK_SIZE;
use crate::error::StorageError;
use crate::metrics;
use crate::path::{self, ObjectResource};
use crate::transport::{header_value, ApiUrls, HttpExecutor, HttpRequest};
use bytes::Bytes;
use reqwest::header::{HeaderValue, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::Method;
use std::collections::HashMap;

/// Shortest session URI accepted as plausible
const MIN_LOCATION_LEN: usize = 20;

/// Consecutive zero-progress responses tolerated before giving up
const MAX_STALLS: usize = 3;

/// Upload lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Uninitiated,
    SessionOpen,
    Finalized,
    Discarded,
}

/// Server-side upload session
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Opaque session URI
    pub location: String,
    pub bytes_accepted: u64,
    pub total_size: Option<u64>,
    pub content_type: String,
    pub finalized: bool,
}

/// One resumable upload of one object
pub struct ResumableUpload {
    executor: HttpExecutor,
    path: String,
    session: UploadSession,
    state: UploadState,
    checker: ConsistencyChecker,
    round_trips: usize,
}

impl std::fmt::Debug for ResumableUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableUpload")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("bytes_accepted", &self.session.bytes_accepted)
            .finish()
    }
}

impl ResumableUpload {
    /// Open a session for `bucket/key`
    #[tracing::instrument(
        name = "upload.resumable.initiate",
        skip(executor, urls, metadata, checker),
        fields(bucket = %bucket, key = %key),
        err
    )]
    pub async fn initiate(
        executor: &HttpExecutor,
        urls: &ApiUrls,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
        checker: ConsistencyChecker,
    ) -> Result<Self, StorageError> {
        let path = path::join(bucket, key);
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);

        let request = HttpRequest::new(Method::POST, urls.upload(bucket))
            .query("uploadType", "resumable")
            .header(
                reqwest::header::HeaderName::from_static("x-upload-content-type"),
                header_value(content_type)?,
            )
            .json_body(&NewObject {
                name: key,
                content_type: Some(content_type),
                metadata,
            })?;

        let response = executor.call(request, &path).await?;
        let location = response
            .header(LOCATION.as_str())
            .map(str::to_string)
            .unwrap_or_default();
        if location.len() < MIN_LOCATION_LEN {
            return Err(StorageError::Protocol(format!(
                "implausible upload session location '{}'",
                location
            )));
        }

        tracing::info!(path = %path, "Opened resumable upload session");

        Ok(Self {
            executor: executor.clone(),
            path,
            session: UploadSession {
                location,
                bytes_accepted: 0,
                total_size: None,
                content_type: content_type.to_string(),
                finalized: false,
            },
            state: UploadState::SessionOpen,
            checker,
            round_trips: 0,
        })
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn checker(&self) -> &ConsistencyChecker {
        &self.checker
    }

    /// Chunk requests made so far, resends included
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    /// Send `data` as the next chunk.
    ///
    /// A non-final chunk must be a non-empty multiple of 256 KiB. The call
    /// returns once every byte has been accepted; for a final chunk it returns
    /// the sealed object after validating the checker against it.
    ///
    /// Any failure once the chunk has been handed to the backend cancels the
    /// session and leaves the upload [`UploadState::Discarded`].
    #[tracing::instrument(
        name = "upload.resumable.send_chunk",
        skip(self, data),
        fields(path = %self.path, bytes = data.len(), is_final = is_final),
        err
    )]
    pub async fn send_chunk(
        &mut self,
        data: Bytes,
        is_final: bool,
    ) -> Result<Option<ObjectResource>, StorageError> {
        if self.state != UploadState::SessionOpen {
            return Err(StorageError::InvalidArgument(format!(
                "upload of {} is {:?}",
                self.path, self.state
            )));
        }
        if !is_final && (data.is_empty() || data.len() % MIN_CHUNK_SIZE != 0) {
            return Err(StorageError::InvalidArgument(format!(
                "non-final chunk of {} bytes is not a multiple of {}",
                data.len(),
                MIN_CHUNK_SIZE
            )));
        }

        let result = self.send_chunk_inner(data, is_final).await;
        if result.is_err() && self.state == UploadState::SessionOpen {
            self.discard().await;
        }
        result
    }

    async fn send_chunk_inner(
        &mut self,
        data: Bytes,
        is_final: bool,
    ) -> Result<Option<ObjectResource>, StorageError> {
        let mut remaining = data;
        let mut stalls = 0;

        loop {
            let start = self.session.bytes_accepted;
            let len = remaining.len() as u64;
            if is_final {
                self.session.total_size = Some(start + len);
            }

            let content_range = content_range(start, len, is_final);
            let request = HttpRequest::new(Method::PUT, self.session.location.clone())
                .header(CONTENT_RANGE, header_value(&content_range)?)
                .header(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE))
                .body(remaining.clone());

            let response = self.executor.call(request, &self.path).await?;
            self.round_trips += 1;
            metrics::record_upload_bytes(len);

            match response.status {
                308 => {
                    let persisted = match response.header("range") {
                        Some(range) => parse_range_end(range)? + 1,
                        None => 0,
                    };
                    if persisted < start || persisted > start + len {
                        return Err(StorageError::Protocol(format!(
                            "backend reports {} bytes persisted after sending {}-{}",
                            persisted,
                            start,
                            start + len
                        )));
                    }

                    let accepted = (persisted - start) as usize;
                    let shortfall = len - accepted as u64;
                    self.checker.update(&remaining[..accepted]);
                    self.session.bytes_accepted = persisted;
                    remaining = remaining.slice(accepted..);
                    metrics::record_upload_chunk(shortfall);

                    if shortfall > 0 {
                        tracing::debug!(
                            path = %self.path,
                            accepted = accepted,
                            shortfall = shortfall,
                            "Partial chunk acceptance, resending tail"
                        );
                    }

                    if accepted == 0 && len > 0 {
                        stalls += 1;
                        if stalls >= MAX_STALLS {
                            return Err(StorageError::Protocol(format!(
                                "no upload progress for {} after {} attempts",
                                self.path, stalls
                            )));
                        }
                    } else {
                        stalls = 0;
                    }

                    if remaining.is_empty() {
                        if is_final {
                            return Err(StorageError::Protocol(format!(
                                "final chunk of {} accepted but object not sealed",
                                self.path
                            )));
                        }
                        return Ok(None);
                    }
                }
                200 | 201 => {
                    if !is_final {
                        return Err(StorageError::Protocol(format!(
                            "upload of {} sealed before the final chunk",
                            self.path
                        )));
                    }
                    metrics::record_upload_chunk(0);
                    self.checker.update(&remaining);
                    self.session.bytes_accepted = start + len;

                    let object: ObjectResource = response.json()?;
                    self.session.finalized = true;
                    self.state = UploadState::Finalized;
                    self.checker
                        .validate(&ObjectMetadata::from_resource(&object), &self.path)?;

                    tracing::info!(
                        path = %self.path,
                        size = object.size,
                        round_trips = self.round_trips,
                        "Resumable upload finalized"
                    );
                    return Ok(Some(object));
                }
                other => {
                    return Err(StorageError::Protocol(format!(
                        "unexpected status {} during upload of {}",
                        other, self.path
                    )));
                }
            }
        }
    }

    /// Seal the object with whatever has been sent so far
    pub async fn finalize(&mut self) -> Result<ObjectResource, StorageError> {
        self.send_chunk(Bytes::new(), true)
            .await?
            .ok_or_else(|| StorageError::Protocol(format!("{} was not sealed", self.path)))
    }

    /// Best-effort cancellation of the session; never fails
    pub async fn discard(&mut self) {
        if self.state != UploadState::SessionOpen {
            return;
        }
        self.state = UploadState::Discarded;

        let request = HttpRequest::new(Method::DELETE, self.session.location.clone());
        match self.executor.attempt(&request, &self.path).await {
            Ok(_) => tracing::debug!(path = %self.path, "Upload session cancelled"),
            // 499 is the documented reply to a successful cancel
            Err(StorageError::Http { code: 499, .. }) => {}
            Err(e) => tracing::warn!(path = %self.path, error = %e, "Failed to cancel upload session"),
        }
    }
}

/// `Content-Range` value for a chunk of `len` bytes starting at `start`
fn content_range(start: u64, len: u64, is_final: bool) -> String {
    match (is_final, len) {
        (true, 0) => format!("bytes */{}", start),
        (true, _) => format!("bytes {}-{}/{}", start, start + len - 1, start + len),
        (false, _) => format!("bytes {}-{}/*", start, start + len - 1),
    }
}

/// Last persisted byte offset from `bytes=0-{n}`
fn parse_range_end(range: &str) -> Result<u64, StorageError> {
    range
        .rsplit_once('-')
        .and_then(|(_, end)| end.trim().parse().ok())
        .ok_or_else(|| StorageError::Protocol(format!("malformed Range header '{}'", range)))
}
