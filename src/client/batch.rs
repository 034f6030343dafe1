//! Batch deletion
//!
//! Many deletes travel in one `multipart/mixed` request, one sub-request per
//! object. Each request carries at most `batch.delete_batch_size` deletes and
//! at most `batch.max_concurrency` requests are in flight.

use super::{FindOptions, StorageClient};
use crate::error::{validate_response, StorageError};
use crate::path::{self, quote, ObjectKey};
use crate::transport::HttpRequest;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::collections::BTreeSet;

const BOUNDARY: &str = "===============7330845974216740156==";

/// Sub-request `Content-ID` stem; replies echo it as `response-kumofs+N`
const CONTENT_ID_PREFIX: &str = "kumofs+";

/// One sub-response of a batch
#[derive(Debug, Clone, PartialEq)]
struct BatchPart {
    /// 1-based sub-request number from the echoed `Content-ID`
    id: Option<usize>,
    status: u16,
    body: String,
}

fn batch_body(keys: &[ObjectKey]) -> String {
    let mut body = String::new();
    for (i, key) in keys.iter().enumerate() {
        body.push_str(&format!(
            "--{boundary}\r\n\
             Content-Type: application/http\r\n\
             Content-Transfer-Encoding: binary\r\n\
             Content-ID: <{prefix}{i}>\r\n\
             \r\n\
             DELETE /storage/v1/b/{bucket}/o/{key} HTTP/1.1\r\n\
             Content-Type: application/json\r\n\
             accept: application/json\r\n\
             content-length: 0\r\n\
             \r\n",
            boundary = BOUNDARY,
            prefix = CONTENT_ID_PREFIX,
            i = i + 1,
            bucket = quote(&key.bucket),
            key = quote(&key.key),
        ));
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    body
}

/// Boundary declared by a `multipart/mixed` content type
fn response_boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .next()
}

/// Sub-request number from a `Content-ID: <response-kumofs+N>` header
fn response_content_id(part: &str) -> Option<usize> {
    part.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-id") {
            return None;
        }
        value
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .strip_prefix("response-")?
            .strip_prefix(CONTENT_ID_PREFIX)?
            .parse()
            .ok()
    })
}

/// Sub-responses in the order they appear in the body
fn parse_batch_response(body: &str, boundary: &str) -> Vec<BatchPart> {
    let delimiter = format!("--{}", boundary);
    body.split(delimiter.as_str())
        .skip(1)
        .filter(|part| !part.starts_with("--"))
        .filter_map(|part| {
            let status = part
                .lines()
                .find_map(|line| line.trim().strip_prefix("HTTP/1.1 "))?;
            let status = status.get(..3)?.parse().ok()?;
            let json = part.find('{').map(|i| part[i..].trim()).unwrap_or_default();
            Some(BatchPart {
                id: response_content_id(part),
                status,
                body: json.to_string(),
            })
        })
        .collect()
}

/// Arrange sub-responses in sub-request order.
///
/// Parts are matched by `Content-ID` when every part carries one, and by
/// position when none does.
fn order_parts(parts: Vec<BatchPart>, count: usize) -> Result<Vec<BatchPart>, StorageError> {
    if parts.len() != count {
        return Err(StorageError::Protocol(format!(
            "batch answered {} of {} deletes",
            parts.len(),
            count
        )));
    }
    let with_id = parts.iter().filter(|p| p.id.is_some()).count();
    if with_id == 0 {
        return Ok(parts);
    }
    if with_id != count {
        return Err(StorageError::Protocol(
            "batch response mixes parts with and without Content-ID".into(),
        ));
    }

    let mut slots: Vec<Option<BatchPart>> = vec![None; count];
    for part in parts {
        let id = part.id.unwrap_or_default();
        let slot = id
            .checked_sub(1)
            .and_then(|i| slots.get_mut(i))
            .ok_or_else(|| StorageError::Protocol(format!("unknown batch Content-ID {}", id)))?;
        if slot.is_some() {
            return Err(StorageError::Protocol(format!(
                "duplicate batch Content-ID {}",
                id
            )));
        }
        *slot = Some(part);
    }
    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| StorageError::Protocol("batch response is missing a part".into()))
}

impl StorageClient {
    /// Delete files, or whole trees when `recursive` is set.
    ///
    /// Objects that are already gone count as deleted. A recursive removal of
    /// a bare bucket also deletes the bucket.
    #[tracing::instrument(name = "client.rm", skip(self, paths), fields(count = paths.len()), err)]
    pub async fn rm<S: AsRef<str>>(&self, paths: &[S], recursive: bool) -> Result<(), StorageError> {
        let mut keys = Vec::new();
        let mut buckets = Vec::new();

        for p in paths {
            let target = path::split_path(p.as_ref())?;
            if !recursive {
                if target.key().is_empty() {
                    return Err(StorageError::InvalidArgument(format!(
                        "{} is a bucket; remove it recursively or with rmdir",
                        target.bucket()
                    )));
                }
                keys.push(target.object);
                continue;
            }

            let root = target.object.path();
            let options = FindOptions {
                with_dirs: true,
                ..Default::default()
            };
            let found = self.find(&root, options).await?;
            let has_children = found.iter().any(|e| e.name != root);
            for entry in found {
                let key = entry.key().to_string();
                // Directories may be backed by placeholder objects
                let key = if entry.is_dir() { format!("{}/", key) } else { key };
                keys.push(ObjectKey::new(entry.bucket.clone(), key));
            }
            if target.key().is_empty() {
                buckets.push(target.bucket().to_string());
            } else if has_children {
                keys.push(ObjectKey::new(target.bucket(), format!("{}/", target.key())));
            }
        }

        self.delete_objects(keys).await?;
        for bucket in buckets {
            self.rmdir(&bucket).await?;
        }
        Ok(())
    }

    /// Delete objects in batches; returns once every batch has answered
    pub(super) async fn delete_objects(&self, keys: Vec<ObjectKey>) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }

        let batches: Vec<Vec<ObjectKey>> = keys
            .chunks(self.config.batch.delete_batch_size)
            .map(<[ObjectKey]>::to_vec)
            .collect();
        tracing::debug!(objects = keys.len(), batches = batches.len(), "Deleting objects");

        let results: Vec<Result<(), StorageError>> = stream::iter(batches)
            .map(|batch| async move { self.delete_batch(&batch).await })
            .buffer_unordered(self.config.batch.max_concurrency)
            .collect()
            .await;

        // Invalidate even after partial failure; some deletes went through
        let touched: BTreeSet<String> = keys.iter().map(ObjectKey::path).collect();
        for path in &touched {
            self.cache.invalidate(Some(path));
        }

        results.into_iter().collect()
    }

    async fn delete_batch(&self, keys: &[ObjectKey]) -> Result<(), StorageError> {
        let request = HttpRequest::new(Method::POST, self.urls.batch())
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static(
                    "multipart/mixed; boundary=\"===============7330845974216740156==\"",
                ),
            )
            .body(batch_body(keys));

        let response = self.executor.call(request, "batch").await?;
        let boundary = response
            .header("content-type")
            .and_then(response_boundary)
            .ok_or_else(|| StorageError::Protocol("batch response without a boundary".into()))?
            .to_string();

        let text = String::from_utf8_lossy(&response.body);
        let parts = order_parts(parse_batch_response(&text, &boundary), keys.len())?;

        for (key, part) in keys.iter().zip(parts) {
            match part.status {
                200 | 204 | 404 => {}
                code => {
                    let path = key.path();
                    tracing::warn!(path = %path, status = code, "Batched delete failed");
                    validate_response(code, part.body.as_bytes(), &path)?;
                }
            }
        }
        Ok(())
    }
}
