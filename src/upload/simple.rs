//! One-shot `multipart/related` upload for payloads that fit in one chunk

use super::{NewObject, DEFAULT_CONTENT_TYPE};
use crate::checker::{ConsistencyChecker, ObjectMetadata};
use crate::error::StorageError;
use crate::metrics;
use crate::path::{self, ObjectResource};
use crate::transport::{ApiUrls, HttpExecutor, HttpRequest};
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::collections::HashMap;

const BOUNDARY: &str = "==0==";

fn multipart_body(metadata_json: &[u8], content_type: &str, data: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(data.len() + metadata_json.len() + 256);
    body.put_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(metadata_json);
    body.put_slice(format!("\r\n--{}\r\n", BOUNDARY).as_bytes());
    body.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{}--", BOUNDARY).as_bytes());
    body.freeze()
}

/// Upload `data` to `bucket/key` in a single request.
///
/// The whole request is retried on transient faults. The checker sees the
/// payload once and is validated against the returned object resource.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(
    name = "upload.simple",
    skip(executor, urls, data, metadata, checker),
    fields(bucket = %bucket, key = %key, bytes = data.len()),
    err
)]
pub async fn simple_upload(
    executor: &HttpExecutor,
    urls: &ApiUrls,
    bucket: &str,
    key: &str,
    data: Bytes,
    content_type: Option<&str>,
    metadata: Option<&HashMap<String, String>>,
    mut checker: ConsistencyChecker,
) -> Result<ObjectResource, StorageError> {
    let path = path::join(bucket, key);
    let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);

    let metadata_json = serde_json::to_vec(&NewObject {
        name: key,
        content_type: Some(content_type),
        metadata,
    })
    .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

    let request = HttpRequest::new(Method::POST, urls.upload(bucket))
        .query("uploadType", "multipart")
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("multipart/related; boundary=\"==0==\""),
        )
        .body(multipart_body(&metadata_json, content_type, &data));

    let response = executor.call(request, &path).await?;
    metrics::record_upload_bytes(data.len() as u64);

    let object: ObjectResource = response.json()?;
    checker.update(&data);
    checker.validate(&ObjectMetadata::from_resource(&object), &path)?;

    tracing::debug!(path = %path, size = object.size, "Simple upload complete");
    Ok(object)
}
