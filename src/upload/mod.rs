//! Upload module
//!
//! Payloads up to one chunk go out as a single `multipart/related` request.
//! Anything larger runs through the resumable session protocol, which
//! tolerates the backend accepting fewer bytes than were sent.

use crate::path::ObjectResource;
use serde::Serialize;
use std::collections::HashMap;

pub mod resumable;
pub mod simple;
pub mod writer;

pub use resumable::{ResumableUpload, UploadSession, UploadState};
pub use simple::simple_upload;
pub use writer::{ObjectWriter, WriteOptions};

/// Default content type for uploaded bytes
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upload result
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub object: ObjectResource,
    pub bytes_written: u64,
    /// Chunk round trips made by a resumable upload; zero for a simple upload
    pub chunk_round_trips: usize,
}

/// Object resource fields sent when creating an object
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewObject<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<&'a HashMap<String, String>>,
}
