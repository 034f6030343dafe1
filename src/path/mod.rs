//! Path model
//!
//! Normalizes user-supplied paths (`gs://bucket/key`, `/bucket/key/`,
//! `bucket/key?generation=123`) into bucket, key and optional generation.
//! Paths stay unencoded everywhere except at the wire boundary, where
//! [`quote`] is applied to individual segments.

pub mod listing;

use crate::error::StorageError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;

pub use listing::{build_listing, DirEntry, EntryKind, ListPage, ObjectResource};

/// Protocol prefixes accepted on input paths
pub const PROTOCOLS: [&str; 2] = ["gs://", "gcs://"];

/// Characters left unescaped in wire path segments (RFC 3986 unreserved)
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// A bucket plus a key inside it; an empty key denotes the bucket itself
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub bucket: String,
    pub key: String,
}

impl ObjectKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Whether this addresses a bucket rather than an object
    pub fn is_bucket(&self) -> bool {
        self.key.is_empty()
    }

    /// Canonical `bucket/key` form
    pub fn path(&self) -> String {
        join(&self.bucket, &self.key)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// A parsed path: object key plus an optional generation selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub object: ObjectKey,
    pub generation: Option<String>,
}

impl ObjectPath {
    pub fn bucket(&self) -> &str {
        &self.object.bucket
    }

    pub fn key(&self) -> &str {
        &self.object.key
    }
}

/// Remove protocol prefixes and surrounding slashes.
pub fn strip_protocol(path: &str) -> String {
    let mut rest = path;
    for protocol in PROTOCOLS {
        if let Some(stripped) = rest.strip_prefix(protocol) {
            rest = stripped;
            break;
        }
    }
    rest.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// Canonical `bucket/key` form of a path, without generation suffix.
pub fn norm_path(path: &str) -> String {
    let stripped = strip_protocol(path);
    let (rest, _) = split_generation(&stripped);
    rest.to_string()
}

fn split_generation(path: &str) -> (&str, Option<&str>) {
    if let Some(idx) = path.rfind("?generation=") {
        let generation = &path[idx + "?generation=".len()..];
        if !generation.is_empty() && generation.bytes().all(|b| b.is_ascii_digit()) {
            return (path[..idx].trim_end_matches('/'), Some(generation));
        }
    }
    (path, None)
}

/// Split a path into bucket, key and generation.
///
/// A path with no `/` after normalization is a bare bucket. An empty bucket
/// name is rejected without any network attempt.
pub fn split_path(path: &str) -> Result<ObjectPath, StorageError> {
    let stripped = strip_protocol(path);
    let (rest, generation) = split_generation(&stripped);

    let (bucket, key) = match rest.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (rest, ""),
    };

    if bucket.is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "path '{}' has an empty bucket name",
            path
        )));
    }

    Ok(ObjectPath {
        object: ObjectKey::new(bucket, key),
        generation: generation.map(str::to_string),
    })
}

/// Join a bucket and key into a canonical path.
pub fn join(bucket: &str, key: &str) -> String {
    if key.is_empty() {
        bucket.to_string()
    } else {
        format!("{}/{}", bucket, key)
    }
}

/// Parent of a normalized path; the parent of a bucket is the root `""`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Last component of a normalized path
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Every ancestor of a normalized path, nearest first, ending at the bucket.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while !current.is_empty() {
        out.push(current);
        current = parent(current);
    }
    out
}

/// Percent-encode one wire path segment. Object keys are a single segment, so
/// `/` is escaped too.
pub fn quote(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}
