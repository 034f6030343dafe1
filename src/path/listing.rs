//! Flat key listing to hierarchical entries
//!
//! The backend only knows flat object names. A delimited listing returns the
//! objects directly at a level plus the common prefixes one level down; the
//! prefixes become synthetic directory entries with no backing object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};

/// Storage class reported for synthetic directory entries
pub const DIRECTORY_STORAGE_CLASS: &str = "DIRECTORY";

/// Object resource as returned by the JSON API
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResource {
    pub name: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
    #[serde(default)]
    pub md5_hash: Option<String>,
    #[serde(default)]
    pub crc32c: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub generation: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// The JSON API encodes 64-bit integers as strings.
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// One page of an object listing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub kind: String,
    #[serde(default)]
    pub items: Vec<ObjectResource>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One listing record
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Canonical `bucket/key` path; directories carry no trailing slash
    pub name: String,
    pub bucket: String,
    pub kind: EntryKind,
    pub size: u64,
    pub md5_hash: Option<String>,
    pub crc32c: Option<String>,
    pub etag: Option<String>,
    pub storage_class: String,
    pub generation: Option<String>,
    pub content_type: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl DirEntry {
    /// File entry for an object resource
    pub fn file(bucket: &str, object: ObjectResource) -> Self {
        Self {
            name: format!("{}/{}", bucket, object.name),
            bucket: bucket.to_string(),
            kind: EntryKind::File,
            size: object.size,
            md5_hash: object.md5_hash,
            crc32c: object.crc32c,
            etag: object.etag,
            storage_class: object.storage_class.unwrap_or_else(|| "STANDARD".to_string()),
            generation: object.generation,
            content_type: object.content_type,
            updated: object.updated,
            metadata: object.metadata.unwrap_or_default(),
        }
    }

    /// Synthetic directory entry for a key prefix (with or without trailing `/`)
    pub fn directory(bucket: &str, prefix: &str) -> Self {
        let key = prefix.trim_end_matches('/');
        Self {
            name: super::join(bucket, key),
            bucket: bucket.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            md5_hash: None,
            crc32c: None,
            etag: None,
            storage_class: DIRECTORY_STORAGE_CLASS.to_string(),
            generation: None,
            content_type: None,
            updated: None,
            metadata: HashMap::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Key part of the entry name
    pub fn key(&self) -> &str {
        self.name
            .strip_prefix(&self.bucket)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(&self.name)
    }
}

/// Turn one level of a delimited listing into entries.
///
/// Every distinct common prefix becomes one directory entry, in the order the
/// backend returned them; every object becomes one file entry.
pub fn build_listing(
    objects: Vec<ObjectResource>,
    prefixes: Vec<String>,
    bucket: &str,
) -> Vec<DirEntry> {
    let mut seen = HashSet::new();
    let mut entries: Vec<DirEntry> = prefixes
        .into_iter()
        .filter(|prefix| seen.insert(prefix.clone()))
        .map(|prefix| DirEntry::directory(bucket, &prefix))
        .collect();

    entries.extend(objects.into_iter().map(|obj| DirEntry::file(bucket, obj)));
    entries
}
