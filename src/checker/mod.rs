//! End-to-end consistency checking
//!
//! A [`ConsistencyChecker`] accumulates the exact byte stream of one transfer,
//! in order, and is compared once against what the server reports for the
//! finished object. The variant is chosen at transfer start from the
//! configured [`Consistency`].

use crate::error::StorageError;
use crate::path::ObjectResource;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crc::{Crc, CRC_32_ISCSI};
use reqwest::header::HeaderMap;
use std::fmt;
use std::str::FromStr;

/// CRC32C (Castagnoli) as used by the backend
static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Which integrity check to run on transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    None,
    Size,
    Md5,
    Crc32c,
}

impl FromStr for Consistency {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Consistency::None),
            "size" => Ok(Consistency::Size),
            "md5" => Ok(Consistency::Md5),
            "crc32c" => Ok(Consistency::Crc32c),
            other => Err(StorageError::InvalidArgument(format!(
                "unknown consistency '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Consistency::None => "none",
            Consistency::Size => "size",
            Consistency::Md5 => "md5",
            Consistency::Crc32c => "crc32c",
        };
        f.write_str(s)
    }
}

/// Server-reported facts about a finished object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: Option<u64>,
    /// Base64 MD5 digest
    pub md5_hash: Option<String>,
    /// Base64 big-endian CRC32C
    pub crc32c: Option<String>,
}

impl ObjectMetadata {
    pub fn from_resource(resource: &ObjectResource) -> Self {
        Self {
            size: Some(resource.size),
            md5_hash: resource.md5_hash.clone(),
            crc32c: resource.crc32c.clone(),
        }
    }

    /// Parse `X-Goog-Hash: crc32c=...,md5=...` plus the stored length headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut meta = ObjectMetadata::default();

        for value in headers.get_all("x-goog-hash") {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for part in value.split(',') {
                match part.trim().split_once('=') {
                    Some(("md5", digest)) => meta.md5_hash = Some(digest.to_string()),
                    Some(("crc32c", digest)) => meta.crc32c = Some(digest.to_string()),
                    _ => {}
                }
            }
        }

        meta.size = ["x-goog-stored-content-length", "content-length"]
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| v.parse().ok());

        meta
    }
}

/// Running checksum state for one transfer
#[derive(Clone)]
pub enum ConsistencyChecker {
    None,
    Size { bytes: u64 },
    Md5(md5::Context),
    Crc32c(crc::Digest<'static, u32>),
}

impl fmt::Debug for ConsistencyChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyChecker::None => f.write_str("None"),
            ConsistencyChecker::Size { bytes } => write!(f, "Size({})", bytes),
            ConsistencyChecker::Md5(_) => f.write_str("Md5"),
            ConsistencyChecker::Crc32c(_) => f.write_str("Crc32c"),
        }
    }
}

impl ConsistencyChecker {
    pub fn new(kind: Consistency) -> Self {
        match kind {
            Consistency::None => ConsistencyChecker::None,
            Consistency::Size => ConsistencyChecker::Size { bytes: 0 },
            Consistency::Md5 => ConsistencyChecker::Md5(md5::Context::new()),
            Consistency::Crc32c => ConsistencyChecker::Crc32c(CASTAGNOLI.digest()),
        }
    }

    pub fn kind(&self) -> Consistency {
        match self {
            ConsistencyChecker::None => Consistency::None,
            ConsistencyChecker::Size { .. } => Consistency::Size,
            ConsistencyChecker::Md5(_) => Consistency::Md5,
            ConsistencyChecker::Crc32c(_) => Consistency::Crc32c,
        }
    }

    /// Feed the next bytes of the transfer
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ConsistencyChecker::None => {}
            ConsistencyChecker::Size { bytes } => *bytes += data.len() as u64,
            ConsistencyChecker::Md5(ctx) => ctx.consume(data),
            ConsistencyChecker::Crc32c(digest) => digest.update(data),
        }
    }

    /// Current digest in the backend's encoding, without consuming the state
    pub fn digest(&self) -> Option<String> {
        match self {
            ConsistencyChecker::None => None,
            ConsistencyChecker::Size { bytes } => Some(bytes.to_string()),
            ConsistencyChecker::Md5(ctx) => Some(BASE64.encode(ctx.clone().compute().0)),
            ConsistencyChecker::Crc32c(digest) => {
                Some(BASE64.encode(digest.clone().finalize().to_be_bytes()))
            }
        }
    }

    /// Compare the accumulated state against server metadata for `path`
    pub fn validate(&self, meta: &ObjectMetadata, path: &str) -> Result<(), StorageError> {
        match self {
            ConsistencyChecker::None => Ok(()),
            ConsistencyChecker::Size { bytes } => match meta.size {
                Some(size) if size == *bytes => Ok(()),
                Some(size) => Err(StorageError::ChecksumMismatch(format!(
                    "{}: transferred {} bytes, server reports {}",
                    path, bytes, size
                ))),
                None => Err(StorageError::ChecksumUnsupported(format!(
                    "{}: server did not report a size",
                    path
                ))),
            },
            ConsistencyChecker::Md5(_) => {
                let Some(remote) = meta.md5_hash.as_deref() else {
                    // Composite objects carry no MD5
                    return Err(StorageError::ChecksumUnsupported(format!(
                        "{}: no md5 reported, use crc32c for composite objects",
                        path
                    )));
                };
                self.compare(remote, path)
            }
            ConsistencyChecker::Crc32c(_) => {
                let Some(remote) = meta.crc32c.as_deref() else {
                    return Err(StorageError::ChecksumUnsupported(format!(
                        "{}: no crc32c reported",
                        path
                    )));
                };
                self.compare(remote, path)
            }
        }
    }

    fn compare(&self, remote: &str, path: &str) -> Result<(), StorageError> {
        let local = self.digest().unwrap_or_default();
        if local.trim_end_matches('=') == remote.trim_end_matches('=') {
            Ok(())
        } else {
            Err(StorageError::ChecksumMismatch(format!(
                "{}: local {} {} != remote {}",
                path,
                self.kind(),
                local,
                remote
            )))
        }
    }
}

/// Base64 MD5 of a complete buffer
pub fn md5_base64(data: &[u8]) -> String {
    BASE64.encode(md5::compute(data).0)
}

/// Base64 big-endian CRC32C of a complete buffer
pub fn crc32c_base64(data: &[u8]) -> String {
    BASE64.encode(CASTAGNOLI.checksum(data).to_be_bytes())
}
