//! Object transfers and mutations

use super::{FindOptions, StorageClient};
use crate::checker::{self, ConsistencyChecker, ObjectMetadata};
use crate::error::StorageError;
use crate::metrics;
use crate::path::{self, DirEntry, ObjectPath, ObjectResource};
use crate::read::{HttpRangeFetcher, ObjectReader};
use crate::transport::{header_value, HttpRequest, HttpResponse};
use crate::upload::{ObjectWriter, UploadResult, WriteOptions};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::RANGE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Writable attributes for [`StorageClient::setxattrs`]
#[derive(Debug, Clone, Default)]
pub struct XattrUpdate {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// `Some` sets a custom metadata key, `None` deletes it
    pub metadata: HashMap<String, Option<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchBody<'a> {
    metadata: &'a HashMap<String, Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_encoding: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct PatchedMetadata {
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    done: bool,
    #[serde(default)]
    rewrite_token: Option<String>,
    #[serde(default)]
    resource: Option<ObjectResource>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComposeRequest<'a> {
    kind: &'static str,
    source_objects: Vec<SourceObject<'a>>,
    destination: ComposeDestination<'a>,
}

#[derive(Debug, Serialize)]
struct SourceObject<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ComposeDestination<'a> {
    name: &'a str,
    bucket: &'a str,
}

#[derive(Debug, Serialize)]
struct NamedResource<'a> {
    name: &'a str,
}

/// Long-running operation returned by folder renames
#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Parse a path that must address an object, not a bucket
fn object_path(path: &str) -> Result<ObjectPath, StorageError> {
    let target = path::split_path(path)?;
    if target.key().is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "{} is a bucket, not an object",
            path
        )));
    }
    Ok(target)
}

fn with_generation(request: HttpRequest, target: &ObjectPath, name: &str) -> HttpRequest {
    match &target.generation {
        Some(generation) => request.query(name, generation.clone()),
        None => request,
    }
}

/// Every regular file below a local directory, sorted
async fn local_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `/`-joined form of a path relative to a local root
fn remote_suffix(root: &Path, file: &Path) -> String {
    file.strip_prefix(root)
        .unwrap_or(file)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn is_local_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Check a whole-object body against the md5 in `X-Goog-Hash`, if any
fn verify_md5(response: &HttpResponse, path: &str) -> Result<(), StorageError> {
    let meta = ObjectMetadata::from_headers(&response.headers);
    if let Some(expected) = meta.md5_hash {
        let actual = checker::md5_base64(&response.body);
        if actual != expected {
            return Err(StorageError::ChecksumMismatch(format!(
                "{}: md5 {} does not match server {}",
                path, actual, expected
            )));
        }
    }
    Ok(())
}

impl StorageClient {
    // ========================================================================
    // Reads
    // ========================================================================

    /// Object bytes in `[start, end)`; both bounds default to the whole object.
    ///
    /// A range past the end yields empty bytes. Full-object reads are checked
    /// against the server md5 within the retried attempt.
    #[tracing::instrument(name = "client.cat_file", skip(self), fields(path = %path), err)]
    pub async fn cat_file(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Bytes, StorageError> {
        let target = object_path(path)?;
        let norm = target.object.path();

        let mut request = HttpRequest::get(self.urls.object(target.bucket(), target.key()))
            .query("alt", "media");
        request = with_generation(request, &target, "generation");

        let ranged = start.is_some() || end.is_some();
        if ranged {
            let from = start.unwrap_or(0);
            let range = match end {
                Some(end) if end <= from => return Ok(Bytes::new()),
                Some(end) => format!("bytes={}-{}", from, end - 1),
                None => format!("bytes={}-", from),
            };
            request = request.header(RANGE, header_value(&range)?);
        }

        let result = self
            .executor
            .call_with(request, &norm, |response| {
                if !ranged {
                    verify_md5(&response, &norm)?;
                }
                Ok(response.body)
            })
            .await;

        match result {
            Ok(body) => {
                metrics::record_download_bytes(body.len() as u64);
                Ok(body)
            }
            Err(StorageError::Http { code: 416, .. }) => Ok(Bytes::new()),
            Err(e) => Err(e),
        }
    }

    /// First `size` bytes of an object
    pub async fn head(&self, path: &str, size: u64) -> Result<Bytes, StorageError> {
        self.cat_file(path, Some(0), Some(size)).await
    }

    /// Last `size` bytes of an object
    pub async fn tail(&self, path: &str, size: u64) -> Result<Bytes, StorageError> {
        let info = self.info(path).await?;
        if size >= info.size {
            return self.cat_file(path, None, None).await;
        }
        self.cat_file(path, Some(info.size - size), None).await
    }

    /// Direct media link for an object
    pub fn url(&self, path: &str) -> Result<String, StorageError> {
        let target = object_path(path)?;
        Ok(self.urls.download(target.bucket(), target.key()))
    }

    /// Stream an object into a local file, returning the bytes written.
    ///
    /// The configured consistency check runs over the streamed bytes; on a
    /// mismatch the local file is removed.
    #[tracing::instrument(
        name = "client.get_file",
        skip(self, lpath),
        fields(path = %rpath, local = %lpath.as_ref().display()),
        err
    )]
    pub async fn get_file(
        &self,
        rpath: &str,
        lpath: impl AsRef<Path>,
    ) -> Result<u64, StorageError> {
        let lpath = lpath.as_ref();
        let target = object_path(rpath)?;
        let norm = target.object.path();

        let request = HttpRequest::get(self.urls.object(target.bucket(), target.key()))
            .query("alt", "media");
        let request = with_generation(request, &target, "generation");

        let response = self.executor.stream(request, &norm).await?;
        let meta = ObjectMetadata::from_headers(&response.headers);
        let mut checker = ConsistencyChecker::new(self.consistency);

        let mut file = tokio::fs::File::create(lpath).await?;
        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            checker.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        metrics::record_download_bytes(written);

        if let Err(e) = checker.validate(&meta, &norm) {
            if let Err(rm) = tokio::fs::remove_file(lpath).await {
                tracing::warn!(local = %lpath.display(), error = %rm, "Could not remove failed download");
            }
            return Err(e);
        }

        tracing::debug!(path = %norm, bytes = written, "Download complete");
        Ok(written)
    }

    /// Download `rpath` to `lpath`, returning the bytes written.
    ///
    /// Without `recursive` this is [`StorageClient::get_file`]. With it,
    /// every file that [`StorageClient::walk`] finds below `rpath` lands at
    /// the same relative position under `lpath`, or under
    /// `lpath/<basename of rpath>` when `lpath` is an existing directory.
    /// Local parent directories are created as needed.
    #[tracing::instrument(
        name = "client.get",
        skip(self, lpath),
        fields(path = %rpath, local = %lpath.as_ref().display(), recursive = recursive),
        err
    )]
    pub async fn get(
        &self,
        rpath: &str,
        lpath: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<u64, StorageError> {
        let lpath = lpath.as_ref();
        if !recursive {
            return self.get_file(rpath, lpath).await;
        }

        let root = path::norm_path(rpath);
        let files = self.walk(&root).await?;
        if files.is_empty() {
            return Err(StorageError::NotFound(root));
        }
        let target = if is_local_dir(lpath).await {
            lpath.join(path::basename(&root))
        } else {
            lpath.to_path_buf()
        };

        let transfers: Vec<(String, PathBuf)> = files
            .into_iter()
            .map(|entry| {
                let relative = entry
                    .name
                    .get(root.len()..)
                    .unwrap_or_default()
                    .trim_start_matches('/');
                let local = if relative.is_empty() {
                    target.clone()
                } else {
                    target.join(relative)
                };
                (entry.name, local)
            })
            .collect();

        let concurrency = self.config.batch.max_concurrency;
        let written: Vec<u64> = stream::iter(transfers)
            .map(|(remote, local)| async move {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.get_file(&remote, &local).await
            })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        tracing::info!(path = %root, files = written.len(), "Recursive download complete");
        Ok(written.iter().sum())
    }

    /// Read a block of `path`; see [`ObjectReader::read_block`]
    #[tracing::instrument(
        name = "client.read_block",
        skip(self, delimiter),
        fields(path = %path, offset = offset),
        err
    )]
    pub async fn read_block(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
        delimiter: Option<&[u8]>,
    ) -> Result<Bytes, StorageError> {
        let mut reader = self.open_read(path).await?;
        reader.read_block(offset, length, delimiter).await
    }

    /// Open a seekable read handle
    pub async fn open_read(&self, path: &str) -> Result<ObjectReader, StorageError> {
        let target = object_path(path)?;
        let info = self.info(path).await?;
        if info.is_dir() {
            return Err(StorageError::InvalidArgument(format!(
                "{} is a directory",
                info.name
            )));
        }
        let fetcher = HttpRangeFetcher::new(self.executor.clone(), &self.urls, &target);
        Ok(ObjectReader::new(
            fetcher,
            target.object.path(),
            info.size,
            self.config.transfer.block_size as u64,
        ))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Open a buffered write handle. Nothing is visible until it is closed.
    pub fn open_write(
        &self,
        path: &str,
        options: WriteOptions,
    ) -> Result<ObjectWriter, StorageError> {
        let target = object_path(path)?;
        Ok(ObjectWriter::new(
            self.executor.clone(),
            self.urls.clone(),
            self.cache.clone(),
            target.object,
            options,
            self.config.transfer.effective_chunk_size(),
            self.config.transfer.max_request_size,
            self.consistency,
        ))
    }

    /// Write `data` as the whole content of `path`
    #[tracing::instrument(
        name = "client.pipe_file",
        skip(self, data),
        fields(path = %path, bytes = data.len()),
        err
    )]
    pub async fn pipe_file(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResult, StorageError> {
        let options = WriteOptions {
            content_type: content_type.map(str::to_string),
            ..Default::default()
        };
        let mut writer = self.open_write(path, options)?;
        if let Err(e) = writer.write(&data).await {
            writer.discard().await;
            return Err(e);
        }
        writer.close().await
    }

    /// Upload a local file
    #[tracing::instrument(
        name = "client.put_file",
        skip(self, lpath),
        fields(path = %rpath, local = %lpath.as_ref().display()),
        err
    )]
    pub async fn put_file(
        &self,
        lpath: impl AsRef<Path>,
        rpath: &str,
    ) -> Result<UploadResult, StorageError> {
        let mut file = tokio::fs::File::open(lpath.as_ref()).await?;
        let mut writer = self.open_write(rpath, WriteOptions::default())?;
        let mut buf = vec![0u8; writer.chunk_size()];

        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.discard().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = writer.write(&buf[..n]).await {
                writer.discard().await;
                return Err(e);
            }
        }
        writer.close().await
    }

    /// Upload `lpath` to `rpath`.
    ///
    /// Without `recursive`, or for a plain file, this is
    /// [`StorageClient::put_file`]. A directory uploaded recursively keeps
    /// its layout below `rpath`, or below `rpath/<basename of lpath>` when
    /// `rpath` already exists.
    #[tracing::instrument(
        name = "client.put",
        skip(self, lpath),
        fields(path = %rpath, local = %lpath.as_ref().display(), recursive = recursive),
        err
    )]
    pub async fn put(
        &self,
        lpath: impl AsRef<Path>,
        rpath: &str,
        recursive: bool,
    ) -> Result<Vec<UploadResult>, StorageError> {
        let lpath = lpath.as_ref();
        if !recursive || !is_local_dir(lpath).await {
            return Ok(vec![self.put_file(lpath, rpath).await?]);
        }

        let root = path::norm_path(rpath);
        let dest = if self.exists(&root).await? {
            let name = lpath
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            path::join(&root, &name)
        } else {
            root
        };

        let transfers: Vec<(PathBuf, String)> = local_files(lpath)
            .await?
            .into_iter()
            .map(|file| {
                let remote = path::join(&dest, &remote_suffix(lpath, &file));
                (file, remote)
            })
            .collect();

        let concurrency = self.config.batch.max_concurrency;
        let results: Vec<UploadResult> = stream::iter(transfers)
            .map(|(local, remote)| async move { self.put_file(&local, &remote).await })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        tracing::info!(path = %dest, files = results.len(), "Recursive upload complete");
        Ok(results)
    }

    /// Create an empty object
    pub async fn touch(&self, path: &str) -> Result<UploadResult, StorageError> {
        self.pipe_file(path, Bytes::new(), None).await
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Delete one object
    #[tracing::instrument(name = "client.rm_file", skip(self), fields(path = %path), err)]
    pub async fn rm_file(&self, path: &str) -> Result<(), StorageError> {
        let target = object_path(path)?;
        let norm = target.object.path();
        let request = HttpRequest::new(
            Method::DELETE,
            self.urls.object(target.bucket(), target.key()),
        );
        let request = with_generation(request, &target, "generation");

        self.executor.call(request, &norm).await?;
        self.cache.invalidate(Some(&norm));
        Ok(())
    }

    /// Server-side copy, following rewrite tokens until the copy is done
    #[tracing::instrument(name = "client.cp_file", skip(self), fields(src = %src, dst = %dst), err)]
    pub async fn cp_file(&self, src: &str, dst: &str) -> Result<ObjectResource, StorageError> {
        let source = object_path(src)?;
        let dest = object_path(dst)?;
        let src_norm = source.object.path();
        let url = self
            .urls
            .rewrite(source.bucket(), source.key(), dest.bucket(), dest.key());

        let mut token: Option<String> = None;
        let resource = loop {
            let mut request = HttpRequest::new(Method::POST, url.clone()).body(Bytes::new());
            request = with_generation(request, &source, "sourceGeneration");
            if let Some(token) = token.take() {
                request = request.query("rewriteToken", token);
            }

            let response: RewriteResponse = self.executor.call(request, &src_norm).await?.json()?;
            if response.done {
                break response.resource;
            }
            token = Some(response.rewrite_token.ok_or_else(|| {
                StorageError::Protocol(format!("rewrite of {} unfinished without a token", src_norm))
            })?);
            tracing::debug!(src = %src_norm, "Rewrite continuing");
        };

        self.cache.invalidate(Some(&dest.object.path()));
        resource.ok_or_else(|| {
            StorageError::Protocol(format!("rewrite of {} returned no resource", src_norm))
        })
    }

    /// Move a file or directory.
    ///
    /// On hierarchical buckets a directory is renamed as a folder in one call
    /// and the parent listing is updated in place. Everything else is copied
    /// and then deleted.
    #[tracing::instrument(name = "client.mv", skip(self), fields(src = %src, dst = %dst), err)]
    pub async fn mv(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let source = path::split_path(src)?;
        let dest = path::split_path(dst)?;
        if source.object == dest.object {
            return Ok(());
        }
        if source.key().is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "cannot move bucket {}",
                source.bucket()
            )));
        }

        let info = self.info(src).await?;

        if info.is_dir()
            && !dest.key().is_empty()
            && source.bucket() == dest.bucket()
            && self.bucket_layout(source.bucket()).await.is_hierarchical()
        {
            return self.rename_folder(&source, &dest).await;
        }

        if info.is_file() {
            self.cp_file(src, dst).await?;
            return self.rm_file(src).await;
        }

        // Directory on a flat bucket: copy every file, then remove the tree
        let src_root = source.object.path();
        let dst_root = dest.object.path();
        let files = self.find(&src_root, FindOptions::default()).await?;
        let concurrency = self.config.batch.max_concurrency;
        stream::iter(files.into_iter().filter(DirEntry::is_file))
            .map(|entry| {
                let target = format!("{}{}", dst_root, &entry.name[src_root.len()..]);
                async move { self.cp_file(&entry.name, &target).await }
            })
            .buffer_unordered(concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        self.rm(&[src_root], true).await
    }

    async fn rename_folder(
        &self,
        source: &ObjectPath,
        dest: &ObjectPath,
    ) -> Result<(), StorageError> {
        let bucket = source.bucket();
        let src_norm = source.object.path();
        let dst_norm = dest.object.path();
        let url = self.urls.rename_folder(
            bucket,
            &format!("{}/", source.key()),
            &format!("{}/", dest.key()),
        );

        let request = HttpRequest::new(Method::POST, url).body(Bytes::new());
        let operation: Operation = self.executor.call(request, &src_norm).await?.json()?;
        self.wait_operation(bucket, operation, &src_norm).await?;

        tracing::info!(src = %src_norm, dst = %dst_norm, "Folder renamed");

        let new_entry = DirEntry::directory(bucket, dest.key());
        let (src_parent, dst_parent) = (path::parent(&src_norm), path::parent(&dst_norm));
        if src_parent == dst_parent {
            self.cache.rename_entry(src_parent, &src_norm, new_entry);
        } else {
            self.cache.remove_entry(src_parent, &src_norm);
            self.cache.mark_seen(dst_parent, new_entry);
        }
        self.cache.invalidate_tree(&src_norm);
        self.cache.invalidate_tree(&dst_norm);
        Ok(())
    }

    /// Poll a long-running operation until it reports done
    async fn wait_operation(
        &self,
        bucket: &str,
        mut operation: Operation,
        path: &str,
    ) -> Result<(), StorageError> {
        let policy = self.executor.retry_policy();
        let started = Instant::now();
        let mut attempt = 0;
        while !operation.done {
            attempt += 1;
            if attempt > policy.max_attempts() {
                return Err(StorageError::Timeout(started.elapsed()));
            }
            tokio::time::sleep(policy.backoff_delay(attempt)).await;
            let id = operation
                .name
                .rsplit_once("operations/")
                .map(|(_, id)| id.to_string())
                .ok_or_else(|| {
                    StorageError::Protocol(format!("operation without a name for {}", path))
                })?;
            let request = HttpRequest::get(self.urls.operation(bucket, &id));
            operation = self.executor.call(request, path).await?.json()?;
        }
        match operation.error {
            Some(error) => Err(StorageError::Http {
                code: error.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16,
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Concatenate objects of one bucket into `path`
    #[tracing::instrument(name = "client.merge", skip(self, sources), fields(path = %path), err)]
    pub async fn merge<S: AsRef<str>>(
        &self,
        path: &str,
        sources: &[S],
    ) -> Result<ObjectResource, StorageError> {
        let dest = object_path(path)?;
        let parsed = sources
            .iter()
            .map(|s| object_path(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(other) = parsed.iter().find(|p| p.bucket() != dest.bucket()) {
            return Err(StorageError::InvalidArgument(format!(
                "cannot compose {} into bucket {}",
                other.object,
                dest.bucket()
            )));
        }

        let body = ComposeRequest {
            kind: "storage#composeRequest",
            source_objects: parsed.iter().map(|p| SourceObject { name: p.key() }).collect(),
            destination: ComposeDestination {
                name: dest.key(),
                bucket: dest.bucket(),
            },
        };
        let request = HttpRequest::new(Method::POST, self.urls.compose(dest.bucket(), dest.key()))
            .json_body(&body)?;

        let norm = dest.object.path();
        let object = self.executor.call(request, &norm).await?.json()?;
        self.cache.invalidate(Some(&norm));
        Ok(object)
    }

    /// Update content type, content encoding and custom metadata.
    /// Returns the custom metadata after the update.
    #[tracing::instrument(name = "client.setxattrs", skip(self, update), fields(path = %path), err)]
    pub async fn setxattrs(
        &self,
        path: &str,
        update: XattrUpdate,
    ) -> Result<HashMap<String, String>, StorageError> {
        let target = object_path(path)?;
        let norm = target.object.path();
        let body = PatchBody {
            metadata: &update.metadata,
            content_type: update.content_type.as_deref(),
            content_encoding: update.content_encoding.as_deref(),
        };
        let request = HttpRequest::new(
            Method::PATCH,
            self.urls.object(target.bucket(), target.key()),
        )
        .query("fields", "metadata")
        .json_body(&body)?;

        let patched: PatchedMetadata = self.executor.call(request, &norm).await?.json()?;
        self.cache.invalidate(Some(&norm));
        Ok(patched.metadata.unwrap_or_default())
    }

    /// One custom metadata value
    pub async fn getxattr(&self, path: &str, key: &str) -> Result<Option<String>, StorageError> {
        let info = self.info(path).await?;
        Ok(info.metadata.get(key).cloned())
    }

    /// Create a bucket, or a directory inside one.
    ///
    /// Hierarchical buckets get a real folder. On flat buckets directories
    /// exist only through the objects below them, so only the bucket is
    /// checked (and created when `create_parents` is set).
    #[tracing::instrument(name = "client.mkdir", skip(self), fields(path = %path), err)]
    pub async fn mkdir(&self, path: &str, create_parents: bool) -> Result<(), StorageError> {
        let target = path::split_path(path)?;
        let bucket = target.bucket();
        if target.key().is_empty() {
            return self.create_bucket(bucket).await;
        }

        if self.bucket_layout(bucket).await.is_hierarchical() {
            let name = format!("{}/", target.key());
            let request = HttpRequest::new(Method::POST, self.urls.folders(bucket))
                .query("recursive", create_parents.to_string())
                .json_body(&NamedResource { name: &name })?;
            let norm = target.object.path();
            self.executor.call(request, &norm).await?;
            self.cache.invalidate(Some(&norm));
            return Ok(());
        }

        if !self.exists(bucket).await? {
            if !create_parents {
                return Err(StorageError::NotFound(bucket.to_string()));
            }
            self.create_bucket(bucket).await?;
        }
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let project = self.config.storage.project.as_deref().ok_or_else(|| {
            StorageError::InvalidArgument("creating a bucket requires storage.project".into())
        })?;
        let request = HttpRequest::new(Method::POST, self.urls.buckets())
            .query("project", project)
            .json_body(&NamedResource { name: bucket })?;
        self.executor.call(request, bucket).await?;
        self.cache.invalidate(Some(""));
        self.cache.invalidate_tree(bucket);
        tracing::info!(bucket = %bucket, "Bucket created");
        Ok(())
    }

    /// Remove an empty bucket or directory
    #[tracing::instrument(name = "client.rmdir", skip(self), fields(path = %path), err)]
    pub async fn rmdir(&self, path: &str) -> Result<(), StorageError> {
        let target = path::split_path(path)?;
        let bucket = target.bucket();
        let norm = target.object.path();

        if target.key().is_empty() {
            let request = HttpRequest::new(Method::DELETE, self.urls.bucket(bucket));
            self.executor.call(request, bucket).await?;
            self.cache.invalidate(Some(""));
            self.cache.invalidate_tree(bucket);
            self.layouts.remove(bucket);
            tracing::info!(bucket = %bucket, "Bucket deleted");
            return Ok(());
        }

        let folder = format!("{}/", target.key());
        if self.bucket_layout(bucket).await.is_hierarchical() {
            let request = HttpRequest::new(Method::DELETE, self.urls.folder(bucket, &folder));
            self.executor.call(request, &norm).await?;
        } else {
            match self.ls(&norm, Default::default()).await {
                Ok(entries) if !entries.is_empty() => {
                    return Err(StorageError::InvalidArgument(format!(
                        "directory {} is not empty",
                        norm
                    )))
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            // Only a placeholder object can back an empty directory
            let request = HttpRequest::new(Method::DELETE, self.urls.object(bucket, &folder));
            match self.executor.call(request, &norm).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.cache.invalidate(Some(&norm));
        self.cache.invalidate_tree(&norm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_object_path_rejects_bucket() {
        assert!(matches!(
            object_path("gs://bucket"),
            Err(StorageError::InvalidArgument(_))
        ));
        assert_eq!(object_path("bucket/a/b").unwrap().key(), "a/b");
    }

    #[test]
    fn test_verify_md5() {
        let mut response = HttpResponse::new(200, "hello");
        response.headers.insert(
            "x-goog-hash",
            HeaderValue::from_str(&format!("crc32c=AAAAAA==,md5={}", checker::md5_base64(b"hello")))
                .unwrap(),
        );
        assert!(verify_md5(&response, "b/k").is_ok());

        response.body = Bytes::from_static(b"hellO");
        assert!(matches!(
            verify_md5(&response, "b/k"),
            Err(StorageError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_verify_md5_without_header() {
        assert!(verify_md5(&HttpResponse::new(200, "x"), "b/k").is_ok());
    }

    #[test]
    fn test_patch_body_keeps_deletions() {
        let mut metadata = HashMap::new();
        metadata.insert("gone".to_string(), None);
        metadata.insert("kept".to_string(), Some("v".to_string()));
        let body = PatchBody {
            metadata: &metadata,
            content_type: Some("text/plain"),
            content_encoding: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["metadata"]["gone"], serde_json::Value::Null);
        assert_eq!(json["metadata"]["kept"], "v");
        assert_eq!(json["contentType"], "text/plain");
        assert!(json.get("contentEncoding").is_none());
    }
}
