//! Listing and metadata operations

use super::StorageClient;
use crate::error::StorageError;
use crate::path::{self, build_listing, DirEntry, ListPage, ObjectResource};
use crate::transport::HttpRequest;
use regex_lite::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

const PAGE_SIZE: usize = 1000;

/// Options for [`StorageClient::ls`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only list names starting with this, relative to the listed directory.
    /// Filtered listings bypass the listing cache entirely.
    pub prefix: Option<String>,
    /// Skip the cached listing and fetch afresh
    pub refresh: bool,
}

/// Options for [`StorageClient::find`]
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Only return names starting with this, relative to the searched path
    pub prefix: Option<String>,
    /// Also return directory entries
    pub with_dirs: bool,
    /// Maximum depth below the searched path, 1 being its direct children
    pub max_depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketPage {
    kind: String,
    #[serde(default)]
    items: Vec<BucketResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BucketResource {
    name: String,
}

/// Listing prefix addressing everything below `key`
fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

fn active_filter(prefix: &Option<String>) -> Option<&str> {
    prefix.as_deref().filter(|p| !p.is_empty())
}

/// Levels between `root` and `name`
fn depth_below(root: &str, name: &str) -> usize {
    name[root.len().min(name.len())..]
        .trim_start_matches('/')
        .split('/')
        .count()
}

/// Translate a glob into an anchored regex. `**` crosses directory levels,
/// `*` and `?` do not.
fn glob_regex(pattern: &str) -> Result<Regex, StorageError> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".+");
            }
            '*' => out.push_str("[^/]+"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex_lite::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| StorageError::InvalidArgument(format!("bad glob: {}", e)))
}

impl StorageClient {
    /// Page through an object listing
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimited: bool,
        max_results: Option<usize>,
        path: &str,
    ) -> Result<(Vec<ObjectResource>, Vec<String>), StorageError> {
        let mut items = Vec::new();
        let mut prefixes = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = HttpRequest::get(self.urls.objects(bucket))
                .query("maxResults", max_results.unwrap_or(PAGE_SIZE).to_string());
            if !prefix.is_empty() {
                request = request.query("prefix", prefix);
            }
            if delimited {
                request = request.query("delimiter", "/");
            }
            if let Some(token) = page_token.take() {
                request = request.query("pageToken", token);
            }

            let page: ListPage = self.executor.call(request, path).await?.json()?;
            if page.kind != "storage#objects" {
                return Err(StorageError::Protocol(format!(
                    "unexpected listing kind '{}' for {}",
                    page.kind, path
                )));
            }
            items.extend(page.items);
            prefixes.extend(page.prefixes);

            match page.next_page_token {
                Some(token) if max_results.is_none() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(
            path = %path,
            objects = items.len(),
            prefixes = prefixes.len(),
            "Listed objects"
        );
        Ok((items, prefixes))
    }

    pub(super) async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<&str>,
        path: &str,
    ) -> Result<ObjectResource, StorageError> {
        let mut request = HttpRequest::get(self.urls.object(bucket, key));
        if let Some(generation) = generation {
            request = request.query("generation", generation);
        }
        self.executor.call(request, path).await?.json()
    }

    /// List one directory level.
    ///
    /// The root path lists buckets. A path naming a single object lists just
    /// that object. Complete listings are cached; listings restricted by
    /// `options.prefix` never touch the cache.
    #[tracing::instrument(name = "client.ls", skip(self, options), fields(path = %path), err)]
    pub async fn ls(&self, path: &str, options: ListOptions) -> Result<Vec<DirEntry>, StorageError> {
        let norm = path::norm_path(path);
        if norm.is_empty() {
            return self.buckets().await;
        }
        let target = path::split_path(&norm)?;
        let (bucket, key) = (target.bucket(), target.key());
        let base = dir_prefix(key);

        if let Some(filter) = active_filter(&options.prefix) {
            let prefix = format!("{}{}", base, filter);
            let (items, prefixes) = self.list_objects(bucket, &prefix, true, None, &norm).await?;
            let items = items.into_iter().filter(|o| o.name != base).collect();
            return Ok(build_listing(items, prefixes, bucket));
        }

        if !options.refresh {
            if let Some(cached) = self.cache.get(&norm) {
                return Ok(cached.as_ref().clone());
            }
        }

        let since = self.cache.epoch();
        let (items, prefixes) = self.list_objects(bucket, &base, true, None, &norm).await?;
        let placeholder = !base.is_empty() && items.iter().any(|o| o.name == base);
        let items: Vec<_> = items.into_iter().filter(|o| o.name != base).collect();
        let entries = build_listing(items, prefixes, bucket);

        if entries.is_empty() && !key.is_empty() && !placeholder {
            // Nothing below the key: it may still name an object
            let object = self.get_object(bucket, key, None, &norm).await?;
            return Ok(vec![DirEntry::file(bucket, object)]);
        }

        self.cache.put_if_fresh(&norm, entries.clone(), since);
        Ok(entries)
    }

    /// Buckets visible to the configured project
    #[tracing::instrument(name = "client.buckets", skip(self), err)]
    pub async fn buckets(&self) -> Result<Vec<DirEntry>, StorageError> {
        if let Some(cached) = self.cache.get("") {
            return Ok(cached.as_ref().clone());
        }

        let since = self.cache.epoch();
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = HttpRequest::get(self.urls.buckets());
            if let Some(project) = &self.config.storage.project {
                request = request.query("project", project.clone());
            }
            if let Some(token) = page_token.take() {
                request = request.query("pageToken", token);
            }

            let page: BucketPage = self.executor.call(request, "").await?.json()?;
            if page.kind != "storage#buckets" {
                return Err(StorageError::Protocol(format!(
                    "unexpected bucket listing kind '{}'",
                    page.kind
                )));
            }
            names.extend(page.items.into_iter().map(|b| b.name));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let entries: Vec<DirEntry> = names
            .iter()
            .map(|name| DirEntry::directory(name, ""))
            .collect();
        self.cache.put_if_fresh("", entries.clone(), since);
        Ok(entries)
    }

    async fn bucket_info(&self, bucket: &str) -> Result<DirEntry, StorageError> {
        let request = HttpRequest::get(self.urls.bucket(bucket));
        match self.executor.call(request, bucket).await {
            Ok(_) => {}
            // Viewable but not owned by the project: listing still works
            Err(StorageError::PermissionDenied { .. }) => {
                self.list_objects(bucket, "", true, Some(1), bucket).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(DirEntry::directory(bucket, ""))
    }

    /// Answer from cached listings, if they are conclusive
    fn cached_info(&self, norm: &str) -> Option<Result<DirEntry, StorageError>> {
        if let Some(parent) = self.cache.get(path::parent(norm)) {
            return Some(
                parent
                    .iter()
                    .find(|e| e.name == norm)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound(norm.to_string())),
            );
        }
        None
    }

    /// Metadata for a file, directory or bucket.
    ///
    /// A key with no object but with objects below it is a directory.
    #[tracing::instrument(name = "client.info", skip(self), fields(path = %path), err)]
    pub async fn info(&self, path: &str) -> Result<DirEntry, StorageError> {
        let target = path::split_path(path)?;
        let norm = target.object.path();
        let (bucket, key) = (target.bucket(), target.key());

        if key.is_empty() {
            return self.bucket_info(bucket).await;
        }

        if target.generation.is_none() {
            if let Some(cached) = self.cached_info(&norm) {
                return cached;
            }
        }

        match self
            .get_object(bucket, key, target.generation.as_deref(), &norm)
            .await
        {
            Ok(object) => Ok(DirEntry::file(bucket, object)),
            Err(e) if e.is_not_found() => {
                let (items, prefixes) = self
                    .list_objects(bucket, &dir_prefix(key), true, Some(1), &norm)
                    .await?;
                if items.is_empty() && prefixes.is_empty() {
                    Err(StorageError::NotFound(norm))
                } else {
                    Ok(DirEntry::directory(bucket, key))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Whether anything lives at `path`
    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self.info(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool, StorageError> {
        match self.info(path).await {
            Ok(entry) => Ok(entry.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_file(&self, path: &str) -> Result<bool, StorageError> {
        match self.info(path).await {
            Ok(entry) => Ok(entry.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every file below `path`, found with one recursive listing.
    ///
    /// Without a prefix filter the listing is complete, so it is split per
    /// directory level and cached, making later `ls` calls below `path` free.
    #[tracing::instrument(name = "client.find", skip(self, options), fields(path = %path), err)]
    pub async fn find(
        &self,
        path: &str,
        options: FindOptions,
    ) -> Result<Vec<DirEntry>, StorageError> {
        let target = path::split_path(path)?;
        let root = target.object.path();
        let (bucket, key) = (target.bucket(), target.key());
        let filter = active_filter(&options.prefix);
        let base = dir_prefix(key);
        let list_prefix = format!("{}{}", base, filter.unwrap_or(""));

        let since = self.cache.epoch();
        let (items, _) = self
            .list_objects(bucket, &list_prefix, false, None, &root)
            .await?;

        let mut files = Vec::new();
        let mut dirs: BTreeMap<String, DirEntry> = BTreeMap::new();
        for object in items {
            if object.name == base {
                continue;
            }
            if object.name.ends_with('/') {
                let dir = DirEntry::directory(bucket, &object.name);
                dirs.insert(dir.name.clone(), dir);
            } else {
                files.push(DirEntry::file(bucket, object));
            }
        }

        // Directories implied by deeper names
        let implied: Vec<String> = files
            .iter()
            .map(|e| e.name.as_str())
            .chain(dirs.keys().map(String::as_str))
            .flat_map(path::ancestors)
            .filter(|a| a.len() > root.len())
            .map(str::to_string)
            .collect();
        for name in implied {
            dirs.entry(name).or_insert_with_key(|name| {
                DirEntry::directory(bucket, &name[bucket.len() + 1..])
            });
        }

        if files.is_empty() && dirs.is_empty() {
            if filter.is_none() && !key.is_empty() {
                // A path naming one object finds just that object
                match self.info(&root).await {
                    Ok(entry) if entry.is_file() => return Ok(vec![entry]),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(Vec::new());
        }

        if filter.is_none() {
            self.cache_tree(bucket, key, &root, &files, &dirs, since);
        }

        let within_depth = |entry: &DirEntry| match options.max_depth {
            Some(max) => depth_below(&root, &entry.name) <= max,
            None => true,
        };
        let mut out: Vec<DirEntry> = files.into_iter().filter(within_depth).collect();
        if options.with_dirs {
            out.extend(dirs.into_values().filter(within_depth));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Cache every level of a complete recursive listing rooted at `root`
    fn cache_tree(
        &self,
        bucket: &str,
        key: &str,
        root: &str,
        files: &[DirEntry],
        dirs: &BTreeMap<String, DirEntry>,
        since: u64,
    ) {
        let mut listings: BTreeMap<String, Vec<DirEntry>> = BTreeMap::new();
        listings.insert(root.to_string(), Vec::new());
        for name in dirs.keys() {
            listings.entry(name.clone()).or_default();
        }
        for entry in dirs.values().chain(files.iter()) {
            listings
                .entry(path::parent(&entry.name).to_string())
                .or_default()
                .push(entry.clone());
        }

        tracing::debug!(root = %root, levels = listings.len(), "Caching recursive listing");
        self.cache.put_many_if_fresh(listings, since);

        if !key.is_empty() {
            self.cache
                .mark_seen(path::parent(root), DirEntry::directory(bucket, key));
        }
    }

    /// Every file at or below `path`, one cached `ls` per directory level.
    ///
    /// Unlike [`StorageClient::find`] this reuses and fills the listing cache
    /// level by level. A missing path walks to nothing.
    #[tracing::instrument(name = "client.walk", skip(self), fields(path = %path), err)]
    pub async fn walk(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let root = path::norm_path(path);
        if root.is_empty() {
            return Err(StorageError::InvalidArgument(
                "cannot walk the whole store".into(),
            ));
        }

        let mut files = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match self.ls(&dir, ListOptions::default()).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() && dir == root => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            for entry in entries {
                if entry.is_dir() {
                    pending.push(entry.name);
                } else {
                    files.push(entry);
                }
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Total size of the files below `path`
    pub async fn du(&self, path: &str) -> Result<u64, StorageError> {
        Ok(self
            .find(path, FindOptions::default())
            .await?
            .iter()
            .map(|e| e.size)
            .sum())
    }

    /// File paths matching a glob. The bucket part may not contain `*`; a
    /// pattern without wildcards matches the children of that path.
    #[tracing::instrument(name = "client.glob", skip(self), fields(pattern = %pattern), err)]
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut pattern = path::strip_protocol(pattern);
        let bucket = pattern.split('/').next().unwrap_or_default();
        if bucket.contains('*') {
            return Err(StorageError::InvalidArgument(format!(
                "bucket cannot contain '*': {}",
                pattern
            )));
        }
        if !pattern.contains(['*', '?']) {
            pattern.push_str("/*");
        }

        let first_wild = pattern.find(['*', '?']).unwrap_or(pattern.len());
        let root = match pattern[..first_wild].rfind('/') {
            Some(idx) => &pattern[..idx],
            None => {
                return Err(StorageError::InvalidArgument(format!(
                    "glob needs a literal bucket: {}",
                    pattern
                )))
            }
        };
        let max_depth = if pattern.contains("**") {
            None
        } else {
            Some(depth_below(root, &pattern))
        };
        let regex = glob_regex(&pattern)?;

        let options = FindOptions {
            max_depth,
            ..Default::default()
        };
        let found = match self.find(root, options).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(found
            .into_iter()
            .map(|e| e.name)
            .filter(|name| regex.is_match(name))
            .collect())
    }
}
