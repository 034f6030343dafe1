//! Directory listing cache
//!
//! Maps a normalized directory path to the complete listing of that level.
//! A partial (prefix-filtered) listing is never stored here.
//!
//! # Concurrency
//!
//! All state sits behind one `parking_lot::RwLock`. No lock is ever held
//! across an `.await`, and every read-modify-write happens under a single
//! write guard, so interleaved tasks on the event loop cannot observe or
//! produce a torn listing.
//!
//! A listing fetched over the network may be overtaken by a mutation that
//! invalidates its path while the request is in flight. Callers take
//! [`DirCache::epoch`] before listing and store through
//! [`DirCache::put_if_fresh`], which refuses the listing when its path was
//! invalidated after that epoch.
//!
//! # Expiry
//!
//! - `ttl = None`: entries live until invalidated
//! - `ttl = Some(0)`: nothing is ever stored
//! - `ttl = Some(d)`: entries older than `d` are dropped when read

use crate::metrics;
use crate::path::{self, DirEntry};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared listing handed out by the cache
pub type Listing = Arc<Vec<DirEntry>>;

/// Invalidation records kept before they are folded into the floor
const MAX_TRACKED_INVALIDATIONS: usize = 4096;

struct CachedListing {
    entries: Listing,
    cached_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, CachedListing>,
    /// Bumped by every invalidation
    epoch: u64,
    /// Listings fetched before this epoch are stale everywhere
    floor: u64,
    /// Epoch of the last invalidation of each path
    invalidated: BTreeMap<String, u64>,
    /// Epoch of the last invalidation of each subtree root
    trees: BTreeMap<String, u64>,
}

impl CacheState {
    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        if self.invalidated.len() + self.trees.len() > MAX_TRACKED_INVALIDATIONS {
            self.invalidated.clear();
            self.trees.clear();
            self.floor = self.epoch;
        }
        self.epoch
    }

    fn record(&mut self, path: &str) {
        let epoch = self.bump();
        self.invalidated.insert(path.to_string(), epoch);
    }

    fn is_stale(&self, path: &str, since: u64) -> bool {
        if self.floor > since {
            return true;
        }
        if self.invalidated.get(path).is_some_and(|e| *e > since) {
            return true;
        }
        self.trees.iter().any(|(root, e)| {
            *e > since
                && (path == root
                    || (path.len() > root.len()
                        && path.starts_with(root.as_str())
                        && path.as_bytes()[root.len()] == b'/'))
        })
    }
}

/// Directory listing cache
pub struct DirCache {
    state: RwLock<CacheState>,
    ttl: Option<Duration>,
}

impl DirCache {
    /// Create a cache with the given expiry policy
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            ttl,
        }
    }

    /// Whether this cache stores anything at all
    pub fn enabled(&self) -> bool {
        self.ttl != Some(Duration::ZERO)
    }

    fn is_fresh(&self, cached: &CachedListing) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => cached.cached_at.elapsed() < ttl,
        }
    }

    /// Current invalidation epoch; take it before fetching a listing
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Complete listing for `path`, if present and not expired
    pub fn get(&self, path: &str) -> Option<Listing> {
        if !self.enabled() {
            return None;
        }

        {
            let state = self.state.read();
            match state.entries.get(path) {
                Some(cached) if self.is_fresh(cached) => {
                    metrics::record_listing_cache(true);
                    return Some(cached.entries.clone());
                }
                Some(_) => {}
                None => {
                    metrics::record_listing_cache(false);
                    return None;
                }
            }
        }

        // Expired: drop it, re-checking freshness under the write guard since
        // another task may have refreshed the entry in between.
        let mut state = self.state.write();
        if let Some(cached) = state.entries.get(path) {
            if self.is_fresh(cached) {
                metrics::record_listing_cache(true);
                return Some(cached.entries.clone());
            }
            tracing::debug!(path = %path, "expired cached listing");
            state.entries.remove(path);
        }
        metrics::record_listing_cache(false);
        None
    }

    /// Store the complete listing of `path`, replacing any previous one
    pub fn put(&self, path: &str, listing: Vec<DirEntry>) {
        if !self.enabled() {
            return;
        }
        self.state.write().entries.insert(
            path.to_string(),
            CachedListing {
                entries: Arc::new(listing),
                cached_at: Instant::now(),
            },
        );
    }

    /// Store a listing fetched after `since` was read from
    /// [`DirCache::epoch`], unless `path` was invalidated in the meantime.
    /// Returns whether the listing was stored.
    pub fn put_if_fresh(&self, path: &str, listing: Vec<DirEntry>, since: u64) -> bool {
        self.put_many_if_fresh([(path.to_string(), listing)], since) == 1
    }

    /// Store several complete listings under one write guard
    pub fn put_many(&self, listings: impl IntoIterator<Item = (String, Vec<DirEntry>)>) {
        if !self.enabled() {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.write();
        for (path, listing) in listings {
            state.entries.insert(
                path,
                CachedListing {
                    entries: Arc::new(listing),
                    cached_at: now,
                },
            );
        }
    }

    /// [`DirCache::put_many`], skipping every path invalidated after `since`.
    /// Returns how many listings were stored.
    pub fn put_many_if_fresh(
        &self,
        listings: impl IntoIterator<Item = (String, Vec<DirEntry>)>,
        since: u64,
    ) -> usize {
        if !self.enabled() {
            return 0;
        }
        let now = Instant::now();
        let mut state = self.state.write();
        let mut stored = 0;
        for (path, listing) in listings {
            if state.is_stale(&path, since) {
                tracing::debug!(path = %path, "discarding listing overtaken by invalidation");
                continue;
            }
            state.entries.insert(
                path,
                CachedListing {
                    entries: Arc::new(listing),
                    cached_at: now,
                },
            );
            stored += 1;
        }
        stored
    }

    /// Record `entry` inside the cached listing of `path`.
    ///
    /// An entry with the same name is replaced; otherwise it is appended. When
    /// `path` is not cached this is a no-op, because a listing holding only the
    /// new entry would not be complete.
    pub fn mark_seen(&self, path: &str, entry: DirEntry) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.write();
        if let Some(cached) = state.entries.get_mut(path) {
            let listing = Arc::make_mut(&mut cached.entries);
            match listing.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => *existing = entry,
                None => listing.push(entry),
            }
        }
    }

    /// Remove the entry called `name` from the cached listing of `path`
    pub fn remove_entry(&self, path: &str, name: &str) {
        let mut state = self.state.write();
        state.record(path);
        if let Some(cached) = state.entries.get_mut(path) {
            Arc::make_mut(&mut cached.entries).retain(|e| e.name != name);
        }
    }

    /// Update a parent listing in place after a rename: the old name goes,
    /// the new entry is appended.
    pub fn rename_entry(&self, path: &str, old_name: &str, new_entry: DirEntry) {
        let mut state = self.state.write();
        state.record(path);
        if let Some(cached) = state.entries.get_mut(path) {
            let listing = Arc::make_mut(&mut cached.entries);
            listing.retain(|e| e.name != old_name && e.name != new_entry.name);
            listing.push(new_entry);
        }
    }

    /// Invalidate after a mutation at `path`.
    ///
    /// `None` clears everything. `Some(path)` removes the listing of `path`
    /// itself and of every ancestor up to its bucket, since sibling existence
    /// at each of those levels may have changed.
    pub fn invalidate(&self, path: Option<&str>) {
        let mut state = self.state.write();
        match path {
            None => {
                tracing::debug!("invalidating entire listing cache");
                state.entries.clear();
                state.invalidated.clear();
                state.trees.clear();
                let epoch = state.bump();
                state.floor = epoch;
            }
            Some(path) => {
                let path = path::norm_path(path);
                state.entries.remove(&path);
                state.record(&path);
                for ancestor in path::ancestors(&path) {
                    state.entries.remove(ancestor);
                    state.record(ancestor);
                }
            }
        }
    }

    /// Remove the listing of `path` and of everything below it
    pub fn invalidate_tree(&self, path: &str) {
        let path = path::norm_path(path);
        let below = format!("{}/", path);
        let mut state = self.state.write();
        state
            .entries
            .retain(|key, _| key != &path && !key.starts_with(&below));
        let epoch = state.bump();
        state.trees.insert(path, epoch);
    }

    /// Whether a listing for `path` is stored (expired or not)
    pub fn contains(&self, path: &str) -> bool {
        self.state.read().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Cached paths in order
    pub fn paths(&self) -> Vec<String> {
        self.state.read().entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> DirEntry {
        let (bucket, key) = name.split_once('/').unwrap();
        DirEntry::file(
            bucket,
            crate::path::ObjectResource {
                name: key.to_string(),
                size: 1,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_put_get() {
        let cache = DirCache::new(None);
        cache.put("b/dir", vec![file("b/dir/x")]);
        let listing = cache.get("b/dir").unwrap();
        assert_eq!(listing.len(), 1);
        assert!(cache.get("b/other").is_none());
    }

    #[test]
    fn test_zero_ttl_caches_nothing() {
        let cache = DirCache::new(Some(Duration::ZERO));
        cache.put("b/dir", vec![file("b/dir/x")]);
        assert!(cache.is_empty());
        assert!(cache.get("b/dir").is_none());
    }

    #[test]
    fn test_expiry_checked_on_read() {
        let cache = DirCache::new(Some(Duration::from_millis(20)));
        cache.put("b/dir", vec![file("b/dir/x")]);
        assert!(cache.get("b/dir").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.contains("b/dir"));
        assert!(cache.get("b/dir").is_none());
        assert!(!cache.contains("b/dir"));
    }

    #[test]
    fn test_invalidate_path_and_ancestors() {
        let cache = DirCache::new(None);
        cache.put("b", vec![]);
        cache.put("b/a", vec![]);
        cache.put("b/a/c", vec![]);
        cache.put("b/sibling", vec![]);

        cache.invalidate(Some("b/a/c"));

        assert!(!cache.contains("b"));
        assert!(!cache.contains("b/a"));
        assert!(!cache.contains("b/a/c"));
        assert!(cache.contains("b/sibling"));
    }

    #[test]
    fn test_invalidate_all() {
        let cache = DirCache::new(None);
        cache.put("b", vec![]);
        cache.put("c", vec![]);
        cache.invalidate(None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_mark_seen_only_touches_cached_levels() {
        let cache = DirCache::new(None);
        cache.mark_seen("b/dir", file("b/dir/x"));
        assert!(!cache.contains("b/dir"));

        cache.put("b/dir", vec![file("b/dir/x")]);
        cache.mark_seen("b/dir", file("b/dir/y"));
        cache.mark_seen("b/dir", file("b/dir/x"));
        let listing = cache.get("b/dir").unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b/dir/x", "b/dir/y"]);
    }

    #[test]
    fn test_rename_entry_in_place() {
        let cache = DirCache::new(None);
        cache.put(
            "b/base",
            vec![DirEntry::directory("b", "base/old"), DirEntry::directory("b", "base/keep")],
        );

        cache.rename_entry("b/base", "b/base/old", DirEntry::directory("b", "base/new"));

        let listing = cache.get("b/base").unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b/base/keep", "b/base/new"]);
    }

    #[test]
    fn test_listing_overtaken_by_invalidation_is_dropped() {
        let cache = DirCache::new(None);
        let since = cache.epoch();
        // A mutation lands while the listing request is in flight
        cache.invalidate(Some("b/dir/new"));

        assert!(!cache.put_if_fresh("b/dir", vec![file("b/dir/old")], since));
        assert!(!cache.contains("b/dir"));
        // Unrelated levels are unaffected
        assert!(cache.put_if_fresh("b/other", vec![], since));

        // A listing started after the mutation is stored
        let since = cache.epoch();
        assert!(cache.put_if_fresh("b/dir", vec![file("b/dir/new")], since));
        assert!(cache.contains("b/dir"));
    }

    #[test]
    fn test_stale_tree_listings_skipped() {
        let cache = DirCache::new(None);
        let since = cache.epoch();
        cache.invalidate_tree("b/dir");

        let stored = cache.put_many_if_fresh(
            [
                ("b/dir".to_string(), vec![]),
                ("b/dir/sub".to_string(), vec![]),
                ("b/dirty".to_string(), vec![]),
            ],
            since,
        );
        assert_eq!(stored, 1);
        assert_eq!(cache.paths(), vec!["b/dirty".to_string()]);
    }

    #[test]
    fn test_clear_makes_every_older_listing_stale() {
        let cache = DirCache::new(None);
        let since = cache.epoch();
        cache.invalidate(None);
        assert!(!cache.put_if_fresh("b/anything", vec![], since));
        assert!(cache.put_if_fresh("b/anything", vec![], cache.epoch()));
    }

    #[test]
    fn test_invalidate_tree() {
        let cache = DirCache::new(None);
        cache.put("b/dir", vec![]);
        cache.put("b/dir/sub", vec![]);
        cache.put("b/dirty", vec![]);
        cache.invalidate_tree("b/dir");
        assert_eq!(cache.paths(), vec!["b/dirty".to_string()]);
    }
}
