//! Filesystem-style client
//!
//! [`StorageClient`] exposes the bucket/object namespace as a directory tree:
//! listings, metadata, whole-object transfers, handles and mutations. All
//! requests go through one [`HttpExecutor`], so every call shares the same
//! credentials, retry policy and metrics. Listings are served from a shared
//! [`DirCache`] which every mutation invalidates.
//!
//! # Example
//!
//! ```no_run
//! use kumofs::client::{ListOptions, StorageClient};
//! use kumofs::config::Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StorageClient::from_config(Config::load("kumofs.yaml")?)?;
//! for entry in client.ls("gs://my-bucket/data", ListOptions::default()).await? {
//!     println!("{} {}", entry.name, entry.size);
//! }
//! # Ok(())
//! # }
//! ```

mod batch;
mod listing;
mod objects;
pub mod registry;

pub use listing::{FindOptions, ListOptions};
pub use objects::XattrUpdate;
pub use registry::{ClientRegistry, RegistryKey};

use crate::checker::Consistency;
use crate::config::Config;
use crate::dircache::DirCache;
use crate::error::StorageError;
use crate::retry::RetryPolicy;
use crate::transport::{
    Anonymous, ApiUrls, CredentialProvider, HttpExecutor, HttpRequest, ReqwestTransport,
    StaticToken, Transport,
};
use dashmap::DashMap;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Namespace layout of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketLayout {
    /// Flat namespace; directories are implied by key prefixes
    Flat,
    /// Hierarchical namespace with real folders
    Hierarchical,
    /// Hierarchical namespace in a zonal bucket
    ZonalHierarchical,
    /// Layout could not be determined
    Unknown,
}

impl BucketLayout {
    /// Whether folders are real resources that can be renamed in one call
    pub fn is_hierarchical(&self) -> bool {
        matches!(
            self,
            BucketLayout::Hierarchical | BucketLayout::ZonalHierarchical
        )
    }
}

impl fmt::Display for BucketLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BucketLayout::Flat => "flat",
            BucketLayout::Hierarchical => "hierarchical",
            BucketLayout::ZonalHierarchical => "zonal-hierarchical",
            BucketLayout::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageLayout {
    #[serde(default)]
    location_type: Option<String>,
    #[serde(default)]
    hierarchical_namespace: Option<HierarchicalNamespace>,
}

#[derive(Debug, Deserialize)]
struct HierarchicalNamespace {
    #[serde(default)]
    enabled: bool,
}

impl StorageLayout {
    fn layout(&self) -> BucketLayout {
        let hierarchical = self
            .hierarchical_namespace
            .as_ref()
            .map(|ns| ns.enabled)
            .unwrap_or(false);
        let zonal = self
            .location_type
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case("zone"))
            .unwrap_or(false);
        match (hierarchical, zonal) {
            (true, true) => BucketLayout::ZonalHierarchical,
            (true, false) => BucketLayout::Hierarchical,
            (false, _) => BucketLayout::Flat,
        }
    }
}

/// Storage client
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct StorageClient {
    executor: HttpExecutor,
    urls: ApiUrls,
    cache: Arc<DirCache>,
    config: Config,
    consistency: Consistency,
    layouts: DashMap<String, BucketLayout>,
}

impl StorageClient {
    /// Create a client over an explicit transport and credential provider
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, StorageError> {
        config
            .validate()
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        let consistency: Consistency = config.transfer.consistency.parse()?;
        crate::metrics::set_enabled(config.metrics.enabled);

        let executor = HttpExecutor::new(
            transport,
            credentials,
            RetryPolicy::from_config(&config.retry),
            config.storage.user_project().map(str::to_string),
        );

        tracing::debug!(
            endpoint = %config.storage.endpoint,
            consistency = %consistency,
            "Storage client created"
        );

        Ok(Self {
            urls: ApiUrls::new(&config.storage.endpoint),
            cache: Arc::new(DirCache::new(config.cache.ttl())),
            executor,
            config,
            consistency,
            layouts: DashMap::new(),
        })
    }

    /// Create a client with the default reqwest transport.
    ///
    /// Uses a bearer token from `GCS_OAUTH_TOKEN` when set, anonymous access
    /// otherwise.
    pub fn from_config(config: Config) -> Result<Self, StorageError> {
        let transport = Arc::new(ReqwestTransport::new(config.storage.timeout())?);
        let credentials: Arc<dyn CredentialProvider> = match StaticToken::from_env() {
            Ok(token) => Arc::new(token),
            Err(_) => {
                tracing::debug!("No token in environment, using anonymous access");
                Arc::new(Anonymous)
            }
        };
        Self::new(config, transport, credentials)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &HttpExecutor {
        &self.executor
    }

    pub fn urls(&self) -> &ApiUrls {
        &self.urls
    }

    /// Shared listing cache
    pub fn cache(&self) -> &Arc<DirCache> {
        &self.cache
    }

    /// Default consistency check for transfers
    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// Drop cached listings at and above `path`, or everything for `None`
    pub fn invalidate_cache(&self, path: Option<&str>) {
        self.cache.invalidate(path);
    }

    /// Namespace layout of `bucket`, memoized per client.
    ///
    /// A failed lookup yields [`BucketLayout::Unknown`], which is not
    /// remembered so the next call asks again.
    #[tracing::instrument(name = "client.bucket_layout", skip(self), fields(bucket = %bucket))]
    pub async fn bucket_layout(&self, bucket: &str) -> BucketLayout {
        if let Some(layout) = self.layouts.get(bucket) {
            return *layout;
        }

        let request = HttpRequest::get(self.urls.storage_layout(bucket));
        let layout = match self.executor.call(request, bucket).await {
            Ok(response) => match response.json::<StorageLayout>() {
                Ok(body) => body.layout(),
                Err(e) => {
                    tracing::warn!(bucket = %bucket, error = %e, "Unreadable storage layout");
                    BucketLayout::Unknown
                }
            },
            Err(e) => {
                tracing::debug!(bucket = %bucket, error = %e, "Storage layout lookup failed");
                BucketLayout::Unknown
            }
        };

        if layout != BucketLayout::Unknown {
            self.layouts.insert(bucket.to_string(), layout);
        }
        layout
    }
}
