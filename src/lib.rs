//! Kumofs Library
//!
//! Filesystem-style client runtime for Google Cloud Storage and compatible
//! JSON APIs.
//!
//! # Features
//!
//! - **Directory View**: Buckets and slash-separated keys browsed as a tree
//! - **Listing Cache**: Shared, TTL-bounded directory listings
//! - **Retries**: Exponential backoff with jitter over transient faults
//! - **Resumable Uploads**: 256 KiB-aligned chunked sessions
//! - **Random Access Reads**: Block-aligned read-ahead over ranged GETs
//! - **Integrity Checks**: Size, MD5 or CRC32C validation of transfers
//! - **Blocking Façade**: Synchronous calls driven by a dedicated event loop
//!
//! # Example
//!
//! ```no_run
//! use kumofs::{client::ListOptions, config::Config, StorageClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("kumofs.yaml")?;
//!     kumofs::logging::init(&config.logging)?;
//!     let client = StorageClient::from_config(config)?;
//!     let entries = client.ls("gs://my-bucket/logs", ListOptions::default()).await?;
//!     println!("{} entries", entries.len());
//!     Ok(())
//! }
//! ```

pub mod checker;
pub mod client;
pub mod config;
pub mod dircache;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod path;
pub mod read;
pub mod retry;
pub mod runtime;
pub mod transport;
pub mod upload;

// Re-export commonly used types
pub use checker::Consistency;
pub use client::{BucketLayout, ClientRegistry, StorageClient};
pub use config::Config;
pub use error::StorageError;
pub use path::DirEntry;
pub use runtime::{BlockingClient, EventLoop};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
