//! Metrics module
//!
//! Process-wide Prometheus counters for requests, retries, caches and
//! transfers. Without the `metrics` feature, or after `set_enabled(false)`,
//! every `record_*` helper is a no-op. Without the feature [`gather`] returns
//! an empty string.

use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;
#[cfg(feature = "metrics")]
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec, Encoder};

#[cfg(feature = "metrics")]
lazy_static! {
    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "kumofs_requests_total",
        "Total HTTP requests issued to the backend",
        &["method", "status"]
    ).unwrap();

    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "kumofs_retries_total",
        "Retried attempts by fault class",
        &["reason"]
    ).unwrap();

    // Cache metrics
    pub static ref LISTING_CACHE_TOTAL: CounterVec = register_counter_vec!(
        "kumofs_listing_cache_total",
        "Directory listing cache lookups",
        &["result"]  // "hit" or "miss"
    ).unwrap();

    pub static ref READAHEAD_TOTAL: CounterVec = register_counter_vec!(
        "kumofs_readahead_total",
        "Read-ahead cache lookups",
        &["result"]
    ).unwrap();

    // Upload metrics
    pub static ref UPLOAD_CHUNKS_TOTAL: Counter = register_counter!(
        "kumofs_upload_chunks_total",
        "Resumable upload chunk round trips"
    ).unwrap();

    pub static ref UPLOAD_SHORTFALL_BYTES_TOTAL: Counter = register_counter!(
        "kumofs_upload_shortfall_bytes_total",
        "Bytes the backend did not accept and had to be resent"
    ).unwrap();

    pub static ref TRANSFER_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "kumofs_transfer_bytes_total",
        "Payload bytes moved",
        &["direction"]  // "upload" or "download"
    ).unwrap();
}

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn recording on or off for the whole process
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether the `record_*` helpers currently record anything
pub fn is_enabled() -> bool {
    cfg!(feature = "metrics") && ENABLED.load(Ordering::Relaxed)
}

fn hit_label(hit: bool) -> &'static str {
    if hit {
        "hit"
    } else {
        "miss"
    }
}

/// Record one completed HTTP attempt
pub fn record_request(method: &str, status: u16) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = (method, status);
}

/// Record a retry caused by `reason`
pub fn record_retry(reason: &str) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    RETRIES_TOTAL.with_label_values(&[reason]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

/// Record a directory cache lookup
pub fn record_listing_cache(hit: bool) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    LISTING_CACHE_TOTAL.with_label_values(&[hit_label(hit)]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = hit_label(hit);
}

/// Record a read-ahead cache lookup
pub fn record_readahead(hit: bool) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    READAHEAD_TOTAL.with_label_values(&[hit_label(hit)]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = hit_label(hit);
}

/// Record one chunk round trip and the bytes it failed to deliver
pub fn record_upload_chunk(shortfall: u64) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    {
        UPLOAD_CHUNKS_TOTAL.inc();
        if shortfall > 0 {
            UPLOAD_SHORTFALL_BYTES_TOTAL.inc_by(shortfall as f64);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = shortfall;
}

/// Record payload bytes sent to the backend
pub fn record_upload_bytes(bytes: u64) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    TRANSFER_BYTES_TOTAL
        .with_label_values(&["upload"])
        .inc_by(bytes as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

/// Record payload bytes received from the backend
pub fn record_download_bytes(bytes: u64) {
    if !is_enabled() {
        return;
    }
    #[cfg(feature = "metrics")]
    TRANSFER_BYTES_TOTAL
        .with_label_values(&["download"])
        .inc_by(bytes as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    #[cfg(feature = "metrics")]
    {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
    #[cfg(not(feature = "metrics"))]
    String::new()
}
