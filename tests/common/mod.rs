//! Shared integration test helpers
//!
//! Every client built here talks to a `wiremock::MockServer` through the real
//! reqwest transport, with millisecond backoff so retry tests stay fast.

#![allow(dead_code)]

use kumofs::config::Config;
use kumofs::transport::{Anonymous, ReqwestTransport, StaticToken};
use kumofs::StorageClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "test-bucket";

/// Configuration pointing at `endpoint` with fast retries
pub fn test_config(endpoint: &str) -> Config {
    let mut config = Config::default();
    config.storage.endpoint = endpoint.to_string();
    config.retry.backoff_unit_millis = 1;
    config.retry.max_backoff_units = 4.0;
    config.transfer.chunk_size = 256 * 1024;
    config
}

pub fn client_with(config: Config) -> StorageClient {
    StorageClient::new(
        config,
        Arc::new(ReqwestTransport::new(Duration::from_secs(10)).unwrap()),
        Arc::new(Anonymous),
    )
    .unwrap()
}

pub fn client(endpoint: &str) -> StorageClient {
    client_with(test_config(endpoint))
}

pub fn token_client(endpoint: &str, token: &str) -> StorageClient {
    StorageClient::new(
        test_config(endpoint),
        Arc::new(ReqwestTransport::new(Duration::from_secs(10)).unwrap()),
        Arc::new(StaticToken::new(token)),
    )
    .unwrap()
}

/// Request path of an object in the test bucket
pub fn object_path(key: &str) -> String {
    format!(
        "/storage/v1/b/{}/o/{}",
        BUCKET,
        kumofs::path::quote(key)
    )
}

pub fn objects_path() -> String {
    format!("/storage/v1/b/{}/o", BUCKET)
}

pub fn object_json(name: &str, size: u64) -> Value {
    json!({
        "kind": "storage#object",
        "name": name,
        "bucket": BUCKET,
        "size": size.to_string(),
        "generation": "1700000000000000",
        "contentType": "application/octet-stream",
    })
}

pub fn listing_json(items: &[(&str, u64)], prefixes: &[&str]) -> Value {
    let items: Vec<Value> = items
        .iter()
        .map(|(name, size)| object_json(name, *size))
        .collect();
    json!({
        "kind": "storage#objects",
        "items": items,
        "prefixes": prefixes,
    })
}

pub fn error_json(code: u16, message: &str) -> Value {
    json!({"error": {"code": code, "message": message}})
}
