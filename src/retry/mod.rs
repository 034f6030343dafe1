//! Retry/backoff engine
//!
//! Wraps one network attempt at a time with classification-aware retries.
//! Attempt `i` (0-indexed) sleeps `unit * min(random(0,1) + 2^(i-1), cap)`
//! before running when `i > 0`. Sleeping goes through `tokio::time`, so other
//! tasks on the same loop keep running while one operation backs off.
//!
//! The policy holds only configuration and may be shared freely between
//! concurrent operations.

use crate::config::RetryConfig;
use crate::error::StorageError;
use crate::metrics;
use std::future::Future;
use std::time::Duration;

/// HTTP statuses that indicate a transient backend condition
const RETRIABLE_STATUSES: [u16; 7] = [408, 429, 500, 501, 502, 503, 504];

/// Classification-driven retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    unit: Duration,
    cap_units: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, unit: Duration, cap_units: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            unit,
            cap_units,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_unit_millis),
            config.max_backoff_units,
        )
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before attempt `attempt`; zero for the first attempt
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(62) as i32;
        let units = (rand::random::<f64>() + 2f64.powi(exponent)).min(self.cap_units);
        self.unit.mul_f64(units)
    }

    /// Run `operation` until it succeeds, fails terminally or the attempt
    /// budget is spent. The last fault is returned unchanged on exhaustion,
    /// apart from the requester-pays rewrite.
    pub async fn execute<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.backoff_delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(rewritten) = requester_pays(&err) {
                tracing::error!(operation = name, error = %err, "Bucket requires requester pays");
                return Err(rewritten);
            }

            if err.is_not_found() {
                return Err(err);
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                tracing::error!(
                    operation = name,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            if !is_retriable(&err) {
                tracing::warn!(operation = name, error = %err, "Non-retriable error");
                return Err(err);
            }

            tracing::debug!(
                operation = name,
                attempt = attempt,
                error = %err,
                "Retrying after transient error"
            );
            metrics::record_retry(&retry_reason(&err));
        }
    }
}

/// Whether a fault may succeed on another attempt
pub fn is_retriable(err: &StorageError) -> bool {
    match err {
        StorageError::Transport { kind, .. } => *kind != crate::error::TransportErrorKind::Builder,
        StorageError::Auth(_) | StorageError::ChecksumMismatch(_) => true,
        StorageError::Http { code, .. } => RETRIABLE_STATUSES.contains(code),
        _ => false,
    }
}

fn requester_pays(err: &StorageError) -> Option<StorageError> {
    match err {
        StorageError::BadRequest { path, message }
            if message.to_lowercase().contains("requester pays") =>
        {
            Some(StorageError::RequesterPays(path.clone()))
        }
        _ => None,
    }
}

fn retry_reason(err: &StorageError) -> String {
    match err {
        StorageError::Http { code, .. } => format!("http_{}", code),
        StorageError::Transport { kind, .. } => format!("transport_{}", kind),
        other => other.label().to_string(),
    }
}
