//! Credential collaborators
//!
//! Token acquisition itself lives outside this crate. A
//! [`CredentialProvider`] only inserts an `Authorization` header, refreshing
//! its token first when needed, and reports whether it currently holds a
//! usable credential.
//!
//! # Implementations
//!
//! - `Anonymous` - No credentials, for public buckets and emulators
//! - `StaticToken` - A fixed bearer token
//! - `RefreshingToken` - Caches a token from a [`TokenSource`] until expiry
//!
//! # Example
//!
//! ```
//! use kumofs::transport::{CredentialProvider, StaticToken};
//!
//! let provider = StaticToken::new("ya29.token");
//! assert!(provider.is_valid());
//! ```

use crate::error::StorageError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Environment variable consulted by [`StaticToken::from_env`]
pub const TOKEN_ENV_VAR: &str = "GCS_OAUTH_TOKEN";

/// Tokens this close to expiry are refreshed early
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Credential applier capability
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Insert authentication headers, refreshing the token if it expired.
    /// A failed refresh is an `Auth` fault.
    async fn apply(&self, headers: &mut HeaderMap) -> Result<(), StorageError>;

    /// Whether a usable credential is held right now
    fn is_valid(&self) -> bool;

    /// Stable identity, used as part of client registry keys
    fn identity(&self) -> String;
}

fn bearer(token: &str) -> Result<HeaderValue, StorageError> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| StorageError::Auth("token contains invalid header characters".into()))
}

/// No credentials at all
#[derive(Debug, Clone, Default)]
pub struct Anonymous;

#[async_trait]
impl CredentialProvider for Anonymous {
    async fn apply(&self, _headers: &mut HeaderMap) -> Result<(), StorageError> {
        Ok(())
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn identity(&self) -> String {
        "anon".to_string()
    }
}

/// A fixed bearer token
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").finish_non_exhaustive()
    }
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read the token from `GCS_OAUTH_TOKEN`
    pub fn from_env() -> Result<Self, StorageError> {
        let token = std::env::var(TOKEN_ENV_VAR)
            .map_err(|_| StorageError::Auth(format!("{} not set", TOKEN_ENV_VAR)))?;
        if token.trim().is_empty() {
            return Err(StorageError::Auth(format!("{} is empty", TOKEN_ENV_VAR)));
        }
        Ok(Self::new(token.trim()))
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn apply(&self, headers: &mut HeaderMap) -> Result<(), StorageError> {
        headers.insert(AUTHORIZATION, bearer(&self.token)?);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.token.is_empty()
    }

    fn identity(&self) -> String {
        // Never expose the token itself
        format!("token:{:x}", md5::compute(self.token.as_bytes()))
    }
}

/// An access token with its expiry
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Where refreshed tokens come from (metadata server, OAuth flow, ...)
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, StorageError>;

    /// Identity of the principal the tokens belong to
    fn identity(&self) -> String;
}

/// Caches the token from a [`TokenSource`] and refreshes it near expiry
pub struct RefreshingToken<S: TokenSource> {
    source: S,
    current: Mutex<Option<AccessToken>>,
    valid: parking_lot::RwLock<bool>,
}

impl<S: TokenSource> RefreshingToken<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            current: Mutex::new(None),
            valid: parking_lot::RwLock::new(false),
        }
    }

    async fn token(&self) -> Result<String, StorageError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }

        tracing::debug!("Refreshing access token");
        match self.source.fetch_token().await {
            Ok(token) => {
                let value = token.token.clone();
                *current = Some(token);
                *self.valid.write() = true;
                Ok(value)
            }
            Err(e) => {
                *self.valid.write() = false;
                tracing::warn!(error = %e, "Token refresh failed");
                Err(match e {
                    StorageError::Auth(msg) => StorageError::Auth(msg),
                    other => StorageError::Auth(other.to_string()),
                })
            }
        }
    }
}

#[async_trait]
impl<S: TokenSource> CredentialProvider for RefreshingToken<S> {
    async fn apply(&self, headers: &mut HeaderMap) -> Result<(), StorageError> {
        let token = self.token().await?;
        headers.insert(AUTHORIZATION, bearer(&token)?);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        *self.valid.read()
    }

    fn identity(&self) -> String {
        self.source.identity()
    }
}
