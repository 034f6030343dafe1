//! Client registry
//!
//! Shares one [`StorageClient`] per endpoint, project and credential identity,
//! so callers asking for the same backend reuse its listing cache and
//! connection pool.
//!
//! The registry is an ordinary value owned by the application; nothing here
//! is process-global.
//!
//! # Example
//!
//! ```no_run
//! use kumofs::client::ClientRegistry;
//! use kumofs::config::Config;
//! use kumofs::transport::{Anonymous, ReqwestTransport};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ClientRegistry::new();
//! let config = Config::default();
//! let transport = Arc::new(ReqwestTransport::new(config.storage.timeout())?);
//! let client = registry.get_or_create(config, transport, Arc::new(Anonymous))?;
//! assert_eq!(registry.len(), 1);
//! # Ok(())
//! # }
//! ```

use super::StorageClient;
use crate::config::Config;
use crate::error::StorageError;
use crate::transport::{CredentialProvider, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// What makes two clients interchangeable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub endpoint: String,
    pub project: Option<String>,
    pub identity: String,
}

impl RegistryKey {
    pub fn new(config: &Config, credentials: &dyn CredentialProvider) -> Self {
        Self {
            endpoint: config.storage.endpoint.trim_end_matches('/').to_string(),
            project: config.storage.project.clone(),
            identity: credentials.identity(),
        }
    }
}

/// Application-owned map of shared clients
///
/// # Thread Safety
///
/// Backed by a `DashMap`; concurrent `get_or_create` calls for one key build
/// at most one client.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<RegistryKey, Arc<StorageClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for this configuration and identity, created on first use.
    ///
    /// When a client already exists for the key, `config` and `transport`
    /// are ignored.
    pub fn get_or_create(
        &self,
        config: Config,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<StorageClient>, StorageError> {
        let key = RegistryKey::new(&config, credentials.as_ref());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        match self.clients.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    endpoint = %entry.key().endpoint,
                    identity = %entry.key().identity,
                    "Registering storage client"
                );
                let client = Arc::new(StorageClient::new(config, transport, credentials)?);
                entry.insert(client.clone());
                Ok(client)
            }
        }
    }

    pub fn get(&self, key: &RegistryKey) -> Option<Arc<StorageClient>> {
        self.clients.get(key).map(|c| c.clone())
    }

    /// Forget a client; callers holding it keep a working handle
    pub fn remove(&self, key: &RegistryKey) -> Option<Arc<StorageClient>> {
        self.clients.remove(key).map(|(_, c)| c)
    }

    pub fn clear(&self) {
        self.clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Anonymous, ReqwestTransport, StaticToken};

    fn transport() -> Arc<dyn Transport> {
        Arc::new(ReqwestTransport::from_client(reqwest::Client::new()))
    }

    #[test]
    fn test_same_key_shares_client() {
        let registry = ClientRegistry::new();
        let a = registry
            .get_or_create(Config::default(), transport(), Arc::new(Anonymous))
            .unwrap();
        let b = registry
            .get_or_create(Config::default(), transport(), Arc::new(Anonymous))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identity_separates_clients() {
        let registry = ClientRegistry::new();
        let anon = registry
            .get_or_create(Config::default(), transport(), Arc::new(Anonymous))
            .unwrap();
        let token = registry
            .get_or_create(
                Config::default(),
                transport(),
                Arc::new(StaticToken::new("secret")),
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&anon, &token));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = ClientRegistry::new();
        let config = Config::default();
        let key = RegistryKey::new(&config, &Anonymous);
        registry
            .get_or_create(config, transport(), Arc::new(Anonymous))
            .unwrap();

        assert!(registry.get(&key).is_some());
        assert!(registry.remove(&key).is_some());
        assert!(registry.is_empty());

        registry
            .get_or_create(Config::default(), transport(), Arc::new(Anonymous))
            .unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_creation_registers_nothing() {
        let registry = ClientRegistry::new();
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(registry
            .get_or_create(config, transport(), Arc::new(Anonymous))
            .is_err());
        assert!(registry.is_empty());
    }
}
