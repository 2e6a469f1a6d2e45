//! Registry of connection managers, one per configured store.
//!
//! The factory is meant to be built once per process and shared by handle
//! between the loader and the refresh coordinator, so replica backoff and
//! health survive every reload cycle.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::debug;

use super::builder::normalize_endpoint;
use super::client::ReplicaClient;
use super::manager::ConnectionManager;
use crate::backoff::BackoffBounds;
use crate::service::{ConfigurationError, StoreConfig};
use crate::status::StoreHealth;
use crate::transport::TransportProvider;

/// Process-wide map from origin endpoint to [`ConnectionManager`].
pub struct ReplicaClientFactory {
    provider: Arc<dyn TransportProvider>,
    bounds: BackoffBounds,
    managers: RwLock<Vec<Arc<ConnectionManager>>>,
}

impl std::fmt::Debug for ReplicaClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaClientFactory")
            .field("bounds", &self.bounds)
            .field("stores", &self.origins())
            .finish()
    }
}

impl ReplicaClientFactory {
    /// Creates an empty registry.
    pub fn new(provider: Arc<dyn TransportProvider>, bounds: BackoffBounds) -> Self {
        Self {
            provider,
            bounds,
            managers: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry and registers `stores` in order.
    pub fn with_stores(
        stores: &[StoreConfig],
        provider: Arc<dyn TransportProvider>,
        bounds: BackoffBounds,
    ) -> Result<Self, ConfigurationError> {
        let factory = Self::new(provider, bounds);
        for store in stores {
            factory.register_store(store)?;
        }
        Ok(factory)
    }

    /// Registers `store` unless its origin is already known; the first registration wins.
    pub fn register_store(
        &self,
        store: &StoreConfig,
    ) -> Result<Arc<ConnectionManager>, ConfigurationError> {
        store.validate()?;
        let origin = store.origin_endpoint()?;
        let mut managers = self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = managers.iter().find(|m| m.origin_endpoint() == origin) {
            return Ok(existing.clone());
        }
        let manager = Arc::new(ConnectionManager::new(
            store.clone(),
            self.provider.clone(),
            self.bounds,
        )?);
        debug!(origin = %origin, "app-configuration: registered store");
        managers.push(manager.clone());
        Ok(manager)
    }

    /// Every registered manager in registration order.
    pub fn connections(&self) -> Vec<Arc<ConnectionManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn origins(&self) -> Vec<String> {
        self.connections()
            .iter()
            .map(|m| m.origin_endpoint().to_string())
            .collect()
    }

    /// Manager registered for `origin_endpoint`.
    pub fn connection(&self, origin_endpoint: &str) -> Option<Arc<ConnectionManager>> {
        let origin = normalize_endpoint(origin_endpoint);
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.origin_endpoint() == origin)
            .cloned()
    }

    fn require(&self, origin_endpoint: &str) -> Result<Arc<ConnectionManager>, ConfigurationError> {
        self.connection(origin_endpoint)
            .ok_or_else(|| ConfigurationError::UnknownStore(origin_endpoint.to_string()))
    }

    /// Usable replicas of the store identified by `origin_endpoint`.
    pub fn available_clients(
        &self,
        origin_endpoint: &str,
        use_current: bool,
    ) -> Result<Vec<Arc<ReplicaClient>>, ConfigurationError> {
        self.require(origin_endpoint)?.available_clients(use_current)
    }

    /// Backs off replica `endpoint` of the store identified by `origin_endpoint`.
    pub fn backoff_client(&self, origin_endpoint: &str, endpoint: &str) -> Option<Duration> {
        self.connection(origin_endpoint)?.backoff_client(endpoint)
    }

    /// Records `endpoint` as the replica that last served `origin_endpoint`.
    pub fn set_current_client(&self, origin_endpoint: &str, endpoint: &str) {
        if let Some(manager) = self.connection(origin_endpoint) {
            manager.set_current_client(endpoint);
        }
    }

    /// Health of every store keyed by origin endpoint.
    pub fn health(&self) -> BTreeMap<String, StoreHealth> {
        self.connections()
            .iter()
            .map(|m| (m.origin_endpoint().to_string(), m.health()))
            .collect()
    }

    /// Maps any replica endpoint to the origin of the store it belongs to.
    ///
    /// Unknown endpoints are returned unchanged.
    pub fn find_origin_for_endpoint(&self, endpoint: &str) -> String {
        let endpoint = normalize_endpoint(endpoint);
        for manager in self.connections() {
            let replicas = manager.store().configured_endpoints().unwrap_or_default();
            if replicas.iter().any(|replica| *replica == endpoint) {
                return manager.origin_endpoint().to_string();
            }
        }
        endpoint
    }

    /// Whether the store that `endpoint` belongs to has more than one replica.
    pub fn has_replicas(&self, endpoint: &str) -> bool {
        let origin = self.find_origin_for_endpoint(endpoint);
        self.connection(&origin)
            .map(|m| m.replica_count() > 1)
            .unwrap_or(false)
    }

    /// Forwards a sync token to the store identified by `origin_endpoint`.
    pub fn update_sync_token(&self, origin_endpoint: &str, token: Option<&str>) {
        if let Some(manager) = self.connection(origin_endpoint) {
            manager.update_sync_token(token);
        }
    }
}
