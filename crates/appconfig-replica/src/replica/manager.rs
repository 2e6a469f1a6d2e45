//! Per-store replica selection and health tracking.
//!
//! A [`ConnectionManager`] owns the replica clients of one logical store. It
//! builds them on first use, hands out the ones whose backoff window has
//! elapsed starting from the replica that last succeeded, and keeps the
//! store's aggregate health in step with what it handed out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::builder::build_clients;
use super::client::ReplicaClient;
use crate::backoff::BackoffBounds;
use crate::service::state::deadline;
use crate::service::{ConfigurationError, StoreConfig};
use crate::status::StoreHealth;
use crate::transport::TransportProvider;

#[derive(Debug)]
struct ManagerInner {
    clients: Option<Vec<Arc<ReplicaClient>>>,
    current_replica: Option<String>,
    health: StoreHealth,
}

/// Replica clients and health of one store, keyed by its origin endpoint.
pub struct ConnectionManager {
    origin_endpoint: String,
    store: StoreConfig,
    provider: Arc<dyn TransportProvider>,
    bounds: BackoffBounds,
    inner: Mutex<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("origin_endpoint", &self.origin_endpoint)
            .field("bounds", &self.bounds)
            .field("inner", &self.inner)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager for `store`; clients are built lazily.
    pub fn new(
        store: StoreConfig,
        provider: Arc<dyn TransportProvider>,
        bounds: BackoffBounds,
    ) -> Result<Self, ConfigurationError> {
        let origin_endpoint = store.origin_endpoint()?;
        Ok(Self {
            origin_endpoint,
            store,
            provider,
            bounds,
            inner: Mutex::new(ManagerInner {
                clients: None,
                current_replica: None,
                health: StoreHealth::NotLoaded,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Origin endpoint identifying the store.
    pub fn origin_endpoint(&self) -> &str {
        &self.origin_endpoint
    }

    /// Store configuration this manager was built from.
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    /// Number of replicas configured for the store (including the origin).
    pub fn replica_count(&self) -> usize {
        match &self.lock().clients {
            Some(clients) => clients.len(),
            None => self
                .store
                .configured_endpoints()
                .map(|endpoints| endpoints.len())
                .unwrap_or(1),
        }
    }

    fn ensure_clients(
        &self,
        inner: &mut ManagerInner,
    ) -> Result<Vec<Arc<ReplicaClient>>, ConfigurationError> {
        if let Some(clients) = &inner.clients {
            return Ok(clients.clone());
        }
        let clients = build_clients(&self.store, self.provider.as_ref())?;
        inner.clients = Some(clients.clone());
        Ok(clients)
    }

    /// Replicas usable right now, in rotation order.
    ///
    /// A single replica is always returned. With several, the scan starts at
    /// the current replica when `use_current` is set (otherwise at the first
    /// configured one), wraps around, and skips replicas still backed off.
    pub fn available_clients(
        &self,
        use_current: bool,
    ) -> Result<Vec<Arc<ReplicaClient>>, ConfigurationError> {
        let mut inner = self.lock();
        let clients = match self.ensure_clients(&mut inner) {
            Ok(clients) => clients,
            Err(error) => {
                warn!(
                    origin = %self.origin_endpoint,
                    %error,
                    "app-configuration: failed to build replica clients"
                );
                return Err(error);
            }
        };
        if clients.is_empty() {
            inner.health = StoreHealth::NotLoaded;
            return Ok(clients);
        }
        if clients.len() == 1 {
            return Ok(clients);
        }

        let start = if use_current {
            inner
                .current_replica
                .as_deref()
                .and_then(|current| clients.iter().position(|c| c.endpoint() == current))
                .unwrap_or(0)
        } else {
            0
        };
        let now = Instant::now();
        let available: Vec<_> = clients
            .iter()
            .cycle()
            .skip(start)
            .take(clients.len())
            .filter(|client| client.is_available_at(now))
            .cloned()
            .collect();

        inner.health = if available.is_empty() {
            StoreHealth::Down
        } else {
            StoreHealth::Up
        };
        debug!(
            origin = %self.origin_endpoint,
            available = available.len(),
            total = clients.len(),
            "app-configuration: selected available replicas"
        );
        Ok(available)
    }

    /// Backs off `endpoint` according to its failure count and returns the delay applied.
    pub fn backoff_client(&self, endpoint: &str) -> Option<Duration> {
        let client = {
            let inner = self.lock();
            inner
                .clients
                .as_ref()?
                .iter()
                .find(|client| client.endpoint() == endpoint)
                .cloned()?
        };
        let delay = self.bounds.backoff(client.failed_attempts());
        client.update_backoff_end_time(deadline(Instant::now(), delay));
        debug!(
            origin = %self.origin_endpoint,
            endpoint,
            ?delay,
            failed_attempts = client.failed_attempts(),
            "app-configuration: backing off replica"
        );
        Some(delay)
    }

    /// Records the replica that last served a request successfully.
    pub fn set_current_client(&self, endpoint: &str) {
        self.lock().current_replica = Some(endpoint.to_string());
    }

    /// Replica that last served a request successfully.
    pub fn current_client(&self) -> Option<String> {
        self.lock().current_replica.clone()
    }

    /// Aggregate health of the store.
    pub fn health(&self) -> StoreHealth {
        self.lock().health
    }

    /// Overrides the aggregate health (used by the load and refresh paths).
    pub fn set_health(&self, health: StoreHealth) {
        self.lock().health = health;
    }

    /// Forwards a sync token; ignored when the store has replicas.
    pub fn update_sync_token(&self, token: Option<&str>) {
        let clients = {
            let mut inner = self.lock();
            match self.ensure_clients(&mut inner) {
                Ok(clients) => clients,
                Err(error) => {
                    warn!(
                        origin = %self.origin_endpoint,
                        %error,
                        "app-configuration: cannot apply sync token"
                    );
                    return;
                }
            }
        };
        if let [client] = clients.as_slice() {
            client.update_sync_token(token);
        }
    }
}
