//! Store loading.
//!
//! A load cycle reads every enabled store through the first replica that
//! answers, records the watched ETags that later refresh checks compare
//! against, and publishes the resulting snapshot in one swap.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::{ProviderConfig, StoreConfig};
use super::core::ServiceError;
use super::state::{deadline, feature_flag_key, RefreshState, StateHolder};
use crate::replica::{ReplicaClient, ReplicaClientFactory, ReplicaError};
use crate::status::StoreHealth;
use crate::transport::Setting;

/// Settings read from one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedStore {
    /// Origin endpoint of the store.
    pub origin_endpoint: String,
    /// Replica that served the load.
    pub endpoint: String,
    /// Settings matching the store's selectors, in selector order.
    pub settings: Vec<Setting>,
    /// Trigger settings as observed during the load; missing keys carry no ETag.
    pub watch_keys: Vec<Setting>,
    /// Feature flags, empty when feature flags are disabled.
    pub feature_flags: Vec<Setting>,
}

/// Outcome of a load cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Stores loaded in this cycle.
    pub loaded: Vec<LoadedStore>,
    /// Disabled stores.
    pub skipped: Vec<String>,
    /// Stores that could not be loaded and kept their previous state.
    pub failed: Vec<String>,
}

/// Loads stores and publishes the watch state for the refresh coordinator.
#[derive(Debug)]
pub struct StoreLoader {
    factory: Arc<ReplicaClientFactory>,
    state: Arc<RefreshState>,
    config: ProviderConfig,
    started_at: Instant,
}

impl StoreLoader {
    /// Creates a loader; the pre-kill window starts now.
    pub fn new(
        factory: Arc<ReplicaClientFactory>,
        state: Arc<RefreshState>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            factory,
            state,
            config: config.sanitise(),
            started_at: Instant::now(),
        }
    }

    /// Loads `stores`, registering any the factory does not know yet.
    ///
    /// A fail-fast store that cannot be loaded aborts the cycle once the
    /// pre-kill window has passed. Other failures keep the store's previous
    /// watch state and stop refresh checks for it until a later load succeeds.
    pub async fn load(&self, stores: &[StoreConfig]) -> Result<LoadReport, ServiceError> {
        let previous = self.state.snapshot();
        let mut next = StateHolder::new();
        let mut report = LoadReport::default();

        for store in stores {
            let origin = store.origin_endpoint()?;
            if !store.enabled {
                debug!(origin = %origin, "app-configuration: store disabled, not loading");
                report.skipped.push(origin);
                continue;
            }
            let manager = self.factory.register_store(store)?;

            match self.load_store(store, &origin).await {
                Ok(loaded) => {
                    manager.set_current_client(&loaded.endpoint);
                    manager.set_health(StoreHealth::Up);
                    if store.monitoring.enabled {
                        next.set_state(
                            &origin,
                            loaded.watch_keys.clone(),
                            store.monitoring.refresh_interval,
                        );
                    }
                    next.set_load_state(&origin, true);
                    if store.feature_flags.enabled {
                        next.set_feature_flag_state(
                            &origin,
                            loaded.feature_flags.clone(),
                            store.monitoring.feature_flag_refresh_interval,
                        );
                        next.set_load_state_feature_flag(&origin, true);
                    }
                    info!(
                        origin = %origin,
                        endpoint = %loaded.endpoint,
                        settings = loaded.settings.len(),
                        feature_flags = loaded.feature_flags.len(),
                        "app-configuration: store loaded"
                    );
                    report.loaded.push(loaded);
                }
                Err(failure) if store.fail_fast => {
                    manager.set_health(StoreHealth::Down);
                    self.delay_fail_fast().await;
                    error!(
                        origin = %origin,
                        error = %failure,
                        "app-configuration: fail-fast store could not be loaded"
                    );
                    return Err(failure);
                }
                Err(failure) => {
                    manager.set_health(StoreHealth::Down);
                    warn!(
                        origin = %origin,
                        error = %failure,
                        "app-configuration: store could not be loaded, keeping previous state"
                    );
                    next.carry_over(&previous, &origin);
                    next.carry_over(&previous, &feature_flag_key(&origin));
                    next.set_load_state(&origin, false);
                    next.set_load_state_feature_flag(&origin, false);
                    report.failed.push(origin);
                }
            }
        }

        next.set_next_forced_refresh(self.config.refresh_interval);
        self.state.replace(next);
        Ok(report)
    }

    /// Tries each usable replica in turn until one serves the whole store.
    async fn load_store(
        &self,
        store: &StoreConfig,
        origin: &str,
    ) -> Result<LoadedStore, ServiceError> {
        let clients = self.factory.available_clients(origin, true)?;
        for client in clients {
            match read_store(&client, store).await {
                Ok(loaded) => {
                    return Ok(LoadedStore {
                        origin_endpoint: origin.to_string(),
                        ..loaded
                    })
                }
                Err(failure) if failure.is_retryable() => {
                    warn!(
                        origin = %origin,
                        error = %failure,
                        "app-configuration: replica failed during load"
                    );
                    self.factory.backoff_client(origin, client.endpoint());
                }
                Err(failure) => return Err(failure.into()),
            }
        }
        Err(ServiceError::StoreUnavailable {
            origin: origin.to_string(),
        })
    }

    /// Sleeps until the pre-kill window after startup has passed.
    async fn delay_fail_fast(&self) {
        let window_end = deadline(self.started_at, self.config.prekill_time);
        if window_end > Instant::now() {
            debug!(
                remaining = ?window_end.saturating_duration_since(Instant::now()),
                "app-configuration: delaying fail-fast abort until pre-kill window ends"
            );
            tokio::time::sleep_until(window_end).await;
        }
    }
}

/// Reads selectors, triggers and feature flags of `store` from one replica.
async fn read_store(
    client: &ReplicaClient,
    store: &StoreConfig,
) -> Result<LoadedStore, ReplicaError> {
    let mut settings = Vec::new();
    for selector in &store.selects {
        settings.extend(client.list_settings(selector).await?);
    }

    let mut watch_keys = Vec::new();
    if store.monitoring.enabled {
        for trigger in &store.monitoring.triggers {
            let live = client
                .get_watch_key(&trigger.key, trigger.label.as_deref())
                .await?;
            watch_keys.push(live.unwrap_or_else(|| {
                Setting::new(trigger.key.clone(), trigger.label.as_deref())
            }));
        }
    }

    let feature_flags = if store.feature_flags.enabled {
        client.list_settings(&store.feature_flags.selector()).await?
    } else {
        Vec::new()
    };

    Ok(LoadedStore {
        origin_endpoint: String::new(),
        endpoint: client.endpoint().to_string(),
        settings,
        watch_keys,
        feature_flags,
    })
}
