//! Refresh decision engine.
//!
//! One pass walks every enabled store in registration order and, for each
//! store whose check is due, asks its usable replicas for the current ETags
//! of the watched settings. The first difference found anywhere ends the
//! pass and becomes the refresh event. Stores that showed no change get their
//! next check rescheduled and stores whose check was rejected are backed off;
//! both are applied to the published snapshot in one swap when the pass ends,
//! whatever its outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::ProviderConfig;
use super::core::{RefreshEvent, ServiceError};
use super::state::{RefreshState, State, StateHolder};
use super::telemetry::RefreshTelemetry;
use crate::replica::{ConnectionManager, ReplicaClient, ReplicaClientFactory, ReplicaError};
use crate::status::StoreHealth;
use crate::transport::{Setting, SettingSelector};

/// Trigger message used when the forced refresh interval elapses.
pub const FORCED_REFRESH_MESSAGE: &str =
    "Minimum refresh period reached. Refreshing configurations.";

/// What a store scan concluded.
#[derive(Debug)]
enum ScanOutcome {
    /// A watched setting changed.
    Changed(RefreshEvent),
    /// The check ran (or was not due) and found nothing.
    Unchanged,
    /// A replica rejected the request; the rest of this store is skipped.
    Rejected,
}

/// Timer update recorded during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reschedule {
    /// The check completed; the next one runs a full interval later.
    Checked(String, Duration),
    /// A replica rejected the check; the timer follows the failure path.
    Rejected(String),
}

/// Which watch protocol a scan applies.
#[derive(Debug, Clone, Copy)]
enum WatchKind<'a> {
    /// Fetch every watched key individually.
    KeyValues,
    /// List every flag matching the selector and compare the whole set.
    FeatureFlags(&'a SettingSelector),
}

/// Whether `live` differs from what was recorded in `watched`.
///
/// A setting recorded without an ETag never counts as changed.
pub(crate) fn etag_changed(watched: &Setting, live: Option<&Setting>) -> bool {
    match watched.etag.as_deref() {
        None => false,
        Some(stored) => live.and_then(|s| s.etag.as_deref()) != Some(stored),
    }
}

/// Borrowed collaborators of one refresh pass.
pub(crate) struct RefreshCheck<'a> {
    pub factory: &'a ReplicaClientFactory,
    pub state: &'a RefreshState,
    pub config: &'a ProviderConfig,
    pub telemetry: &'a dyn RefreshTelemetry,
}

impl RefreshCheck<'_> {
    /// Runs one pass; `Ok(Some(_))` means a refresh is required.
    pub(crate) async fn run(&self) -> Result<Option<RefreshEvent>, ServiceError> {
        let current = self.state.snapshot();

        if self.config.refresh_interval.is_some() {
            if let Some(forced) = current.next_forced_refresh() {
                if forced <= Instant::now() {
                    info!("app-configuration: {FORCED_REFRESH_MESSAGE}");
                    return Ok(Some(RefreshEvent::new(FORCED_REFRESH_MESSAGE, None)));
                }
            }
        }

        let mut reschedule = Vec::new();
        let result = self.check_stores(&current, &mut reschedule).await;
        if !reschedule.is_empty() {
            let bounds = self.config.backoff_bounds();
            self.state.update(|holder| {
                for entry in &reschedule {
                    match entry {
                        Reschedule::Checked(key, interval) => {
                            holder.update_state_refresh(key, *interval)
                        }
                        Reschedule::Rejected(key) => holder.back_off_state(key, &bounds),
                    }
                }
            });
            debug!(
                rescheduled = reschedule.len(),
                "app-configuration: published refresh schedule"
            );
        }
        result
    }

    async fn check_stores(
        &self,
        current: &StateHolder,
        reschedule: &mut Vec<Reschedule>,
    ) -> Result<Option<RefreshEvent>, ServiceError> {
        for manager in self.factory.connections() {
            let store = manager.store();
            if !store.enabled {
                continue;
            }
            let origin = manager.origin_endpoint();
            let clients = manager.available_clients(true)?;

            match current.state(origin) {
                Some(state) if store.monitoring.enabled && current.load_state(origin) => {
                    match self
                        .scan(&manager, state, &clients, WatchKind::KeyValues, reschedule)
                        .await?
                    {
                        ScanOutcome::Changed(event) => return Ok(Some(event)),
                        ScanOutcome::Rejected => continue,
                        ScanOutcome::Unchanged => {}
                    }
                }
                _ => debug!(
                    origin = %origin,
                    "app-configuration: skipping configuration refresh check"
                ),
            }

            if store.feature_flags.enabled && current.load_state_feature_flag(origin) {
                if let Some(state) = current.feature_flag_state(origin) {
                    let selector = store.feature_flags.selector();
                    if let ScanOutcome::Changed(event) = self
                        .scan(
                            &manager,
                            state,
                            &clients,
                            WatchKind::FeatureFlags(&selector),
                            reschedule,
                        )
                        .await?
                    {
                        return Ok(Some(event));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Checks one state against the first replica that answers.
    async fn scan(
        &self,
        manager: &ConnectionManager,
        state: &State,
        clients: &[Arc<ReplicaClient>],
        kind: WatchKind<'_>,
        reschedule: &mut Vec<Reschedule>,
    ) -> Result<ScanOutcome, ServiceError> {
        if !state.is_due(Instant::now()) {
            return Ok(ScanOutcome::Unchanged);
        }
        let origin = manager.origin_endpoint();

        for client in clients {
            let result = match kind {
                WatchKind::KeyValues => check_watch_keys(client, state).await,
                WatchKind::FeatureFlags(selector) => {
                    check_feature_flags(client, state, selector).await
                }
            };
            match result {
                Ok(change) => {
                    manager.set_health(StoreHealth::Up);
                    reschedule.push(Reschedule::Checked(
                        state.key().to_string(),
                        state.refresh_interval(),
                    ));
                    return Ok(match change {
                        Some(message) => {
                            manager.set_current_client(client.endpoint());
                            info!(
                                origin = %origin,
                                endpoint = %client.endpoint(),
                                trigger = %message,
                                "app-configuration: configuration change detected"
                            );
                            ScanOutcome::Changed(RefreshEvent::new(
                                message,
                                Some(origin.to_string()),
                            ))
                        }
                        None => ScanOutcome::Unchanged,
                    });
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        origin = %origin,
                        %error,
                        "app-configuration: replica failed during refresh check"
                    );
                    if let Some(delay) = manager.backoff_client(client.endpoint()) {
                        self.telemetry
                            .on_replica_backoff(origin, client.endpoint(), delay);
                    }
                }
                Err(error @ ReplicaError::Service { .. }) => {
                    warn!(
                        origin = %origin,
                        %error,
                        "app-configuration: skipping store after rejected refresh check"
                    );
                    reschedule.push(Reschedule::Rejected(state.key().to_string()));
                    return Ok(ScanOutcome::Rejected);
                }
                Err(error) => return Err(error.into()),
            }
        }

        manager.set_health(StoreHealth::Down);
        Ok(ScanOutcome::Unchanged)
    }
}

/// Returns the key of the first watched setting whose ETag moved.
async fn check_watch_keys(
    client: &ReplicaClient,
    state: &State,
) -> Result<Option<String>, ReplicaError> {
    for watched in state.watch_keys() {
        let live = client
            .get_watch_key(&watched.key, watched.label.as_deref())
            .await?;
        if etag_changed(watched, live.as_ref()) {
            return Ok(Some(watched.key.clone()));
        }
    }
    Ok(None)
}

/// Compares the listed flags with the recorded ones, including their count.
async fn check_feature_flags(
    client: &ReplicaClient,
    state: &State,
    selector: &SettingSelector,
) -> Result<Option<String>, ReplicaError> {
    let flags = client.list_settings(selector).await?;
    for flag in &flags {
        let recorded = state
            .watch_keys()
            .iter()
            .find(|w| w.key == flag.key && w.label == flag.label);
        if let Some(watched) = recorded {
            if etag_changed(watched, Some(flag)) {
                return Ok(Some(flag.key.clone()));
            }
        }
    }
    if flags.len() != state.watch_keys().len() {
        return Ok(Some(selector.key_filter.clone()));
    }
    Ok(None)
}
