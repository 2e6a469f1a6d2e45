//! Pull-refresh coordination.
//!
//! [`PullRefresh`] is the entry point hosts call from a timer or on demand.
//! It lets one refresh pass run at a time, publishes a [`RefreshEvent`] when
//! the pass finds a change, and pushes the refresh timers back when the pass
//! fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::config::{ConfigurationError, ProviderConfig, MIN_REFRESH_INTERVAL};
use super::refresh::RefreshCheck;
use super::state::RefreshState;
use super::telemetry::{NoopTelemetry, RefreshTelemetry};
use crate::replica::{ReplicaClientFactory, ReplicaError};
use crate::status::StoreHealth;

/// Default capacity of a [`BroadcastPublisher`] channel.
const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Error type surfaced by the loader and the refresh coordinator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Invalid or ambiguous store configuration.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    /// A replica failed in a way that retrying elsewhere does not fix.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    /// Every replica of a store failed with retryable errors.
    #[error("no replica of {origin} could be reached")]
    StoreUnavailable {
        /// Origin endpoint of the store.
        origin: String,
    },
}

/// Notification that configuration changed and should be reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
    /// Human-readable trigger: the changed key, or the forced-refresh notice.
    pub message: String,
    /// Store that triggered the refresh; `None` for forced refreshes.
    pub origin_endpoint: Option<String>,
}

impl RefreshEvent {
    /// Creates an event.
    pub fn new(message: impl Into<String>, origin_endpoint: Option<String>) -> Self {
        Self {
            message: message.into(),
            origin_endpoint,
        }
    }
}

/// Sink accepting "configuration changed" events.
pub trait RefreshEventPublisher: Send + Sync {
    /// Publishes `event`; must not block.
    fn publish(&self, event: RefreshEvent);
}

/// Publisher fanning events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<RefreshEvent>,
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl BroadcastPublisher {
    /// Creates a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.sender.subscribe()
    }
}

impl RefreshEventPublisher for BroadcastPublisher {
    fn publish(&self, event: RefreshEvent) {
        if self.sender.send(event).is_err() {
            debug!("app-configuration: refresh event dropped, no subscribers");
        }
    }
}

/// Clears the running flag when a refresh pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-flight refresh coordinator.
pub struct PullRefresh {
    factory: Arc<ReplicaClientFactory>,
    state: Arc<RefreshState>,
    config: ProviderConfig,
    publisher: Arc<dyn RefreshEventPublisher>,
    telemetry: RwLock<Arc<dyn RefreshTelemetry>>,
    running: AtomicBool,
}

impl std::fmt::Debug for PullRefresh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullRefresh")
            .field("factory", &self.factory)
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl PullRefresh {
    /// Builds a coordinator over shared registry and state; `config` is sanitised first.
    pub fn new(
        factory: Arc<ReplicaClientFactory>,
        state: Arc<RefreshState>,
        config: ProviderConfig,
        publisher: Arc<dyn RefreshEventPublisher>,
    ) -> Self {
        Self {
            factory,
            state,
            config: config.sanitise(),
            publisher,
            telemetry: RwLock::new(Arc::new(NoopTelemetry)),
            running: AtomicBool::new(false),
        }
    }

    /// Replaces the telemetry sink.
    pub fn set_telemetry(&self, telemetry: Arc<dyn RefreshTelemetry>) {
        *self
            .telemetry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = telemetry;
    }

    fn telemetry(&self) -> Arc<dyn RefreshTelemetry> {
        self.telemetry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shared replica registry.
    pub fn factory(&self) -> &Arc<ReplicaClientFactory> {
        &self.factory
    }

    /// Shared refresh state.
    pub fn state(&self) -> &Arc<RefreshState> {
        &self.state
    }

    /// Runs one refresh pass unless one is already running.
    ///
    /// Returns `Ok(true)` when a refresh event was published and `Ok(false)`
    /// when nothing changed or another pass was in flight. On error the
    /// overdue refresh timers are pushed back before the error is returned.
    pub async fn refresh_configurations(&self) -> Result<bool, ServiceError> {
        let telemetry = self.telemetry();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("app-configuration: refresh check already running, skipping");
            telemetry.on_refresh_skipped();
            return Ok(false);
        }
        let _running = RunningGuard(&self.running);

        let check = RefreshCheck {
            factory: &self.factory,
            state: &self.state,
            config: &self.config,
            telemetry: telemetry.as_ref(),
        };
        match check.run().await {
            Ok(Some(event)) => {
                info!(
                    trigger = %event.message,
                    "app-configuration: publishing refresh event"
                );
                telemetry.on_refresh_signaled(&event.message);
                self.publisher.publish(event);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(error) => {
                let bounds = self.config.backoff_bounds();
                self.state.update(|holder| {
                    holder.update_next_refresh_time(self.config.refresh_interval, &bounds)
                });
                warn!(%error, "app-configuration: refresh check failed");
                telemetry.on_refresh_error(&error);
                Err(error)
            }
        }
    }

    /// Forces an early check of the store `endpoint` belongs to.
    ///
    /// The sync token is only forwarded when that store has a single replica.
    pub fn expire_refresh_interval(&self, endpoint: &str, sync_token: Option<&str>) {
        let origin = self.factory.find_origin_for_endpoint(endpoint);
        if !self.factory.has_replicas(&origin) {
            self.factory.update_sync_token(&origin, sync_token);
        }
        debug!(origin = %origin, "app-configuration: expiring refresh interval");
        self.state.update(|holder| holder.expire_state(&origin));
    }

    /// Health of every registered store keyed by origin endpoint.
    pub fn stores_health(&self) -> BTreeMap<String, StoreHealth> {
        self.factory.health()
    }

    /// Spawns a task calling [`PullRefresh::refresh_configurations`] every `period`.
    ///
    /// Periods shorter than [`MIN_REFRESH_INTERVAL`] are raised to it.
    pub fn spawn_poller(self: Arc<Self>, period: Duration) -> PollerHandle {
        let period = if period < MIN_REFRESH_INTERVAL {
            warn!(
                ?period,
                minimum = ?MIN_REFRESH_INTERVAL,
                "app-configuration: poll period below minimum; clamping"
            );
            MIN_REFRESH_INTERVAL
        } else {
            period
        };
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.refresh_configurations().await {
                            warn!(%error, "app-configuration: background refresh failed");
                        }
                    }
                }
            }
            debug!("app-configuration: refresh poller stopped");
        });
        PollerHandle {
            shutdown,
            join_handle,
        }
    }
}

/// Handle returned by [`PullRefresh::spawn_poller`].
pub struct PollerHandle {
    shutdown: broadcast::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("finished", &self.join_handle.is_finished())
            .finish()
    }
}

impl PollerHandle {
    /// Stops the poller and waits for its task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(error) = self.join_handle.await {
            warn!(%error, "app-configuration: refresh poller ended abnormally");
        }
    }
}
