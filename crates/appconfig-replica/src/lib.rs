//! Public entry points for the App Configuration replica crate.
//!
//! The crate decides which geo-replica of a configuration store to query,
//! tracks per-replica backoff and per-store health, and runs the polling
//! protocol that detects changed settings and feature flags by ETag. HTTP
//! access is supplied by the host through [`ConfigurationTransport`].

pub mod backoff;
pub mod config;
pub mod replica;
pub mod service;
pub mod status;
pub mod telemetry;
pub mod transport;

pub use backoff::{calculate_backoff, calculate_backoff_with, BackoffBounds, BackoffError};
pub use config::AppConfigEnv;
pub use replica::{
    normalize_endpoint, ConnectionManager, ConnectionString, ReplicaClient, ReplicaClientFactory,
    ReplicaError,
};
pub use service::{
    BroadcastPublisher, ConfigurationError, FeatureFlagConfig, LoadReport, LoadedStore,
    MonitoringConfig, PollerHandle, ProviderConfig, PullRefresh, RefreshEvent,
    RefreshEventPublisher, RefreshState, RefreshTelemetry, ServiceError, StateHolder, StoreConfig,
    StoreLoader, WatchTrigger, FORCED_REFRESH_MESSAGE,
};
pub use status::{health_json, overall_health, StoreHealth};
pub use telemetry::{CountingTelemetry, TelemetryCounters, TelemetrySnapshot};
pub use transport::{
    classify_status, ConfigurationTransport, ReplicaTarget, Setting, SettingSelector,
    StatusClass, TransportError, TransportProvider,
};
