//! Refresh service module facade.
//!
//! This module re-exports the store configuration, the loader and the
//! pull-refresh coordinator while wiring the submodules that implement the
//! watch state and the refresh decision engine.

pub(crate) mod config;
mod core;
pub(crate) mod loader;
pub(crate) mod refresh;
pub(crate) mod state;
pub(crate) mod telemetry;
#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    ConfigurationError, FeatureFlagConfig, MonitoringConfig, ProviderConfig, StoreConfig,
    WatchTrigger, DEFAULT_PREKILL_TIME, DEFAULT_REFRESH_INTERVAL, MAX_CONFIGURED_DURATION,
    MIN_REFRESH_INTERVAL,
};
pub use core::*;
pub use loader::{LoadReport, LoadedStore, StoreLoader};
pub use refresh::FORCED_REFRESH_MESSAGE;
pub use state::{feature_flag_key, RefreshState, State, StateHolder, MAX_EXPIRE_JITTER};
pub use telemetry::RefreshTelemetry;
