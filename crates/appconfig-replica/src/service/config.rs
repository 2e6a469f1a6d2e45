//! Static configuration for stores and for the refresh runtime.
//!
//! A [`StoreConfig`] describes one logical App Configuration store and the
//! replicas it may be reached through. [`ProviderConfig`] carries the
//! process-wide knobs: forced refresh cadence and backoff bounds.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::backoff::{BackoffBounds, DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF};
use crate::replica::{normalize_endpoint, ConnectionString};
use crate::transport::{SettingSelector, FEATURE_FLAG_PREFIX};

/// Default cadence for key-value and feature-flag refresh checks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Shortest refresh interval accepted anywhere.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
/// Default window after startup during which a fail-fast abort is delayed.
pub const DEFAULT_PREKILL_TIME: Duration = Duration::from_secs(5);
/// Longest interval, backoff or delay accepted from configuration.
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Fatal configuration problems; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// More than one of endpoint/endpoints/connection-string/connection-strings was set.
    #[error("more than 1 connection method was set for connecting to App Configuration")]
    MultipleConnectionMethods,
    /// None of the connection methods was set.
    #[error("no connection method was set for connecting to App Configuration")]
    NoConnectionMethod,
    /// A connection string could not be parsed.
    #[error("malformed connection string: {0}")]
    MalformedConnectionString(String),
    /// Monitoring was enabled with a refresh interval below one second or above one day.
    #[error("refresh interval must be between 1 second and 1 day")]
    InvalidRefreshInterval,
    /// Monitoring was enabled without any trigger key.
    #[error("monitoring is enabled for {0} but no triggers are configured")]
    MissingTriggers(String),
    /// The origin endpoint is not registered with the factory.
    #[error("no store registered for endpoint {0}")]
    UnknownStore(String),
    /// An environment value could not be parsed.
    #[error("invalid value {value:?} for {name}")]
    InvalidSetting {
        /// Variable name.
        name: String,
        /// Offending raw value.
        value: String,
    },
}

/// A (key, label) pair whose ETag is polled to detect changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTrigger {
    /// Watched key.
    pub key: String,
    /// Watched label; `None` means no label.
    pub label: Option<String>,
}

impl WatchTrigger {
    /// Creates a trigger for `key` and an optional label.
    pub fn new(key: impl Into<String>, label: Option<&str>) -> Self {
        Self {
            key: key.into(),
            label: crate::transport::normalize_label(label),
        }
    }
}

/// Refresh-check settings for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Whether key-value refresh checks run for this store.
    pub enabled: bool,
    /// Cadence of key-value checks.
    pub refresh_interval: Duration,
    /// Cadence of feature-flag checks.
    pub feature_flag_refresh_interval: Duration,
    /// Keys whose ETags are polled.
    pub triggers: Vec<WatchTrigger>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            feature_flag_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            triggers: Vec::new(),
        }
    }
}

/// Feature-flag selection for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlagConfig {
    /// Whether feature flags are loaded and watched.
    pub enabled: bool,
    /// Key filter appended to the feature-flag prefix.
    pub key_filter: String,
    /// Label filter.
    pub label_filter: Option<String>,
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_filter: "*".into(),
            label_filter: None,
        }
    }
}

impl FeatureFlagConfig {
    /// Selector listing every flag this store exposes.
    pub fn selector(&self) -> SettingSelector {
        SettingSelector::new(
            format!("{FEATURE_FLAG_PREFIX}{}", self.key_filter),
            self.label_filter.as_deref(),
        )
    }
}

/// One logical configuration store and its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Single endpoint.
    pub endpoint: Option<String>,
    /// Ordered replica endpoints; the first one is the origin.
    pub endpoints: Vec<String>,
    /// Single connection string.
    pub connection_string: Option<String>,
    /// Ordered replica connection strings; the first one is the origin.
    pub connection_strings: Vec<String>,
    /// Disabled stores are neither loaded nor watched.
    pub enabled: bool,
    /// Abort loading (after the pre-kill delay) instead of continuing without this store.
    pub fail_fast: bool,
    /// Selectors for the settings loaded from this store.
    pub selects: Vec<SettingSelector>,
    /// Refresh-check settings.
    pub monitoring: MonitoringConfig,
    /// Feature-flag settings.
    pub feature_flags: FeatureFlagConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            endpoints: Vec::new(),
            connection_string: None,
            connection_strings: Vec::new(),
            enabled: true,
            fail_fast: true,
            selects: vec![SettingSelector::default()],
            monitoring: MonitoringConfig::default(),
            feature_flags: FeatureFlagConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Store reached through a single endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    /// Store reached through an ordered list of replica endpoints.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Store reached through a single connection string.
    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            ..Default::default()
        }
    }

    /// Number of connection methods set (valid configurations have exactly one).
    fn connection_methods(&self) -> usize {
        [
            self.endpoint.is_some(),
            !self.endpoints.is_empty(),
            self.connection_string.is_some(),
            !self.connection_strings.is_empty(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Fails unless exactly one connection method is configured.
    pub fn connection_method(&self) -> Result<(), ConfigurationError> {
        match self.connection_methods() {
            0 => Err(ConfigurationError::NoConnectionMethod),
            1 => Ok(()),
            _ => Err(ConfigurationError::MultipleConnectionMethods),
        }
    }

    /// Every replica endpoint in configured order, origin first.
    pub fn configured_endpoints(&self) -> Result<Vec<String>, ConfigurationError> {
        self.connection_method()?;
        if let Some(endpoint) = &self.endpoint {
            return Ok(vec![normalize_endpoint(endpoint)]);
        }
        if !self.endpoints.is_empty() {
            return Ok(self.endpoints.iter().map(|e| normalize_endpoint(e)).collect());
        }
        let strings: Vec<&String> = match &self.connection_string {
            Some(single) => vec![single],
            None => self.connection_strings.iter().collect(),
        };
        strings
            .into_iter()
            .map(|raw| ConnectionString::parse(raw).map(|parsed| parsed.endpoint))
            .collect()
    }

    /// Endpoint identifying this store; also its key in every per-store map.
    pub fn origin_endpoint(&self) -> Result<String, ConfigurationError> {
        self.configured_endpoints()?
            .into_iter()
            .next()
            .ok_or(ConfigurationError::NoConnectionMethod)
    }

    /// Validates connection and monitoring settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let origin = self.origin_endpoint()?;
        if self.monitoring.enabled {
            if self.monitoring.triggers.is_empty() {
                return Err(ConfigurationError::MissingTriggers(origin));
            }
            let intervals = [
                self.monitoring.refresh_interval,
                self.monitoring.feature_flag_refresh_interval,
            ];
            if intervals
                .iter()
                .any(|i| *i < MIN_REFRESH_INTERVAL || *i > MAX_CONFIGURED_DURATION)
            {
                return Err(ConfigurationError::InvalidRefreshInterval);
            }
        }
        Ok(())
    }
}

/// Process-wide refresh settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Interval after which a refresh is forced regardless of watch keys.
    pub refresh_interval: Option<Duration>,
    /// Backoff after the first failure.
    pub default_min_backoff: Duration,
    /// Backoff ceiling.
    pub default_max_backoff: Duration,
    /// Window after startup during which a fail-fast abort is delayed.
    pub prekill_time: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            refresh_interval: None,
            default_min_backoff: DEFAULT_MIN_BACKOFF,
            default_max_backoff: DEFAULT_MAX_BACKOFF,
            prekill_time: DEFAULT_PREKILL_TIME,
        }
    }
}

impl ProviderConfig {
    /// Backoff bounds derived from this configuration.
    pub fn backoff_bounds(&self) -> BackoffBounds {
        BackoffBounds::new(self.default_min_backoff, self.default_max_backoff)
    }

    /// Replaces inconsistent values with safe ones, logging each correction.
    pub fn sanitise(mut self) -> Self {
        self.default_min_backoff = cap_duration("min backoff", self.default_min_backoff);
        self.default_max_backoff = cap_duration("max backoff", self.default_max_backoff);
        self.prekill_time = cap_duration("pre-kill time", self.prekill_time);
        if self.default_min_backoff > self.default_max_backoff {
            warn!(
                "app-configuration: min backoff {:?} exceeds max backoff {:?}; using {:?}/{:?}",
                self.default_min_backoff,
                self.default_max_backoff,
                DEFAULT_MIN_BACKOFF,
                DEFAULT_MAX_BACKOFF
            );
            self.default_min_backoff = DEFAULT_MIN_BACKOFF;
            self.default_max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if let Some(interval) = self.refresh_interval {
            if interval < MIN_REFRESH_INTERVAL {
                warn!(
                    "app-configuration: forced refresh interval {:?} below minimum {:?}; clamping",
                    interval, MIN_REFRESH_INTERVAL
                );
                self.refresh_interval = Some(MIN_REFRESH_INTERVAL);
            } else {
                self.refresh_interval = Some(cap_duration("forced refresh interval", interval));
            }
        }
        self
    }
}

/// Lowers `value` to [`MAX_CONFIGURED_DURATION`], logging when it was above.
fn cap_duration(name: &str, value: Duration) -> Duration {
    if value > MAX_CONFIGURED_DURATION {
        warn!(
            "app-configuration: {name} {:?} above maximum {:?}; clamping",
            value, MAX_CONFIGURED_DURATION
        );
        MAX_CONFIGURED_DURATION
    } else {
        value
    }
}
