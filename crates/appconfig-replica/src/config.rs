//! Environment-driven configuration.
//!
//! Builds a single-store configuration and the process-wide refresh settings
//! from `AZURE_APPCONFIGURATION_*` variables. Durations are given in whole
//! seconds.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::service::{
    ConfigurationError, FeatureFlagConfig, MonitoringConfig, ProviderConfig, StoreConfig,
    WatchTrigger, MAX_CONFIGURED_DURATION,
};

const ENV_ENDPOINT: &str = "AZURE_APPCONFIGURATION_ENDPOINT";
const ENV_ENDPOINTS: &str = "AZURE_APPCONFIGURATION_ENDPOINTS";
const ENV_CONNECTION_STRING: &str = "AZURE_APPCONFIGURATION_CONNECTION_STRING";
const ENV_CONNECTION_STRINGS: &str = "AZURE_APPCONFIGURATION_CONNECTION_STRINGS";
const ENV_ENABLED: &str = "AZURE_APPCONFIGURATION_ENABLED";
const ENV_FAIL_FAST: &str = "AZURE_APPCONFIGURATION_FAIL_FAST";
const ENV_MONITORING_ENABLED: &str = "AZURE_APPCONFIGURATION_MONITORING_ENABLED";
const ENV_REFRESH_INTERVAL: &str = "AZURE_APPCONFIGURATION_REFRESH_INTERVAL";
const ENV_FEATURE_FLAG_REFRESH_INTERVAL: &str =
    "AZURE_APPCONFIGURATION_FEATURE_FLAG_REFRESH_INTERVAL";
const ENV_TRIGGER_KEYS: &str = "AZURE_APPCONFIGURATION_TRIGGER_KEYS";
const ENV_FEATURE_FLAGS_ENABLED: &str = "AZURE_APPCONFIGURATION_FEATURE_FLAGS_ENABLED";
const ENV_FEATURE_FLAG_LABEL: &str = "AZURE_APPCONFIGURATION_FEATURE_FLAG_LABEL";
const ENV_FORCED_REFRESH_INTERVAL: &str = "AZURE_APPCONFIGURATION_FORCED_REFRESH_INTERVAL";
const ENV_MIN_BACKOFF: &str = "AZURE_APPCONFIGURATION_MIN_BACKOFF";
const ENV_MAX_BACKOFF: &str = "AZURE_APPCONFIGURATION_MAX_BACKOFF";
const ENV_PREKILL_TIME: &str = "AZURE_APPCONFIGURATION_PREKILL_TIME";

const MAX_SECONDS: i64 = MAX_CONFIGURED_DURATION.as_secs() as i64;

/// Separates a trigger key from its label in `TRIGGER_KEYS`.
const LABEL_SEPARATOR: char = '@';

/// Store and provider settings captured from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigEnv {
    /// The single store described by the environment.
    pub store: StoreConfig,
    /// Process-wide refresh settings.
    pub provider: ProviderConfig,
}

impl AppConfigEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Result<Self, ConfigurationError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| map.get(name).and_then(|v| sanitize_non_empty(v));

        let monitoring_defaults = MonitoringConfig::default();
        let monitoring = MonitoringConfig {
            enabled: parse_bool(map.get(ENV_MONITORING_ENABLED).map(String::as_str), false),
            refresh_interval: parse_seconds(&map, ENV_REFRESH_INTERVAL)?
                .unwrap_or(monitoring_defaults.refresh_interval),
            feature_flag_refresh_interval: parse_seconds(&map, ENV_FEATURE_FLAG_REFRESH_INTERVAL)?
                .unwrap_or(monitoring_defaults.feature_flag_refresh_interval),
            triggers: get(ENV_TRIGGER_KEYS)
                .map(|raw| parse_triggers(&raw))
                .unwrap_or_default(),
        };
        let feature_flags = FeatureFlagConfig {
            enabled: parse_bool(map.get(ENV_FEATURE_FLAGS_ENABLED).map(String::as_str), false),
            label_filter: get(ENV_FEATURE_FLAG_LABEL),
            ..Default::default()
        };
        let store = StoreConfig {
            endpoint: get(ENV_ENDPOINT),
            endpoints: get(ENV_ENDPOINTS).map(|raw| split_list(&raw)).unwrap_or_default(),
            connection_string: get(ENV_CONNECTION_STRING),
            connection_strings: get(ENV_CONNECTION_STRINGS)
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            enabled: parse_bool(map.get(ENV_ENABLED).map(String::as_str), true),
            fail_fast: parse_bool(map.get(ENV_FAIL_FAST).map(String::as_str), true),
            monitoring,
            feature_flags,
            ..Default::default()
        };

        let provider_defaults = ProviderConfig::default();
        let provider = ProviderConfig {
            refresh_interval: parse_seconds(&map, ENV_FORCED_REFRESH_INTERVAL)?,
            default_min_backoff: parse_seconds(&map, ENV_MIN_BACKOFF)?
                .unwrap_or(provider_defaults.default_min_backoff),
            default_max_backoff: parse_seconds(&map, ENV_MAX_BACKOFF)?
                .unwrap_or(provider_defaults.default_max_backoff),
            prekill_time: parse_seconds(&map, ENV_PREKILL_TIME)?
                .unwrap_or(provider_defaults.prekill_time),
        }
        .sanitise();

        Ok(Self { store, provider })
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

/// Parses a whole number of seconds; negative, non-numeric or over-a-day values are rejected.
fn parse_seconds(
    map: &HashMap<String, String>,
    name: &str,
) -> Result<Option<Duration>, ConfigurationError> {
    let Some(raw) = map.get(name).and_then(|v| sanitize_non_empty(v)) else {
        return Ok(None);
    };
    match raw.parse::<i64>() {
        Ok(seconds) if (0..=MAX_SECONDS).contains(&seconds) => {
            Ok(Some(Duration::from_secs(seconds as u64)))
        }
        _ => Err(ConfigurationError::InvalidSetting {
            name: name.to_string(),
            value: raw,
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').filter_map(sanitize_non_empty).collect()
}

/// Parses `key` or `key@label` entries.
fn parse_triggers(raw: &str) -> Vec<WatchTrigger> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once(LABEL_SEPARATOR) {
            Some((key, label)) => WatchTrigger::new(key.trim(), Some(label.trim())),
            None => WatchTrigger::new(entry, None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Result<AppConfigEnv, ConfigurationError> {
        AppConfigEnv::from_env_iter(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn defaults_apply_when_only_endpoint_is_set() {
        let env = env(&[(ENV_ENDPOINT, " https://store.azconfig.io ")]).unwrap();
        assert_eq!(env.store.endpoint.as_deref(), Some("https://store.azconfig.io"));
        assert!(env.store.enabled);
        assert!(env.store.fail_fast);
        assert!(!env.store.monitoring.enabled);
        assert_eq!(env.store.monitoring.refresh_interval, Duration::from_secs(30));
        assert_eq!(env.provider, ProviderConfig::default());
        assert_eq!(env.store.validate(), Ok(()));
    }

    #[test]
    fn lists_and_triggers_are_split() {
        let env = env(&[
            (ENV_ENDPOINTS, "https://a.azconfig.io, https://b.azconfig.io,"),
            (ENV_MONITORING_ENABLED, "yes"),
            (ENV_TRIGGER_KEYS, "sentinel, app/refresh@prod"),
            (ENV_REFRESH_INTERVAL, "90"),
        ])
        .unwrap();
        assert_eq!(
            env.store.endpoints,
            ["https://a.azconfig.io", "https://b.azconfig.io"]
        );
        assert!(env.store.monitoring.enabled);
        assert_eq!(
            env.store.monitoring.triggers,
            [
                WatchTrigger::new("sentinel", None),
                WatchTrigger::new("app/refresh", Some("prod")),
            ]
        );
        assert_eq!(env.store.monitoring.refresh_interval, Duration::from_secs(90));
    }

    #[test]
    fn provider_settings_are_parsed_and_sanitised() {
        let env = env(&[
            (ENV_FORCED_REFRESH_INTERVAL, "3600"),
            (ENV_MIN_BACKOFF, "700"),
            (ENV_MAX_BACKOFF, "60"),
            (ENV_PREKILL_TIME, "0"),
        ])
        .unwrap();
        assert_eq!(env.provider.refresh_interval, Some(Duration::from_secs(3600)));
        assert_eq!(env.provider.default_min_backoff, Duration::from_secs(30));
        assert_eq!(env.provider.default_max_backoff, Duration::from_secs(600));
        assert_eq!(env.provider.prekill_time, Duration::ZERO);
    }

    #[test]
    fn negative_or_garbage_durations_are_rejected() {
        for value in ["-5", "soon"] {
            assert_eq!(
                env(&[(ENV_MIN_BACKOFF, value)]),
                Err(ConfigurationError::InvalidSetting {
                    name: ENV_MIN_BACKOFF.into(),
                    value: value.into(),
                })
            );
        }
    }

    #[test]
    fn durations_above_one_day_are_rejected() {
        for name in [
            ENV_FORCED_REFRESH_INTERVAL,
            ENV_REFRESH_INTERVAL,
            ENV_PREKILL_TIME,
            ENV_MAX_BACKOFF,
        ] {
            assert_eq!(
                env(&[(name, "9223372036854775807")]),
                Err(ConfigurationError::InvalidSetting {
                    name: name.into(),
                    value: "9223372036854775807".into(),
                })
            );
        }
        let env = env(&[(ENV_FORCED_REFRESH_INTERVAL, "86400")]).unwrap();
        assert_eq!(env.provider.refresh_interval, Some(MAX_CONFIGURED_DURATION));
    }

    #[test]
    fn parse_bool_permits_common_variants() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("Y"), false));
        assert!(!parse_bool(Some("0"), true));
        assert!(!parse_bool(Some("No"), true));
        assert!(parse_bool(Some("maybe"), true));
        assert!(!parse_bool(None, false));
    }

    #[test]
    fn feature_flag_settings_are_read() {
        let env = env(&[
            (ENV_CONNECTION_STRING, "Endpoint=https://a.azconfig.io;Id=1;Secret=s"),
            (ENV_FEATURE_FLAGS_ENABLED, "1"),
            (ENV_FEATURE_FLAG_LABEL, "prod"),
            (ENV_FAIL_FAST, "false"),
        ])
        .unwrap();
        assert!(env.store.feature_flags.enabled);
        assert_eq!(env.store.feature_flags.label_filter.as_deref(), Some("prod"));
        assert!(!env.store.fail_fast);
        assert_eq!(env.store.origin_endpoint().unwrap(), "https://a.azconfig.io");
    }
}
