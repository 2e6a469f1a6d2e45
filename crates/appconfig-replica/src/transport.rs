//! Transport seam between replica clients and the configuration-store API.
//!
//! The wire protocol lives behind [`ConfigurationTransport`]; this crate only
//! needs "fetch one setting", "list settings matching a selector", and "apply
//! a sync token". [`TransportProvider`] is where hosts plug in credentials:
//! it receives the endpoint (and connection string, when one was configured)
//! of each replica and returns a transport bound to it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replica::ConnectionString;
use crate::service::ConfigurationError;

/// Label value the store uses to mean "no label".
pub const EMPTY_LABEL: &str = "\0";

/// Key prefix under which feature flags are stored.
pub const FEATURE_FLAG_PREFIX: &str = ".appconfig.featureflag/";

/// A single configuration setting as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Setting {
    /// Setting key.
    pub key: String,
    /// Normalised label; `None` means no label.
    pub label: Option<String>,
    /// Raw value.
    pub value: Option<String>,
    /// Opaque version token; equal ETags mean the setting did not change.
    pub etag: Option<String>,
    /// Optional content type (feature flags use a dedicated one).
    pub content_type: Option<String>,
}

impl Setting {
    /// Creates a setting with the given key and label and no value or ETag.
    pub fn new(key: impl Into<String>, label: Option<&str>) -> Self {
        Self {
            key: key.into(),
            label: normalize_label(label),
            ..Default::default()
        }
    }

    /// Sets the ETag.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Sets the value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Key and label filter used for bulk listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingSelector {
    /// Key filter, `*` wildcards allowed.
    pub key_filter: String,
    /// Label filter; `None` selects settings without a label.
    pub label_filter: Option<String>,
}

impl Default for SettingSelector {
    fn default() -> Self {
        Self {
            key_filter: "*".into(),
            label_filter: None,
        }
    }
}

impl SettingSelector {
    /// Creates a selector from a key filter and an optional label filter.
    pub fn new(key_filter: impl Into<String>, label_filter: Option<&str>) -> Self {
        Self {
            key_filter: key_filter.into(),
            label_filter: normalize_label(label_filter),
        }
    }
}

/// Maps the empty label and the store's null-label sentinel to `None`.
pub fn normalize_label(label: Option<&str>) -> Option<String> {
    match label {
        None => None,
        Some(value) if value.is_empty() || value == EMPTY_LABEL => None,
        Some(value) => Some(value.to_owned()),
    }
}

/// Failure reported by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The store answered with a non-success HTTP status.
    #[error("http status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Message or body excerpt returned by the store.
        message: String,
    },
    /// DNS, socket, TLS or connection-refused failure.
    #[error("connection failure: {0}")]
    Connectivity(String),
    /// The transport's own timeout elapsed.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Anything else, e.g. an undecodable response.
    #[error("{0}")]
    Other(String),
}

/// Classification of an HTTP status returned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx.
    Success,
    /// 408, 429 and every 5xx: another replica or a later attempt may succeed.
    Retryable,
    /// Every other status: retrying elsewhere will not help.
    Fatal,
}

/// Maps an HTTP status code to the retry taxonomy.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        // Request timeout and throttling are transient even though they are 4xx.
        408 | 429 => StatusClass::Retryable,
        500..=u16::MAX => StatusClass::Retryable,
        _ => StatusClass::Fatal,
    }
}

/// Operations a replica client needs from the configuration store.
#[async_trait]
pub trait ConfigurationTransport: Send + Sync + fmt::Debug {
    /// Fetches one setting; `Ok(None)` when the key/label pair does not exist.
    async fn get_setting(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<Setting>, TransportError>;

    /// Lists every setting matching `selector`, fully materialised.
    async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<Setting>, TransportError>;

    /// Applies a sync token received out of band (e.g. from a push notification).
    fn update_sync_token(&self, token: &str);
}

/// Replica endpoint plus the credentials configured for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    /// Normalised endpoint URL.
    pub endpoint: String,
    /// Connection string, when the store was configured with connection strings.
    pub connection_string: Option<ConnectionString>,
}

/// Builds transports for replica endpoints (the credential seam).
pub trait TransportProvider: Send + Sync {
    /// Returns a transport bound to `target`.
    fn connect(
        &self,
        target: &ReplicaTarget,
    ) -> Result<Arc<dyn ConfigurationTransport>, ConfigurationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_retry_taxonomy() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(204), StatusClass::Success);
        assert_eq!(classify_status(408), StatusClass::Retryable);
        assert_eq!(classify_status(429), StatusClass::Retryable);
        assert_eq!(classify_status(500), StatusClass::Retryable);
        assert_eq!(classify_status(503), StatusClass::Retryable);
        assert_eq!(classify_status(599), StatusClass::Retryable);
        assert_eq!(classify_status(400), StatusClass::Fatal);
        assert_eq!(classify_status(401), StatusClass::Fatal);
        assert_eq!(classify_status(403), StatusClass::Fatal);
        assert_eq!(classify_status(404), StatusClass::Fatal);
        assert_eq!(classify_status(302), StatusClass::Fatal);
    }

    #[test]
    fn empty_and_sentinel_labels_normalise_to_none() {
        assert_eq!(normalize_label(None), None);
        assert_eq!(normalize_label(Some("")), None);
        assert_eq!(normalize_label(Some(EMPTY_LABEL)), None);
        assert_eq!(normalize_label(Some("prod")), Some("prod".to_string()));
    }

    #[test]
    fn setting_builder_normalises_label() {
        let setting = Setting::new("app/color", Some("")).with_etag("v1");
        assert_eq!(setting.label, None);
        assert_eq!(setting.etag.as_deref(), Some("v1"));
    }

    #[test]
    fn default_selector_matches_all_unlabelled_keys() {
        let selector = SettingSelector::default();
        assert_eq!(selector.key_filter, "*");
        assert_eq!(selector.label_filter, None);
    }
}
