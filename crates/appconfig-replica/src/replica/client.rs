//! Client bound to one physical replica of a configuration store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::time::Instant;

use crate::transport::{
    classify_status, ConfigurationTransport, Setting, SettingSelector, StatusClass, TransportError,
};

/// Failure reported by a [`ReplicaClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// Throttling, timeouts, 5xx and connectivity problems; another replica may succeed.
    #[error("replica {endpoint} is temporarily unavailable: {message}")]
    Retryable {
        /// Replica endpoint.
        endpoint: String,
        /// HTTP status, absent for connectivity failures.
        status: Option<u16>,
        /// Transport message.
        message: String,
    },
    /// Any other HTTP status; retrying against a different replica will not help.
    #[error("replica {endpoint} rejected the request with status {status}: {message}")]
    Service {
        /// Replica endpoint.
        endpoint: String,
        /// HTTP status.
        status: u16,
        /// Transport message.
        message: String,
    },
    /// Anything else, such as an undecodable response.
    #[error("unexpected failure talking to {endpoint}: {message}")]
    Unexpected {
        /// Replica endpoint.
        endpoint: String,
        /// Transport message.
        message: String,
    },
}

impl ReplicaError {
    /// Whether the caller should back off this replica and try the next one.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Endpoint of the replica that failed.
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Retryable { endpoint, .. }
            | Self::Service { endpoint, .. }
            | Self::Unexpected { endpoint, .. } => endpoint,
        }
    }

    fn from_transport(endpoint: &str, error: TransportError) -> Self {
        let endpoint = endpoint.to_string();
        match error {
            TransportError::Status { status, message } => match classify_status(status) {
                StatusClass::Retryable => Self::Retryable {
                    endpoint,
                    status: Some(status),
                    message,
                },
                // A success code reported as an error is still not something a retry fixes.
                StatusClass::Success | StatusClass::Fatal => Self::Service {
                    endpoint,
                    status,
                    message,
                },
            },
            TransportError::Connectivity(message) | TransportError::Timeout(message) => {
                Self::Retryable {
                    endpoint,
                    status: None,
                    message,
                }
            }
            TransportError::Other(message) => Self::Unexpected { endpoint, message },
        }
    }
}

/// One replica endpoint together with its failure bookkeeping.
///
/// The client only counts failures; [`super::ConnectionManager`] decides the
/// backoff window and stores it through [`ReplicaClient::update_backoff_end_time`].
#[derive(Debug)]
pub struct ReplicaClient {
    endpoint: String,
    transport: Arc<dyn ConfigurationTransport>,
    backoff_end_time: Mutex<Instant>,
    failed_attempts: AtomicU32,
}

impl ReplicaClient {
    /// Wraps `transport` for `endpoint`; the replica starts out usable.
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn ConfigurationTransport>) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            backoff_end_time: Mutex::new(Instant::now()),
            failed_attempts: AtomicU32::new(0),
        }
    }

    /// Replica endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Instant before which this replica must not be used.
    pub fn backoff_end_time(&self) -> Instant {
        *self
            .backoff_end_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Consecutive failures since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Whether the backoff window has elapsed at `now`.
    pub fn is_available_at(&self, now: Instant) -> bool {
        self.backoff_end_time() <= now
    }

    /// Parks the replica until `until` and counts one more failure.
    pub fn update_backoff_end_time(&self, until: Instant) {
        *self
            .backoff_end_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = until;
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Fetches a watched key; `Ok(None)` when it does not exist.
    pub async fn get_watch_key(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<Setting>, ReplicaError> {
        let result = self.transport.get_setting(key, label).await;
        self.record(result)
    }

    /// Lists every setting matching `selector`.
    pub async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<Setting>, ReplicaError> {
        let result = self.transport.list_settings(selector).await;
        self.record(result)
    }

    /// Forwards a sync token to the transport; `None` is ignored.
    pub fn update_sync_token(&self, token: Option<&str>) {
        if let Some(token) = token {
            self.transport.update_sync_token(token);
        }
    }

    fn record<T>(&self, result: Result<T, TransportError>) -> Result<T, ReplicaError> {
        match result {
            Ok(value) => {
                self.failed_attempts.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(error) => Err(ReplicaError::from_transport(&self.endpoint, error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::MockTransport;
    use std::time::Duration;

    const ENDPOINT: &str = "https://store.azconfig.io";

    fn client(transport: &Arc<MockTransport>) -> ReplicaClient {
        ReplicaClient::new(ENDPOINT, transport.clone())
    }

    #[tokio::test]
    async fn success_resets_failed_attempts() {
        let transport = MockTransport::new();
        transport.set_setting(Setting::new("sentinel", None).with_etag("v1"));
        let client = client(&transport);
        client.update_backoff_end_time(Instant::now());
        client.update_backoff_end_time(Instant::now());
        assert_eq!(client.failed_attempts(), 2);

        let setting = client.get_watch_key("sentinel", None).await.unwrap();
        assert_eq!(setting.and_then(|s| s.etag).as_deref(), Some("v1"));
        assert_eq!(client.failed_attempts(), 0);
    }

    #[tokio::test]
    async fn missing_key_is_not_an_error() {
        let transport = MockTransport::new();
        let client = client(&transport);
        assert_eq!(client.get_watch_key("absent", Some("prod")).await, Ok(None));
    }

    #[tokio::test]
    async fn transient_statuses_are_retryable() {
        for status in [408, 429, 500, 503] {
            let transport = MockTransport::new();
            transport.push_error(TransportError::Status {
                status,
                message: "busy".into(),
            });
            let error = client(&transport)
                .get_watch_key("sentinel", None)
                .await
                .unwrap_err();
            assert!(error.is_retryable(), "status {status}");
            assert_eq!(error.endpoint(), ENDPOINT);
        }
    }

    #[tokio::test]
    async fn connectivity_failures_are_retryable() {
        let transport = MockTransport::new();
        transport.push_error(TransportError::Connectivity("connection refused".into()));
        transport.push_error(TransportError::Timeout("30s elapsed".into()));
        let client = client(&transport);
        let selector = SettingSelector::default();
        assert!(client.list_settings(&selector).await.unwrap_err().is_retryable());
        assert!(client.list_settings(&selector).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn other_statuses_propagate_as_service_errors() {
        let transport = MockTransport::new();
        transport.push_error(TransportError::Status {
            status: 403,
            message: "forbidden".into(),
        });
        transport.push_error(TransportError::Other("bad json".into()));
        let client = client(&transport);
        assert!(matches!(
            client.get_watch_key("sentinel", None).await,
            Err(ReplicaError::Service { status: 403, .. })
        ));
        assert!(matches!(
            client.get_watch_key("sentinel", None).await,
            Err(ReplicaError::Unexpected { .. })
        ));
    }

    #[test]
    fn backoff_window_controls_availability() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let now = Instant::now();
        assert!(client.is_available_at(now));
        client.update_backoff_end_time(now + Duration::from_secs(30));
        assert!(!client.is_available_at(now));
        assert!(client.is_available_at(now + Duration::from_secs(30)));
        assert_eq!(client.failed_attempts(), 1);
    }

    #[test]
    fn sync_token_is_forwarded_only_when_present() {
        let transport = MockTransport::new();
        let client = client(&transport);
        client.update_sync_token(None);
        assert!(transport.sync_tokens().is_empty());
        client.update_sync_token(Some("token=1;sn=2"));
        assert_eq!(transport.sync_tokens(), ["token=1;sn=2"]);
    }
}
