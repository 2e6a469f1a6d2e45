//! Refresh telemetry hooks.
//!
//! Embedders implement [`RefreshTelemetry`] to observe refresh decisions and
//! replica failover without reaching into the coordinator's state.

use std::time::Duration;

use super::ServiceError;

/// Hook invoked on significant refresh events.
pub trait RefreshTelemetry: Send + Sync {
    /// Called when a refresh event is published, with its trigger message.
    fn on_refresh_signaled(&self, _message: &str) {}
    /// Called when a refresh check fails.
    fn on_refresh_error(&self, _error: &ServiceError) {}
    /// Called when a refresh check is rejected because another one is running.
    fn on_refresh_skipped(&self) {}
    /// Called when a replica is backed off after a retryable failure.
    fn on_replica_backoff(&self, _origin: &str, _endpoint: &str, _delay: Duration) {}
}

/// Telemetry implementation that ignores every event.
#[derive(Debug, Default)]
pub(crate) struct NoopTelemetry;

impl RefreshTelemetry for NoopTelemetry {}
