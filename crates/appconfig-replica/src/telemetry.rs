//! Counting implementation of [`RefreshTelemetry`].
//!
//! Hosts that export metrics through their own backend can install
//! [`CountingTelemetry`] and read [`TelemetryCounters::snapshot`] on their
//! own schedule.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::service::{RefreshTelemetry, ServiceError};

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    refresh_signaled: AtomicU64,
    refresh_error: AtomicU64,
    refresh_skipped: AtomicU64,
    replica_backoff: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            refresh_signaled: self.refresh_signaled.load(Ordering::Relaxed),
            refresh_error: self.refresh_error.load(Ordering::Relaxed),
            refresh_skipped: self.refresh_skipped.load(Ordering::Relaxed),
            replica_backoff: self.replica_backoff.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    /// Refresh events published.
    pub refresh_signaled: u64,
    /// Refresh checks that failed.
    pub refresh_error: u64,
    /// Refresh checks rejected because one was already running.
    pub refresh_skipped: u64,
    /// Replicas backed off.
    pub replica_backoff: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refresh_signaled={}, refresh_error={}, refresh_skipped={}, replica_backoff={}",
            self.refresh_signaled, self.refresh_error, self.refresh_skipped, self.replica_backoff
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every signal.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl RefreshTelemetry for CountingTelemetry {
    fn on_refresh_signaled(&self, _message: &str) {
        self.counters.refresh_signaled.fetch_add(1, Ordering::Relaxed);
    }

    fn on_refresh_error(&self, _error: &ServiceError) {
        self.counters.refresh_error.fetch_add(1, Ordering::Relaxed);
    }

    fn on_refresh_skipped(&self) {
        self.counters.refresh_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn on_replica_backoff(&self, _origin: &str, _endpoint: &str, _delay: Duration) {
        self.counters.replica_backoff.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ConfigurationError;

    #[test]
    fn counting_telemetry_tracks_every_hook() {
        let telemetry = CountingTelemetry::default();
        telemetry.on_refresh_signaled("sentinel");
        telemetry.on_refresh_signaled("other");
        telemetry.on_refresh_error(&ServiceError::Configuration(
            ConfigurationError::NoConnectionMethod,
        ));
        telemetry.on_refresh_skipped();
        telemetry.on_replica_backoff("origin", "replica", Duration::from_secs(30));

        let snapshot = telemetry.counters().snapshot();
        assert_eq!(
            snapshot,
            TelemetrySnapshot {
                refresh_signaled: 2,
                refresh_error: 1,
                refresh_skipped: 1,
                replica_backoff: 1,
            }
        );
        assert_eq!(
            snapshot.to_string(),
            "refresh_signaled=2, refresh_error=1, refresh_skipped=1, replica_backoff=1"
        );
    }

    #[test]
    fn clones_share_counters() {
        let telemetry = CountingTelemetry::default();
        let clone = telemetry.clone();
        clone.on_refresh_skipped();
        assert_eq!(telemetry.counters().snapshot().refresh_skipped, 1);
    }
}
