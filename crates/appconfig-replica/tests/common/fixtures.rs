//! In-memory store replicas used to drive the public API end to end.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use appconfig_replica::{
    ConfigurationError, ConfigurationTransport, ReplicaTarget, Setting, SettingSelector,
    TransportError, TransportProvider,
};
use async_trait::async_trait;
use serde_json::Value;

/// Deserialises a JSON array of settings.
pub fn settings(value: Value) -> Vec<Setting> {
    serde_json::from_value(value).expect("fixture settings must deserialise")
}

/// One replica's contents plus scripted failures.
#[derive(Debug, Default)]
pub struct ReplicaData {
    settings: Mutex<Vec<Setting>>,
    failures: Mutex<VecDeque<TransportError>>,
    sync_tokens: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("fixture mutex poisoned")
}

impl ReplicaData {
    /// Replaces every setting served by this replica.
    pub fn replace(&self, settings: Vec<Setting>) {
        *lock(&self.settings) = settings;
    }

    /// Fails the next `count` requests with `status`.
    pub fn fail_next(&self, count: usize, status: u16) {
        let mut failures = lock(&self.failures);
        for _ in 0..count {
            failures.push_back(TransportError::Status {
                status,
                message: format!("scripted {status}"),
            });
        }
    }

    /// Sync tokens received so far.
    pub fn sync_tokens(&self) -> Vec<String> {
        lock(&self.sync_tokens).clone()
    }

    fn failure(&self) -> Option<TransportError> {
        lock(&self.failures).pop_front()
    }
}

#[async_trait]
impl ConfigurationTransport for ReplicaData {
    async fn get_setting(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<Setting>, TransportError> {
        if let Some(error) = self.failure() {
            return Err(error);
        }
        Ok(lock(&self.settings)
            .iter()
            .find(|s| s.key == key && s.label.as_deref() == label)
            .cloned())
    }

    async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<Setting>, TransportError> {
        if let Some(error) = self.failure() {
            return Err(error);
        }
        let prefix = selector.key_filter.trim_end_matches('*');
        Ok(lock(&self.settings)
            .iter()
            .filter(|s| s.key.starts_with(prefix) && s.label == selector.label_filter)
            .cloned()
            .collect())
    }

    fn update_sync_token(&self, token: &str) {
        lock(&self.sync_tokens).push(token.to_string());
    }
}

/// Provider serving one [`ReplicaData`] per endpoint.
#[derive(Debug, Default)]
pub struct ReplicaSet {
    replicas: Mutex<BTreeMap<String, Arc<ReplicaData>>>,
}

impl ReplicaSet {
    /// Replica behind `endpoint`, created on first use.
    pub fn replica(&self, endpoint: &str) -> Arc<ReplicaData> {
        lock(&self.replicas)
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }
}

impl TransportProvider for ReplicaSet {
    fn connect(
        &self,
        target: &ReplicaTarget,
    ) -> Result<Arc<dyn ConfigurationTransport>, ConfigurationError> {
        let replica: Arc<dyn ConfigurationTransport> = self.replica(&target.endpoint);
        Ok(replica)
    }
}
