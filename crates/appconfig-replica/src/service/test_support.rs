//! Shared fixtures for replica and refresh tests.
//!
//! [`MockTransport`] is an in-memory store with scripted failures;
//! [`MockProvider`] hands out one transport per endpoint and remembers what
//! it connected to.

#![cfg(test)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{ConfigurationError, StoreConfig, WatchTrigger};
use crate::transport::{
    ConfigurationTransport, ReplicaTarget, Setting, SettingSelector, TransportError,
    TransportProvider,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Matches `key` against a filter where `*` is a trailing wildcard.
fn key_matches(filter: &str, key: &str) -> bool {
    match filter.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => filter == key,
    }
}

/// In-memory transport with scripted errors.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    settings: Mutex<BTreeMap<(String, Option<String>), Setting>>,
    errors: Mutex<VecDeque<TransportError>>,
    sync_tokens: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts or replaces a setting.
    pub(crate) fn set_setting(&self, setting: Setting) {
        lock(&self.settings).insert((setting.key.clone(), setting.label.clone()), setting);
    }

    /// Removes a setting.
    pub(crate) fn remove_setting(&self, key: &str, label: Option<&str>) {
        lock(&self.settings).remove(&(key.to_string(), label.map(str::to_string)));
    }

    /// Queues an error returned by the next call instead of data.
    pub(crate) fn push_error(&self, error: TransportError) {
        lock(&self.errors).push_back(error);
    }

    /// Makes every following call wait for a permit on the returned semaphore.
    pub(crate) fn hold_requests(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.gate) = Some(gate.clone());
        gate
    }

    pub(crate) fn sync_tokens(&self) -> Vec<String> {
        lock(&self.sync_tokens).clone()
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    async fn wait_for_gate(&self) {
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn next_error(&self) -> Option<TransportError> {
        lock(&self.errors).pop_front()
    }
}

#[async_trait]
impl ConfigurationTransport for MockTransport {
    async fn get_setting(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<Setting>, TransportError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_gate().await;
        if let Some(error) = self.next_error() {
            return Err(error);
        }
        Ok(lock(&self.settings)
            .get(&(key.to_string(), label.map(str::to_string)))
            .cloned())
    }

    async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<Setting>, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_gate().await;
        if let Some(error) = self.next_error() {
            return Err(error);
        }
        Ok(lock(&self.settings)
            .values()
            .filter(|s| key_matches(&selector.key_filter, &s.key))
            .filter(|s| s.label == selector.label_filter)
            .cloned()
            .collect())
    }

    fn update_sync_token(&self, token: &str) {
        lock(&self.sync_tokens).push(token.to_string());
    }
}

/// Provider returning one shared [`MockTransport`] per endpoint.
#[derive(Debug, Default)]
pub(crate) struct MockProvider {
    transports: Mutex<BTreeMap<String, Arc<MockTransport>>>,
    connected: Mutex<Vec<ReplicaTarget>>,
    refuse: Mutex<Option<ConfigurationError>>,
}

impl MockProvider {
    /// Transport serving `endpoint`, created on first use.
    pub(crate) fn transport(&self, endpoint: &str) -> Arc<MockTransport> {
        lock(&self.transports)
            .entry(endpoint.to_string())
            .or_insert_with(MockTransport::new)
            .clone()
    }

    /// Targets passed to `connect` so far.
    pub(crate) fn connected_targets(&self) -> Vec<ReplicaTarget> {
        lock(&self.connected).clone()
    }

    /// Makes every following `connect` fail with `error`.
    pub(crate) fn refuse_with(&self, error: ConfigurationError) {
        *lock(&self.refuse) = Some(error);
    }
}

impl TransportProvider for MockProvider {
    fn connect(
        &self,
        target: &ReplicaTarget,
    ) -> Result<Arc<dyn ConfigurationTransport>, ConfigurationError> {
        if let Some(error) = lock(&self.refuse).clone() {
            return Err(error);
        }
        lock(&self.connected).push(target.clone());
        let transport: Arc<dyn ConfigurationTransport> = self.transport(&target.endpoint);
        Ok(transport)
    }
}

/// Monitored store over `endpoints` watching `sentinel` every 30 seconds.
pub(crate) fn monitored_store(endpoints: &[&str]) -> StoreConfig {
    let mut store = StoreConfig::with_endpoints(endpoints.iter().copied());
    store.monitoring.enabled = true;
    store.monitoring.triggers.push(WatchTrigger::new("sentinel", None));
    store
}
