//! Watch-key snapshots and refresh timers.
//!
//! [`StateHolder`] is an immutable snapshot once published: every change is
//! made on a clone which then replaces the published value through
//! [`RefreshState`]. Readers holding an older `Arc<StateHolder>` keep seeing a
//! complete, consistent snapshot while the next one is assembled.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use super::config::MAX_CONFIGURED_DURATION;
use crate::backoff::BackoffBounds;
use crate::transport::Setting;

/// Upper bound of the random delay applied when a store is expired early.
pub const MAX_EXPIRE_JITTER: Duration = Duration::from_secs(15);

const FEATURE_FLAG_SUFFIX: &str = "_feature";

/// `now + delay`, with `delay` capped at [`MAX_CONFIGURED_DURATION`].
pub(crate) fn deadline(now: Instant, delay: Duration) -> Instant {
    now + delay.min(MAX_CONFIGURED_DURATION)
}

/// Key under which the feature-flag state of `origin_endpoint` is stored.
pub fn feature_flag_key(origin_endpoint: &str) -> String {
    format!("{origin_endpoint}{FEATURE_FLAG_SUFFIX}")
}

/// Watched settings and refresh timer of one store (or its feature-flag namespace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    key: String,
    watch_keys: Arc<Vec<Setting>>,
    next_refresh_check: Instant,
    refresh_interval: Duration,
    refresh_attempt: u32,
}

impl State {
    fn fresh(key: String, watch_keys: Vec<Setting>, refresh_interval: Duration) -> Self {
        Self {
            key,
            watch_keys: Arc::new(watch_keys),
            next_refresh_check: deadline(Instant::now(), refresh_interval),
            refresh_interval,
            refresh_attempt: 1,
        }
    }

    /// State identifier (origin endpoint, or its feature-flag key).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Settings observed at the last load, with their ETags.
    pub fn watch_keys(&self) -> &[Setting] {
        &self.watch_keys
    }

    /// Earliest instant at which the next refresh check may run.
    pub fn next_refresh_check(&self) -> Instant {
        self.next_refresh_check
    }

    /// Interval between refresh checks.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Attempt counter driving backoff escalation; starts at 1.
    pub fn refresh_attempt(&self) -> u32 {
        self.refresh_attempt
    }

    /// Whether a refresh check is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_refresh_check <= now
    }

    fn back_off(&mut self, bounds: &BackoffBounds, now: Instant) {
        let Some(next) = next_check_after_failure(
            self.next_refresh_check,
            self.refresh_attempt,
            self.refresh_interval,
            bounds,
            now,
        ) else {
            return;
        };
        if next != self.next_refresh_check {
            debug!(
                key = %self.key,
                attempt = self.refresh_attempt,
                delay = ?next.saturating_duration_since(now),
                "app-configuration: rescheduled overdue refresh check"
            );
            self.next_refresh_check = next;
            self.refresh_attempt += 1;
        }
    }
}

/// Computes the next check for an overdue timer, or `None` when it is not overdue yet.
fn next_check_after_failure(
    next_refresh_check: Instant,
    attempt: u32,
    interval: Duration,
    bounds: &BackoffBounds,
    now: Instant,
) -> Option<Instant> {
    if next_refresh_check > now {
        return None;
    }
    if interval <= bounds.min {
        return Some(deadline(now, interval));
    }
    Some(deadline(now, bounds.backoff(attempt)))
}

/// Complete refresh bookkeeping for every store.
#[derive(Debug, Clone, Default)]
pub struct StateHolder {
    states: BTreeMap<String, State>,
    load_state: BTreeMap<String, bool>,
    load_state_feature_flag: BTreeMap<String, bool>,
    next_forced_refresh: Option<Instant>,
    forced_refresh_attempt: u32,
}

impl StateHolder {
    /// Empty snapshot.
    pub fn new() -> Self {
        Self {
            forced_refresh_attempt: 1,
            ..Default::default()
        }
    }

    /// Key-value state of `origin_endpoint`.
    pub fn state(&self, origin_endpoint: &str) -> Option<&State> {
        self.states.get(origin_endpoint)
    }

    /// Feature-flag state of `origin_endpoint`.
    pub fn feature_flag_state(&self, origin_endpoint: &str) -> Option<&State> {
        self.states.get(&feature_flag_key(origin_endpoint))
    }

    /// Number of states held (key-value and feature-flag).
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no state is held.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Replaces the key-value state of `origin_endpoint` with a fresh one.
    pub fn set_state(
        &mut self,
        origin_endpoint: &str,
        watch_keys: Vec<Setting>,
        interval: Duration,
    ) {
        let key = origin_endpoint.to_string();
        self.states
            .insert(key.clone(), State::fresh(key, watch_keys, interval));
    }

    /// Replaces the feature-flag state of `origin_endpoint` with a fresh one.
    pub fn set_feature_flag_state(
        &mut self,
        origin_endpoint: &str,
        flags: Vec<Setting>,
        interval: Duration,
    ) {
        let key = feature_flag_key(origin_endpoint);
        self.states
            .insert(key.clone(), State::fresh(key, flags, interval));
    }

    /// Copies the state stored under `key` in `previous` into this snapshot.
    pub(crate) fn carry_over(&mut self, previous: &StateHolder, key: &str) {
        if let Some(state) = previous.states.get(key) {
            self.states.insert(key.to_string(), state.clone());
        }
    }

    /// Pushes the check of state `key` to `now + interval`, keeping its watch keys and attempt.
    pub fn update_state_refresh(&mut self, key: &str, interval: Duration) {
        if let Some(state) = self.states.get(key) {
            let updated = State {
                next_refresh_check: deadline(Instant::now(), interval),
                ..state.clone()
            };
            self.states.insert(key.to_string(), updated);
        }
    }

    /// Whether the key-value settings of `origin_endpoint` loaded successfully.
    pub fn load_state(&self, origin_endpoint: &str) -> bool {
        self.load_state.get(origin_endpoint).copied().unwrap_or(false)
    }

    /// Records whether the key-value settings of `origin_endpoint` loaded.
    pub fn set_load_state(&mut self, origin_endpoint: &str, loaded: bool) {
        self.load_state.insert(origin_endpoint.to_string(), loaded);
    }

    /// Whether the feature flags of `origin_endpoint` loaded successfully.
    pub fn load_state_feature_flag(&self, origin_endpoint: &str) -> bool {
        self.load_state_feature_flag
            .get(origin_endpoint)
            .copied()
            .unwrap_or(false)
    }

    /// Records whether the feature flags of `origin_endpoint` loaded.
    pub fn set_load_state_feature_flag(&mut self, origin_endpoint: &str, loaded: bool) {
        self.load_state_feature_flag
            .insert(origin_endpoint.to_string(), loaded);
    }

    /// Instant after which a refresh is forced regardless of watch keys.
    pub fn next_forced_refresh(&self) -> Option<Instant> {
        self.next_forced_refresh
    }

    /// Schedules the forced refresh `interval` from now (or disables it).
    pub fn set_next_forced_refresh(&mut self, interval: Option<Duration>) {
        self.next_forced_refresh = interval.map(|interval| deadline(Instant::now(), interval));
        self.forced_refresh_attempt = 1;
    }

    /// Pushes every overdue timer into the future after a failed check.
    ///
    /// Timers still in the future are left alone. An overdue timer moves to
    /// `now + interval` when the interval does not exceed the minimum backoff,
    /// otherwise to `now + backoff(attempt)`; its attempt counter grows only
    /// when the time actually moved.
    pub fn update_next_refresh_time(
        &mut self,
        forced_interval: Option<Duration>,
        bounds: &BackoffBounds,
    ) {
        let now = Instant::now();

        if let (Some(interval), Some(forced)) = (forced_interval, self.next_forced_refresh) {
            if let Some(next) =
                next_check_after_failure(forced, self.forced_refresh_attempt, interval, bounds, now)
            {
                if next != forced {
                    self.next_forced_refresh = Some(next);
                    self.forced_refresh_attempt += 1;
                }
            }
        }

        for state in self.states.values_mut() {
            state.back_off(bounds, now);
        }
    }

    /// Applies the failure path of [`StateHolder::update_next_refresh_time`] to state `key` only.
    pub fn back_off_state(&mut self, key: &str, bounds: &BackoffBounds) {
        if let Some(state) = self.states.get_mut(key) {
            state.back_off(bounds, Instant::now());
        }
    }

    /// Moves the checks of `origin_endpoint` to a random point within the next 15 seconds.
    pub fn expire_state(&mut self, origin_endpoint: &str) {
        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_EXPIRE_JITTER.as_millis() as u64);
        self.expire_state_with_jitter(origin_endpoint, Duration::from_millis(jitter_ms));
    }

    /// Moves the checks of `origin_endpoint` to `now + jitter` (jitter capped at 15s)
    /// when that is earlier than what is scheduled.
    pub fn expire_state_with_jitter(&mut self, origin_endpoint: &str, jitter: Duration) {
        let expire_at = Instant::now() + jitter.min(MAX_EXPIRE_JITTER);
        for key in [origin_endpoint.to_string(), feature_flag_key(origin_endpoint)] {
            if let Some(state) = self.states.get_mut(&key) {
                if expire_at < state.next_refresh_check {
                    state.next_refresh_check = expire_at;
                }
            }
        }
    }
}

/// Published [`StateHolder`] shared by the loader and the refresh coordinator.
#[derive(Debug)]
pub struct RefreshState {
    current: RwLock<Arc<StateHolder>>,
}

impl Default for RefreshState {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshState {
    /// Starts with an empty snapshot.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(StateHolder::new())),
        }
    }

    /// Currently published snapshot.
    pub fn snapshot(&self) -> Arc<StateHolder> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publishes `next`, replacing the previous snapshot.
    pub fn replace(&self, next: StateHolder) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    /// Applies `mutate` to a copy of the current snapshot and publishes the copy.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut StateHolder),
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = StateHolder::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}
