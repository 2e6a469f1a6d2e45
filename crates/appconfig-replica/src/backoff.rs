//! Randomised exponential backoff shared by replica clients and refresh state.
//!
//! A failing replica is parked until `now + backoff`, and overdue refresh
//! checks are pushed out by the same policy. The first failure only waits the
//! minimum; every following failure draws uniformly from
//! `[min, min(max, min * 2^attempts)]`.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Exponent cap; `2^63` is the largest power that still fits the nanosecond arithmetic.
pub const MAX_ATTEMPTS: i64 = 63;
/// Default lower bound applied when a replica or refresh check fails.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(30);
/// Default upper bound applied when a replica or refresh check fails.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Invalid arguments passed to [`calculate_backoff`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BackoffError {
    /// The failed-attempt count was negative.
    #[error("failed attempts must not be negative")]
    NegativeAttempts,
    /// The minimum backoff was negative.
    #[error("minimum backoff must not be negative")]
    NegativeMinBackoff,
    /// The maximum backoff was negative.
    #[error("maximum backoff must not be negative")]
    NegativeMaxBackoff,
}

/// Computes the backoff for `failed_attempts` using the thread-local RNG.
///
/// Bounds are expressed in nanoseconds so values read from signed
/// configuration sources can be validated here rather than silently wrapped.
pub fn calculate_backoff(
    failed_attempts: i64,
    min_backoff_nanos: i64,
    max_backoff_nanos: i64,
) -> Result<Duration, BackoffError> {
    calculate_backoff_with(
        &mut rand::thread_rng(),
        failed_attempts,
        min_backoff_nanos,
        max_backoff_nanos,
    )
}

/// Computes the backoff for `failed_attempts` drawing randomness from `rng`.
pub fn calculate_backoff_with<R: Rng + ?Sized>(
    rng: &mut R,
    failed_attempts: i64,
    min_backoff_nanos: i64,
    max_backoff_nanos: i64,
) -> Result<Duration, BackoffError> {
    if min_backoff_nanos < 0 {
        return Err(BackoffError::NegativeMinBackoff);
    }
    if max_backoff_nanos < 0 {
        return Err(BackoffError::NegativeMaxBackoff);
    }
    if failed_attempts < 0 {
        return Err(BackoffError::NegativeAttempts);
    }

    if failed_attempts <= 1 || max_backoff_nanos <= min_backoff_nanos {
        return Ok(nanos_to_duration(min_backoff_nanos));
    }

    // i128 keeps `min * 2^63` exact; anything above the max is clamped.
    let exponent = failed_attempts.min(MAX_ATTEMPTS) as u32;
    let ceiling = (i128::from(min_backoff_nanos.max(1)) << exponent)
        .min(i128::from(max_backoff_nanos)) as i64;

    let spread = (ceiling - min_backoff_nanos) as f64;
    let jitter = (rng.gen::<f64>() * spread) as i64;
    Ok(nanos_to_duration(
        min_backoff_nanos.saturating_add(jitter).min(ceiling),
    ))
}

fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Minimum and maximum backoff applied to replicas and overdue refresh checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffBounds {
    /// Delay applied after the first failure.
    pub min: Duration,
    /// Ceiling that exponential growth never exceeds.
    pub max: Duration,
}

impl Default for BackoffBounds {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffBounds {
    /// Creates bounds from the provided minimum and maximum.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Returns the backoff for `failed_attempts`; typed inputs cannot be negative.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        self.backoff_with(&mut rand::thread_rng(), failed_attempts)
    }

    /// Same as [`BackoffBounds::backoff`] with an explicit randomness source.
    pub fn backoff_with<R: Rng + ?Sized>(&self, rng: &mut R, failed_attempts: u32) -> Duration {
        calculate_backoff_with(
            rng,
            i64::from(failed_attempts),
            duration_to_nanos(self.min),
            duration_to_nanos(self.max),
        )
        .unwrap_or(self.min)
    }
}
