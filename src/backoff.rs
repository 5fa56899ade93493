//! Requeue timing for the reconcilers.
//!
//! Each error class from the error taxonomy requeues differently: transient failures back off
//! exponentially (with jitter) up to a ceiling, while validation problems, missing dependencies
//! and terminal remote rejections are retried at fixed intervals.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Ceiling for the exponential delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub multiplier: f64,
    /// Fraction of the delay that is randomised, between 0 and 1
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied and capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = base * self.jitter.clamp(0.0, 1.0);
        let jittered = if spread > 0.0 {
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Fixed requeue intervals for the non-transient error classes.
#[derive(Clone, Debug)]
pub struct RequeueIntervals {
    /// Periodic resync of converged objects
    pub resync: Duration,
    /// Dependency not ready yet
    pub dependency: Duration,
    /// Validation failures and terminal remote rejections
    pub slow: Duration,
    /// Consecutive transient failures after which an object is reported as degraded
    pub degraded_after: u32,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(60),
            dependency: Duration::from_secs(10),
            slow: Duration::from_secs(5 * 60),
            degraded_after: 8,
        }
    }
}

/// Counts consecutive transient failures per object.
#[derive(Default, Debug)]
pub struct FailureTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    /// Record a failure and return the number of consecutive failures so far.
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry(key.to_owned()).or_default();
        *count += 1;
        *count
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Requeue timing and failure counts, shared by every Konnect reconciler.
#[derive(Debug, Default)]
pub struct RequeuePolicy {
    pub intervals: RequeueIntervals,
    pub backoff: BackoffConfig,
    pub failures: FailureTracker,
}

impl RequeuePolicy {
    pub fn new(intervals: RequeueIntervals, backoff: BackoffConfig) -> Self {
        Self {
            intervals,
            backoff,
            failures: FailureTracker::default(),
        }
    }

    /// Count a transient failure of `key`. Returns the delay before the next attempt, and whether
    /// failures have gone on long enough to be reported as degraded.
    pub fn transient_failure(&self, key: &str, retry_after: Option<Duration>) -> (Duration, bool) {
        let attempts = self.failures.record_failure(key);
        let delay = retry_after.unwrap_or_else(|| self.backoff.delay(attempts));
        (delay, attempts >= self.intervals.degraded_after)
    }

    pub fn succeeded(&self, key: &str) {
        self.failures.reset(key);
    }
}
