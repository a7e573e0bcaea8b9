//! Exponential backoff with full jitter.
//!
//! Delay for a failed attempt `n` (1-based) is `base * 2^(n-1)` capped at
//! `cap`, then multiplied by a uniform draw from `[0.5, 1.0)`. A receiver's
//! `Retry-After` wins when it asks for a longer wait.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry budget and backoff bounds for webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Backoff base delay.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// True when another attempt fits the budget after `attempts` total
    /// attempts so far.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Backoff before retrying after failed attempt `attempt` (1-based).
    ///
    /// For an upstream rate limit the receiver's requested wait applies
    /// when it exceeds the computed backoff.
    pub fn backoff_after(&self, attempt: u32, error: &DeliveryError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = 2u32.saturating_pow(exponent);
        let raw = self.base_delay.saturating_mul(multiplier);
        let capped = raw.min(self.max_delay);

        let jittered = apply_full_jitter(capped);

        match error.retry_after_secs() {
            Some(secs) => jittered.max(Duration::from_secs(secs)),
            None => jittered,
        }
    }
}

/// Scales a delay by a uniform factor in `[0.5, 1.0)`.
///
/// Full jitter keeps retry storms from different workers landing on the
/// same instant after a shared outage.
fn apply_full_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range(0.5..1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
