//! Per-endpoint send pacing.
//!
//! Each endpoint has a single send slot: one acquirer at a time, a minimum
//! interval between consecutive grants, no burst credit. Waiters for one
//! endpoint queue FIFO on the slot lock; endpoints never contend with each
//! other.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use feedrelay_core::{metrics::names, Clock, MetricsSink};

use crate::error::{DeliveryError, Result};

/// Pacing configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Interval applied to endpoints without an override.
    pub default_interval: Duration,
    /// Per-endpoint interval overrides, keyed by endpoint key.
    pub overrides: HashMap<String, Duration>,
    /// Idle time after which an endpoint's slot is dropped.
    pub idle_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_millis(200),
            overrides: HashMap::new(),
            idle_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct SendSlot {
    last_send: Option<Instant>,
    last_used: Instant,
}

/// Registry of per-endpoint send slots.
///
/// The registry map is guarded by a plain mutex held only to look up or
/// insert a slot; the slot itself is an async mutex held across the pacing
/// wait, which is what serializes concurrent senders FIFO.
pub struct EndpointRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    slots: StdMutex<HashMap<String, Arc<Mutex<SendSlot>>>>,
}

impl EndpointRateLimiter {
    /// Creates a limiter.
    pub fn new(
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { config, clock, metrics, slots: StdMutex::new(HashMap::new()) }
    }

    /// Interval enforced for one endpoint.
    pub fn interval_for(&self, endpoint: &str) -> Duration {
        self.config.overrides.get(endpoint).copied().unwrap_or(self.config.default_interval)
    }

    /// Blocks until the endpoint's interval has elapsed, then claims the
    /// slot. Returns the time spent waiting.
    ///
    /// Cancellation aborts the wait and leaves `last_send` untouched, so a
    /// cancelled acquire never affects later pacing.
    pub async fn acquire(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        if cancel.is_cancelled() {
            return Err(DeliveryError::ShuttingDown);
        }
        let slot = self.slot(endpoint);

        let mut guard = tokio::select! {
            guard = slot.lock() => guard,
            () = cancel.cancelled() => return Err(DeliveryError::ShuttingDown),
        };

        let interval = self.interval_for(endpoint);
        let now = self.clock.now();
        let wait = match guard.last_send {
            Some(last) => (last + interval).saturating_duration_since(now),
            None => Duration::ZERO,
        };

        if !wait.is_zero() {
            tokio::select! {
                () = self.clock.sleep(wait) => {},
                () = cancel.cancelled() => return Err(DeliveryError::ShuttingDown),
            }
        }

        let granted_at = self.clock.now();
        guard.last_send = Some(granted_at);
        guard.last_used = granted_at;

        self.metrics.gauge(
            names::RATE_LIMIT_WAIT,
            &[("endpoint", endpoint)],
            wait.as_secs_f64(),
        );

        Ok(wait)
    }

    /// Drops slots unused for longer than the configured idle TTL.
    ///
    /// Slots currently held by a waiter are skipped and revisited on the
    /// next sweep.
    pub fn evict_idle(&self) {
        let now = self.clock.now();
        let ttl = self.config.idle_ttl;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => now.saturating_duration_since(guard.last_used) < ttl,
            Err(_) => true,
        });
    }

    /// Number of endpoints with live pacing state.
    pub fn tracked_endpoints(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn slot(&self, endpoint: &str) -> Arc<Mutex<SendSlot>> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SendSlot { last_send: None, last_used: now }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use feedrelay_core::NoOpMetrics;
    use feedrelay_testing::TestClock;

    use super::*;

    fn limiter(clock: TestClock, default_ms: u64) -> EndpointRateLimiter {
        EndpointRateLimiter::new(
            RateLimitConfig {
                default_interval: Duration::from_millis(default_ms),
                ..Default::default()
            },
            Arc::new(clock),
            Arc::new(NoOpMetrics),
        )
    }

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let clock = TestClock::new();
        let limiter = limiter(clock.clone(), 200);
        let cancel = CancellationToken::new();

        let waited = limiter.acquire("e", &cancel).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn consecutive_acquires_space_out() {
        let clock = TestClock::new();
        let limiter = limiter(clock.clone(), 200);
        let cancel = CancellationToken::new();

        limiter.acquire("e", &cancel).await.unwrap();
        let second = limiter.acquire("e", &cancel).await.unwrap();
        let third = limiter.acquire("e", &cancel).await.unwrap();

        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(200));
        assert_eq!(clock.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn elapsed_interval_means_no_wait() {
        let clock = TestClock::new();
        let limiter = limiter(clock.clone(), 200);
        let cancel = CancellationToken::new();

        limiter.acquire("e", &cancel).await.unwrap();
        clock.advance(Duration::from_millis(300));
        let waited = limiter.acquire("e", &cancel).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn endpoints_do_not_share_slots() {
        let clock = TestClock::new();
        let limiter = limiter(clock.clone(), 200);
        let cancel = CancellationToken::new();

        limiter.acquire("a", &cancel).await.unwrap();
        let waited = limiter.acquire("b", &cancel).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(limiter.tracked_endpoints(), 2);
    }

    #[tokio::test]
    async fn override_applies_to_named_endpoint() {
        let clock = TestClock::new();
        let mut config = RateLimitConfig {
            default_interval: Duration::from_millis(200),
            ..Default::default()
        };
        config.overrides.insert("slow".to_string(), Duration::from_millis(1000));
        let limiter =
            EndpointRateLimiter::new(config, Arc::new(clock), Arc::new(NoOpMetrics));
        let cancel = CancellationToken::new();

        limiter.acquire("slow", &cancel).await.unwrap();
        let waited = limiter.acquire("slow", &cancel).await.unwrap();
        assert_eq!(waited, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn cancellation_does_not_mutate_state() {
        let clock = TestClock::new();
        let limiter = limiter(clock.clone(), 200);
        let cancel = CancellationToken::new();

        limiter.acquire("e", &cancel).await.unwrap();
        let first_elapsed = clock.elapsed();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let result = limiter.acquire("e", &cancelled).await;
        assert!(matches!(result, Err(DeliveryError::ShuttingDown)));

        // The failed acquire left last_send alone: the next acquire waits
        // exactly one interval from the first grant.
        let waited = limiter.acquire("e", &cancel).await.unwrap();
        assert_eq!(waited, Duration::from_millis(200));
        assert_eq!(clock.elapsed() - first_elapsed, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn idle_slots_are_swept() {
        let clock = TestClock::new();
        let config = RateLimitConfig {
            default_interval: Duration::from_millis(200),
            idle_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let limiter =
            EndpointRateLimiter::new(config, Arc::new(clock.clone()), Arc::new(NoOpMetrics));
        let cancel = CancellationToken::new();

        limiter.acquire("e", &cancel).await.unwrap();
        assert_eq!(limiter.tracked_endpoints(), 1);

        clock.advance(Duration::from_secs(120));
        limiter.evict_idle();
        assert_eq!(limiter.tracked_endpoints(), 0);
    }
}
