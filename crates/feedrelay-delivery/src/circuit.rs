//! Per-endpoint circuit breakers.
//!
//! A breaker fails fast while a receiver is down and probes recovery with a
//! single request. State machine:
//!
//! ```text
//!   closed ──(threshold consecutive failures)──▶ open
//!   open ──(reset timeout elapsed, checked at acquire)──▶ half_open
//!   half_open ──(probe success)──▶ closed
//!   half_open ──(probe failure)──▶ open
//! ```
//!
//! The open→closed edge always passes through half_open; there is no direct
//! transition. Half-open admits exactly one probe: a second acquire while
//! the probe is in flight is denied.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use feedrelay_core::{metrics::names, Clock, MetricsSink};

/// Breaker thresholds shared by all endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time in open before a probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30) }
    }
}

/// Phase of one endpoint's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Requests are denied without touching the network.
    Open,
    /// One probe request is allowed through.
    HalfOpen,
}

impl BreakerState {
    /// Stable label for the transition counter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct EndpointBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_used: Instant,
}

impl EndpointBreaker {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            last_used: now,
        }
    }
}

/// Breaker registry for every endpoint the sender talks to.
///
/// Entries are created lazily on first acquire and evicted once idle past
/// the TTL. One short critical section per call; the lock is never held
/// across I/O.
pub struct CircuitBreakerManager {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    circuits: Mutex<HashMap<String, EndpointBreaker>>,
}

impl CircuitBreakerManager {
    /// Creates a breaker registry.
    pub fn new(
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { config, clock, metrics, circuits: Mutex::new(HashMap::new()) }
    }

    /// Asks permission to attempt the endpoint.
    ///
    /// A `true` return hands the caller a permit: it must report the
    /// attempt's result through [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) exactly once, or release an
    /// unused permit through [`abandon`](Self::abandon).
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let breaker =
            circuits.entry(endpoint.to_string()).or_insert_with(|| EndpointBreaker::new(now));
        breaker.last_used = now;

        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    self.transition(endpoint, breaker, BreakerState::HalfOpen);
                    breaker.probe_in_flight = true;
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen => {
                if breaker.probe_in_flight {
                    false
                } else {
                    breaker.probe_in_flight = true;
                    true
                }
            },
        }
    }

    /// Reports a successful attempt.
    pub fn record_success(&self, endpoint: &str) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let breaker =
            circuits.entry(endpoint.to_string()).or_insert_with(|| EndpointBreaker::new(now));
        breaker.last_used = now;
        breaker.probe_in_flight = false;
        breaker.consecutive_failures = 0;

        if breaker.state == BreakerState::HalfOpen {
            self.transition(endpoint, breaker, BreakerState::Closed);
        }
    }

    /// Reports a failed attempt.
    pub fn record_failure(&self, endpoint: &str) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let breaker =
            circuits.entry(endpoint.to_string()).or_insert_with(|| EndpointBreaker::new(now));
        breaker.last_used = now;
        breaker.probe_in_flight = false;
        breaker.consecutive_failures += 1;

        match breaker.state {
            BreakerState::Closed => {
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.opened_at = Some(now);
                    self.transition(endpoint, breaker, BreakerState::Open);
                }
            },
            BreakerState::HalfOpen => {
                breaker.opened_at = Some(now);
                self.transition(endpoint, breaker, BreakerState::Open);
            },
            BreakerState::Open => {},
        }
    }

    /// Releases a permit whose attempt never produced a result, e.g. when
    /// shutdown cancels between acquire and send. Leaves counters untouched.
    pub fn abandon(&self, endpoint: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(breaker) = circuits.get_mut(endpoint) {
            breaker.probe_in_flight = false;
        }
    }

    /// Current state of one endpoint's breaker, if it exists.
    pub fn state(&self, endpoint: &str) -> Option<BreakerState> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(endpoint).map(|b| b.state)
    }

    /// Consecutive-failure count for one endpoint.
    pub fn consecutive_failures(&self, endpoint: &str) -> u32 {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(endpoint).map(|b| b.consecutive_failures).unwrap_or(0)
    }

    /// Forces a breaker into a state. Test and operator escape hatch.
    pub fn force_state(&self, endpoint: &str, state: BreakerState) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let breaker =
            circuits.entry(endpoint.to_string()).or_insert_with(|| EndpointBreaker::new(now));
        breaker.state = state;
        breaker.probe_in_flight = false;
        if state == BreakerState::Open {
            breaker.opened_at = Some(now);
        }
        if state == BreakerState::Closed {
            breaker.consecutive_failures = 0;
        }
    }

    /// Drops breakers unused for longer than `ttl`.
    pub fn evict_idle(&self, ttl: Duration) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.retain(|_, b| now.saturating_duration_since(b.last_used) < ttl);
    }

    fn transition(&self, endpoint: &str, breaker: &mut EndpointBreaker, to: BreakerState) {
        match to {
            BreakerState::Open => tracing::warn!(
                endpoint,
                consecutive_failures = breaker.consecutive_failures,
                "circuit breaker opening"
            ),
            BreakerState::HalfOpen => {
                tracing::info!(endpoint, "circuit breaker half-open, probing");
            },
            BreakerState::Closed => tracing::info!(endpoint, "circuit breaker closed"),
        }
        breaker.state = to;
        self.metrics.incr(
            names::BREAKER_TRANSITIONS,
            &[("endpoint", endpoint), ("to_state", to.as_str())],
            1,
        );
    }
}

#[cfg(test)]
mod tests {
    use feedrelay_core::NoOpMetrics;

    use super::*;

    struct StepClock {
        start: Instant,
        offset: Mutex<Duration>,
    }

    impl StepClock {
        fn new() -> Self {
            Self { start: Instant::now(), offset: Mutex::new(Duration::ZERO) }
        }

        fn advance(&self, d: Duration) {
            *self.offset.lock().unwrap() += d;
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap()
        }

        fn now_system(&self) -> std::time::SystemTime {
            std::time::SystemTime::now()
        }

        fn sleep(
            &self,
            duration: Duration,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            self.advance(duration);
            Box::pin(std::future::ready(()))
        }
    }

    fn manager(clock: Arc<StepClock>) -> CircuitBreakerManager {
        CircuitBreakerManager::new(
            BreakerConfig { failure_threshold: 3, reset_timeout: Duration::from_secs(1) },
            clock,
            Arc::new(NoOpMetrics),
        )
    }

    #[test]
    fn starts_closed_and_allows() {
        let breaker = manager(Arc::new(StepClock::new()));
        assert!(breaker.try_acquire("e"));
        assert_eq!(breaker.state("e"), Some(BreakerState::Closed));
    }

    #[test]
    fn opens_at_threshold() {
        let breaker = manager(Arc::new(StepClock::new()));
        for _ in 0..2 {
            assert!(breaker.try_acquire("e"));
            breaker.record_failure("e");
            assert_eq!(breaker.state("e"), Some(BreakerState::Closed));
        }

        assert!(breaker.try_acquire("e"));
        breaker.record_failure("e");
        assert_eq!(breaker.state("e"), Some(BreakerState::Open));
        assert!(!breaker.try_acquire("e"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = manager(Arc::new(StepClock::new()));
        breaker.record_failure("e");
        breaker.record_failure("e");
        assert_eq!(breaker.consecutive_failures("e"), 2);

        breaker.record_success("e");
        assert_eq!(breaker.consecutive_failures("e"), 0);
        assert_eq!(breaker.state("e"), Some(BreakerState::Closed));
    }

    #[test]
    fn reset_timeout_allows_single_probe() {
        let clock = Arc::new(StepClock::new());
        let breaker = manager(clock.clone());
        for _ in 0..3 {
            breaker.record_failure("e");
        }
        assert!(!breaker.try_acquire("e"));

        clock.advance(Duration::from_secs(1));
        assert!(breaker.try_acquire("e"));
        assert_eq!(breaker.state("e"), Some(BreakerState::HalfOpen));

        // Second acquirer while the probe is in flight is denied.
        assert!(!breaker.try_acquire("e"));
    }

    #[test]
    fn probe_success_closes() {
        let clock = Arc::new(StepClock::new());
        let breaker = manager(clock.clone());
        for _ in 0..3 {
            breaker.record_failure("e");
        }
        clock.advance(Duration::from_secs(1));
        assert!(breaker.try_acquire("e"));

        breaker.record_success("e");
        assert_eq!(breaker.state("e"), Some(BreakerState::Closed));
        assert!(breaker.try_acquire("e"));
    }

    #[test]
    fn probe_failure_reopens() {
        let clock = Arc::new(StepClock::new());
        let breaker = manager(clock.clone());
        for _ in 0..3 {
            breaker.record_failure("e");
        }
        clock.advance(Duration::from_secs(1));
        assert!(breaker.try_acquire("e"));

        breaker.record_failure("e");
        assert_eq!(breaker.state("e"), Some(BreakerState::Open));
        assert!(!breaker.try_acquire("e"));
    }

    #[test]
    fn abandon_releases_probe_without_counting() {
        let clock = Arc::new(StepClock::new());
        let breaker = manager(clock.clone());
        for _ in 0..3 {
            breaker.record_failure("e");
        }
        clock.advance(Duration::from_secs(1));
        assert!(breaker.try_acquire("e"));

        breaker.abandon("e");
        assert_eq!(breaker.state("e"), Some(BreakerState::HalfOpen));
        // The probe slot is free again.
        assert!(breaker.try_acquire("e"));
    }

    #[test]
    fn idle_breakers_are_evicted() {
        let clock = Arc::new(StepClock::new());
        let breaker = manager(clock.clone());
        breaker.record_failure("stale");

        clock.advance(Duration::from_secs(120));
        breaker.evict_idle(Duration::from_secs(60));
        assert_eq!(breaker.state("stale"), None);
    }

    #[test]
    fn endpoints_are_independent() {
        let breaker = manager(Arc::new(StepClock::new()));
        for _ in 0..3 {
            breaker.record_failure("down");
        }
        assert!(!breaker.try_acquire("down"));
        assert!(breaker.try_acquire("healthy"));
    }
}
