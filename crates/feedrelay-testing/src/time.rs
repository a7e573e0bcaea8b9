//! Deterministic clock for timing-sensitive tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use feedrelay_core::Clock;

/// Clock whose time only moves when a test advances it.
///
/// `sleep` advances virtual time by the requested duration and completes
/// immediately, so code paths that space themselves out (rate limiter,
/// backoff) run instantly while still observing correct virtual intervals.
#[derive(Clone)]
pub struct TestClock {
    monotonic_ns: Arc<AtomicU64>,
    system_secs: Arc<AtomicU64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a clock anchored at the current time with zero elapsed.
    pub fn new() -> Self {
        let since_epoch =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_secs: Arc::new(AtomicU64::new(since_epoch.as_secs())),
            base_instant: Instant::now(),
        }
    }

    /// Moves both clocks forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0);
        self.monotonic_ns.fetch_add(nanos, Ordering::AcqRel);
        self.system_secs.fetch_add(duration.as_secs(), Ordering::AcqRel);
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.system_secs.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Advance lazily at first poll so that building the future (for
        // example as a select arm) does not move time by itself.
        let clock = self.clone();
        Box::pin(async move {
            clock.advance(duration);
            tokio::task::yield_now().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_monotonic_time() {
        let clock = TestClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(7));
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn sleep_advances_virtually() {
        let clock = TestClock::new();
        clock.sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(other.elapsed(), Duration::from_millis(250));
    }
}
