//! Closed-loop tuning of batch size and worker count.
//!
//! A periodic controller reads CPU utilization, error rate, and throughput
//! trend, and multiplies the current batch size and worker count by
//! bounded factors:
//!
//! ```text
//! cpu_factor   = clamp(target_cpu / observed_cpu, 0.5, 2.0)
//! error_factor = 1 / (1 + error_rate * 10)
//! trend_factor = clamp(throughput_short / throughput_long, 0.7, 1.3)
//! ```
//!
//! New values apply at the next dequeue boundary. A tick that produces
//! non-finite numbers keeps the previous values. The worker count never
//! drops below what the current backlog needs to drain within the
//! configured SLA at the observed per-item latency.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use feedrelay_core::{metrics::names, Clock, MetricsSink};

use crate::{
    circuit::CircuitBreakerManager,
    queue::WorkQueue,
    ratelimit::EndpointRateLimiter,
    worker::{PoolStats, PoolTotals, TuningState},
};

/// CPU utilization source, injectable for tests.
pub trait CpuProbe: Send + Sync {
    /// Utilization in percent, or `None` when unavailable on this host.
    fn sample(&self) -> Option<f64>;
}

/// Probe reading aggregate utilization from `/proc/stat` deltas.
///
/// The first sample primes the baseline and reports `None`; hosts without
/// `/proc/stat` always report `None`, which the controller treats as a
/// neutral factor.
#[derive(Debug, Default)]
pub struct ProcStatProbe {
    last: Mutex<Option<(u64, u64)>>,
}

impl ProcStatProbe {
    /// Creates an unprimed probe.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CpuProbe for ProcStatProbe {
    fn sample(&self) -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let fields: Vec<u64> =
            line.split_whitespace().skip(1).filter_map(|f| f.parse().ok()).collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let previous = last.replace((idle, total));
        let (prev_idle, prev_total) = previous?;

        let total_delta = total.saturating_sub(prev_total);
        if total_delta == 0 {
            return None;
        }
        let idle_delta = idle.saturating_sub(prev_idle);
        Some(100.0 * (1.0 - idle_delta as f64 / total_delta as f64))
    }
}

/// Controller bounds and cadence.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    /// Batch size bounds.
    pub min_batch: usize,
    /// Upper batch bound.
    pub max_batch: usize,
    /// Worker count bounds.
    pub min_workers: usize,
    /// Upper worker bound.
    pub max_workers: usize,
    /// CPU setpoint, percent.
    pub target_cpu_percent: f64,
    /// Tick interval.
    pub tick: Duration,
    /// Shutdown drain deadline the worker floor protects.
    pub drain_sla: Duration,
    /// TTL for idle endpoint state, swept once per tick.
    pub endpoint_idle_ttl: Duration,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_batch: 10,
            max_batch: 500,
            min_workers: 2,
            max_workers: 16,
            target_cpu_percent: 70.0,
            tick: Duration::from_secs(5),
            drain_sla: Duration::from_secs(30),
            endpoint_idle_ttl: Duration::from_secs(600),
        }
    }
}

/// Exponential moving average.
#[derive(Debug, Clone, Copy)]
struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(current) => current + self.alpha * (sample - current),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    fn get(&self) -> Option<f64> {
        self.value
    }
}

/// Inputs to one tuning decision.
#[derive(Debug, Clone, Copy)]
struct Readings {
    batch: usize,
    workers: usize,
    observed_cpu: f64,
    error_rate: f64,
    trend_short: f64,
    trend_long: f64,
    queue_depth: usize,
    avg_latency_secs: f64,
}

/// Applies the tuning formula. Returns `None` when the inputs degenerate,
/// in which case the previous values stand.
fn plan(config: &TunerConfig, readings: &Readings) -> Option<(usize, usize)> {
    if !readings.observed_cpu.is_finite()
        || !readings.error_rate.is_finite()
        || !readings.trend_short.is_finite()
        || !readings.trend_long.is_finite()
    {
        return None;
    }

    let cpu_factor =
        (config.target_cpu_percent / readings.observed_cpu.max(1.0)).clamp(0.5, 2.0);
    let error_factor = 1.0 / (1.0 + readings.error_rate * 10.0);
    let trend_factor = if readings.trend_long > f64::EPSILON {
        (readings.trend_short / readings.trend_long).clamp(0.7, 1.3)
    } else {
        1.0
    };

    let combined = cpu_factor * error_factor * trend_factor;
    if !combined.is_finite() || !cpu_factor.is_finite() {
        return None;
    }

    let batch = ((readings.batch as f64 * combined).round() as usize)
        .clamp(config.min_batch, config.max_batch);
    let mut workers = ((readings.workers as f64 * cpu_factor).round() as usize)
        .clamp(config.min_workers, config.max_workers);

    // Floor: enough workers to drain the backlog within the SLA at the
    // observed per-item latency.
    if readings.avg_latency_secs > 0.0 && readings.queue_depth > 0 {
        let required = (readings.queue_depth as f64 * readings.avg_latency_secs
            / config.drain_sla.as_secs_f64())
        .ceil() as usize;
        workers = workers.max(required.min(config.max_workers));
    }

    Some((batch, workers))
}

/// Periodic controller adjusting the shared [`TuningState`].
pub struct AdaptiveController {
    config: TunerConfig,
    tuning: Arc<TuningState>,
    stats: Arc<PoolStats>,
    queue: Arc<WorkQueue>,
    limiter: Arc<EndpointRateLimiter>,
    breakers: Arc<CircuitBreakerManager>,
    probe: Arc<dyn CpuProbe>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl AdaptiveController {
    /// Creates a controller.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TunerConfig,
        tuning: Arc<TuningState>,
        stats: Arc<PoolStats>,
        queue: Arc<WorkQueue>,
        limiter: Arc<EndpointRateLimiter>,
        breakers: Arc<CircuitBreakerManager>,
        probe: Arc<dyn CpuProbe>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            tuning,
            stats,
            queue,
            limiter,
            breakers,
            probe,
            clock,
            metrics,
            cancel,
        }
    }

    /// Runs the tick loop until cancelled.
    pub async fn run(self) {
        let mut last = self.stats.totals();
        let mut cpu_ema = Ema::new(0.5);
        let mut throughput_short = Ema::new(0.6);
        let mut throughput_long = Ema::new(0.15);

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.tick) => {},
                () = self.cancel.cancelled() => break,
            }

            let totals = self.stats.totals();
            let readings = self.collect(
                &mut last,
                totals,
                &mut cpu_ema,
                &mut throughput_short,
                &mut throughput_long,
            );

            match plan(&self.config, &readings) {
                Some((batch, workers)) => {
                    self.tuning.set_batch_size(batch);
                    self.tuning.set_target_workers(workers);
                    self.metrics.gauge(names::CURRENT_BATCH_SIZE, &[], batch as f64);
                    self.metrics.gauge(names::ACTIVE_WORKERS, &[], workers as f64);
                    debug!(
                        batch,
                        workers,
                        cpu = readings.observed_cpu,
                        error_rate = readings.error_rate,
                        queue_depth = readings.queue_depth,
                        "tuning applied"
                    );
                },
                None => {
                    warn!("tuning inputs degenerate, keeping previous values");
                },
            }

            self.limiter.evict_idle();
            self.breakers.evict_idle(self.config.endpoint_idle_ttl);
        }
    }

    fn collect(
        &self,
        last: &mut PoolTotals,
        totals: PoolTotals,
        cpu_ema: &mut Ema,
        throughput_short: &mut Ema,
        throughput_long: &mut Ema,
    ) -> Readings {
        let tick_secs = self.config.tick.as_secs_f64().max(f64::EPSILON);
        let processed = totals.processed.saturating_sub(last.processed);
        let failed = totals.failed.saturating_sub(last.failed);
        let latency_micros =
            totals.send_latency_micros.saturating_sub(last.send_latency_micros);
        let latency_samples =
            totals.send_latency_samples.saturating_sub(last.send_latency_samples);
        *last = totals;

        let throughput = processed as f64 / tick_secs;
        let short = throughput_short.update(throughput);
        let long = throughput_long.update(throughput);

        let error_rate = if processed > 0 { failed as f64 / processed as f64 } else { 0.0 };
        let avg_latency_secs = if latency_samples > 0 {
            latency_micros as f64 / latency_samples as f64 / 1_000_000.0
        } else {
            0.0
        };

        let observed_cpu = match self.probe.sample() {
            Some(cpu) => cpu_ema.update(cpu),
            // Without a probe the cpu factor stays neutral.
            None => cpu_ema.get().unwrap_or(self.config.target_cpu_percent),
        };

        Readings {
            batch: self.tuning.batch_size(),
            workers: self.tuning.target_workers(),
            observed_cpu,
            error_rate,
            trend_short: short,
            trend_long: long,
            queue_depth: self.queue.size(),
            avg_latency_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunerConfig {
        TunerConfig::default()
    }

    fn readings() -> Readings {
        Readings {
            batch: 100,
            workers: 8,
            observed_cpu: 70.0,
            error_rate: 0.0,
            trend_short: 10.0,
            trend_long: 10.0,
            queue_depth: 0,
            avg_latency_secs: 0.0,
        }
    }

    #[test]
    fn at_setpoint_nothing_changes() {
        let (batch, workers) = plan(&config(), &readings()).unwrap();
        assert_eq!(batch, 100);
        assert_eq!(workers, 8);
    }

    #[test]
    fn idle_cpu_grows_batch_and_workers() {
        let r = Readings { observed_cpu: 35.0, ..readings() };
        let (batch, workers) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 200);
        assert_eq!(workers, 16);
    }

    #[test]
    fn saturated_cpu_shrinks() {
        let r = Readings { observed_cpu: 140.0, ..readings() };
        let (batch, workers) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 50);
        assert_eq!(workers, 4);
    }

    #[test]
    fn cpu_factor_is_clamped() {
        // Near-zero CPU would suggest a 70x factor; the clamp holds it at 2.
        let r = Readings { observed_cpu: 0.5, ..readings() };
        let (batch, _) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 200);
    }

    #[test]
    fn errors_throttle_batch() {
        let r = Readings { error_rate: 0.3, ..readings() };
        let (batch, _) = plan(&config(), &r).unwrap();
        // 1 / (1 + 3) = 0.25
        assert_eq!(batch, 25);
    }

    #[test]
    fn trend_factor_is_clamped() {
        let r = Readings { trend_short: 100.0, trend_long: 10.0, ..readings() };
        let (batch, _) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 130);

        let r = Readings { trend_short: 1.0, trend_long: 10.0, ..readings() };
        let (batch, _) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 70);
    }

    #[test]
    fn bounds_are_enforced() {
        let r = Readings { batch: 480, workers: 15, observed_cpu: 20.0, ..readings() };
        let (batch, workers) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 500);
        assert_eq!(workers, 16);

        let r = Readings { batch: 12, workers: 3, observed_cpu: 140.0, error_rate: 1.0, ..readings() };
        let (batch, workers) = plan(&config(), &r).unwrap();
        assert_eq!(batch, 10);
        assert_eq!(workers, 2);
    }

    #[test]
    fn drain_floor_holds_workers_up() {
        // 2000 queued at 0.5s each over a 30s SLA needs 34 workers; the
        // max bound wins, but the floor overrides the cpu shrink.
        let r = Readings {
            observed_cpu: 140.0,
            queue_depth: 2000,
            avg_latency_secs: 0.5,
            ..readings()
        };
        let (_, workers) = plan(&config(), &r).unwrap();
        assert_eq!(workers, 16);

        // A small backlog needs only two workers; cpu shrink applies.
        let r = Readings {
            observed_cpu: 140.0,
            queue_depth: 60,
            avg_latency_secs: 0.5,
            ..readings()
        };
        let (_, workers) = plan(&config(), &r).unwrap();
        assert_eq!(workers, 4);
    }

    #[test]
    fn degenerate_inputs_keep_previous() {
        let r = Readings { observed_cpu: f64::NAN, ..readings() };
        assert!(plan(&config(), &r).is_none());
    }

    #[test]
    fn ema_converges_toward_samples() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.update(10.0), 10.0);
        assert_eq!(ema.update(20.0), 15.0);
        assert!(ema.get().unwrap() > 10.0);
    }
}
