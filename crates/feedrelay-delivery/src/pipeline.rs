//! Pipeline assembly and embedding surface.
//!
//! [`DeliveryPipeline`] constructs every component from one
//! [`PipelineConfig`], wires them through explicit `Arc`s (no globals), and
//! exposes the three operations embedders use: `enqueue`, `stats`,
//! `shutdown`. The fetch driver is optional; a library embedder can push
//! items directly.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use feedrelay_core::{
    AdmissionResult, Clock, DrainReport, Fetcher, InMemoryMetrics, Item, PipelineConfig,
    Priority, Snapshot, Store,
};

use crate::{
    circuit::{BreakerConfig, CircuitBreakerManager},
    client::{ClientConfig, WebhookClient},
    error::{DeliveryError, Result},
    fetch::{FetchDriver, FetchDriverConfig},
    queue::{QueueConfig, WorkQueue},
    ratelimit::{EndpointRateLimiter, RateLimitConfig},
    retry::RetryPolicy,
    sender::WebhookSender,
    tuner::{AdaptiveController, CpuProbe, TunerConfig},
    worker::{PoolStats, TuningState},
    worker_pool::{PoolConfig, WorkerPool},
};

/// TTL for idle per-endpoint limiter and breaker state.
const ENDPOINT_IDLE_TTL: Duration = Duration::from_secs(600);

/// The assembled delivery pipeline.
pub struct DeliveryPipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<InMemoryMetrics>,
    queue: Arc<WorkQueue>,
    limiter: Arc<EndpointRateLimiter>,
    breakers: Arc<CircuitBreakerManager>,
    probe: Arc<dyn CpuProbe>,
    stats: Arc<PoolStats>,
    tuning: Arc<TuningState>,
    fetch_cancel: CancellationToken,
    hard_cancel: CancellationToken,
    pool: WorkerPool,
    controller: Option<JoinHandle<()>>,
    fetch_driver: Option<JoinHandle<()>>,
}

impl DeliveryPipeline {
    /// Builds the pipeline from configuration and collaborators.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid option combinations or an
    /// unusable HTTP client setup.
    pub fn new(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        probe: Arc<dyn CpuProbe>,
    ) -> Result<Self> {
        config.validate().map_err(|e| DeliveryError::configuration(e.to_string()))?;

        let metrics = Arc::new(InMemoryMetrics::new());
        let fetch_cancel = CancellationToken::new();
        let hard_cancel = CancellationToken::new();

        let queue = Arc::new(WorkQueue::new(
            QueueConfig {
                max_size: config.queue_max_size,
                overflow_policy: config.overflow_policy,
                age_boost_interval: config.age_boost_interval(),
                max_payload_bytes: config.max_payload_bytes,
                item_deadline: config.item_deadline(),
            },
            clock.clone(),
            metrics.clone(),
        ));

        let limiter = Arc::new(EndpointRateLimiter::new(
            RateLimitConfig {
                default_interval: Duration::from_millis(config.min_send_interval_ms),
                overrides: config
                    .endpoint_overrides
                    .iter()
                    .filter_map(|(key, options)| {
                        options.min_interval_ms.map(|ms| (key.clone(), Duration::from_millis(ms)))
                    })
                    .collect(),
                idle_ttl: ENDPOINT_IDLE_TTL,
            },
            clock.clone(),
            metrics.clone(),
        ));

        let breakers = Arc::new(CircuitBreakerManager::new(
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                reset_timeout: config.breaker_reset_timeout(),
            },
            clock.clone(),
            metrics.clone(),
        ));

        let client = WebhookClient::new(ClientConfig {
            attempt_timeout: config.per_attempt_timeout(),
            ..ClientConfig::default()
        })?;

        let sender = Arc::new(WebhookSender::new(
            client,
            limiter.clone(),
            breakers.clone(),
            RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base(),
                max_delay: config.retry_cap(),
            },
            config.endpoint_overrides.clone(),
            clock.clone(),
            metrics.clone(),
            hard_cancel.clone(),
        ));

        let stats = Arc::new(PoolStats::new());
        let tuning = Arc::new(TuningState::new(config.min_batch, config.min_workers));

        let pool = WorkerPool::new(
            PoolConfig {
                max_workers: config.max_workers,
                store_timeout: config.store_timeout(),
                drain_sla: config.drain_sla(),
                // A cancelled worker still finishes its current HTTP attempt
                // and the bounded store write before it can exit.
                cancel_grace: config.per_attempt_timeout()
                    + config.store_timeout()
                    + Duration::from_secs(1),
            },
            queue.clone(),
            sender,
            store,
            stats.clone(),
            tuning.clone(),
            metrics.clone(),
            clock.clone(),
            hard_cancel.clone(),
        );

        Ok(Self {
            config,
            clock,
            metrics,
            queue,
            limiter,
            breakers,
            probe,
            stats,
            tuning,
            fetch_cancel,
            hard_cancel,
            pool,
            controller: None,
            fetch_driver: None,
        })
    }

    /// Spawns the worker pool and the adaptive controller.
    pub fn start(&mut self) {
        self.pool.spawn_workers();

        let controller = AdaptiveController::new(
            TunerConfig {
                min_batch: self.config.min_batch,
                max_batch: self.config.max_batch,
                min_workers: self.config.min_workers,
                max_workers: self.config.max_workers,
                target_cpu_percent: self.config.target_cpu_percent,
                tick: self.config.tune_interval(),
                drain_sla: self.config.drain_sla(),
                endpoint_idle_ttl: ENDPOINT_IDLE_TTL,
            },
            self.tuning.clone(),
            self.stats.clone(),
            self.queue.clone(),
            self.limiter.clone(),
            self.breakers.clone(),
            self.probe.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            self.hard_cancel.clone(),
        );
        self.controller = Some(tokio::spawn(controller.run()));

        info!(
            workers = self.config.min_workers,
            batch = self.config.min_batch,
            "delivery pipeline started"
        );
    }

    /// Spawns the fetch driver pulling from `fetcher`.
    pub fn spawn_fetch_driver(&mut self, fetcher: Arc<dyn Fetcher>) {
        let driver = FetchDriver::new(
            FetchDriverConfig {
                interval: self.config.fetch_interval(),
                page_size: self.config.fetch_page_size,
            },
            fetcher,
            self.queue.clone(),
            self.clock.clone(),
            self.fetch_cancel.clone(),
        );
        self.fetch_driver = Some(tokio::spawn(driver.run()));
    }

    /// Submits one item for delivery.
    pub fn enqueue(&self, item: Item) -> AdmissionResult {
        self.queue.enqueue(item)
    }

    /// Complete metrics snapshot, available at any point in the lifecycle.
    pub fn stats(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Queued items across lanes.
    pub fn queue_depth(&self) -> usize {
        self.queue.size()
    }

    /// Queued items per lane.
    pub fn queue_depth_by_lane(&self) -> [usize; Priority::COUNT] {
        self.queue.size_by_lane()
    }

    /// Breaker registry, for operational tooling and tests.
    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    /// Metrics registry backing [`stats`](Self::stats).
    pub fn metrics(&self) -> Arc<InMemoryMetrics> {
        self.metrics.clone()
    }

    /// Stops fetching, drains the queue within the drain SLA, cancels
    /// stragglers, and reports what happened.
    pub async fn shutdown(mut self) -> DrainReport {
        info!("pipeline shutdown requested");

        self.fetch_cancel.cancel();
        if let Some(handle) = self.fetch_driver.take() {
            let _ = handle.await;
        }

        let report = self.pool.shutdown().await;

        self.hard_cancel.cancel();
        if let Some(handle) = self.controller.take() {
            let _ = handle.await;
        }

        report
    }
}
