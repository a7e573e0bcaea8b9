//! Worker pool lifecycle: spawn, supervise, drain, cancel.
//!
//! The pool spawns one task per worker slot up to `max_workers`; the tuner
//! decides how many of them actively dequeue. Shutdown closes the queue,
//! lets active workers drain within the drain SLA, then cancels whatever
//! is still running and reports what was left behind.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use feedrelay_core::{metrics::names, Clock, DrainReport, MetricsSink, Store};

use crate::{
    error::Result,
    queue::WorkQueue,
    sender::WebhookSender,
    worker::{DeliveryWorker, PoolStats, TuningState},
};

/// Pool sizing and shutdown limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker tasks spawned; the tuner decides how many actively dequeue.
    pub max_workers: usize,
    /// Upper bound on one best-effort store record.
    pub store_timeout: Duration,
    /// Drain window granted to in-flight work at shutdown.
    pub drain_sla: Duration,
    /// Second join window after cancellation. Must cover the longest step a
    /// worker cannot abandon mid-way: one HTTP attempt plus one store write.
    pub cancel_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            store_timeout: Duration::from_secs(2),
            drain_sla: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(13),
        }
    }
}

/// Supervised set of delivery workers.
pub struct WorkerPool {
    config: PoolConfig,
    queue: Arc<WorkQueue>,
    sender: Arc<WebhookSender>,
    store: Arc<dyn Store>,
    stats: Arc<PoolStats>,
    tuning: Arc<TuningState>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates an idle pool; call [`spawn_workers`](Self::spawn_workers) to
    /// start it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PoolConfig,
        queue: Arc<WorkQueue>,
        sender: Arc<WebhookSender>,
        store: Arc<dyn Store>,
        stats: Arc<PoolStats>,
        tuning: Arc<TuningState>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            sender,
            store,
            stats,
            tuning,
            metrics,
            clock,
            cancel,
            handles: Vec::new(),
        }
    }

    /// Spawns every worker slot. Only the first `target_workers` of them
    /// dequeue; the rest park until the tuner raises the target.
    pub fn spawn_workers(&mut self) {
        info!(
            worker_slots = self.config.max_workers,
            active_target = self.tuning.target_workers(),
            "spawning delivery workers"
        );

        for id in 0..self.config.max_workers {
            let worker = DeliveryWorker::new(
                id,
                self.queue.clone(),
                self.sender.clone(),
                self.store.clone(),
                self.stats.clone(),
                self.tuning.clone(),
                self.metrics.clone(),
                self.clock.clone(),
                self.cancel.clone(),
                self.config.store_timeout,
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref e) = result {
                    error!(worker_id = id, error = %e, "delivery worker terminated with error");
                }
                result
            });
            self.handles.push(handle);
        }

        self.metrics.gauge(
            names::ACTIVE_WORKERS,
            &[],
            self.tuning.target_workers() as f64,
        );
        self.metrics.gauge(
            names::CURRENT_BATCH_SIZE,
            &[],
            self.tuning.batch_size() as f64,
        );
    }

    /// Drains and stops the pool.
    ///
    /// Closes the queue, unparks every worker so the backlog drains as fast
    /// as possible, and waits for the workers to exit within the drain SLA.
    /// Stragglers are cancelled and re-joined under a second bounded wait
    /// sized to cover the longest non-cancellable step (the store write),
    /// so the report is only built once the workers have actually stopped.
    /// Whatever never left the queue is reported as unfinished.
    pub async fn shutdown(mut self) -> DrainReport {
        info!(
            drain_sla_ms = self.config.drain_sla.as_millis() as u64,
            queued = self.queue.size(),
            "worker pool shutting down"
        );

        self.tuning.set_target_workers(self.config.max_workers);
        self.queue.close();

        if !Self::join_workers(&mut self.handles, self.config.drain_sla).await {
            warn!("drain SLA expired, cancelling outstanding deliveries");
            self.cancel.cancel();
            if !Self::join_workers(&mut self.handles, self.config.cancel_grace).await {
                error!(
                    remaining = self.handles.len(),
                    "cancellation grace expired before all workers exited; \
                     the drain report may undercount in-flight items"
                );
            }
        }

        let unfinished: Vec<String> =
            self.queue.drain_remaining().into_iter().map(|item| item.id).collect();
        let totals = self.stats.totals();

        self.metrics.gauge(names::ACTIVE_WORKERS, &[], 0.0);

        let report = DrainReport {
            delivered: totals.succeeded,
            failed: totals.failed,
            dropped: totals.dropped,
            unfinished,
        };
        info!(
            delivered = report.delivered,
            failed = report.failed,
            dropped = report.dropped,
            unfinished = report.unfinished.len(),
            clean = report.is_clean(),
            "worker pool stopped"
        );
        report
    }

    /// True while any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Shared clock, for collaborators spawned next to the pool.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Awaits worker handles until `window` elapses.
    ///
    /// Joined handles are removed from `handles`; a handle that misses the
    /// window stays put and can be re-awaited by a later call. Returns
    /// `true` once every worker has exited.
    async fn join_workers(
        handles: &mut Vec<JoinHandle<Result<()>>>,
        window: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        while let Some(handle) = handles.last_mut() {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(()))) => {
                    handles.pop();
                },
                Ok(Ok(Err(worker_error))) => {
                    warn!(error = %worker_error, "worker finished with error during drain");
                    handles.pop();
                },
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "worker task panicked during drain");
                    handles.pop();
                },
                Err(_) => return false,
            }
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancel.is_cancelled() {
            error!(
                active_workers = self.handles.iter().filter(|h| !h.is_finished()).count(),
                "worker pool dropped without shutdown; cancelling to avoid orphaned tasks"
            );
            self.queue.close();
            self.cancel.cancel();
        }
    }
}
