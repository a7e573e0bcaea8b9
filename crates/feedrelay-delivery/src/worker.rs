//! Delivery workers and the shared state they report into.
//!
//! A worker loops: dequeue a batch at the current adaptive size, run every
//! item through the sender, release fingerprints, hand outcomes to the
//! store, and account stats. Workers whose id is at or past the tuner's
//! target are parked and re-check at the next poll, which is how worker
//! count changes take effect at dequeue boundaries.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use feedrelay_core::{metrics::names, Clock, DeliveryOutcome, Item, MetricsSink, Store};

use crate::{
    error::{DeliveryError, Result},
    queue::WorkQueue,
    sender::WebhookSender,
    PARKED_WORKER_POLL,
};

/// Live tuning knobs shared between the controller and the workers.
///
/// Workers read these at every dequeue boundary; the controller writes them
/// on its tick. Plain atomics, no coordination needed.
#[derive(Debug)]
pub struct TuningState {
    batch_size: AtomicUsize,
    target_workers: AtomicUsize,
}

impl TuningState {
    /// Creates tuning state with starting values.
    pub fn new(batch_size: usize, target_workers: usize) -> Self {
        Self {
            batch_size: AtomicUsize::new(batch_size),
            target_workers: AtomicUsize::new(target_workers),
        }
    }

    /// Current batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Updates the batch size.
    pub fn set_batch_size(&self, size: usize) {
        self.batch_size.store(size, Ordering::Relaxed);
    }

    /// Number of workers allowed to dequeue.
    pub fn target_workers(&self) -> usize {
        self.target_workers.load(Ordering::Relaxed)
    }

    /// Updates the active worker target.
    pub fn set_target_workers(&self, workers: usize) {
        self.target_workers.store(workers, Ordering::Relaxed);
    }
}

/// Pool-wide counters, all lock-free.
#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    workers_busy: AtomicU64,
    send_latency_micros: AtomicU64,
    send_latency_samples: AtomicU64,
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolTotals {
    /// Items that reached a terminal outcome.
    pub processed: u64,
    /// Successful deliveries.
    pub succeeded: u64,
    /// Terminal failures.
    pub failed: u64,
    /// Items abandoned by shutdown.
    pub dropped: u64,
    /// Sum of successful send latencies, microseconds.
    pub send_latency_micros: u64,
    /// Number of latency samples.
    pub send_latency_samples: u64,
}

impl PoolStats {
    /// Creates zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts one terminal outcome.
    pub fn record_outcome(&self, outcome: &DeliveryOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            DeliveryOutcome::Succeeded { latency, .. } => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.send_latency_micros
                    .fetch_add(latency.as_micros().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
                self.send_latency_samples.fetch_add(1, Ordering::Relaxed);
            },
            DeliveryOutcome::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            },
            DeliveryOutcome::Dropped { .. } => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    /// Workers currently processing a batch.
    pub fn workers_busy(&self) -> u64 {
        self.workers_busy.load(Ordering::Relaxed)
    }

    /// Copies all counters.
    pub fn totals(&self) -> PoolTotals {
        PoolTotals {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_latency_micros: self.send_latency_micros.load(Ordering::Relaxed),
            send_latency_samples: self.send_latency_samples.load(Ordering::Relaxed),
        }
    }

    fn enter_batch(&self) {
        self.workers_busy.fetch_add(1, Ordering::Relaxed);
    }

    fn leave_batch(&self) {
        self.workers_busy.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One delivery worker.
pub struct DeliveryWorker {
    id: usize,
    queue: Arc<WorkQueue>,
    sender: Arc<WebhookSender>,
    store: Arc<dyn Store>,
    stats: Arc<PoolStats>,
    tuning: Arc<TuningState>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    store_timeout: Duration,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queue: Arc<WorkQueue>,
        sender: Arc<WebhookSender>,
        store: Arc<dyn Store>,
        stats: Arc<PoolStats>,
        tuning: Arc<TuningState>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        store_timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            sender,
            store,
            stats,
            tuning,
            metrics,
            clock,
            cancel,
            store_timeout,
        }
    }

    /// Main loop: dequeue, deliver, record, until the queue closes or the
    /// worker observes an invariant violation.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the dedup index disagrees with the
    /// in-flight set; the supervisor may restart the worker.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.id >= self.tuning.target_workers() {
                if self.queue.is_closed() {
                    break;
                }
                tokio::select! {
                    () = self.clock.sleep(PARKED_WORKER_POLL) => continue,
                    () = self.cancel.cancelled() => break,
                }
            }

            let batch_size = self.tuning.batch_size();
            let Some(batch) = self.queue.dequeue_batch(batch_size, &self.cancel).await else {
                break;
            };

            debug!(worker_id = self.id, batch = batch.len(), "processing batch");
            self.metrics.observe(names::BATCH_SIZE_OBSERVED, &[], batch.len() as f64);

            self.stats.enter_batch();
            let results = self.sender.send_batch(batch).await;
            self.stats.leave_batch();

            for (item, outcome) in results {
                self.finish_item(item, outcome).await?;
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Side effects for one finalized outcome: fingerprint release, stats,
    /// metrics, best-effort store record. Runs strictly after the outcome
    /// is terminal.
    async fn finish_item(&self, item: Item, outcome: DeliveryOutcome) -> Result<()> {
        if !self.queue.complete(&item.fingerprint) {
            self.metrics.incr(names::INTERNAL_ERRORS, &[], 1);
            error!(
                worker_id = self.id,
                item_id = %item.id,
                fingerprint = %item.fingerprint,
                "fingerprint missing from dedup index; tearing down worker"
            );
            return Err(DeliveryError::internal("dedup index inconsistency"));
        }

        self.stats.record_outcome(&outcome);
        if let Some(at) = item.enqueued_at {
            self.metrics.observe(
                names::ENQUEUE_TO_SEND,
                &[],
                self.clock.now().saturating_duration_since(at).as_secs_f64(),
            );
        }

        match tokio::time::timeout(self.store_timeout, self.store.record(&item, &outcome)).await
        {
            Ok(Ok(())) => {},
            Ok(Err(store_error)) => {
                self.metrics.incr(names::STORE_ERRORS, &[], 1);
                warn!(
                    worker_id = self.id,
                    item_id = %item.id,
                    error = %store_error,
                    "store record failed, continuing"
                );
            },
            Err(_) => {
                self.metrics.incr(names::STORE_ERRORS, &[], 1);
                warn!(
                    worker_id = self.id,
                    item_id = %item.id,
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "store record timed out, continuing"
                );
            },
        }

        Ok(())
    }
}
