//! Bounded multi-priority work queue with admission-time dedup.
//!
//! Three FIFO lanes behind one mutex. Admission (validation, dedup,
//! capacity) happens synchronously under that single critical section;
//! dequeue blocks on a not-empty signal and drains in strict priority
//! order. The fingerprint index covers both queued and in-flight items, so
//! a duplicate cannot be admitted until its predecessor reaches a terminal
//! outcome and the worker releases it.
//!
//! The queue is a composition: [`PriorityLanes`] is the ordering primitive,
//! [`WorkQueue`] wraps it with the dedup index and exposes the single
//! tagged admission operation.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use feedrelay_core::{
    metrics::names, AdmissionResult, Clock, Item, MetricsSink, OverflowPolicy, Priority,
    RejectReason,
};

/// Queue behavior knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Aggregate bound across all lanes.
    pub max_size: usize,
    /// Behavior when an enqueue would exceed the bound.
    pub overflow_policy: OverflowPolicy,
    /// Optional promotion interval: items waiting longer move up one lane.
    pub age_boost_interval: Option<Duration>,
    /// Largest admissible payload.
    pub max_payload_bytes: usize,
    /// Optional global per-item deadline, stamped at admission.
    pub item_deadline: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            overflow_policy: OverflowPolicy::Displace,
            age_boost_interval: None,
            max_payload_bytes: 256 * 1024,
            item_deadline: None,
        }
    }
}

/// Strict-priority FIFO lanes. Ordering only; no capacity, no dedup.
#[derive(Debug, Default)]
struct PriorityLanes {
    lanes: [VecDeque<Item>; Priority::COUNT],
}

impl PriorityLanes {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    fn push(&mut self, item: Item) {
        self.lanes[item.priority.lane()].push_back(item);
    }

    /// Oldest item from the most urgent non-empty lane.
    fn pop_strict(&mut self) -> Option<Item> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Oldest item from the lowest non-empty lane strictly below `lane`.
    fn displace_below(&mut self, lane: usize) -> Option<Item> {
        for idx in (lane + 1..Priority::COUNT).rev() {
            if let Some(victim) = self.lanes[idx].pop_front() {
                return Some(victim);
            }
        }
        None
    }

    /// Moves items older than `interval` up one lane, keeping their
    /// relative order. Promoted items join the tail of the faster lane.
    fn promote_aged(&mut self, now: std::time::Instant, interval: Duration) {
        for lane in 1..Priority::COUNT {
            let mut keep = VecDeque::with_capacity(self.lanes[lane].len());
            while let Some(mut item) = self.lanes[lane].pop_front() {
                let aged = item
                    .enqueued_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= interval);
                if aged {
                    item.priority = Priority::from_lane(lane - 1).unwrap_or(item.priority);
                    self.lanes[lane - 1].push_back(item);
                } else {
                    keep.push_back(item);
                }
            }
            self.lanes[lane] = keep;
        }
    }

    fn sizes(&self) -> [usize; Priority::COUNT] {
        [self.lanes[0].len(), self.lanes[1].len(), self.lanes[2].len()]
    }
}

#[derive(Debug, Default)]
struct Inner {
    lanes: PriorityLanes,
    /// Fingerprints of queued and in-flight items.
    fingerprints: HashSet<String>,
    closed: bool,
}

/// Thread-safe bounded priority queue with dedup.
pub struct WorkQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<Inner>,
    not_empty: Notify,
    closed_signal: CancellationToken,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            clock,
            metrics,
            inner: Mutex::new(Inner::default()),
            not_empty: Notify::new(),
            closed_signal: CancellationToken::new(),
        }
    }

    /// Admits an item, or says why not.
    ///
    /// Runs entirely under the queue lock: dedup, capacity, and insertion
    /// are one atomic decision. Never blocks beyond that critical section.
    pub fn enqueue(&self, mut item: Item) -> AdmissionResult {
        let start = self.clock.now();

        if let Err(reason) = item.validate(self.config.max_payload_bytes) {
            tracing::debug!(item_id = %item.id, %reason, "item failed validation");
            self.metrics.incr(
                names::ITEMS_REJECTED,
                &[("reason", RejectReason::ValidationFailed.as_str())],
                1,
            );
            return AdmissionResult::Rejected(RejectReason::ValidationFailed);
        }

        let sizes;
        let displaced;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            if inner.closed {
                self.metrics.incr(
                    names::ITEMS_REJECTED,
                    &[("reason", RejectReason::ShuttingDown.as_str())],
                    1,
                );
                return AdmissionResult::Rejected(RejectReason::ShuttingDown);
            }

            if inner.fingerprints.contains(&item.fingerprint) {
                self.metrics.incr(
                    names::ITEMS_REJECTED,
                    &[("reason", RejectReason::Duplicate.as_str())],
                    1,
                );
                return AdmissionResult::Rejected(RejectReason::Duplicate);
            }

            displaced = if inner.lanes.len() >= self.config.max_size {
                match self.config.overflow_policy {
                    OverflowPolicy::Reject => {
                        self.metrics.incr(
                            names::ITEMS_REJECTED,
                            &[("reason", RejectReason::QueueFull.as_str())],
                            1,
                        );
                        return AdmissionResult::Rejected(RejectReason::QueueFull);
                    },
                    OverflowPolicy::Displace => {
                        match inner.lanes.displace_below(item.priority.lane()) {
                            Some(victim) => {
                                inner.fingerprints.remove(&victim.fingerprint);
                                Some(victim)
                            },
                            None => {
                                self.metrics.incr(
                                    names::ITEMS_REJECTED,
                                    &[("reason", RejectReason::QueueFull.as_str())],
                                    1,
                                );
                                return AdmissionResult::Rejected(RejectReason::QueueFull);
                            },
                        }
                    },
                }
            } else {
                None
            };

            let now = self.clock.now();
            item.enqueued_at = Some(now);
            if item.deadline_at.is_none() {
                item.deadline_at = self.config.item_deadline.map(|d| now + d);
            }
            inner.fingerprints.insert(item.fingerprint.clone());
            let priority = item.priority;
            inner.lanes.push(item);
            sizes = inner.lanes.sizes();

            self.metrics.incr(names::ITEMS_ADMITTED, &[("priority", priority.as_str())], 1);
        }

        if let Some(victim) = displaced {
            tracing::warn!(
                item_id = %victim.id,
                lane = victim.priority.as_str(),
                "displaced queued item to admit higher priority"
            );
            self.metrics.incr(names::OVERFLOW, &[("lane", victim.priority.as_str())], 1);
        }
        self.publish_sizes(sizes);
        self.metrics.observe(
            names::ENQUEUE_DURATION,
            &[],
            self.clock.now().saturating_duration_since(start).as_secs_f64(),
        );

        self.not_empty.notify_one();
        AdmissionResult::Admitted
    }

    /// Blocks until at least one item is available, then drains up to
    /// `max` in strict priority order.
    ///
    /// Returns `None` once the queue is closed and fully drained, or when
    /// `cancel` fires first. Dequeued fingerprints stay reserved until
    /// [`complete`](Self::complete).
    pub async fn dequeue_batch(
        &self,
        max: usize,
        cancel: &CancellationToken,
    ) -> Option<Vec<Item>> {
        let max = max.max(1);
        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

                if let Some(interval) = self.config.age_boost_interval {
                    inner.lanes.promote_aged(self.clock.now(), interval);
                }

                if !inner.lanes.is_empty() {
                    let mut batch = Vec::with_capacity(max.min(inner.lanes.len()));
                    while batch.len() < max {
                        match inner.lanes.pop_strict() {
                            Some(item) => batch.push(item),
                            None => break,
                        }
                    }
                    let sizes = inner.lanes.sizes();
                    let more = !inner.lanes.is_empty();
                    drop(inner);

                    let now = self.clock.now();
                    for item in &batch {
                        if let Some(at) = item.enqueued_at {
                            self.metrics.observe(
                                names::QUEUE_WAIT,
                                &[],
                                now.saturating_duration_since(at).as_secs_f64(),
                            );
                        }
                    }
                    self.publish_sizes(sizes);
                    if more {
                        // Hand the wakeup on so a second waiter can claim
                        // the remainder.
                        self.not_empty.notify_one();
                    }
                    return Some(batch);
                }

                if inner.closed {
                    return None;
                }
            }

            tokio::select! {
                () = self.not_empty.notified() => {},
                () = self.closed_signal.cancelled() => {},
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Releases an in-flight fingerprint after its terminal outcome.
    ///
    /// Returns `false` when the fingerprint was not reserved, which means
    /// the dedup index and the in-flight set disagree.
    #[must_use]
    pub fn complete(&self, fingerprint: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.fingerprints.remove(fingerprint)
    }

    /// Closes the queue: wakes all waiters, refuses new items, lets
    /// dequeuers drain what is left.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
        }
        self.closed_signal.cancel();
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Queued items across all lanes.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).lanes.len()
    }

    /// Queued items per lane, most urgent first.
    pub fn size_by_lane(&self) -> [usize; Priority::COUNT] {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).lanes.sizes()
    }

    /// Empties the queue, releasing fingerprints, and returns what was
    /// still waiting. Used by shutdown to report unfinished items.
    pub fn drain_remaining(&self) -> Vec<Item> {
        let (remaining, sizes) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut remaining = Vec::with_capacity(inner.lanes.len());
            while let Some(item) = inner.lanes.pop_strict() {
                inner.fingerprints.remove(&item.fingerprint);
                remaining.push(item);
            }
            (remaining, inner.lanes.sizes())
        };
        self.publish_sizes(sizes);
        remaining
    }

    fn publish_sizes(&self, sizes: [usize; Priority::COUNT]) {
        for (lane, size) in sizes.iter().enumerate() {
            if let Some(priority) = Priority::from_lane(lane) {
                self.metrics.gauge(
                    names::QUEUE_SIZE,
                    &[("lane", priority.as_str())],
                    *size as f64,
                );
            }
        }
    }
}
