//! Feed-to-webhook delivery pipeline.
//!
//! Binds a bounded multi-priority work queue, a per-endpoint rate limiter
//! and circuit breaker, a retrying HTTP sender, and an adaptive worker pool
//! into one in-process delivery path.
//!
//! # Pipeline Architecture
//!
//! ```text
//!   Fetcher ──▶ enqueue ──▶ ┌───────────────────────────┐
//!   (pull)      (admission) │       WorkQueue           │
//!                           │  high ▸▸▸▸ ┐              │
//!                           │  normal ▸▸ ┤ strict       │
//!                           │  low ▸     ┘ priority     │
//!                           │  [fingerprint dedup]      │
//!                           └───────────────────────────┘
//!                                       │ dequeue_batch
//!                     ┌─────────────────┼─────────────────┐
//!                     ▼                 ▼                 ▼
//!              ┌────────────┐   ┌────────────┐   ┌────────────┐
//!              │  Worker 0  │   │  Worker 1  │   │  Worker N  │
//!              └────────────┘   └────────────┘   └────────────┘
//!                     │                │                │
//!                     ▼                ▼                ▼
//!              ┌─────────────────────────────────────────────┐
//!              │ WebhookSender                               │
//!              │   breaker ▸ rate limit ▸ POST ▸ classify    │
//!              │   ▸ backoff(jitter) ▸ retry                 │
//!              └─────────────────────────────────────────────┘
//!                     │                                │
//!                     ▼                                ▼
//!               Endpoint A                        Endpoint B
//!
//!   AdaptiveController ──(cpu, error rate, throughput trend)──▶
//!       batch size + worker count, applied at dequeue boundaries
//! ```
//!
//! Admission, dedup, and capacity live in [`queue`]; per-endpoint pacing in
//! [`ratelimit`]; failure gating in [`circuit`]; the retry loop in
//! [`sender`]; dispatch and closed-loop tuning in [`worker`],
//! [`worker_pool`], and [`tuner`]. [`pipeline`] wires everything together
//! behind a small embedding surface: `enqueue`, `stats`, `shutdown`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod sender;
pub mod tuner;
pub mod worker;
pub mod worker_pool;

pub use circuit::{BreakerConfig, BreakerState, CircuitBreakerManager};
pub use client::{ClientConfig, DeliveryRequest, DeliveryResponse, WebhookClient};
pub use error::{DeliveryError, Result};
pub use fetch::{FetchDriver, FetchDriverConfig};
pub use pipeline::DeliveryPipeline;
pub use queue::{QueueConfig, WorkQueue};
pub use ratelimit::{EndpointRateLimiter, RateLimitConfig};
pub use retry::RetryPolicy;
pub use sender::WebhookSender;
pub use tuner::{AdaptiveController, CpuProbe, ProcStatProbe, TunerConfig};
pub use worker::{DeliveryWorker, PoolStats, PoolTotals, TuningState};
pub use worker_pool::{PoolConfig, WorkerPool};

/// Poll interval for workers parked by the tuner.
pub(crate) const PARKED_WORKER_POLL: std::time::Duration =
    std::time::Duration::from_millis(250);
