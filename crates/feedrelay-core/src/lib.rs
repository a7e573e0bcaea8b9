//! Core domain models and shared contracts.
//!
//! Provides the item data model, admission and delivery outcome types, the
//! error taxonomy, collaborator ports (fetcher, store, metrics sink), the
//! injectable clock, and the flat pipeline configuration record. All other
//! crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod time;

pub use config::{EndpointOptions, OverflowPolicy, PipelineConfig};
pub use metrics::{InMemoryMetrics, MetricsSink, NoOpMetrics, Snapshot};
pub use models::{
    AdmissionResult, ContentKind, DeliveryOutcome, DrainReport, EndpointKey, ErrorKind, Item,
    Priority, RejectReason,
};
pub use ports::{FetchError, FetchPage, Fetcher, NoOpStore, Store, StoreError};
pub use time::{Clock, RealClock};
