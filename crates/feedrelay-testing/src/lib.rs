//! Test support for the delivery pipeline.
//!
//! Deterministic time control plus scripted collaborator doubles so that
//! timing-sensitive behavior (rate-limit spacing, breaker reset windows,
//! backoff) can be asserted without wall-clock sleeps.

#![forbid(unsafe_code)]

pub mod fixtures;
pub mod time;

pub use fixtures::{FixedCpuProbe, RecordingStore, ScriptedFetcher};
pub use time::TestClock;
