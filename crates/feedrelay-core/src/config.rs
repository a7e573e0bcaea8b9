//! Flat pipeline configuration record.
//!
//! One record holds every recognized option; unknown keys are load errors.
//! The binary layers defaults, `config.toml`, and environment overrides on
//! top of this type. Components receive the values they need at
//! construction, never the whole record.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do when an enqueue would exceed the queue bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Evict the oldest strictly-lower-priority item to make room.
    Displace,
    /// Refuse the incoming item.
    Reject,
}

/// Per-endpoint overrides layered over the pipeline defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointOptions {
    /// Minimum interval between sends to this endpoint, when different from
    /// `min_send_interval_ms`.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    /// Whether the endpoint accepts combined batch bodies.
    #[serde(default)]
    pub supports_batch: bool,
    /// Extra headers attached to every request to this endpoint.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Bearer token attached as `Authorization` header.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Invalid configuration value.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    /// What was wrong.
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// All recognized pipeline options.
///
/// Serde-level `deny_unknown_fields` makes a typo in `config.toml` or an
/// environment override a hard load error instead of a silently ignored
/// key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Floor between sends to one endpoint, in milliseconds.
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
    /// Retries per item across all attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Backoff cap, in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// Per-attempt HTTP timeout, in milliseconds.
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
    /// Consecutive failures that open an endpoint breaker.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    /// Open-to-half-open delay, in milliseconds.
    #[serde(default = "default_breaker_reset_timeout_ms")]
    pub breaker_reset_timeout_ms: u64,
    /// Aggregate queue bound across all lanes.
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    /// Behavior at the queue bound.
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: OverflowPolicy,
    /// Optional age-based lane promotion interval, in milliseconds.
    #[serde(default)]
    pub age_boost_interval_ms: Option<u64>,
    /// Lower bound for the adaptive batch size.
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
    /// Upper bound for the adaptive batch size.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Lower bound for the adaptive worker count.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound for the adaptive worker count.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// CPU utilization setpoint for the tuner, in percent.
    #[serde(default = "default_target_cpu_percent")]
    pub target_cpu_percent: f64,
    /// Shutdown drain deadline, in milliseconds.
    #[serde(default = "default_drain_sla_ms")]
    pub drain_sla_ms: u64,
    /// Upper bound on one best-effort store record, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Optional global per-item deadline, in milliseconds.
    #[serde(default)]
    pub item_deadline_ms: Option<u64>,
    /// Largest admissible payload, in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Tuner tick interval, in milliseconds.
    #[serde(default = "default_tune_interval_ms")]
    pub tune_interval_ms: u64,
    /// Pause between fetch pulls when the feed is drained, in milliseconds.
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    /// Items requested per fetch pull.
    #[serde(default = "default_fetch_page_size")]
    pub fetch_page_size: usize,
    /// Upstream feed-reader base URL. Required by the binary, unused by
    /// library embedders that enqueue directly.
    #[serde(default)]
    pub feed_url: Option<String>,
    /// Bearer token for the feed reader.
    #[serde(default)]
    pub feed_token: Option<String>,
    /// Per-endpoint overrides keyed by canonicalized endpoint URL.
    #[serde(default)]
    pub endpoint_overrides: HashMap<String, EndpointOptions>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_send_interval_ms: default_min_send_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_reset_timeout_ms: default_breaker_reset_timeout_ms(),
            queue_max_size: default_queue_max_size(),
            overflow_policy: default_overflow_policy(),
            age_boost_interval_ms: None,
            min_batch: default_min_batch(),
            max_batch: default_max_batch(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            target_cpu_percent: default_target_cpu_percent(),
            drain_sla_ms: default_drain_sla_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            item_deadline_ms: None,
            max_payload_bytes: default_max_payload_bytes(),
            tune_interval_ms: default_tune_interval_ms(),
            fetch_interval_ms: default_fetch_interval_ms(),
            fetch_page_size: default_fetch_page_size(),
            feed_url: None,
            feed_token: None,
            endpoint_overrides: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max_size == 0 {
            return Err(ConfigError::new("queue_max_size must be greater than 0"));
        }
        if self.min_batch == 0 {
            return Err(ConfigError::new("min_batch must be greater than 0"));
        }
        if self.min_batch > self.max_batch {
            return Err(ConfigError::new("min_batch cannot exceed max_batch"));
        }
        if self.min_workers == 0 {
            return Err(ConfigError::new("min_workers must be greater than 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::new("min_workers cannot exceed max_workers"));
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::new("retry_base_ms must be greater than 0"));
        }
        if self.retry_base_ms > self.retry_cap_ms {
            return Err(ConfigError::new("retry_base_ms cannot exceed retry_cap_ms"));
        }
        if self.per_attempt_timeout_ms == 0 {
            return Err(ConfigError::new("per_attempt_timeout_ms must be greater than 0"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::new("breaker_failure_threshold must be greater than 0"));
        }
        if !(1.0..=100.0).contains(&self.target_cpu_percent) {
            return Err(ConfigError::new("target_cpu_percent must be within 1..=100"));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::new("max_payload_bytes must be greater than 0"));
        }
        if self.fetch_page_size == 0 {
            return Err(ConfigError::new("fetch_page_size must be greater than 0"));
        }
        Ok(())
    }

    /// Minimum send interval for one endpoint, honoring overrides.
    pub fn send_interval_for(&self, endpoint: &str) -> Duration {
        let ms = self
            .endpoint_overrides
            .get(endpoint)
            .and_then(|o| o.min_interval_ms)
            .unwrap_or(self.min_send_interval_ms);
        Duration::from_millis(ms)
    }

    /// Backoff base delay.
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    /// Backoff cap.
    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }

    /// Per-attempt HTTP timeout.
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    /// Open-to-half-open delay.
    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_reset_timeout_ms)
    }

    /// Optional aging promotion interval.
    pub fn age_boost_interval(&self) -> Option<Duration> {
        self.age_boost_interval_ms.map(Duration::from_millis)
    }

    /// Shutdown drain deadline.
    pub fn drain_sla(&self) -> Duration {
        Duration::from_millis(self.drain_sla_ms)
    }

    /// Store record timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Optional global item deadline.
    pub fn item_deadline(&self) -> Option<Duration> {
        self.item_deadline_ms.map(Duration::from_millis)
    }

    /// Tuner tick interval.
    pub fn tune_interval(&self) -> Duration {
        Duration::from_millis(self.tune_interval_ms)
    }

    /// Fetch pull pause.
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }
}

fn default_min_send_interval_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

fn default_per_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_reset_timeout_ms() -> u64 {
    30_000
}

fn default_queue_max_size() -> usize {
    1000
}

fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::Displace
}

fn default_min_batch() -> usize {
    10
}

fn default_max_batch() -> usize {
    500
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    16
}

fn default_target_cpu_percent() -> f64 {
    70.0
}

fn default_drain_sla_ms() -> u64 {
    30_000
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_tune_interval_ms() -> u64 {
    5000
}

fn default_fetch_interval_ms() -> u64 {
    5000
}

fn default_fetch_page_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_send_interval_ms, 200);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.queue_max_size, 1000);
        assert_eq!(config.overflow_policy, OverflowPolicy::Displace);
        assert!(config.age_boost_interval_ms.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<PipelineConfig, _> =
            serde_json::from_str(r#"{"max_retries": 2, "max_retires": 5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn bound_inversions_fail_validation() {
        let config = PipelineConfig { min_batch: 50, max_batch: 10, ..Default::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { min_workers: 8, max_workers: 4, ..Default::default() };
        assert!(config.validate().is_err());

        let config =
            PipelineConfig { retry_base_ms: 60_000, retry_cap_ms: 30_000, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn endpoint_override_takes_precedence() {
        let mut config = PipelineConfig::default();
        config.endpoint_overrides.insert(
            "https://slow.example/hook".to_string(),
            EndpointOptions { min_interval_ms: Some(1000), ..Default::default() },
        );

        assert_eq!(
            config.send_interval_for("https://slow.example/hook"),
            Duration::from_millis(1000)
        );
        assert_eq!(
            config.send_interval_for("https://other.example/hook"),
            Duration::from_millis(200)
        );
    }
}
