//! Error types for delivery operations.
//!
//! Delivery outcomes travel as tagged values, not unwinds: the sender turns
//! every failure into a [`DeliveryError`], classifies it through
//! [`ErrorKind`], and resolves retryable ones locally. Only invariant
//! violations propagate further.

use thiserror::Error;

use feedrelay_core::ErrorKind;

/// Result alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Everything that can go wrong while delivering one item.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Transport-level failure: DNS, TCP, TLS, reset.
    #[error("network failure: {message}")]
    Network {
        /// Transport detail.
        message: String,
    },

    /// The per-attempt timeout expired.
    #[error("attempt timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured per-attempt timeout.
        timeout_ms: u64,
    },

    /// Receiver answered 4xx (other than 408/425/429). Terminal.
    #[error("client error: HTTP {status}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// Receiver answered 5xx. Retryable.
    #[error("server error: HTTP {status}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// Receiver answered 429 or asked us to back off.
    #[error("rate limited by receiver: retry after {retry_after_secs}s")]
    RateLimitedUpstream {
        /// Wait requested by the receiver.
        retry_after_secs: u64,
    },

    /// The endpoint breaker is denying requests.
    #[error("circuit breaker open for endpoint {endpoint}")]
    CircuitOpen {
        /// Affected endpoint key.
        endpoint: String,
    },

    /// The item's global deadline passed before delivery finished.
    #[error("item deadline exceeded")]
    DeadlineExceeded,

    /// The pipeline is closing; the attempt was abandoned.
    #[error("delivery cancelled: pipeline shutting down")]
    ShuttingDown,

    /// Invariant violation inside the pipeline.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// Pipeline construction was handed unusable configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// What was wrong.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a client error from an HTTP response.
    pub fn client(status: u16, body: impl Into<String>) -> Self {
        Self::Client { status, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server(status: u16, body: impl Into<String>) -> Self {
        Self::Server { status, body: body.into() }
    }

    /// Creates an upstream rate-limit error.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimitedUpstream { retry_after_secs }
    }

    /// Creates a breaker-open error.
    pub fn circuit_open(endpoint: impl Into<String>) -> Self {
        Self::CircuitOpen { endpoint: endpoint.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Maps to the pipeline-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Client { .. } => ErrorKind::Client4xx,
            Self::Server { .. } => ErrorKind::Server5xx,
            Self::RateLimitedUpstream { .. } => ErrorKind::RateLimitedUpstream,
            Self::CircuitOpen { .. } => ErrorKind::BreakerOpen,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Internal { .. } | Self::Configuration { .. } => ErrorKind::Internal,
        }
    }

    /// True when the attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// HTTP status attached to this error, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::RateLimitedUpstream { .. } => Some(429),
            _ => None,
        }
    }

    /// Receiver-requested wait before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitedUpstream { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Classifies an HTTP status into a delivery error.
///
/// 408 maps to the timeout kind and 425 to the upstream rate-limit kind so
/// that both stay retryable; every other 4xx is terminal.
pub fn classify_status(
    status: u16,
    body: String,
    retry_after_secs: Option<u64>,
    attempt_timeout_ms: u64,
) -> DeliveryError {
    match status {
        429 => DeliveryError::rate_limited(retry_after_secs.unwrap_or(60)),
        408 => DeliveryError::timeout(attempt_timeout_ms),
        425 => DeliveryError::rate_limited(retry_after_secs.unwrap_or(1)),
        400..=499 => DeliveryError::client(status, body),
        500..=599 => DeliveryError::server(status, body),
        other => DeliveryError::internal(format!("unclassifiable HTTP status {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(10_000).is_retryable());
        assert!(DeliveryError::server(503, "unavailable").is_retryable());
        assert!(DeliveryError::rate_limited(60).is_retryable());

        assert!(!DeliveryError::client(404, "not found").is_retryable());
        assert!(!DeliveryError::circuit_open("endpoint").is_retryable());
        assert!(!DeliveryError::DeadlineExceeded.is_retryable());
        assert!(!DeliveryError::ShuttingDown.is_retryable());
        assert!(!DeliveryError::internal("bug").is_retryable());
    }

    #[test]
    fn status_classification_edges() {
        assert!(matches!(
            classify_status(429, String::new(), Some(30), 10_000),
            DeliveryError::RateLimitedUpstream { retry_after_secs: 30 }
        ));
        assert!(matches!(
            classify_status(408, String::new(), None, 10_000),
            DeliveryError::Timeout { .. }
        ));
        assert!(matches!(
            classify_status(425, String::new(), None, 10_000),
            DeliveryError::RateLimitedUpstream { .. }
        ));
        assert!(matches!(
            classify_status(400, String::new(), None, 10_000),
            DeliveryError::Client { status: 400, .. }
        ));
        assert!(matches!(
            classify_status(500, String::new(), None, 10_000),
            DeliveryError::Server { status: 500, .. }
        ));
    }

    #[test]
    fn kinds_carry_stable_labels() {
        assert_eq!(DeliveryError::network("x").kind().as_str(), "network");
        assert_eq!(DeliveryError::client(404, "x").kind().as_str(), "client_4xx");
        assert_eq!(DeliveryError::circuit_open("e").kind().as_str(), "breaker_open");
    }

    #[test]
    fn status_extraction() {
        assert_eq!(DeliveryError::client(404, "").status(), Some(404));
        assert_eq!(DeliveryError::server(502, "").status(), Some(502));
        assert_eq!(DeliveryError::rate_limited(5).status(), Some(429));
        assert_eq!(DeliveryError::network("x").status(), None);
    }
}
