//! Domain model for feed items and their delivery lifecycle.
//!
//! Items enter through admission (dedup, validation, bounded capacity),
//! travel through the priority queue, and leave with exactly one terminal
//! [`DeliveryOutcome`]. The types here are shared by the queue, the sender,
//! and the worker pool, so changes ripple through the whole pipeline.

use std::{
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Delivery priority lane for an item.
///
/// Dequeue order is strict: all high-priority items drain before any normal
/// one, and all normal before any low one. Within a lane, FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched before everything else.
    High,
    /// Default lane.
    Normal,
    /// Only dispatched when the other lanes are empty.
    Low,
}

impl Priority {
    /// Lane index used by the queue; 0 is the most urgent lane.
    pub fn lane(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Priority for a given lane index, if valid.
    pub fn from_lane(lane: usize) -> Option<Self> {
        match lane {
            0 => Some(Self::High),
            1 => Some(Self::Normal),
            2 => Some(Self::Low),
            _ => None,
        }
    }

    /// Stable label used in metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Number of priority lanes.
    pub const COUNT: usize = 3;
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Long-form article content.
    Article,
    /// Video content.
    Video,
    /// Short social post.
    Social,
}

impl ContentKind {
    /// Stable label used in fingerprints, metrics, and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Video => "video",
            Self::Social => "social",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier scoping rate-limiter and circuit-breaker state.
///
/// Wraps the canonicalized receiver URL. Two items with the same endpoint
/// key serialize through the same send slot and share one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Creates an endpoint key from a receiver URL.
    ///
    /// Canonicalizes by trimming whitespace and trailing slashes so that
    /// `https://x/hook` and `https://x/hook/` share limiter and breaker
    /// state.
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(url.as_ref().trim().trim_end_matches('/').to_string())
    }

    /// The canonicalized URL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content item flowing through the pipeline.
///
/// Created by the fetcher (or directly by a caller), owned exclusively by
/// the queue while queued, then by the worker while in flight. Only the
/// delivery path mutates it, and only the attempt counter.
#[derive(Debug, Clone)]
pub struct Item {
    /// Unique item id assigned upstream.
    pub id: String,
    /// Deterministic content hash used for dedup; independent of receipt
    /// metadata.
    pub fingerprint: String,
    /// Content classification.
    pub kind: ContentKind,
    /// Delivery priority lane.
    pub priority: Priority,
    /// Receiver this item is delivered to.
    pub endpoint: EndpointKey,
    /// Opaque payload forwarded verbatim as the request body.
    pub payload: Bytes,
    /// Set by the queue at admission; drives the wait-to-dequeue histogram
    /// and optional age promotion.
    pub enqueued_at: Option<Instant>,
    /// Delivery attempts so far. Strictly monotonic over the item lifetime.
    pub attempts: u32,
    /// Optional absolute deadline; checked at retry boundaries.
    pub deadline_at: Option<Instant>,
}

impl Item {
    /// Creates an item, deriving its fingerprint from kind and payload.
    pub fn new(
        id: impl Into<String>,
        kind: ContentKind,
        priority: Priority,
        endpoint: EndpointKey,
        payload: Bytes,
    ) -> Self {
        let fingerprint = fingerprint(kind, &payload);
        Self {
            id: id.into(),
            fingerprint,
            kind,
            priority,
            endpoint,
            payload,
            enqueued_at: None,
            attempts: 0,
            deadline_at: None,
        }
    }

    /// Checks admission preconditions.
    ///
    /// The payload must be non-empty and within `max_payload_bytes`, and the
    /// id must be present. Kind is enforced by the type system already.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("item id is empty".to_string());
        }
        if self.endpoint.as_str().is_empty() {
            return Err("endpoint is empty".to_string());
        }
        if self.payload.is_empty() {
            return Err("payload is empty".to_string());
        }
        if self.payload.len() > max_payload_bytes {
            return Err(format!(
                "payload of {} bytes exceeds limit of {max_payload_bytes}",
                self.payload.len()
            ));
        }
        Ok(())
    }
}

/// Computes the dedup fingerprint for a payload.
///
/// SHA-256 over the content kind tag and the raw payload, hex encoded. Two
/// fetches of the same content yield the same fingerprint regardless of
/// when they were received.
pub fn fingerprint(kind: ContentKind, payload: &[u8]) -> String {
    use fmt::Write;

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Synchronous result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    /// The item was accepted and is now owned by the queue.
    Admitted,
    /// The item was refused; the caller decides whether to resubmit.
    Rejected(RejectReason),
}

impl AdmissionResult {
    /// True when the item was accepted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The bound was reached and the overflow policy refused the item.
    QueueFull,
    /// The fingerprint is already queued or in flight.
    Duplicate,
    /// The item failed admission preconditions.
    ValidationFailed,
    /// The pipeline is closing.
    ShuttingDown,
}

impl RejectReason {
    /// Stable label used in the `items_rejected_total` counter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Duplicate => "duplicate",
            Self::ValidationFailed => "validation_failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a delivery error, shared across the pipeline.
///
/// Kinds are coarse on purpose: retry policy, metrics labels, and logs all
/// key off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Item failed admission preconditions.
    ValidationFailed,
    /// Fingerprint already present.
    Duplicate,
    /// Queue bound reached under the reject policy.
    QueueFull,
    /// Endpoint breaker is denying requests.
    BreakerOpen,
    /// Receiver answered 429 or sent `Retry-After`.
    RateLimitedUpstream,
    /// Per-attempt timeout expired.
    Timeout,
    /// Transport failure: DNS, TCP, TLS, reset.
    Network,
    /// Receiver answered 500-599.
    Server5xx,
    /// Receiver answered 400-499 other than 408/425/429.
    Client4xx,
    /// The item's global deadline passed.
    DeadlineExceeded,
    /// The pipeline is closing.
    ShuttingDown,
    /// Invariant violation inside the pipeline.
    Internal,
}

impl ErrorKind {
    /// True when a delivery attempt failing with this kind may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimitedUpstream | Self::Timeout | Self::Network | Self::Server5xx
        )
    }

    /// Stable label used in metrics and structured logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::Duplicate => "duplicate",
            Self::QueueFull => "queue_full",
            Self::BreakerOpen => "breaker_open",
            Self::RateLimitedUpstream => "rate_limited_upstream",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server5xx => "server_5xx",
            Self::Client4xx => "client_4xx",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ShuttingDown => "shutting_down",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification of one item's delivery attempt sequence.
///
/// Produced exactly once per dispatched item. Observable side effects for
/// the item (store writes, counters) happen strictly after this value is
/// finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver acknowledged the item.
    Succeeded {
        /// HTTP status of the accepting response.
        status: u16,
        /// Wall time from first attempt to acknowledgement.
        latency: Duration,
        /// Total attempts made, including the successful one.
        attempts: u32,
    },
    /// All attempts failed, or a terminal error stopped the sequence.
    Failed {
        /// Classification of the final error.
        kind: ErrorKind,
        /// Total attempts made.
        attempts: u32,
        /// HTTP status of the last response, when one was received.
        last_status: Option<u16>,
    },
    /// The item never reached a verdict; delivery was abandoned.
    Dropped {
        /// Why the item was abandoned.
        reason: ErrorKind,
    },
}

impl DeliveryOutcome {
    /// Stable label used in the `sends_total` outcome dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "success",
            Self::Failed { kind, .. } => kind.as_str(),
            Self::Dropped { .. } => "dropped",
        }
    }

    /// True for the success variant.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Summary returned by shutdown after the drain window closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items delivered successfully over the pipeline lifetime.
    pub delivered: u64,
    /// Items that reached a terminal failure.
    pub failed: u64,
    /// Items abandoned mid-flight by the shutdown itself.
    pub dropped: u64,
    /// Ids of items still queued when the drain window closed.
    pub unfinished: Vec<String>,
}

impl DrainReport {
    /// True when nothing was left behind.
    pub fn is_clean(&self) -> bool {
        self.unfinished.is_empty() && self.dropped == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, payload: &[u8]) -> Item {
        Item::new(
            id,
            ContentKind::Article,
            Priority::Normal,
            EndpointKey::new("https://receiver.example/hook"),
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = item("a", b"same payload");
        let b = item("b", b"same payload");
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn fingerprint_depends_on_kind() {
        let article = fingerprint(ContentKind::Article, b"payload");
        let video = fingerprint(ContentKind::Video, b"payload");
        assert_ne!(article, video);
    }

    #[test]
    fn endpoint_key_canonicalizes_trailing_slash() {
        let a = EndpointKey::new("https://x.example/hook/");
        let b = EndpointKey::new("https://x.example/hook");
        assert_eq!(a, b);
    }

    #[test]
    fn validation_rejects_empty_and_oversize() {
        assert!(item("a", b"ok").validate(1024).is_ok());
        assert!(item("", b"ok").validate(1024).is_err());
        assert!(item("a", b"").validate(1024).is_err());
        assert!(item("a", &[0u8; 2048]).validate(1024).is_err());
    }

    #[test]
    fn retryable_kinds_match_taxonomy() {
        assert!(ErrorKind::RateLimitedUpstream.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Server5xx.is_retryable());

        assert!(!ErrorKind::Client4xx.is_retryable());
        assert!(!ErrorKind::ValidationFailed.is_retryable());
        assert!(!ErrorKind::DeadlineExceeded.is_retryable());
        assert!(!ErrorKind::BreakerOpen.is_retryable());
        assert!(!ErrorKind::ShuttingDown.is_retryable());
    }

    #[test]
    fn outcome_labels_are_stable() {
        let ok = DeliveryOutcome::Succeeded {
            status: 200,
            latency: Duration::from_millis(5),
            attempts: 1,
        };
        assert_eq!(ok.as_str(), "success");
        assert!(ok.is_success());

        let failed =
            DeliveryOutcome::Failed { kind: ErrorKind::Client4xx, attempts: 1, last_status: Some(400) };
        assert_eq!(failed.as_str(), "client_4xx");

        let dropped = DeliveryOutcome::Dropped { reason: ErrorKind::ShuttingDown };
        assert_eq!(dropped.as_str(), "dropped");
    }

    #[test]
    fn priority_lane_round_trip() {
        for lane in 0..Priority::COUNT {
            let p = Priority::from_lane(lane).unwrap();
            assert_eq!(p.lane(), lane);
        }
        assert!(Priority::from_lane(3).is_none());
    }
}
