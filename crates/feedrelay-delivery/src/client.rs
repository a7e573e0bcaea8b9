//! HTTP transport for webhook delivery.
//!
//! Wraps a pooled `reqwest` client: builds the outbound POST with delivery
//! metadata and trace context, enforces the per-attempt timeout, and maps
//! transport failures and status codes into [`DeliveryError`]s for the
//! retry and breaker layers.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{classify_status, DeliveryError, Result};

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-attempt timeout covering connect, write, and read.
    pub attempt_timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
    /// Whether to verify receiver TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            user_agent: "feedrelay/0.1".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// One outbound delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Unique id for this attempt.
    pub delivery_id: Uuid,
    /// Item being delivered.
    pub item_id: String,
    /// Receiver URL.
    pub url: String,
    /// Extra headers from endpoint configuration.
    pub headers: HashMap<String, String>,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Request body.
    pub body: Bytes,
    /// Attempt number, 1-based.
    pub attempt: u32,
    /// Trace id shared by every attempt for one item.
    pub trace_id: u128,
}

/// Receiver response to one attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated for audit.
    pub body: String,
    /// Round-trip duration.
    pub duration: Duration,
}

impl DeliveryResponse {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pooled HTTP client for webhook posts.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the TLS or pool setup fails.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.attempt_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Posts one attempt and returns the classified result.
    ///
    /// A 2xx response comes back as `Ok`; everything else (transport
    /// failure, timeout, non-2xx status) is a [`DeliveryError`] ready for
    /// the retry classifier. The response for non-2xx statuses is folded
    /// into the error.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_send",
            item_id = %request.item_id,
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt,
        );

        async move {
            let start = std::time::Instant::now();

            let mut http_request = self
                .client
                .post(&request.url)
                .body(request.body.clone())
                .header("content-type", "application/json")
                .header("traceparent", traceparent(request.trace_id, request.attempt))
                .header("x-feedrelay-item-id", &request.item_id)
                .header("x-feedrelay-delivery-id", request.delivery_id.to_string())
                .header("x-feedrelay-attempt", request.attempt.to_string());

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }
            if let Some(token) = &request.auth_token {
                http_request = http_request.header("authorization", format!("Bearer {token}"));
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start.elapsed();
                    warn!(duration_ms = duration.as_millis() as u64, error = %e, "request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(
                            self.config.attempt_timeout.as_millis() as u64,
                        ));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let duration = start.elapsed();
            let status = response.status().as_u16();
            let headers = extract_headers(response.headers());
            let body = read_capped_body(response).await;

            debug!(status, duration_ms = duration.as_millis() as u64, "received response");

            let parsed = DeliveryResponse { status, headers, body, duration };
            if parsed.is_success() {
                Ok(parsed)
            } else {
                let retry_after = extract_retry_after_secs(&parsed.headers);
                Err(classify_status(
                    status,
                    parsed.body,
                    retry_after,
                    self.config.attempt_timeout.as_millis() as u64,
                ))
            }
        }
        .instrument(span)
        .await
    }
}

/// W3C trace context header value.
///
/// The trace id is stable across one item's attempts; the span id changes
/// per attempt so retries show up as siblings under the same trace.
fn traceparent(trace_id: u128, attempt: u32) -> String {
    let span_id = (trace_id as u64) ^ u64::from(attempt);
    format!("00-{trace_id:032x}-{span_id:016x}-01")
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in header_map {
        if let Ok(value) = value.to_str() {
            headers.insert(key.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    headers
}

async fn read_capped_body(response: reqwest::Response) -> String {
    const MAX_BODY: usize = 4 * 1024;
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_BODY => {
            format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_BODY]))
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

/// Hop-by-hop and transport-managed headers never copied from config.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "traceparent"
    )
}

/// Reads a `Retry-After` wait from response headers.
///
/// Accepts both delta-seconds and HTTP-date forms; an unparseable value
/// falls back to 60 seconds.
pub fn extract_retry_after_secs(headers: &HashMap<String, String>) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let value = headers.get("retry-after")?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let now = chrono::Utc::now();
        let retry_at = date.with_timezone(&chrono::Utc);
        if retry_at > now {
            if let Ok(wait) = retry_at.signed_duration_since(now).to_std() {
                return Some(wait.as_secs());
            }
        }
    }
    Some(DEFAULT_RETRY_AFTER)
}
