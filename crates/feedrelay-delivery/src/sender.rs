//! Rate-limited, retrying webhook sender.
//!
//! `send` runs one item to a terminal [`DeliveryOutcome`]: breaker gate,
//! rate-limit slot, HTTP attempt, classification, jittered backoff, loop.
//! Outcomes are values; the only thing that escapes the loop early is
//! cancellation. Every breaker permit is answered exactly once: a result
//! when the attempt ran, an explicit abandon when shutdown interrupted it.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use feedrelay_core::{
    metrics::names, Clock, DeliveryOutcome, EndpointOptions, ErrorKind, Item, MetricsSink,
};

use crate::{
    circuit::CircuitBreakerManager,
    client::{DeliveryRequest, WebhookClient},
    error::DeliveryError,
    ratelimit::EndpointRateLimiter,
    retry::RetryPolicy,
};

/// Sender wiring and per-endpoint options.
pub struct WebhookSender {
    client: WebhookClient,
    limiter: Arc<EndpointRateLimiter>,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryPolicy,
    endpoints: HashMap<String, EndpointOptions>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl WebhookSender {
    /// Creates a sender.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: WebhookClient,
        limiter: Arc<EndpointRateLimiter>,
        breakers: Arc<CircuitBreakerManager>,
        retry: RetryPolicy,
        endpoints: HashMap<String, EndpointOptions>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self { client, limiter, breakers, retry, endpoints, clock, metrics, cancel }
    }

    /// Breaker registry, for tests and operator tooling.
    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    /// Rate limiter registry.
    pub fn limiter(&self) -> &EndpointRateLimiter {
        &self.limiter
    }

    /// Delivers one item to its endpoint, retrying retryable failures up to
    /// the policy budget. Not reentrant per item.
    pub async fn send(&self, item: &mut Item) -> DeliveryOutcome {
        let endpoint = item.endpoint.clone();
        let key = endpoint.as_str();
        let trace_id = Uuid::new_v4().as_u128();
        let started = self.clock.now();

        loop {
            if let Some(deadline) = item.deadline_at {
                if self.clock.now() >= deadline {
                    let outcome = DeliveryOutcome::Failed {
                        kind: ErrorKind::DeadlineExceeded,
                        attempts: item.attempts,
                        last_status: None,
                    };
                    tracing::error!(
                        item_id = %item.id,
                        endpoint = key,
                        attempt = item.attempts,
                        error_kind = outcome.as_str(),
                        "item deadline exceeded"
                    );
                    self.count_outcome(key, &outcome);
                    return outcome;
                }
            }

            if !self.breakers.try_acquire(key) {
                let outcome = DeliveryOutcome::Failed {
                    kind: ErrorKind::BreakerOpen,
                    attempts: item.attempts,
                    last_status: None,
                };
                tracing::warn!(
                    item_id = %item.id,
                    endpoint = key,
                    attempt = item.attempts,
                    error_kind = outcome.as_str(),
                    "delivery denied by open circuit"
                );
                self.count_outcome(key, &outcome);
                return outcome;
            }

            // From here the breaker permit is held: every path below either
            // records a result or abandons the permit.
            if self.limiter.acquire(key, &self.cancel).await.is_err() {
                self.breakers.abandon(key);
                return self.dropped(key, item);
            }

            item.attempts += 1;
            let attempt = item.attempts;
            let options = self.endpoints.get(key);
            let request = DeliveryRequest {
                delivery_id: Uuid::new_v4(),
                item_id: item.id.clone(),
                url: endpoint.as_str().to_string(),
                headers: options.map(|o| o.headers.clone()).unwrap_or_default(),
                auth_token: options.and_then(|o| o.auth_token.clone()),
                body: item.payload.clone(),
                attempt,
                trace_id,
            };

            let result = tokio::select! {
                result = self.client.deliver(request) => result,
                () = self.cancel.cancelled() => {
                    self.breakers.abandon(key);
                    return self.dropped(key, item);
                },
            };

            match result {
                Ok(response) => {
                    self.breakers.record_success(key);
                    self.metrics.observe(
                        names::SEND_DURATION,
                        &[("endpoint", key)],
                        response.duration.as_secs_f64(),
                    );
                    let outcome = DeliveryOutcome::Succeeded {
                        status: response.status,
                        latency: self.clock.now().saturating_duration_since(started),
                        attempts: attempt,
                    };
                    tracing::info!(
                        item_id = %item.id,
                        endpoint = key,
                        attempt,
                        status = response.status,
                        "item delivered"
                    );
                    self.count_outcome(key, &outcome);
                    return outcome;
                },
                Err(error) => {
                    self.breakers.record_failure(key);
                    if let Some(retry_delay) = self.next_retry(key, item, attempt, &error) {
                        tokio::select! {
                            () = self.clock.sleep(retry_delay) => {},
                            () = self.cancel.cancelled() => return self.dropped(key, item),
                        }
                        continue;
                    }
                    let outcome = DeliveryOutcome::Failed {
                        kind: error.kind(),
                        attempts: attempt,
                        last_status: error.status(),
                    };
                    self.count_outcome(key, &outcome);
                    return outcome;
                },
            }
        }
    }

    /// Delivers a batch, combining items per endpoint where the endpoint
    /// advertises batch support and iterating `send` otherwise.
    pub async fn send_batch(&self, items: Vec<Item>) -> Vec<(Item, DeliveryOutcome)> {
        let mut groups: Vec<(String, Vec<Item>)> = Vec::new();
        for item in items {
            match groups.iter_mut().find(|(key, _)| key.as_str() == item.endpoint.as_str()) {
                Some((_, group)) => group.push(item),
                None => groups.push((item.endpoint.as_str().to_string(), vec![item])),
            }
        }

        let mut results = Vec::new();
        for (key, group) in groups {
            let batchable = group.len() > 1
                && self.endpoints.get(&key).is_some_and(|o| o.supports_batch);
            if batchable {
                results.extend(self.send_grouped(&key, group).await);
            } else {
                for mut item in group {
                    let outcome = self.send(&mut item).await;
                    results.push((item, outcome));
                }
            }
        }
        results
    }

    /// One combined attempt for a batch-capable endpoint.
    ///
    /// On a 2xx reply the receiver may name failed positions in a
    /// `failed_indices` array; those items fall back to individual sends.
    /// A failed reply without positional information counts the whole group
    /// as failed, and every item retries individually.
    async fn send_grouped(
        &self,
        key: &str,
        mut group: Vec<Item>,
    ) -> Vec<(Item, DeliveryOutcome)> {
        if !self.breakers.try_acquire(key) {
            return group
                .into_iter()
                .map(|item| {
                    let outcome = DeliveryOutcome::Failed {
                        kind: ErrorKind::BreakerOpen,
                        attempts: item.attempts,
                        last_status: None,
                    };
                    self.count_outcome(key, &outcome);
                    (item, outcome)
                })
                .collect();
        }

        if self.limiter.acquire(key, &self.cancel).await.is_err() {
            self.breakers.abandon(key);
            return group
                .into_iter()
                .map(|item| {
                    let outcome = self.dropped(key, &item);
                    (item, outcome)
                })
                .collect();
        }

        for item in &mut group {
            item.attempts += 1;
        }

        let delivery_id = Uuid::new_v4();
        let options = self.endpoints.get(key);
        let request = DeliveryRequest {
            delivery_id,
            item_id: format!("batch-{delivery_id}"),
            url: key.to_string(),
            headers: options.map(|o| o.headers.clone()).unwrap_or_default(),
            auth_token: options.and_then(|o| o.auth_token.clone()),
            body: combine_payloads(&group),
            attempt: 1,
            trace_id: delivery_id.as_u128(),
        };

        let result = tokio::select! {
            result = self.client.deliver(request) => result,
            () = self.cancel.cancelled() => {
                self.breakers.abandon(key);
                return group
                    .into_iter()
                    .map(|item| {
                        let outcome = self.dropped(key, &item);
                        (item, outcome)
                    })
                    .collect();
            },
        };

        let group_len = group.len();
        let mut results = Vec::with_capacity(group_len);
        match result {
            Ok(response) => {
                self.breakers.record_success(key);
                self.metrics.observe(
                    names::SEND_DURATION,
                    &[("endpoint", key)],
                    response.duration.as_secs_f64(),
                );
                let failed = parse_failed_indices(&response.body);
                for (index, mut item) in group.into_iter().enumerate() {
                    if failed.contains(&index) {
                        self.metrics.incr(
                            names::RETRIES,
                            &[("endpoint", key), ("attempt", "1")],
                            1,
                        );
                        let outcome = self.send(&mut item).await;
                        results.push((item, outcome));
                    } else {
                        let outcome = DeliveryOutcome::Succeeded {
                            status: response.status,
                            latency: response.duration,
                            attempts: item.attempts,
                        };
                        self.count_outcome(key, &outcome);
                        results.push((item, outcome));
                    }
                }
            },
            Err(error) => {
                self.breakers.record_failure(key);
                if error.is_retryable() {
                    tracing::warn!(
                        endpoint = key,
                        batch = group_len,
                        error_kind = error.kind().as_str(),
                        "batch attempt failed, items retry individually"
                    );
                    for mut item in group {
                        self.metrics.incr(
                            names::RETRIES,
                            &[("endpoint", key), ("attempt", "1")],
                            1,
                        );
                        let outcome = self.send(&mut item).await;
                        results.push((item, outcome));
                    }
                } else {
                    for item in group {
                        let outcome = DeliveryOutcome::Failed {
                            kind: error.kind(),
                            attempts: item.attempts,
                            last_status: error.status(),
                        };
                        self.count_outcome(key, &outcome);
                        results.push((item, outcome));
                    }
                }
            },
        }
        results
    }

    /// Decides whether to retry after a failed attempt; returns the backoff
    /// when another attempt fits the budget.
    fn next_retry(
        &self,
        key: &str,
        item: &Item,
        attempt: u32,
        error: &DeliveryError,
    ) -> Option<std::time::Duration> {
        if !error.is_retryable() {
            tracing::error!(
                item_id = %item.id,
                endpoint = key,
                attempt,
                error_kind = error.kind().as_str(),
                error = %error,
                "delivery failed terminally"
            );
            return None;
        }
        if !self.retry.allows_retry(attempt) {
            tracing::error!(
                item_id = %item.id,
                endpoint = key,
                attempt,
                error_kind = error.kind().as_str(),
                "retry budget exhausted"
            );
            return None;
        }

        let attempt_label = attempt.to_string();
        self.metrics.incr(
            names::RETRIES,
            &[("endpoint", key), ("attempt", attempt_label.as_str())],
            1,
        );
        let delay = self.retry.backoff_after(attempt, error);
        tracing::warn!(
            item_id = %item.id,
            endpoint = key,
            attempt,
            error_kind = error.kind().as_str(),
            backoff_ms = delay.as_millis() as u64,
            "delivery failed, retry scheduled"
        );
        Some(delay)
    }

    fn dropped(&self, key: &str, item: &Item) -> DeliveryOutcome {
        let outcome = DeliveryOutcome::Dropped { reason: ErrorKind::ShuttingDown };
        tracing::info!(
            item_id = %item.id,
            endpoint = key,
            attempt = item.attempts,
            "delivery abandoned by shutdown"
        );
        self.count_outcome(key, &outcome);
        outcome
    }

    fn count_outcome(&self, key: &str, outcome: &DeliveryOutcome) {
        self.metrics.incr(
            names::SENDS,
            &[("endpoint", key), ("outcome", outcome.as_str())],
            1,
        );
    }
}

/// Joins opaque JSON payloads into one `{"items": [...]}` body.
fn combine_payloads(group: &[Item]) -> Bytes {
    let mut body = Vec::with_capacity(
        group.iter().map(|i| i.payload.len() + 1).sum::<usize>() + 16,
    );
    body.extend_from_slice(b"{\"items\":[");
    for (index, item) in group.iter().enumerate() {
        if index > 0 {
            body.push(b',');
        }
        body.extend_from_slice(&item.payload);
    }
    body.extend_from_slice(b"]}");
    Bytes::from(body)
}

/// Reads server-provided positional failure indices from a batch reply.
fn parse_failed_indices(body: &str) -> std::collections::HashSet<usize> {
    #[derive(serde::Deserialize)]
    struct BatchReply {
        #[serde(default)]
        failed_indices: Vec<usize>,
    }
    serde_json::from_str::<BatchReply>(body)
        .map(|reply| reply.failed_indices.into_iter().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_combine_into_json_array() {
        let items = vec![
            Item::new(
                "a",
                feedrelay_core::ContentKind::Article,
                feedrelay_core::Priority::Normal,
                feedrelay_core::EndpointKey::new("https://x/hook"),
                Bytes::from_static(b"{\"n\":1}"),
            ),
            Item::new(
                "b",
                feedrelay_core::ContentKind::Article,
                feedrelay_core::Priority::Normal,
                feedrelay_core::EndpointKey::new("https://x/hook"),
                Bytes::from_static(b"{\"n\":2}"),
            ),
        ];
        let body = combine_payloads(&items);
        assert_eq!(&body[..], b"{\"items\":[{\"n\":1},{\"n\":2}]}" as &[u8]);
    }

    #[test]
    fn failed_indices_parse_when_present() {
        let failed = parse_failed_indices(r#"{"failed_indices":[0,2]}"#);
        assert!(failed.contains(&0));
        assert!(!failed.contains(&1));
        assert!(failed.contains(&2));

        assert!(parse_failed_indices("OK").is_empty());
        assert!(parse_failed_indices(r#"{"accepted":3}"#).is_empty());
    }
}
