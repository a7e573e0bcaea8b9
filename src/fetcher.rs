//! HTTP client for the upstream feed-reader service.
//!
//! Implements the [`Fetcher`] port against a JSON paging API:
//! `GET {base}/items?cursor=&max=` answering
//! `{"items": [{id, kind, priority, endpoint, payload}], "cursor": "..."}`.
//! Payloads are forwarded verbatim as the delivery body.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use feedrelay_core::{
    ContentKind, EndpointKey, FetchError, FetchPage, Fetcher, Item, Priority,
};

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    items: Vec<WireItem>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    id: String,
    kind: ContentKind,
    #[serde(default = "default_priority")]
    priority: Priority,
    endpoint: String,
    payload: serde_json::Value,
}

fn default_priority() -> Priority {
    Priority::Normal
}

/// Feed-reader client.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFetcher {
    /// Builds the client against a feed-reader base URL.
    pub fn new(base_url: String, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("feedrelay/0.1")
            .build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), token })
    }

    /// Cheap availability check used at boot.
    pub async fn probe(&self) -> Result<(), FetchError> {
        self.pull(None, 1).await.map(|_| ())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn pull(&self, cursor: Option<&str>, max: usize) -> Result<FetchPage, FetchError> {
        let mut request = self
            .client
            .get(format!("{}/items", self.base_url))
            .query(&[("max", max.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response =
            request.send().await.map_err(|e| FetchError::unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::unavailable(format!(
                "feed reader answered HTTP {}",
                response.status().as_u16()
            )));
        }

        let page: WirePage =
            response.json().await.map_err(|e| FetchError::malformed(e.to_string()))?;

        let items = page
            .items
            .into_iter()
            .map(|wire| {
                let payload = serde_json::to_vec(&wire.payload)
                    .map_err(|e| FetchError::malformed(e.to_string()))?;
                Ok(Item::new(
                    wire.id,
                    wire.kind,
                    wire.priority,
                    EndpointKey::new(&wire.endpoint),
                    Bytes::from(payload),
                ))
            })
            .collect::<Result<Vec<_>, FetchError>>()?;

        Ok(FetchPage { items, cursor: page.cursor })
    }
}
