//! Collaborator ports at the edge of the core.
//!
//! The pipeline consumes an upstream [`Fetcher`] and a downstream [`Store`]
//! through these narrow traits. Concrete adapters (the feed-reader HTTP
//! client, an embedded database) live outside the core crates; tests supply
//! scripted implementations.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{DeliveryOutcome, Item};

/// One page of items pulled from the upstream feed reader.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    /// Items in feed order.
    pub items: Vec<Item>,
    /// Cursor to resume from; `None` when the feed is exhausted.
    pub cursor: Option<String>,
}

/// Upstream feed-reader client.
///
/// `pull` must be idempotent per cursor: re-pulling the same cursor yields
/// the same items, so a crashed driver can resume without loss. The driver
/// owns the cursor and drives pagination as a pull iterator.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Pulls up to `max` items starting at `cursor`.
    async fn pull(&self, cursor: Option<&str>, max: usize) -> Result<FetchPage, FetchError>;
}

/// Failure pulling from the upstream feed reader.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The feed reader could not be reached.
    #[error("feed reader unavailable: {message}")]
    Unavailable {
        /// Transport-level detail.
        message: String,
    },
    /// The feed reader answered with something unparseable.
    #[error("feed response malformed: {message}")]
    Malformed {
        /// Decoding detail.
        message: String,
    },
}

impl FetchError {
    /// Creates an unavailability error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Creates a malformed-response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed { message: message.into() }
    }
}

/// Downstream record sink for terminal outcomes.
///
/// Recording is best-effort. The worker bounds each call with the
/// configured store timeout and logs-and-continues on failure; the core
/// never retries a record.
#[async_trait]
pub trait Store: Send + Sync {
    /// Records the terminal outcome for an item.
    async fn record(&self, item: &Item, outcome: &DeliveryOutcome) -> Result<(), StoreError>;
}

/// Failure recording an outcome.
#[derive(Debug, Clone, Error)]
#[error("store rejected record: {message}")]
pub struct StoreError {
    /// Store-side detail.
    pub message: String,
}

impl StoreError {
    /// Creates a store error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Store that discards every record.
#[derive(Debug, Default)]
pub struct NoOpStore;

#[async_trait]
impl Store for NoOpStore {
    async fn record(&self, _item: &Item, _outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        Ok(())
    }
}
