//! Fetch driver: pulls pages from the upstream feed reader into the queue.
//!
//! The driver owns the pagination cursor and treats the fetcher as a pull
//! iterator. Full pages chain immediately; short or empty pages pause for
//! the fetch interval; pull errors back off exponentially up to a minute.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use feedrelay_core::{AdmissionResult, Clock, Fetcher, RejectReason};

use crate::queue::WorkQueue;

/// Driver cadence.
#[derive(Debug, Clone)]
pub struct FetchDriverConfig {
    /// Pause after a short or empty page.
    pub interval: Duration,
    /// Items requested per pull.
    pub page_size: usize,
}

impl Default for FetchDriverConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), page_size: 100 }
    }
}

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Pulls from a [`Fetcher`] and feeds the queue until cancelled.
pub struct FetchDriver {
    config: FetchDriverConfig,
    fetcher: Arc<dyn Fetcher>,
    queue: Arc<WorkQueue>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl FetchDriver {
    /// Creates a driver.
    pub fn new(
        config: FetchDriverConfig,
        fetcher: Arc<dyn Fetcher>,
        queue: Arc<WorkQueue>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self { config, fetcher, queue, clock, cancel }
    }

    /// Pull loop. Exits on cancellation or once the queue refuses items
    /// because it closed.
    pub async fn run(self) {
        info!(page_size = self.config.page_size, "fetch driver starting");

        let mut cursor: Option<String> = None;
        let mut error_backoff = self.config.interval;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.fetcher.pull(cursor.as_deref(), self.config.page_size).await {
                Ok(page) => {
                    error_backoff = self.config.interval;
                    let pulled = page.items.len();
                    let mut admitted = 0usize;

                    for item in page.items {
                        match self.queue.enqueue(item) {
                            AdmissionResult::Admitted => admitted += 1,
                            AdmissionResult::Rejected(RejectReason::ShuttingDown) => {
                                info!("queue closed, fetch driver stopping");
                                return;
                            },
                            AdmissionResult::Rejected(reason) => {
                                debug!(reason = reason.as_str(), "fetched item rejected");
                            },
                        }
                    }

                    if page.cursor.is_some() {
                        cursor = page.cursor;
                    }
                    debug!(pulled, admitted, cursor = cursor.as_deref(), "fetch page processed");

                    if pulled < self.config.page_size
                        && !self.pause(self.config.interval).await
                    {
                        break;
                    }
                },
                Err(fetch_error) => {
                    warn!(
                        error = %fetch_error,
                        backoff_ms = error_backoff.as_millis() as u64,
                        "feed pull failed, backing off"
                    );
                    if !self.pause(error_backoff).await {
                        break;
                    }
                    error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                },
            }
        }

        info!("fetch driver stopped");
    }

    /// Cancellable pause; false when cancellation fired.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.clock.sleep(duration) => true,
            () = self.cancel.cancelled() => false,
        }
    }
}
