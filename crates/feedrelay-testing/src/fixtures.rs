//! Item builders and scripted collaborator doubles.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use feedrelay_core::{
    ContentKind, DeliveryOutcome, EndpointKey, FetchError, FetchPage, Fetcher, Item, Priority,
    Store, StoreError,
};
use feedrelay_delivery::tuner::CpuProbe;

/// Builds an item whose payload (and therefore fingerprint) derives from its
/// id, so distinct ids never collide in the dedup index.
pub fn item(id: &str, priority: Priority, endpoint: &str) -> Item {
    Item::new(
        id,
        ContentKind::Article,
        priority,
        EndpointKey::new(endpoint),
        Bytes::from(format!("{{\"id\":\"{id}\"}}")),
    )
}

/// Builds an item with an explicit payload.
pub fn item_with_payload(
    id: &str,
    kind: ContentKind,
    priority: Priority,
    endpoint: &str,
    payload: &[u8],
) -> Item {
    Item::new(id, kind, priority, EndpointKey::new(endpoint), Bytes::copy_from_slice(payload))
}

/// Fetcher that replays a scripted sequence of pages and errors.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<FetchPage, FetchError>>>,
}

impl ScriptedFetcher {
    /// Creates an empty fetcher; pulls return empty exhausted pages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a page to the script.
    pub fn push_page(&self, items: Vec<Item>, cursor: Option<&str>) {
        self.script
            .lock()
            .expect("fetcher script lock")
            .push_back(Ok(FetchPage { items, cursor: cursor.map(String::from) }));
    }

    /// Appends an error to the script.
    pub fn push_error(&self, error: FetchError) {
        self.script.lock().expect("fetcher script lock").push_back(Err(error));
    }

    /// Entries still unplayed.
    pub fn remaining(&self) -> usize {
        self.script.lock().expect("fetcher script lock").len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn pull(&self, _cursor: Option<&str>, _max: usize) -> Result<FetchPage, FetchError> {
        self.script
            .lock()
            .expect("fetcher script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(FetchPage::default()))
    }
}

/// Store that captures every record for later assertions.
#[derive(Default)]
pub struct RecordingStore {
    records: Mutex<Vec<(String, DeliveryOutcome)>>,
    fail: AtomicBool,
}

impl RecordingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent records fail.
    pub fn fail_next_records(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Item ids and outcomes in record order.
    pub fn recorded(&self) -> Vec<(String, DeliveryOutcome)> {
        self.records.lock().expect("store record lock").clone()
    }

    /// Outcome recorded for one item id, if any.
    pub fn outcome_for(&self, id: &str) -> Option<DeliveryOutcome> {
        self.records
            .lock()
            .expect("store record lock")
            .iter()
            .find(|(recorded_id, _)| recorded_id == id)
            .map(|(_, outcome)| outcome.clone())
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn record(&self, item: &Item, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::new("scripted store failure"));
        }
        self.records
            .lock()
            .expect("store record lock")
            .push((item.id.clone(), outcome.clone()));
        Ok(())
    }
}

/// CPU probe returning a settable fixed value.
pub struct FixedCpuProbe {
    percent_millis: AtomicU64,
}

impl FixedCpuProbe {
    /// Creates a probe reporting `percent` utilization.
    pub fn new(percent: f64) -> Self {
        Self { percent_millis: AtomicU64::new((percent * 1000.0) as u64) }
    }

    /// Changes the reported utilization.
    pub fn set(&self, percent: f64) {
        self.percent_millis.store((percent * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl CpuProbe for FixedCpuProbe {
    fn sample(&self) -> Option<f64> {
        Some(self.percent_millis.load(Ordering::SeqCst) as f64 / 1000.0)
    }
}
