//! End-to-end pipeline scenarios: admission through delivery to the store.

use std::{sync::Arc, time::Duration};

use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

use feedrelay_core::{
    AdmissionResult, DeliveryOutcome, ErrorKind, PipelineConfig, Priority, RealClock,
    RejectReason,
};
use feedrelay_delivery::DeliveryPipeline;
use feedrelay_testing::{fixtures, FixedCpuProbe, RecordingStore, ScriptedFetcher};

fn test_config() -> PipelineConfig {
    PipelineConfig {
        min_send_interval_ms: 10,
        max_retries: 2,
        retry_base_ms: 5,
        retry_cap_ms: 20,
        per_attempt_timeout_ms: 2000,
        min_workers: 1,
        max_workers: 1,
        min_batch: 10,
        max_batch: 50,
        drain_sla_ms: 5000,
        tune_interval_ms: 60_000,
        fetch_interval_ms: 10,
        ..Default::default()
    }
}

struct Env {
    pipeline: DeliveryPipeline,
    store: Arc<RecordingStore>,
}

fn build(config: PipelineConfig) -> Env {
    let store = Arc::new(RecordingStore::new());
    let pipeline = DeliveryPipeline::new(
        config,
        Arc::new(RealClock::new()),
        store.clone(),
        Arc::new(FixedCpuProbe::new(70.0)),
    )
    .expect("pipeline construction");
    Env { pipeline, store }
}

/// Polls the store until `count` outcomes are recorded or a wall-clock
/// timeout expires.
async fn wait_for_records(store: &RecordingStore, count: usize) {
    for _ in 0..500 {
        if store.recorded().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {count} records, saw {:?}",
        store.recorded().iter().map(|(id, _)| id.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn happy_path_delivers_in_priority_order() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut env = build(test_config());

    // Enqueue before starting so the batch is dequeued as one unit and
    // priority ordering is observable at the receiver.
    for (id, priority) in
        [("n1", Priority::Normal), ("h1", Priority::High), ("n2", Priority::Normal)]
    {
        assert!(env.pipeline.enqueue(fixtures::item(id, priority, &server.uri())).is_admitted());
    }
    let started = std::time::Instant::now();
    env.pipeline.start();

    wait_for_records(&env.store, 3).await;

    for id in ["h1", "n1", "n2"] {
        assert!(
            env.store.outcome_for(id).unwrap().is_success(),
            "{id} should be delivered"
        );
    }

    // The high item reached the receiver first, then the normals in FIFO
    // order.
    let requests = server.received_requests().await.unwrap();
    let ids: Vec<String> = requests
        .iter()
        .map(|r| {
            r.headers
                .get("x-feedrelay-item-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(ids, vec!["h1", "n1", "n2"]);

    // Each consecutive pair of sends is spaced by the minimum interval:
    // two enforced 10ms gaps across three sends.
    assert!(started.elapsed() >= Duration::from_millis(20));

    let report = env.pipeline.shutdown().await;
    assert_eq!(report.delivered, 3);
    assert!(report.is_clean());
}

#[tokio::test]
async fn overflow_displaces_lowest_priority() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut env = build(PipelineConfig { queue_max_size: 2, ..test_config() });

    assert!(env.pipeline.enqueue(fixtures::item("a", Priority::Low, &server.uri())).is_admitted());
    assert!(env
        .pipeline
        .enqueue(fixtures::item("b", Priority::Normal, &server.uri()))
        .is_admitted());
    assert!(env.pipeline.enqueue(fixtures::item("c", Priority::High, &server.uri())).is_admitted());

    // The low item was displaced to admit the high one.
    assert_eq!(env.pipeline.queue_depth_by_lane(), [1, 1, 0]);
    assert_eq!(env.pipeline.stats().counter("overflow_total{lane=\"low\"}"), 1);

    env.pipeline.start();
    wait_for_records(&env.store, 2).await;

    assert!(env.store.outcome_for("a").is_none());
    assert!(env.store.outcome_for("b").unwrap().is_success());
    assert!(env.store.outcome_for("c").unwrap().is_success());

    // The admitted high item went out before the older normal one.
    let requests = server.received_requests().await.unwrap();
    let first = requests[0].headers.get("x-feedrelay-item-id").unwrap().to_str().unwrap();
    assert_eq!(first, "c");

    env.pipeline.shutdown().await;
}

#[tokio::test]
async fn duplicate_admission_follows_item_lifecycle() {
    let server = MockServer::start().await;
    // Slow first response keeps the item in flight long enough to probe
    // the dedup window; the retry succeeds quickly.
    Mock::given(matchers::method("POST"))
        .respond_with(
            ResponseTemplate::new(500).set_delay(Duration::from_millis(300)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut env = build(test_config());
    env.pipeline.start();

    let item = fixtures::item("x", Priority::Normal, &server.uri());
    assert!(env.pipeline.enqueue(item.clone()).is_admitted());

    // While the first attempt is still in flight the fingerprint stays
    // reserved.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        env.pipeline.enqueue(item.clone()),
        AdmissionResult::Rejected(RejectReason::Duplicate)
    );

    wait_for_records(&env.store, 1).await;
    assert!(env.store.outcome_for("x").unwrap().is_success());

    // Terminal completion releases the fingerprint.
    assert!(env.pipeline.enqueue(item).is_admitted());

    env.pipeline.shutdown().await;
}

#[tokio::test]
async fn terminal_failures_are_recorded_not_retried() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("no thanks"))
        .expect(1)
        .mount(&server)
        .await;

    let mut env = build(test_config());
    env.pipeline.start();

    assert!(env.pipeline.enqueue(fixtures::item("x", Priority::Normal, &server.uri())).is_admitted());
    wait_for_records(&env.store, 1).await;

    assert_eq!(
        env.store.outcome_for("x").unwrap(),
        DeliveryOutcome::Failed { kind: ErrorKind::Client4xx, attempts: 1, last_status: Some(400) }
    );
    server.verify().await;

    let report = env.pipeline.shutdown().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn fetch_driver_feeds_the_queue() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_page(
        vec![
            fixtures::item("f1", Priority::Normal, &server.uri()),
            fixtures::item("f2", Priority::High, &server.uri()),
        ],
        Some("cursor-1"),
    );
    fetcher.push_page(vec![fixtures::item("f3", Priority::Low, &server.uri())], None);

    let mut env = build(test_config());
    env.pipeline.start();
    env.pipeline.spawn_fetch_driver(fetcher);

    wait_for_records(&env.store, 3).await;
    for id in ["f1", "f2", "f3"] {
        assert!(env.store.outcome_for(id).unwrap().is_success());
    }

    let report = env.pipeline.shutdown().await;
    assert_eq!(report.delivered, 3);
}

#[tokio::test]
async fn store_failures_do_not_stop_the_pipeline() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut env = build(test_config());
    env.store.fail_next_records(true);
    env.pipeline.start();

    assert!(env.pipeline.enqueue(fixtures::item("a", Priority::Normal, &server.uri())).is_admitted());

    // The record fails, the item still counts as delivered.
    for _ in 0..500 {
        if env.pipeline.stats().counter_total("store_errors_total") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(env.pipeline.stats().counter_total("store_errors_total"), 1);

    let report = env.pipeline.shutdown().await;
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn shutdown_reports_unfinished_items() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let mut env = build(PipelineConfig {
        drain_sla_ms: 200,
        per_attempt_timeout_ms: 500,
        ..test_config()
    });
    env.pipeline.start();

    for id in ["a", "b", "c"] {
        assert!(env.pipeline.enqueue(fixtures::item(id, Priority::Normal, &server.uri())).is_admitted());
    }
    // Let the worker pick up the batch before closing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = env.pipeline.shutdown().await;

    // Nothing was delivered; every item is accounted for as dropped
    // mid-flight, failed, or still queued.
    assert_eq!(report.delivered, 0);
    assert_eq!(report.failed + report.dropped + report.unfinished.len() as u64, 3);
}

#[tokio::test]
async fn stats_snapshot_is_complete_during_lifecycle() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut env = build(test_config());
    assert!(env.pipeline.enqueue(fixtures::item("a", Priority::High, &server.uri())).is_admitted());

    let before = env.pipeline.stats();
    assert_eq!(before.counter("items_admitted_total{priority=\"high\"}"), 1);

    // Two snapshots without activity are identical.
    assert_eq!(env.pipeline.stats(), env.pipeline.stats());

    env.pipeline.start();
    wait_for_records(&env.store, 1).await;

    let after = env.pipeline.stats();
    assert!(after.counter_total("sends_total") >= 1);
    // Counters never went backwards.
    assert!(
        after.counter("items_admitted_total{priority=\"high\"}")
            >= before.counter("items_admitted_total{priority=\"high\"}")
    );

    env.pipeline.shutdown().await;
}
