//! Feedrelay service entry point.
//!
//! Loads configuration, wires the delivery pipeline to the feed-reader
//! client, and coordinates graceful shutdown. Exit codes follow the
//! supervisor contract: 0 ok, 64 bad configuration, 65 feed reader
//! unavailable at boot, 70 internal error observed at shutdown.

mod fetcher;

use std::sync::Arc;

use async_trait::async_trait;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::{error, info, warn};

use feedrelay_core::{
    metrics::names, DeliveryOutcome, Item, PipelineConfig, RealClock, Store, StoreError,
};
use feedrelay_delivery::{DeliveryPipeline, ProcStatProbe};

use crate::fetcher::HttpFetcher;

mod exit_codes {
    pub const OK: i32 = 0;
    pub const BAD_CONFIG: i32 = 64;
    pub const FETCHER_UNAVAILABLE: i32 = 65;
    pub const INTERNAL: i32 = 70;
}

const CONFIG_FILE: &str = "config.toml";

#[tokio::main]
async fn main() {
    init_tracing();
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    info!("starting feedrelay");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return exit_codes::BAD_CONFIG;
        },
    };

    let Some(feed_url) = config.feed_url.clone() else {
        error!("feed_url is required");
        return exit_codes::BAD_CONFIG;
    };

    let fetcher = match HttpFetcher::new(feed_url.clone(), config.feed_token.clone()) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!(error = %e, "feed client setup failed");
            return exit_codes::BAD_CONFIG;
        },
    };

    // Boot probe: a service that cannot reach its feed should fail fast so
    // the supervisor can act.
    if let Err(e) = fetcher.probe().await {
        error!(feed_url = %feed_url, error = %e, "feed reader unreachable at boot");
        return exit_codes::FETCHER_UNAVAILABLE;
    }

    let clock = Arc::new(RealClock::new());
    let mut pipeline = match DeliveryPipeline::new(
        config,
        clock,
        Arc::new(LogStore),
        Arc::new(ProcStatProbe::new()),
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "pipeline construction failed");
            return exit_codes::BAD_CONFIG;
        },
    };

    let metrics = pipeline.metrics();
    pipeline.start();
    pipeline.spawn_fetch_driver(fetcher);
    info!("feedrelay ready");

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    let report = pipeline.shutdown().await;
    info!(
        delivered = report.delivered,
        failed = report.failed,
        dropped = report.dropped,
        unfinished = report.unfinished.len(),
        "feedrelay stopped"
    );
    if !report.unfinished.is_empty() {
        warn!(items = ?report.unfinished, "items left undelivered at shutdown");
    }

    if metrics.snapshot().counter_total(names::INTERNAL_ERRORS) > 0 {
        return exit_codes::INTERNAL;
    }
    exit_codes::OK
}

/// Layers defaults, `config.toml`, and `FEEDRELAY_`-prefixed environment
/// overrides into the flat pipeline record, then validates it.
fn load_config() -> anyhow::Result<PipelineConfig> {
    use anyhow::Context;

    let config: PipelineConfig = Figment::new()
        .merge(Serialized::defaults(PipelineConfig::default()))
        .merge(Toml::file(CONFIG_FILE))
        .merge(Env::prefixed("FEEDRELAY_"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("configuration invalid")?;
    Ok(config)
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,feedrelay=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received CTRL+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Store that records outcomes into the structured log.
///
/// Stands in for an embedded database; the worker treats it as
/// best-effort like any other store.
struct LogStore;

#[async_trait]
impl Store for LogStore {
    async fn record(&self, item: &Item, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        info!(
            item_id = %item.id,
            endpoint = %item.endpoint,
            outcome = outcome.as_str(),
            "outcome recorded"
        );
        Ok(())
    }
}
