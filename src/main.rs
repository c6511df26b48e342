// =============================================================================
// Market Pulse — Main Entry Point
// =============================================================================
//
// Starts the tick pipeline, the scheduled maintenance loops and the read API.
// The upstream feed is only connected when credentials are present in the
// environment; without them the API still serves stored snapshots and
// candles.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod market_data;
mod pipeline;
mod runtime_config;
mod snapshot_sync;
mod storage;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::broadcast::BroadcastHub;
use crate::app_state::AppState;
use crate::market_data::candle_aggregator::CandleAggregator;
use crate::market_data::connection::{run_feed, FeedStatus};
use crate::market_data::movers::MoversRanker;
use crate::market_data::normalizer::{DropStats, TickNormalizer};
use crate::market_data::price_cache::LatestPriceCache;
use crate::market_data::token_map::TokenMap;
use crate::pipeline::{log_drop_summary, AggregatorHandle, TickPipeline};
use crate::runtime_config::{FeedCredentials, RuntimeConfig};
use crate::snapshot_sync::{seed_from_snapshots, SnapshotSynchronizer};
use crate::storage::{SnapshotStore, SqliteStore, TokenMapSource};
use crate::types::{now_ms, MarketClock};

const DEFAULT_CONFIG_PATH: &str = "market_pulse.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Market Pulse starting up");

    let config_path =
        std::env::var("MARKET_PULSE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load_or_default(&config_path);
    config.apply_env_overrides();
    let clock = MarketClock::new(config.utc_offset_minutes);

    // ── 2. Storage & instruments ─────────────────────────────────────────
    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path))?,
    );

    let tokens = Arc::new(TokenMap::from_entries(
        store
            .load_token_entries()
            .context("failed to load instrument token map")?,
    ));
    if tokens.is_empty() {
        warn!("instrument table has no tradeable rows, every tick will be dropped");
    } else {
        info!(tokens = tokens.len(), "token map loaded");
    }

    // ── 3. In-memory views, seeded from the last snapshots ───────────────
    let cache = Arc::new(LatestPriceCache::new(clock));
    let movers = Arc::new(MoversRanker::new(config.movers_ttl_secs));
    match store.load_snapshots() {
        Ok(rows) => {
            seed_from_snapshots(&rows, clock.date_of(now_ms()), &cache, &movers);
        }
        Err(e) => warn!(error = %e, "failed to load market snapshots, starting cold"),
    }

    // ── 4. Pipeline ──────────────────────────────────────────────────────
    let hub = Arc::new(BroadcastHub::new(config.broadcast_capacity));
    let drops = Arc::new(DropStats::default());
    let (aggregator, aggregator_join) = AggregatorHandle::spawn(
        CandleAggregator::new(store.clone(), clock),
        config.tick_queue_capacity,
    );
    let pipeline = Arc::new(TickPipeline::new(
        tokens.clone(),
        TickNormalizer::new(
            config.min_price,
            config.max_price,
            config.max_clock_skew_secs.saturating_mul(1000),
        ),
        cache.clone(),
        movers.clone(),
        hub.clone(),
        aggregator.clone(),
        drops.clone(),
    ));

    let credentials = FeedCredentials::from_env();
    let feed_status = Arc::new(FeedStatus::default());

    let state = Arc::new(AppState {
        config: config.clone(),
        tokens: tokens.clone(),
        cache: cache.clone(),
        movers,
        hub: hub.clone(),
        aggregator: aggregator.clone(),
        drops: drops.clone(),
        feed_status: feed_status.clone(),
        feed_enabled: credentials.is_some(),
        candles: store.clone(),
        start_time: std::time::Instant::now(),
    });

    let mut tasks = Vec::new();

    // ── 5. Upstream feed ─────────────────────────────────────────────────
    match credentials {
        Some(credentials) => {
            let feed = config.feed.clone();
            tasks.push(tokio::spawn(run_feed(
                feed,
                credentials,
                tokens,
                pipeline,
                feed_status,
            )));
        }
        None => warn!("feed credentials missing, running without a live feed"),
    }

    // ── 6. Stale candle sweep ────────────────────────────────────────────
    {
        let aggregator = aggregator.clone();
        let period = Duration::from_secs(config.sweep_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = aggregator.sweep(now_ms()).await {
                    error!(error = %e, "candle sweep failed");
                }
            }
        }));
    }

    // ── 7. Snapshot sync ─────────────────────────────────────────────────
    let synchronizer = Arc::new(SnapshotSynchronizer::new(cache, store.clone()));
    {
        let synchronizer = synchronizer.clone();
        let drops = drops.clone();
        let period = Duration::from_secs(config.snapshot_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing is cached yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = synchronizer.sync_once().await {
                    error!(error = %e, "snapshot sync failed");
                }
                log_drop_summary(&drops);
            }
        }));
    }

    // ── 8. Subscriber liveness ping ──────────────────────────────────────
    {
        let hub = hub.clone();
        let period = Duration::from_secs(config.ping_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                hub.publish_ping();
            }
        }));
    }

    // ── 9. API server ────────────────────────────────────────────────────
    {
        let app = api::rest::router(state);
        let bind_addr = config.bind_addr.clone();
        tasks.push(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        }));
    }

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    for task in &tasks {
        task.abort();
    }

    match aggregator.shutdown().await {
        Ok(flushed) => info!(flushed, "active candles flushed"),
        Err(e) => error!(error = %e, "candle flush on shutdown failed"),
    }
    if let Err(e) = aggregator_join.await {
        error!(error = %e, "aggregation worker ended abnormally");
    }

    match synchronizer.sync_once().await {
        Ok(written) => info!(symbols = written, "final snapshot written"),
        Err(e) => error!(error = %e, "final snapshot sync failed"),
    }
    log_drop_summary(&drops);

    info!("Market Pulse stopped");
    Ok(())
}
