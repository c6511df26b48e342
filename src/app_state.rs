// =============================================================================
// Central Application State — market-pulse
// =============================================================================
//
// Ties the pipeline's shared components together for the HTTP/WebSocket
// surface and the scheduled tasks.  Each component manages its own interior
// mutability; AppState only holds `Arc`s.
//
// Thread safety:
//   - parking_lot::RwLock inside the cache, the movers ranking and the feed
//     status.
//   - Atomic counters for drop accounting and subscriber counts.
//   - The candle aggregator is not shared at all; it is reached through its
//     worker handle.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;

use crate::api::broadcast::BroadcastHub;
use crate::market_data::candle_aggregator::AggregatorStats;
use crate::market_data::connection::{ConnectionState, FeedStatus};
use crate::market_data::movers::MoversRanker;
use crate::market_data::normalizer::{DropSnapshot, DropStats};
use crate::market_data::price_cache::LatestPriceCache;
use crate::market_data::token_map::TokenMap;
use crate::pipeline::AggregatorHandle;
use crate::runtime_config::RuntimeConfig;
use crate::storage::CandleStore;
use crate::types::now_ms;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: RuntimeConfig,
    pub tokens: Arc<TokenMap>,

    // ── Views ───────────────────────────────────────────────────────────
    pub cache: Arc<LatestPriceCache>,
    pub movers: Arc<MoversRanker>,

    // ── Fan-out ─────────────────────────────────────────────────────────
    pub hub: Arc<BroadcastHub>,

    // ── Pipeline ────────────────────────────────────────────────────────
    pub aggregator: AggregatorHandle,
    pub drops: Arc<DropStats>,
    pub feed_status: Arc<FeedStatus>,
    pub feed_enabled: bool,

    // ── Storage ─────────────────────────────────────────────────────────
    pub candles: Arc<dyn CandleStore>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub feed_enabled: bool,
    pub feed_state: ConnectionState,
    pub feed_connects: u64,
    pub subscribers: usize,
    pub symbols_tracked: usize,
    pub tokens: usize,
    pub ticks_published: u64,
    pub drops: DropSnapshot,
    /// `None` when the aggregation worker has stopped.
    pub candles: Option<AggregatorStats>,
    pub uptime_secs: u64,
    pub server_time: i64,
}

impl AppState {
    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            feed_enabled: self.feed_enabled,
            feed_state: self.feed_status.state(),
            feed_connects: self.feed_status.connects(),
            subscribers: self.hub.subscriber_count(),
            symbols_tracked: self.cache.len(),
            tokens: self.tokens.len(),
            ticks_published: self.hub.published(),
            drops: self.drops.snapshot(),
            candles: self.aggregator.stats().await.ok(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: now_ms(),
        }
    }
}
