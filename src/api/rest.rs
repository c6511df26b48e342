// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All read endpoints live under `/api/v1/`; the subscriber WebSocket is
// mounted at `/ws/prices`.  Every endpoint is read-only and served from the
// in-memory views, except candles, which are read from the store on a
// blocking thread.
//
// CORS is configured permissively; the surface exposes market data only.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::market_data::price_cache::PrevClose;
use crate::types::{NormalizedTick, PersistedCandle, Timeframe};

const DEFAULT_CANDLE_LIMIT: usize = 100;
const MAX_CANDLE_LIMIT: usize = 1_000;
const MAX_MOVERS_LIMIT: usize = 100;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Status ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Market views ────────────────────────────────────────────
        .route("/api/v1/movers", get(movers))
        .route("/api/v1/prices/:symbol", get(price))
        .route("/api/v1/candles/:symbol", get(candles))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws/prices", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health().await)
}

// =============================================================================
// Movers
// =============================================================================

#[derive(Debug, Deserialize)]
struct MoversQuery {
    limit: Option<usize>,
}

/// Never fails: a cold ranking is two empty lists.
async fn movers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MoversQuery>,
) -> impl IntoResponse {
    let limit = q
        .limit
        .unwrap_or(state.config.movers_limit)
        .min(MAX_MOVERS_LIMIT);
    Json(state.movers.movers(limit))
}

// =============================================================================
// Latest price
// =============================================================================

#[derive(Serialize)]
struct PriceResponse {
    symbol: String,
    tick: NormalizedTick,
    timestamp: String,
    prev_close: Option<PrevClose>,
}

async fn price(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> Response {
    let entry = state.cache.entry(&symbol).unwrap_or_default();
    match entry.latest {
        Some(tick) => Json(PriceResponse {
            symbol,
            timestamp: tick.ts_iso(),
            tick,
            prev_close: entry.prev_close,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no price for {symbol}")),
    }
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Debug, Deserialize)]
struct CandlesQuery {
    timeframe: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct CandlesResponse {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<PersistedCandle>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(q): Query<CandlesQuery>,
) -> Response {
    let timeframe = match q.timeframe.as_deref().unwrap_or("1m").parse::<Timeframe>() {
        Ok(tf) => tf,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let limit = q.limit.unwrap_or(DEFAULT_CANDLE_LIMIT).clamp(1, MAX_CANDLE_LIMIT);

    let store = state.candles.clone();
    let lookup = symbol.clone();
    let result =
        tokio::task::spawn_blocking(move || store.recent_candles(&lookup, timeframe, limit)).await;

    match result {
        Ok(Ok(candles)) => Json(CandlesResponse {
            symbol,
            timeframe,
            candles,
        })
        .into_response(),
        Ok(Err(e)) => {
            warn!(symbol = %symbol, error = %e, "candle query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "candle store unavailable")
        }
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "candle query task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "candle store unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::broadcast::BroadcastHub;
    use crate::market_data::candle_aggregator::CandleAggregator;
    use crate::market_data::connection::FeedStatus;
    use crate::market_data::movers::MoversRanker;
    use crate::market_data::normalizer::DropStats;
    use crate::market_data::price_cache::LatestPriceCache;
    use crate::market_data::token_map::TokenMap;
    use crate::pipeline::AggregatorHandle;
    use crate::runtime_config::RuntimeConfig;
    use crate::storage::{CandleStore, SqliteStore};
    use crate::types::MarketClock;

    /// 2024-01-02 09:15:00 IST.
    const T0915: i64 = 1_704_167_100_000;

    fn state() -> (Arc<AppState>, Arc<SqliteStore>) {
        let clock = MarketClock::new(330);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (aggregator, _join) =
            AggregatorHandle::spawn(CandleAggregator::new(store.clone(), clock), 16);
        let state = AppState {
            config: RuntimeConfig::default(),
            tokens: Arc::new(TokenMap::from_entries(Vec::new())),
            cache: Arc::new(LatestPriceCache::new(clock)),
            movers: Arc::new(MoversRanker::new(86_400)),
            hub: Arc::new(BroadcastHub::new(16)),
            aggregator,
            drops: Arc::new(DropStats::default()),
            feed_status: Arc::new(FeedStatus::default()),
            feed_enabled: false,
            candles: store.clone(),
            start_time: std::time::Instant::now(),
        };
        (Arc::new(state), store)
    }

    fn tick(symbol: &str, price: f64, open: f64) -> NormalizedTick {
        NormalizedTick {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            price,
            open,
            high: price.max(open),
            low: price.min(open),
            close: open,
            volume: 100,
            timestamp_ms: T0915,
        }
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_reports_ok() {
        let (state, _) = state();
        let (status, body) = get_json(state, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["feed_state"], "disconnected");
        assert_eq!(body["subscribers"], 0);
        assert_eq!(body["candles"]["active"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn movers_cold_is_empty_lists() {
        let (state, _) = state();
        let (status, body) = get_json(state, "/api/v1/movers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gainers"], json!([]));
        assert_eq!(body["losers"], json!([]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn movers_honours_limit() {
        let (state, _) = state();
        state.movers.upsert("A", 3.0, 103.0, 3.0);
        state.movers.upsert("B", 2.0, 102.0, 2.0);
        state.movers.upsert("C", -1.0, 99.0, -1.0);

        let (_, body) = get_json(state, "/api/v1/movers?limit=1").await;
        let gainers = body["gainers"].as_array().unwrap();
        assert_eq!(gainers.len(), 1);
        assert_eq!(gainers[0]["symbol"], "A");
        assert_eq!(body["losers"][0]["symbol"], "C");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn price_known_and_unknown() {
        let (state, _) = state();
        state.cache.set(&tick("SBIN", 103.0, 100.0));

        let (status, body) = get_json(state.clone(), "/api/v1/prices/SBIN").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tick"]["price"], 103.0);
        assert_eq!(body["prev_close"]["price"], 100.0);

        let (status, body) = get_json(state, "/api/v1/prices/NOPE").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("NOPE"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn candles_read_from_store() {
        let (state, store) = state();
        for i in 0..3 {
            store
                .upsert_candle(&PersistedCandle {
                    symbol: "SBIN".into(),
                    exchange: "NSE".into(),
                    timeframe: Timeframe::M1,
                    bucket_start_ms: T0915 + i * 60_000,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0 + i as f64,
                    volume: 10,
                })
                .unwrap();
        }

        let (status, body) =
            get_json(state.clone(), "/api/v1/candles/SBIN?timeframe=1m&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let candles = body["candles"].as_array().unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0]["close"], 101.0);
        assert_eq!(candles[1]["close"], 102.0);

        let (status, _) = get_json(state, "/api/v1/candles/SBIN?timeframe=7m").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
