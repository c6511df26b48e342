// =============================================================================
// Snapshot Synchronizer — latest-price cache to durable per-symbol snapshots
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::market_data::movers::MoversRanker;
use crate::market_data::price_cache::LatestPriceCache;
use crate::storage::{SnapshotRow, SnapshotStore};

pub struct SnapshotSynchronizer {
    cache: Arc<LatestPriceCache>,
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotSynchronizer {
    pub fn new(cache: Arc<LatestPriceCache>, store: Arc<dyn SnapshotStore>) -> Self {
        Self { cache, store }
    }

    /// One row per cached symbol. Symbols without a latest tick are skipped.
    pub fn collect_rows(&self) -> Vec<SnapshotRow> {
        let clock = self.cache.clock();
        self.cache
            .latest_entries()
            .into_iter()
            .map(|(tick, prev)| SnapshotRow {
                latest_date: clock.date_of(tick.timestamp_ms),
                prev_close: prev.map_or(0.0, |p| p.price),
                latest_price: tick.price,
                latest_ts_ms: tick.timestamp_ms,
                open: tick.open,
                high: tick.high,
                low: tick.low,
                volume: tick.volume,
                symbol: tick.symbol,
                exchange: tick.exchange,
            })
            .collect()
    }

    /// Write the whole cache in one batch. The store applies the
    /// previous-close rollover per row.
    pub async fn sync_once(&self) -> Result<usize> {
        let rows = self.collect_rows();
        if rows.is_empty() {
            return Ok(0);
        }
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.upsert_snapshots(&rows))
            .await
            .context("snapshot task panicked")??;
        info!(symbols = written, "market snapshot synced");
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Cold start
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub prev_closes: usize,
    pub movers: usize,
}

/// Recover previous closes and the last known movers from stored snapshots.
///
/// A snapshot whose latest date is before `today` already holds the close
/// that today's moves are measured against, so its latest price is the
/// effective previous close.
pub fn seed_from_snapshots(
    rows: &[SnapshotRow],
    today: NaiveDate,
    cache: &LatestPriceCache,
    movers: &MoversRanker,
) -> SeedSummary {
    let mut summary = SeedSummary::default();
    for row in rows {
        let (effective_prev, prev_date) = if row.latest_date < today {
            (row.latest_price, row.latest_date)
        } else {
            (row.prev_close, row.latest_date)
        };
        if effective_prev > 0.0 && cache.seed_prev_close(&row.symbol, effective_prev, prev_date) {
            summary.prev_closes += 1;
        }

        if row.prev_close > 0.0 {
            let change = row.latest_price - row.prev_close;
            movers.upsert(&row.symbol, change / row.prev_close * 100.0, row.latest_price, change);
            summary.movers += 1;
        }
    }
    if rows.is_empty() {
        warn!("no stored snapshots, movers start cold");
    } else {
        info!(
            snapshots = rows.len(),
            prev_closes = summary.prev_closes,
            movers = summary.movers,
            "seeded from market snapshots"
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use crate::types::{MarketClock, NormalizedTick, DAY_MS};

    /// 2024-01-02 10:00 IST.
    const D: i64 = 1_704_169_800_000;

    fn tick(symbol: &str, price: f64, ts: i64) -> NormalizedTick {
        NormalizedTick {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            price,
            open: price - 1.0,
            high: price,
            low: price - 1.0,
            close: price,
            volume: 10,
            timestamp_ms: ts,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn sync_writes_every_cached_symbol() {
        let cache = Arc::new(LatestPriceCache::new(MarketClock::new(330)));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sync = SnapshotSynchronizer::new(cache.clone(), store.clone());

        assert_eq!(sync.sync_once().await.unwrap(), 0);

        cache.set(&tick("SBIN", 100.0, D));
        cache.set(&tick("INFY", 1500.0, D));
        assert_eq!(sync.sync_once().await.unwrap(), 2);

        let mut rows = store.load_snapshots().unwrap();
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(rows[1].symbol, "SBIN");
        assert_eq!(rows[1].latest_price, 100.0);
        assert_eq!(rows[1].prev_close, 99.0);
        assert_eq!(rows[1].latest_date, date(2024, 1, 2));
    }

    #[tokio::test]
    async fn durable_rollover_matches_cache_rollover() {
        let cache = Arc::new(LatestPriceCache::new(MarketClock::new(330)));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sync = SnapshotSynchronizer::new(cache.clone(), store.clone());

        cache.set(&tick("SBIN", 100.0, D));
        sync.sync_once().await.unwrap();
        cache.set(&tick("SBIN", 104.0, D + 60_000));
        sync.sync_once().await.unwrap();
        cache.set(&tick("SBIN", 110.0, D + DAY_MS));
        sync.sync_once().await.unwrap();

        let rows = store.load_snapshots().unwrap();
        assert_eq!(rows[0].prev_close, 104.0);
        assert_eq!(rows[0].latest_price, 110.0);
    }

    #[test]
    fn cold_start_seeds_prev_close_and_movers() {
        let cache = LatestPriceCache::new(MarketClock::new(330));
        let movers = MoversRanker::new(86_400);
        let row = |symbol: &str, latest: f64, d: NaiveDate, prev: f64| SnapshotRow {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            latest_price: latest,
            latest_ts_ms: 0,
            latest_date: d,
            prev_close: prev,
            open: latest,
            high: latest,
            low: latest,
            volume: 0,
        };
        let today = date(2024, 1, 3);
        let rows = vec![
            // Last traded yesterday: yesterday's latest is today's prev close.
            row("SBIN", 110.0, date(2024, 1, 2), 100.0),
            // Already traded today: stored prev close stands.
            row("INFY", 95.0, today, 100.0),
            // No usable prev close: not ranked.
            row("NEW", 50.0, today, 0.0),
        ];

        let summary = seed_from_snapshots(&rows, today, &cache, &movers);
        assert_eq!(summary, SeedSummary { prev_closes: 2, movers: 2 });

        assert_eq!(cache.prev_close("SBIN").unwrap().price, 110.0);
        assert_eq!(cache.prev_close("INFY").unwrap().price, 100.0);
        assert!(cache.prev_close("NEW").is_none());

        let m = movers.movers(5);
        assert_eq!(m.gainers[0].symbol, "SBIN");
        assert!((m.gainers[0].percent_change - 10.0).abs() < 1e-9);
        assert_eq!(m.losers[0].symbol, "INFY");
    }
}
