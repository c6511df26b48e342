use std::collections::HashMap;

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{MarketClock, NormalizedTick};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrevClose {
    pub price: f64,
    /// Market-local trading date the price closed on (or was seeded for).
    pub date: NaiveDate,
}

/// Latest tick and previous close for one symbol.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheEntry {
    pub latest: Option<NormalizedTick>,
    pub prev_close: Option<PrevClose>,
}

/// Thread-safe map of symbol to latest tick and previous close.
///
/// The previous close rolls over at most once per market-local day: when a
/// tick dated strictly after the cached latest tick arrives, the cached
/// latest price becomes the new previous close before being overwritten.
pub struct LatestPriceCache {
    clock: MarketClock,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl LatestPriceCache {
    pub fn new(clock: MarketClock) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store `tick` as the symbol's latest and return the effective previous
    /// close after any rollover.
    pub fn set(&self, tick: &NormalizedTick) -> f64 {
        let incoming_date = self.clock.date_of(tick.timestamp_ms);
        let mut map = self.entries.write();
        let entry = map.entry(tick.symbol.clone()).or_default();

        let next_prev = match (entry.prev_close, entry.latest.as_ref()) {
            (None, _) => Some(PrevClose {
                price: tick.open,
                date: incoming_date,
            }),
            (Some(_), Some(latest)) => {
                let latest_date = self.clock.date_of(latest.timestamp_ms);
                (incoming_date > latest_date).then(|| PrevClose {
                    price: latest.price,
                    date: latest_date,
                })
            }
            (Some(_), None) => None,
        };
        if next_prev.is_some() {
            entry.prev_close = next_prev;
        }

        entry.latest = Some(tick.clone());
        entry.prev_close.map_or(tick.open, |p| p.price)
    }

    pub fn get(&self, symbol: &str) -> Option<NormalizedTick> {
        self.entries.read().get(symbol).and_then(|e| e.latest.clone())
    }

    pub fn prev_close(&self, symbol: &str) -> Option<PrevClose> {
        self.entries.read().get(symbol).and_then(|e| e.prev_close)
    }

    pub fn entry(&self, symbol: &str) -> Option<CacheEntry> {
        self.entries.read().get(symbol).cloned()
    }

    /// Install an externally supplied previous close. Ignored when the
    /// symbol already has one in memory.
    pub fn seed_prev_close(&self, symbol: &str, price: f64, date: NaiveDate) -> bool {
        let mut map = self.entries.write();
        let entry = map.entry(symbol.to_string()).or_default();
        if entry.prev_close.is_some() {
            return false;
        }
        entry.prev_close = Some(PrevClose { price, date });
        true
    }

    /// Every symbol with a latest tick, with its previous close.
    pub fn latest_entries(&self) -> Vec<(NormalizedTick, Option<PrevClose>)> {
        self.entries
            .read()
            .values()
            .filter_map(|e| e.latest.clone().map(|t| (t, e.prev_close)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| e.latest.is_some()).count()
    }

    pub fn clock(&self) -> MarketClock {
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DAY_MS;

    /// 2024-01-02 10:00 IST.
    const D: i64 = 1_704_169_800_000;

    fn tick(price: f64, open: f64, ts: i64) -> NormalizedTick {
        NormalizedTick {
            symbol: "SBIN".into(),
            exchange: "NSE".into(),
            price,
            open,
            high: price,
            low: price,
            close: price,
            volume: 0,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn first_tick_seeds_prev_close_from_open() {
        let cache = LatestPriceCache::new(MarketClock::new(330));
        assert_eq!(cache.set(&tick(101.0, 99.0, D)), 99.0);
        assert_eq!(cache.prev_close("SBIN").unwrap().price, 99.0);
        assert_eq!(cache.get("SBIN").unwrap().price, 101.0);
    }

    #[test]
    fn rollover_fires_once_per_day_boundary() {
        let cache = LatestPriceCache::new(MarketClock::new(330));
        cache.set(&tick(100.0, 95.0, D));
        cache.set(&tick(104.0, 95.0, D + 60_000));
        assert_eq!(cache.prev_close("SBIN").unwrap().price, 95.0);

        // D -> D+1: yesterday's last price becomes the previous close.
        assert_eq!(cache.set(&tick(110.0, 106.0, D + DAY_MS)), 104.0);
        // Later the same day: unchanged.
        assert_eq!(cache.set(&tick(112.0, 106.0, D + DAY_MS + 60_000)), 104.0);

        let prev = cache.prev_close("SBIN").unwrap();
        assert_eq!(prev.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn rollover_uses_market_local_dates() {
        let cache = LatestPriceCache::new(MarketClock::new(330));
        // 2024-01-02 23:00 IST then 2024-01-03 00:30 IST, 90 minutes apart.
        let late = 1_704_216_600_000;
        cache.set(&tick(100.0, 100.0, late));
        cache.set(&tick(101.0, 101.0, late + 90 * 60_000));
        assert_eq!(cache.prev_close("SBIN").unwrap().price, 100.0);
    }

    #[test]
    fn seeded_prev_close_is_kept_until_rollover() {
        let cache = LatestPriceCache::new(MarketClock::new(330));
        let yesterday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(cache.seed_prev_close("SBIN", 90.0, yesterday));
        assert!(!cache.seed_prev_close("SBIN", 91.0, yesterday));
        assert_eq!(cache.len(), 0);

        assert_eq!(cache.set(&tick(100.0, 97.0, D)), 90.0);
        assert_eq!(cache.latest_entries().len(), 1);
    }

    #[test]
    fn unknown_symbol_reads_are_empty() {
        let cache = LatestPriceCache::new(MarketClock::default());
        assert!(cache.get("NOPE").is_none());
        assert!(cache.prev_close("NOPE").is_none());
    }
}
