use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::storage::{CandleStore, StoreError};
use crate::types::{MarketClock, NormalizedTick, PersistedCandle, Timeframe, DAY_MS, MINUTE_MS};

// ---------------------------------------------------------------------------
// ActiveCandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveCandle {
    pub symbol: String,
    pub exchange: String,
    pub bucket_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl ActiveCandle {
    fn new(symbol: &str, exchange: &str, bucket_start_ms: i64, price: f64, volume: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            bucket_start_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: volume.max(0),
        }
    }

    fn extend(&mut self, price: f64, volume: i64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume = self.volume.saturating_add(volume.max(0));
    }

    /// low <= open, close <= high and volume >= 0.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0
    }

    fn to_persisted(&self) -> PersistedCandle {
        PersistedCandle {
            symbol: self.symbol.clone(),
            exchange: self.exchange.clone(),
            timeframe: Timeframe::M1,
            bucket_start_ms: self.bucket_start_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Floor a unix-millisecond timestamp to its minute bucket.
pub fn minute_bucket(ts_ms: i64) -> i64 {
    ts_ms.saturating_sub(ts_ms.rem_euclid(MINUTE_MS))
}

// ---------------------------------------------------------------------------
// Volume delta tracking
// ---------------------------------------------------------------------------

/// Converts the feed's day-cumulative volume into per-tick deltas.
///
/// The baseline is the largest cumulative figure seen for the symbol on its
/// market-local trading day. A smaller figure on the same day is a reordered
/// frame and contributes nothing; the first figure of a new day counts in
/// full.
#[derive(Debug, Default)]
pub struct DayVolumeTracker {
    last: HashMap<String, (NaiveDate, i64)>,
}

impl DayVolumeTracker {
    /// First observation yields 0. Zero means the frame carried no volume
    /// (LTP mode) and leaves the tracker untouched, as does a frame dated
    /// before the baseline's day.
    pub fn delta(&mut self, symbol: &str, cumulative: i64, date: NaiveDate) -> i64 {
        if cumulative <= 0 {
            return 0;
        }
        let Some(baseline) = self.last.get_mut(symbol) else {
            self.last.insert(symbol.to_string(), (date, cumulative));
            return 0;
        };
        let (day, seen) = *baseline;
        if date > day {
            *baseline = (date, cumulative);
            cumulative
        } else if date == day && cumulative > seen {
            baseline.1 = cumulative;
            cumulative - seen
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No candle was live for the symbol; one was opened.
    Created,
    /// Same bucket; the live candle was extended.
    Extended,
    /// The live candle belonged to an earlier bucket and was flushed first.
    Rolled,
    /// The tick is older than the live candle's bucket and was ignored.
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Persisted,
    /// Storage failed; the candle is gone and will not be retried.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub active: usize,
    pub persisted: u64,
    pub dropped: u64,
    pub late_ticks: u64,
}

/// Owns the single in-flight 1-minute candle per symbol.
///
/// A candle is flushed (persisted, then dropped from memory) when a tick for
/// a later bucket arrives, when the periodic sweep finds it stale, or at
/// shutdown. Flushing the bucket that closes a 5-minute window derives the
/// 5-minute candle from persisted rows, and the day's 1d candle is
/// recomputed from the 5-minute rows right after.
///
/// Not `Sync`; a single worker owns it so no two writers ever touch the same
/// symbol's candle.
pub struct CandleAggregator {
    store: Arc<dyn CandleStore>,
    clock: MarketClock,
    active: HashMap<String, ActiveCandle>,
    volumes: DayVolumeTracker,
    persisted: u64,
    dropped: u64,
    late_ticks: u64,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn CandleStore>, clock: MarketClock) -> Self {
        Self {
            store,
            clock,
            active: HashMap::new(),
            volumes: DayVolumeTracker::default(),
            persisted: 0,
            dropped: 0,
            late_ticks: 0,
        }
    }

    /// Feed one normalized tick, deriving its volume delta from the
    /// day-cumulative figure. Late ticks leave the volume baseline alone.
    pub fn on_normalized(&mut self, tick: &NormalizedTick) -> TickOutcome {
        let delta = if self.is_late(&tick.symbol, tick.timestamp_ms) {
            0
        } else {
            let date = self.clock.date_of(tick.timestamp_ms);
            self.volumes.delta(&tick.symbol, tick.volume, date)
        };
        self.on_tick(&tick.symbol, &tick.exchange, tick.price, delta, tick.timestamp_ms)
    }

    fn is_late(&self, symbol: &str, ts_ms: i64) -> bool {
        self.active
            .get(symbol)
            .is_some_and(|c| c.bucket_start_ms > minute_bucket(ts_ms))
    }

    pub fn on_tick(
        &mut self,
        symbol: &str,
        exchange: &str,
        price: f64,
        volume_delta: i64,
        ts_ms: i64,
    ) -> TickOutcome {
        let bucket = minute_bucket(ts_ms);

        let outcome = match self.active.get(symbol).map(|c| c.bucket_start_ms) {
            Some(live) if live == bucket => {
                if let Some(candle) = self.active.get_mut(symbol) {
                    candle.extend(price, volume_delta);
                }
                return TickOutcome::Extended;
            }
            Some(live) if live > bucket => {
                self.late_ticks += 1;
                debug!(symbol = %symbol, live, bucket, "late tick ignored for candles");
                return TickOutcome::Late;
            }
            Some(_) => {
                self.flush_symbol(symbol);
                TickOutcome::Rolled
            }
            None => TickOutcome::Created,
        };

        self.active.insert(
            symbol.to_string(),
            ActiveCandle::new(symbol, exchange, bucket, price, volume_delta),
        );
        outcome
    }

    /// Remove the symbol's live candle and persist it. Removal happens first,
    /// so a second flush of the same bucket finds nothing and is a no-op.
    pub fn flush_symbol(&mut self, symbol: &str) -> Option<FlushOutcome> {
        let candle = self.active.remove(symbol)?;
        Some(self.persist(candle))
    }

    /// Flush every candle whose bucket is strictly before the minute
    /// containing `now_ms`. Returns the number flushed.
    pub fn sweep(&mut self, now_ms: i64) -> usize {
        let current = minute_bucket(now_ms);
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|(_, c)| c.bucket_start_ms < current)
            .map(|(s, _)| s.clone())
            .collect();

        for symbol in &stale {
            self.flush_symbol(symbol);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "flushed stale candles");
        }
        stale.len()
    }

    /// Best-effort flush of everything in memory (shutdown).
    pub fn flush_all(&mut self) -> usize {
        let symbols: Vec<String> = self.active.keys().cloned().collect();
        for symbol in &symbols {
            self.flush_symbol(symbol);
        }
        symbols.len()
    }

    pub fn active(&self, symbol: &str) -> Option<&ActiveCandle> {
        self.active.get(symbol)
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            active: self.active.len(),
            persisted: self.persisted,
            dropped: self.dropped,
            late_ticks: self.late_ticks,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist(&mut self, candle: ActiveCandle) -> FlushOutcome {
        let row = candle.to_persisted();
        if let Err(e) = upsert(self.store.as_ref(), &row) {
            self.dropped += 1;
            error!(
                symbol = %row.symbol,
                bucket = row.bucket_start_ms,
                error = %e,
                "failed to persist 1m candle, dropping"
            );
            return FlushOutcome::Dropped;
        }
        self.persisted += 1;

        if let Some((window_start, window_end)) = self.five_minute_window(row.bucket_start_ms) {
            if let Err(e) = self.promote(&row.symbol, window_start, window_end) {
                error!(
                    symbol = %row.symbol,
                    window_start,
                    error = %e,
                    "failed to derive 5m/1d candles"
                );
            }
        }
        FlushOutcome::Persisted
    }

    /// The `[start, end)` 5-minute window this bucket closes, when it is the
    /// last minute of a block in market local time (minute-of-hour 4, 9,
    /// 14, ...). Buckets at the edge of the timestamp range close nothing.
    fn five_minute_window(&self, bucket_start_ms: i64) -> Option<(i64, i64)> {
        let five = Timeframe::M5.duration_ms();
        let window_end = bucket_start_ms.checked_add(MINUTE_MS)?;
        let local_end = window_end.checked_add(self.clock.offset_ms())?;
        if local_end.rem_euclid(five) != 0 {
            return None;
        }
        Some((window_end.checked_sub(five)?, window_end))
    }

    fn promote(&self, symbol: &str, window_start: i64, window_end: i64) -> Result<(), StoreError> {
        let minutes = self
            .store
            .candles_in_range(symbol, Timeframe::M1, window_start, window_end)?;
        let Some(five) = PersistedCandle::rollup(&minutes, Timeframe::M5, window_start) else {
            return Ok(());
        };
        upsert(self.store.as_ref(), &five)?;

        let day_start = self.clock.day_start_ms(window_start);
        let fives = self
            .store
            .candles_in_range(symbol, Timeframe::M5, day_start, day_start.saturating_add(DAY_MS))?;
        if let Some(day) = PersistedCandle::rollup(&fives, Timeframe::D1, day_start) {
            upsert(self.store.as_ref(), &day)?;
        }
        Ok(())
    }
}

/// Upsert, treating a duplicate-key conflict as success.
fn upsert(store: &dyn CandleStore, candle: &PersistedCandle) -> Result<(), StoreError> {
    match store.upsert_candle(candle) {
        Ok(()) | Err(StoreError::Conflict(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
