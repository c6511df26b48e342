// =============================================================================
// Shared types used across the market-pulse pipeline
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds in one minute bucket.
pub const MINUTE_MS: i64 = 60_000;
/// Milliseconds in one calendar day.
pub const DAY_MS: i64 = 86_400_000;

/// A validated, unit-correct tick. Prices are in major units and always lie
/// within the configured price bounds; ticks that violate them are never
/// constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTick {
    pub symbol: String,
    pub exchange: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Day-cumulative traded volume.
    pub volume: i64,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
}

impl NormalizedTick {
    /// ISO 8601 rendering of the tick timestamp (UTC, millisecond precision).
    pub fn ts_iso(&self) -> String {
        iso_millis(self.timestamp_ms)
    }
}

/// Render unix milliseconds as an ISO 8601 UTC string.
pub fn iso_millis(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Candle timeframes persisted by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::D1 => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => MINUTE_MS,
            Self::M5 => 5 * MINUTE_MS,
            Self::D1 => DAY_MS,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "1d" => Ok(Self::D1),
            other => anyhow::bail!("unsupported timeframe: {other}"),
        }
    }
}

/// A completed candle as written to durable storage, uniquely keyed by
/// `(symbol, timeframe, bucket_start_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCandle {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: Timeframe,
    pub bucket_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl PersistedCandle {
    /// Fold a chronologically ordered run of candles into one candle for
    /// `timeframe` starting at `bucket_start_ms`. Returns `None` for an empty
    /// run.
    pub fn rollup(
        parts: &[PersistedCandle],
        timeframe: Timeframe,
        bucket_start_ms: i64,
    ) -> Option<PersistedCandle> {
        let first = parts.first()?;
        let last = parts.last()?;
        let high = parts.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = parts.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let volume = parts.iter().map(|c| c.volume).fold(0, i64::saturating_add);

        Some(PersistedCandle {
            symbol: first.symbol.clone(),
            exchange: first.exchange.clone(),
            timeframe,
            bucket_start_ms,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
        })
    }
}

/// Calendar arithmetic in the market's local time zone.
///
/// Day boundaries (previous-close rollover, daily candles) are evaluated at a
/// fixed UTC offset rather than in UTC.
#[derive(Debug, Clone, Copy)]
pub struct MarketClock {
    offset: FixedOffset,
}

impl MarketClock {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    /// Market-local calendar date of a unix-millisecond timestamp.
    pub fn date_of(&self, ts_ms: i64) -> NaiveDate {
        DateTime::<Utc>::from_timestamp_millis(ts_ms)
            .unwrap_or_default()
            .with_timezone(&self.offset)
            .date_naive()
    }

    pub fn offset_ms(&self) -> i64 {
        i64::from(self.offset.local_minus_utc()) * 1000
    }

    /// Unix milliseconds of market-local midnight for the day containing
    /// `ts_ms`.
    pub fn day_start_ms(&self, ts_ms: i64) -> i64 {
        let off = self.offset_ms();
        let local = ts_ms.saturating_add(off);
        local.saturating_sub(local.rem_euclid(DAY_MS)).saturating_sub(off)
    }
}

impl Default for MarketClock {
    fn default() -> Self {
        Self::new(330)
    }
}
