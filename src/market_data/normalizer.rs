// =============================================================================
// Tick Normalizer — decoded records to validated, unit-correct ticks
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::decoder::DecodedTick;
use super::token_map::{clean_token, TokenMap};
use crate::types::NormalizedTick;

/// Why a decoded tick was discarded.
#[derive(Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("non-positive price {0}")]
    NonPositivePrice(i64),
    #[error("price {0} outside bounds")]
    OutOfBounds(f64),
    #[error("unknown token {0:?}")]
    UnknownToken(String),
}

impl Rejection {
    pub fn is_lookup_miss(&self) -> bool {
        matches!(self, Rejection::UnknownToken(_))
    }
}

pub struct TickNormalizer {
    min_price: f64,
    max_price: f64,
    max_skew_ms: u64,
}

impl TickNormalizer {
    pub fn new(min_price: f64, max_price: f64, max_skew_ms: u64) -> Self {
        Self {
            min_price,
            max_price,
            max_skew_ms,
        }
    }

    fn in_bounds(&self, v: f64) -> bool {
        v.is_finite() && v >= self.min_price && v <= self.max_price
    }

    /// Validate and convert one decoded tick.
    ///
    /// Day OHLC fields that are absent (zero) or fall outside the price
    /// bounds are replaced by the traded price rather than rejecting the
    /// tick. `arrival_ms` is used when the exchange timestamp is missing or
    /// further than the allowed skew from arrival.
    pub fn normalize(
        &self,
        raw: &DecodedTick,
        tokens: &TokenMap,
        arrival_ms: i64,
    ) -> Result<NormalizedTick, Rejection> {
        let token = clean_token(&raw.token);

        if raw.last_traded_price <= 0 {
            return Err(Rejection::NonPositivePrice(raw.last_traded_price));
        }

        let price = to_major(raw.last_traded_price);
        if !self.in_bounds(price) {
            return Err(Rejection::OutOfBounds(price));
        }

        let q = raw.quote.unwrap_or_default();
        let field = |minor: i64| {
            let v = to_major(minor);
            if minor != 0 && self.in_bounds(v) {
                v
            } else {
                price
            }
        };
        let (open, high, low, close) = (
            field(q.day_open),
            field(q.day_high),
            field(q.day_low),
            field(q.day_close),
        );

        let entry = tokens
            .lookup(&token)
            .ok_or_else(|| Rejection::UnknownToken(token.clone()))?;

        let exchange_ts = raw.exchange_timestamp_ms;
        let timestamp_ms =
            if exchange_ts > 0 && exchange_ts.abs_diff(arrival_ms) <= self.max_skew_ms {
                exchange_ts
            } else {
                arrival_ms
            };

        Ok(NormalizedTick {
            symbol: entry.symbol.clone(),
            exchange: entry.exchange.clone(),
            price,
            open,
            high,
            low,
            close,
            volume: q.day_volume.max(0),
            timestamp_ms,
        })
    }
}

fn to_major(minor: i64) -> f64 {
    minor as f64 / 100.0
}

// ---------------------------------------------------------------------------
// Drop accounting
// ---------------------------------------------------------------------------

/// Log the first drop of each kind, then every this many.
const LOG_EVERY: u64 = 10_000;

/// Counters for discarded frames and ticks. Individual drops are only logged
/// at sampled granularity; the totals are reported once per snapshot cycle.
#[derive(Debug, Default)]
pub struct DropStats {
    decode_errors: AtomicU64,
    rejected: AtomicU64,
    unknown_tokens: AtomicU64,
    queue_full: AtomicU64,
    worker_gone: AtomicU64,
    accepted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropSnapshot {
    pub accepted: u64,
    pub decode_errors: u64,
    pub rejected: u64,
    pub unknown_tokens: u64,
    pub queue_full: u64,
    pub worker_gone: u64,
}

impl DropStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self, err: &super::decoder::DecodeError, len: usize) {
        let n = self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if sampled(n) {
            warn!(error = %err, frame_len = len, total = n, "dropping malformed frame");
        }
    }

    pub fn record_rejection(&self, rejection: &Rejection) {
        let counter = if rejection.is_lookup_miss() {
            &self.unknown_tokens
        } else {
            &self.rejected
        };
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if sampled(n) {
            debug!(reason = %rejection, total = n, "tick discarded");
        }
    }

    pub fn record_queue_full(&self, symbol: &str) {
        let n = self.queue_full.fetch_add(1, Ordering::Relaxed) + 1;
        if sampled(n) {
            warn!(symbol = %symbol, total = n, "aggregation queue full, tick not aggregated");
        }
    }

    /// The aggregation worker has exited; candles are no longer built.
    pub fn record_worker_gone(&self, symbol: &str) {
        let n = self.worker_gone.fetch_add(1, Ordering::Relaxed) + 1;
        if sampled(n) {
            error!(symbol = %symbol, total = n, "aggregation worker is gone, tick not aggregated");
        }
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unknown_tokens: self.unknown_tokens.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            worker_gone: self.worker_gone.load(Ordering::Relaxed),
        }
    }
}

fn sampled(n: u64) -> bool {
    n == 1 || n % LOG_EVERY == 0
}
