// =============================================================================
// Durable collaborators — candle history, per-symbol snapshots, token map
// =============================================================================

pub mod sqlite;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::market_data::token_map::TokenMapEntry;
use crate::types::{PersistedCandle, Timeframe};

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The row already exists with the same key. Writes are idempotent
    /// upserts, so callers treat this as success.
    #[error("duplicate key: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        // Only key collisions are conflicts; NOT NULL, CHECK and foreign-key
        // failures are real write errors.
        if let rusqlite::Error::SqliteFailure(ref code, _) = e {
            if matches!(
                code.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            ) {
                return StoreError::Conflict(e.to_string());
            }
        }
        StoreError::Backend(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Candle history keyed by `(symbol, timeframe, bucket_start_ms)`.
pub trait CandleStore: Send + Sync {
    /// Insert or overwrite the OHLCV of one candle.
    fn upsert_candle(&self, candle: &PersistedCandle) -> StoreResult<()>;

    /// Candles for `symbol` with `start_ms <= bucket_start_ms < end_ms`,
    /// oldest first.
    fn candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> StoreResult<Vec<PersistedCandle>>;

    /// The most recent `limit` candles, oldest first.
    fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> StoreResult<Vec<PersistedCandle>>;
}

/// One durable "latest known state" row per symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRow {
    pub symbol: String,
    pub exchange: String,
    pub latest_price: f64,
    pub latest_ts_ms: i64,
    /// Market-local date of `latest_ts_ms`.
    pub latest_date: NaiveDate,
    pub prev_close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: i64,
}

pub trait SnapshotStore: Send + Sync {
    /// Batched upsert. When an incoming row's date is strictly later than the
    /// stored date, the stored latest price becomes the previous close in the
    /// same write.
    fn upsert_snapshots(&self, rows: &[SnapshotRow]) -> StoreResult<usize>;

    fn load_snapshots(&self) -> StoreResult<Vec<SnapshotRow>>;
}

/// Read-only token reference table.
pub trait TokenMapSource: Send + Sync {
    fn load_token_entries(&self) -> StoreResult<Vec<(String, TokenMapEntry)>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn failure(extended: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(extended), None)
    }

    #[test]
    fn only_key_collisions_map_to_conflict() {
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_CONSTRAINT_PRIMARYKEY)),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_CONSTRAINT_UNIQUE)),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_CONSTRAINT_NOTNULL)),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            StoreError::from(failure(ffi::SQLITE_CONSTRAINT_CHECK)),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn not_null_violation_is_a_backend_error() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT NOT NULL)").unwrap();
        let err = conn
            .execute("INSERT INTO t (a) VALUES (NULL)", [])
            .unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::Backend(_)));
    }
}
