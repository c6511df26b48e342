use std::path::Path;

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use super::{
    CandleStore, SnapshotRow, SnapshotStore, StoreError, StoreResult, TokenMapSource,
};
use crate::market_data::token_map::TokenMapEntry;
use crate::types::{PersistedCandle, Timeframe};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    symbol          TEXT    NOT NULL,
    exchange        TEXT    NOT NULL,
    timeframe       TEXT    NOT NULL,
    bucket_start_ms INTEGER NOT NULL,
    open            REAL    NOT NULL,
    high            REAL    NOT NULL,
    low             REAL    NOT NULL,
    close           REAL    NOT NULL,
    volume          INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, bucket_start_ms)
);

CREATE TABLE IF NOT EXISTS market_snapshot (
    symbol          TEXT PRIMARY KEY,
    exchange        TEXT    NOT NULL,
    latest_price    REAL    NOT NULL,
    latest_ts_ms    INTEGER NOT NULL,
    latest_date     TEXT    NOT NULL,
    prev_close      REAL    NOT NULL DEFAULT 0,
    prev_close_date TEXT,
    open            REAL    NOT NULL DEFAULT 0,
    high            REAL    NOT NULL DEFAULT 0,
    low             REAL    NOT NULL DEFAULT 0,
    volume          INTEGER NOT NULL DEFAULT 0,
    updated_at_ms   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS instruments (
    token      TEXT PRIMARY KEY,
    symbol     TEXT    NOT NULL,
    exchange   TEXT    NOT NULL,
    tradeable  INTEGER NOT NULL DEFAULT 1,
    ltp        REAL,
    volume     INTEGER
);
";

const DATE_FMT: &str = "%Y-%m-%d";

/// Single-connection SQLite store implementing every durable collaborator.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let store = Self::with_connection(conn)?;
        info!(path = %path.as_ref().display(), "sqlite store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace one reference-table row.
    pub fn insert_instrument(
        &self,
        token: &str,
        symbol: &str,
        exchange: &str,
        tradeable: bool,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO instruments (token, symbol, exchange, tradeable)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token) DO UPDATE SET
                symbol = excluded.symbol,
                exchange = excluded.exchange,
                tradeable = excluded.tradeable",
            params![token, symbol, exchange, tradeable],
        )?;
        Ok(())
    }
}

fn parse_date(raw: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FMT)
        .map_err(|e| StoreError::Backend(format!("bad stored date {raw:?}: {e}")))
}

fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedCandle> {
    let tf: String = row.get(2)?;
    let timeframe = tf.parse::<Timeframe>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(PersistedCandle {
        symbol: row.get(0)?,
        exchange: row.get(1)?,
        timeframe,
        bucket_start_ms: row.get(3)?,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// CandleStore
// ---------------------------------------------------------------------------

impl CandleStore for SqliteStore {
    fn upsert_candle(&self, c: &PersistedCandle) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO candles
                (symbol, exchange, timeframe, bucket_start_ms, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(symbol, timeframe, bucket_start_ms) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume",
            params![
                c.symbol,
                c.exchange,
                c.timeframe.as_str(),
                c.bucket_start_ms,
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume,
            ],
        )?;
        Ok(())
    }

    fn candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> StoreResult<Vec<PersistedCandle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, exchange, timeframe, bucket_start_ms, open, high, low, close, volume
             FROM candles
             WHERE symbol = ?1 AND timeframe = ?2
               AND bucket_start_ms >= ?3 AND bucket_start_ms < ?4
             ORDER BY bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(
                params![symbol, timeframe.as_str(), start_ms, end_ms],
                row_to_candle,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> StoreResult<Vec<PersistedCandle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, exchange, timeframe, bucket_start_ms, open, high, low, close, volume
             FROM candles
             WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY bucket_start_ms DESC
             LIMIT ?3",
        )?;
        let mut candles = stmt
            .query_map(
                params![symbol, timeframe.as_str(), limit as i64],
                row_to_candle,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        // Reverse to chronological order.
        candles.reverse();
        Ok(candles)
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

impl SnapshotStore for SqliteStore {
    fn upsert_snapshots(&self, rows: &[SnapshotRow]) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let now = crate::types::now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            // ISO dates compare correctly as text.
            let mut stmt = tx.prepare(
                "INSERT INTO market_snapshot
                    (symbol, exchange, latest_price, latest_ts_ms, latest_date,
                     prev_close, open, high, low, volume, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(symbol) DO UPDATE SET
                    prev_close = CASE
                        WHEN excluded.latest_date > market_snapshot.latest_date
                            THEN market_snapshot.latest_price
                        ELSE market_snapshot.prev_close
                    END,
                    prev_close_date = CASE
                        WHEN excluded.latest_date > market_snapshot.latest_date
                            THEN market_snapshot.latest_date
                        ELSE market_snapshot.prev_close_date
                    END,
                    exchange = excluded.exchange,
                    latest_price = excluded.latest_price,
                    latest_ts_ms = excluded.latest_ts_ms,
                    latest_date = excluded.latest_date,
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    volume = excluded.volume,
                    updated_at_ms = excluded.updated_at_ms",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.symbol,
                    r.exchange,
                    r.latest_price,
                    r.latest_ts_ms,
                    r.latest_date.format(DATE_FMT).to_string(),
                    r.prev_close,
                    r.open,
                    r.high,
                    r.low,
                    r.volume,
                    now,
                ])?;
            }

            // Reference-table quotes ride along in the same transaction but
            // never fail the snapshot.
            match tx.prepare(
                "UPDATE instruments SET ltp = ?1, volume = ?2
                 WHERE symbol = ?3 AND exchange = ?4",
            ) {
                Ok(mut quote) => {
                    let mut failed = 0usize;
                    for r in rows {
                        if let Err(e) =
                            quote.execute(params![r.latest_price, r.volume, r.symbol, r.exchange])
                        {
                            failed += 1;
                            if failed == 1 {
                                warn!(symbol = %r.symbol, error = %e, "instrument quote update failed");
                            }
                        }
                    }
                    if failed > 0 {
                        warn!(failed, total = rows.len(), "instrument quotes partially updated");
                    }
                }
                Err(e) => warn!(error = %e, "instrument quote update skipped"),
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn load_snapshots(&self) -> StoreResult<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, exchange, latest_price, latest_ts_ms, latest_date,
                    prev_close, open, high, low, volume
             FROM market_snapshot",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(
                |(symbol, exchange, latest_price, latest_ts_ms, date, prev_close, open, high, low, volume)| {
                    Ok(SnapshotRow {
                        symbol,
                        exchange,
                        latest_price,
                        latest_ts_ms,
                        latest_date: parse_date(&date)?,
                        prev_close,
                        open,
                        high,
                        low,
                        volume,
                    })
                },
            )
            .collect()
    }
}

// ---------------------------------------------------------------------------
// TokenMapSource
// ---------------------------------------------------------------------------

impl TokenMapSource for SqliteStore {
    fn load_token_entries(&self) -> StoreResult<Vec<(String, TokenMapEntry)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT token, symbol, exchange FROM instruments WHERE tradeable = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TokenMapEntry {
                        symbol: row.get(1)?,
                        exchange: row.get(2)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
