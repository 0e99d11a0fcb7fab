// =============================================================================
// Candle store — one-minute bars keyed by (symbol, start_time)
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::EngineResult;
use crate::types::{Candle, VolumeType, MINUTE_MS};

/// Result of a window integrity check.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub existing: i64,
    pub expected: i64,
    pub missing: i64,
    pub pct: f64,
}

/// SQLite-backed store for one-minute bars. Upserts are idempotent; rows that
/// violate the price invariants are skipped on read and counted, never fatal.
#[derive(Clone)]
pub struct CandleStore {
    pool: SqlitePool,
    invalid_rows_skipped: Arc<AtomicU64>,
}

impl CandleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            invalid_rows_skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Rows dropped by reads because they violated an invariant.
    pub fn invalid_rows_skipped(&self) -> u64 {
        self.invalid_rows_skipped.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert or replace the bar at `(symbol, candle.start_ms)`. `is_long` is
    /// computed here so range queries can filter on it in SQL.
    pub async fn upsert(&self, symbol: &str, candle: &Candle) -> EngineResult<()> {
        candle.validate()?;

        sqlx::query(
            r#"
            INSERT INTO kline_data
                (symbol, start_time, end_time, open, high, low, close, volume, is_closed, is_long)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol, start_time) DO UPDATE SET
                end_time  = excluded.end_time,
                open      = excluded.open,
                high      = excluded.high,
                low       = excluded.low,
                close     = excluded.close,
                volume    = excluded.volume,
                is_closed = excluded.is_closed,
                is_long   = excluded.is_long
            "#,
        )
        .bind(symbol)
        .bind(candle.start_ms)
        .bind(candle.end_ms)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.is_closed)
        .bind(candle.is_long())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete every bar with `start_time < ms`.
    pub async fn delete_before(&self, symbol: &str, ms: i64) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM kline_data WHERE symbol = ? AND start_time < ?")
            .bind(symbol)
            .bind(ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every bar with `start_time >= ms`.
    pub async fn delete_from(&self, symbol: &str, ms: i64) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM kline_data WHERE symbol = ? AND start_time >= ?")
            .bind(symbol)
            .bind(ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Closed bars with `from_ms <= start_time < to_ms`, ascending.
    pub async fn closed_range(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> EngineResult<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT start_time, end_time, open, high, low, close, volume, is_closed
            FROM kline_data
            WHERE symbol = ? AND is_closed = 1 AND start_time >= ? AND start_time < ?
            ORDER BY start_time ASC
            "#,
        )
        .bind(symbol)
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.map_rows(symbol, rows))
    }

    /// The most recent `limit` closed bars, ascending.
    pub async fn recent_closed(&self, symbol: &str, limit: i64) -> EngineResult<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT start_time, end_time, open, high, low, close, volume, is_closed
            FROM kline_data
            WHERE symbol = ? AND is_closed = 1
            ORDER BY start_time DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut candles = self.map_rows(symbol, rows);
        candles.reverse();
        Ok(candles)
    }

    /// USDT volumes (`volume × close`) of closed bars in the baseline window
    /// `[now − offset − hours, now − offset)`, filtered by direction.
    pub async fn historical_baseline(
        &self,
        symbol: &str,
        hours: i64,
        offset_minutes: i64,
        volume_type: VolumeType,
        now_ms: i64,
    ) -> EngineResult<Vec<f64>> {
        let to_ms = now_ms - offset_minutes * MINUTE_MS;
        let from_ms = to_ms - hours * 3_600_000;

        let direction_filter = match volume_type {
            VolumeType::Long => " AND is_long = 1",
            VolumeType::Short => " AND is_long = 0",
            VolumeType::All => "",
        };
        let sql = format!(
            "SELECT volume, close FROM kline_data \
             WHERE symbol = ? AND is_closed = 1 AND start_time >= ? AND start_time < ?{direction_filter} \
             ORDER BY start_time ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(symbol)
            .bind(from_ms)
            .bind(to_ms)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let volume: f64 = row.get("volume");
                let close: f64 = row.get("close");
                volume * close
            })
            .collect())
    }

    /// Compare stored closed-bar count against the expected minute count for
    /// the half-open window `[from_ms, to_ms)`.
    pub async fn check_integrity(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> EngineResult<IntegrityReport> {
        let expected = ((to_ms - from_ms) / MINUTE_MS).max(1);

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kline_data \
             WHERE symbol = ? AND is_closed = 1 AND start_time >= ? AND start_time < ?",
        )
        .bind(symbol)
        .bind(from_ms)
        .bind(to_ms)
        .fetch_one(&self.pool)
        .await?;

        let missing = (expected - existing).max(0);
        Ok(IntegrityReport {
            existing,
            expected,
            missing,
            pct: existing as f64 / expected as f64 * 100.0,
        })
    }

    /// Minute starts missing from the half-open window, ascending.
    pub async fn missing_minutes(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> EngineResult<Vec<i64>> {
        let stored: Vec<i64> = sqlx::query_scalar(
            "SELECT start_time FROM kline_data \
             WHERE symbol = ? AND start_time >= ? AND start_time < ? ORDER BY start_time ASC",
        )
        .bind(symbol)
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;

        let mut iter = stored.into_iter().peekable();
        let mut missing = Vec::new();
        let mut minute = from_ms;
        while minute < to_ms {
            match iter.peek() {
                Some(&s) if s == minute => {
                    iter.next();
                }
                _ => missing.push(minute),
            }
            minute += MINUTE_MS;
        }
        Ok(missing)
    }

    /// `(min, max, count)` over closed bars, or `None` when empty.
    pub async fn time_range(&self, symbol: &str) -> EngineResult<Option<(i64, i64, i64)>> {
        let row = sqlx::query(
            "SELECT MIN(start_time) AS min_t, MAX(start_time) AS max_t, COUNT(*) AS cnt \
             FROM kline_data WHERE symbol = ? AND is_closed = 1",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("cnt");
        if count == 0 {
            return Ok(None);
        }
        Ok(Some((row.get("min_t"), row.get("max_t"), count)))
    }

    fn map_rows(&self, symbol: &str, rows: Vec<sqlx::sqlite::SqliteRow>) -> Vec<Candle> {
        rows.into_iter()
            .filter_map(|row| {
                let candle = Candle {
                    start_ms: row.get("start_time"),
                    end_ms: row.get("end_time"),
                    open: row.get("open"),
                    high: row.get("high"),
                    low: row.get("low"),
                    close: row.get("close"),
                    volume: row.get("volume"),
                    is_closed: row.get("is_closed"),
                };
                match candle.validate() {
                    Ok(()) => Some(candle),
                    Err(e) => {
                        self.invalid_rows_skipped.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %symbol, start_ms = candle.start_ms, error = %e,
                              "stored bar violates invariants, skipped");
                        None
                    }
                }
            })
            .collect()
    }
}

// =============================================================================
// Retention task
// =============================================================================

/// Periodically drop closed bars older than the effective retention window
/// for every active watchlist symbol. The effective window never undercuts
/// the analysis window, so retention and backfill cannot oscillate.
pub async fn run_retention(
    store: CandleStore,
    watchlist: super::WatchlistStore,
    config: Arc<crate::config::ConfigHandle>,
    time: Arc<crate::time_service::TimeService>,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(30 * 60));

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("retention job stopping");
                    return;
                }
            }
        }

        let cfg = config.current();
        let cutoff = time.now_ms() - cfg.effective_retention_ms();

        let symbols = match watchlist.active_symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "retention: watchlist unavailable, skipping pass");
                continue;
            }
        };

        let mut deleted_total = 0_u64;
        for symbol in &symbols {
            match store.delete_before(symbol, cutoff).await {
                Ok(n) => deleted_total += n,
                Err(e) => warn!(symbol = %symbol, error = %e, "retention delete failed"),
            }
        }
        debug!(
            symbols = symbols.len(),
            deleted = deleted_total,
            cutoff_ms = cutoff,
            "retention pass complete"
        );
    }
}
