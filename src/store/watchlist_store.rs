// =============================================================================
// Watchlist store — curated symbol set
// =============================================================================

use sqlx::{Row, SqlitePool};

use crate::errors::EngineResult;
use crate::types::WatchlistEntry;

#[derive(Clone)]
pub struct WatchlistStore {
    pool: SqlitePool,
}

impl WatchlistStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a symbol or refresh its pricing fields, reactivating it if it
    /// had been evicted earlier.
    pub async fn upsert(
        &self,
        symbol: &str,
        price_drop: f64,
        current_price: f64,
        historical_price: f64,
        now_ms: i64,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO watchlist
                (symbol, price_drop, current_price, historical_price, is_active, added_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                price_drop       = excluded.price_drop,
                current_price    = excluded.current_price,
                historical_price = excluded.historical_price,
                is_active        = 1,
                updated_at       = excluded.updated_at
            "#,
        )
        .bind(symbol)
        .bind(price_drop)
        .bind(current_price)
        .bind(historical_price)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Evict a symbol. The row is kept (inactive) so its admission history
    /// survives re-qualification.
    pub async fn deactivate(&self, symbol: &str, now_ms: i64) -> EngineResult<()> {
        sqlx::query("UPDATE watchlist SET is_active = 0, updated_at = ? WHERE symbol = ?")
            .bind(now_ms)
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Symbols currently in scope for ingestion, alphabetical.
    pub async fn active_symbols(&self) -> EngineResult<Vec<String>> {
        let symbols = sqlx::query_scalar(
            "SELECT symbol FROM watchlist WHERE is_active = 1 ORDER BY symbol ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(symbols)
    }

    /// All rows, active first, strongest drop first within each group.
    pub async fn entries(&self) -> EngineResult<Vec<WatchlistEntry>> {
        let rows = sqlx::query(
            "SELECT symbol, price_drop, current_price, historical_price, is_active, added_at, updated_at \
             FROM watchlist ORDER BY is_active DESC, price_drop DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WatchlistEntry {
                symbol: row.get("symbol"),
                price_drop: row.get("price_drop"),
                current_price: row.get("current_price"),
                historical_price: row.get("historical_price"),
                is_active: row.get("is_active"),
                added_at: row.get("added_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}
