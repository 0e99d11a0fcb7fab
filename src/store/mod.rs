// =============================================================================
// Storage — SQLite pool and schema
// =============================================================================
//
// Three logical tables: one-minute bars keyed by (symbol, start_time), the
// curated watchlist keyed by symbol, and the alert archive. Writes are
// idempotent upserts; the source is authoritative per key, so last-write-wins
// is safe.
// =============================================================================

pub mod alert_store;
pub mod candle_store;
pub mod watchlist_store;

pub use alert_store::AlertStore;
pub use candle_store::{CandleStore, IntegrityReport};
pub use watchlist_store::WatchlistStore;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Shared database handle; cheap to clone.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self> {
        // Ensure the parent directory exists for file-backed databases.
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        info!(url = %db_url, "database connected");

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Single-connection in-memory database for tests (a pooled `:memory:`
    /// would give every connection its own empty database).
    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Create tables and indexes if absent.
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kline_data (
                symbol      TEXT    NOT NULL,
                start_time  INTEGER NOT NULL,
                end_time    INTEGER NOT NULL,
                open        REAL    NOT NULL,
                high        REAL    NOT NULL,
                low         REAL    NOT NULL,
                close       REAL    NOT NULL,
                volume      REAL    NOT NULL,
                is_closed   INTEGER NOT NULL DEFAULT 0,
                is_long     INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, start_time)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create kline_data table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kline_symbol_time ON kline_data (symbol, start_time);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kline_closed ON kline_data (is_closed);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kline_long ON kline_data (is_long);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol           TEXT    NOT NULL UNIQUE,
                price_drop       REAL    NOT NULL DEFAULT 0,
                current_price    REAL    NOT NULL DEFAULT 0,
                historical_price REAL    NOT NULL DEFAULT 0,
                is_active        INTEGER NOT NULL DEFAULT 1,
                added_at         INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create watchlist table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id                  TEXT PRIMARY KEY,
                symbol              TEXT    NOT NULL,
                alert_type          TEXT    NOT NULL,
                price               REAL    NOT NULL,
                volume_ratio        REAL,
                current_volume_usdt REAL,
                average_volume_usdt REAL,
                consecutive_count   INTEGER,
                alert_timestamp_ms  INTEGER NOT NULL,
                close_timestamp_ms  INTEGER,
                is_closed           INTEGER NOT NULL,
                is_true_signal      INTEGER,
                has_imbalance       INTEGER NOT NULL DEFAULT 0,
                imbalance_data      TEXT,
                candle_data         TEXT,
                order_book_snapshot TEXT,
                message             TEXT    NOT NULL,
                status              TEXT    NOT NULL DEFAULT 'active',
                created_at          INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create alerts table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alerts_symbol_time ON alerts (symbol, alert_timestamp_ms);",
        )
        .execute(&self.pool)
        .await?;

        info!("database schema initialised");
        Ok(())
    }
}
