// =============================================================================
// Alert store — persisted alert archive
// =============================================================================

use sqlx::{Row, SqlitePool};

use crate::alerts::{Alert, AlertKind};
use crate::errors::EngineResult;

#[derive(Clone)]
pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist an alert. Kind-specific fields land in their own columns;
    /// structural payloads are stored as JSON text.
    pub async fn save(&self, alert: &Alert) -> EngineResult<()> {
        let (volume_ratio, current_usdt, average_usdt) = match &alert.kind {
            AlertKind::PreliminaryVolumeSpike {
                volume_ratio,
                current_volume_usdt,
                average_volume_usdt,
            }
            | AlertKind::FinalVolumeSpike {
                volume_ratio,
                current_volume_usdt,
                average_volume_usdt,
                ..
            }
            | AlertKind::VolumeSpike {
                volume_ratio,
                current_volume_usdt,
                average_volume_usdt,
                ..
            } => (
                Some(*volume_ratio),
                Some(*current_volume_usdt),
                Some(*average_volume_usdt),
            ),
            AlertKind::Priority {
                volume_ratio,
                current_volume_usdt,
                average_volume_usdt,
                ..
            } => (*volume_ratio, *current_volume_usdt, *average_volume_usdt),
            AlertKind::ConsecutiveLong { .. } => (None, None, None),
        };

        let consecutive_count = match &alert.kind {
            AlertKind::ConsecutiveLong {
                consecutive_count, ..
            }
            | AlertKind::Priority {
                consecutive_count, ..
            } => Some(*consecutive_count as i64),
            _ => None,
        };

        let is_true_signal = match &alert.kind {
            AlertKind::FinalVolumeSpike { is_true_signal, .. }
            | AlertKind::VolumeSpike { is_true_signal, .. } => Some(*is_true_signal),
            _ => None,
        };

        let imbalance_json = match &alert.kind {
            AlertKind::VolumeSpike { imbalance, .. }
            | AlertKind::ConsecutiveLong { imbalance, .. }
            | AlertKind::Priority { imbalance, .. } => imbalance
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            _ => None,
        };

        let order_book_json = match &alert.kind {
            AlertKind::VolumeSpike {
                order_book_snapshot,
                ..
            } => order_book_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            _ => None,
        };

        let candle_json = alert
            .candle
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO alerts
                (id, symbol, alert_type, price,
                 volume_ratio, current_volume_usdt, average_volume_usdt, consecutive_count,
                 alert_timestamp_ms, close_timestamp_ms, is_closed, is_true_signal,
                 has_imbalance, imbalance_data, candle_data, order_book_snapshot,
                 message, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(&alert.symbol)
        .bind(alert.kind.type_name())
        .bind(alert.price)
        .bind(volume_ratio)
        .bind(current_usdt)
        .bind(average_usdt)
        .bind(consecutive_count)
        .bind(alert.ts_ms)
        .bind(alert.close_ts_ms)
        .bind(alert.is_closed)
        .bind(is_true_signal)
        .bind(alert.kind.has_imbalance())
        .bind(imbalance_json)
        .bind(candle_json)
        .bind(order_book_json)
        .bind(&alert.message)
        .bind(alert.ts_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent alerts as JSON objects for the API, newest first.
    pub async fn recent(&self, limit: i64) -> EngineResult<Vec<serde_json::Value>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, alert_type, price,
                   volume_ratio, current_volume_usdt, average_volume_usdt, consecutive_count,
                   alert_timestamp_ms, close_timestamp_ms, is_closed, is_true_signal,
                   has_imbalance, imbalance_data, candle_data, order_book_snapshot,
                   message, status
            FROM alerts
            ORDER BY alert_timestamp_ms DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut obj = serde_json::json!({
                "id": row.get::<String, _>("id"),
                "symbol": row.get::<String, _>("symbol"),
                "alert_type": row.get::<String, _>("alert_type"),
                "price": row.get::<f64, _>("price"),
                "timestamp": row.get::<i64, _>("alert_timestamp_ms"),
                "is_closed": row.get::<bool, _>("is_closed"),
                "has_imbalance": row.get::<bool, _>("has_imbalance"),
                "message": row.get::<String, _>("message"),
                "status": row.get::<String, _>("status"),
            });
            let map = obj.as_object_mut().expect("literal object");

            macro_rules! opt_field {
                ($key:literal, $ty:ty, $col:literal) => {
                    if let Some(v) = row.get::<Option<$ty>, _>($col) {
                        map.insert($key.into(), serde_json::json!(v));
                    }
                };
            }
            opt_field!("volume_ratio", f64, "volume_ratio");
            opt_field!("current_volume_usdt", f64, "current_volume_usdt");
            opt_field!("average_volume_usdt", f64, "average_volume_usdt");
            opt_field!("consecutive_count", i64, "consecutive_count");
            opt_field!("close_timestamp", i64, "close_timestamp_ms");
            opt_field!("is_true_signal", bool, "is_true_signal");

            for (key, col) in [
                ("imbalance", "imbalance_data"),
                ("candle_data", "candle_data"),
                ("order_book_snapshot", "order_book_snapshot"),
            ] {
                if let Some(text) = row.get::<Option<String>, _>(col) {
                    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
                        map.insert(key.into(), v);
                    }
                }
            }

            out.push(obj);
        }
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::CandleSnapshot;
    use crate::imbalance::{Direction, Imbalance, ImbalanceKind};
    use crate::store::Database;

    async fn store() -> AlertStore {
        let db = Database::connect_in_memory().await.unwrap();
        AlertStore::new(db.pool)
    }

    fn spike(ts_ms: i64, with_imbalance: bool) -> Alert {
        let imbalance = with_imbalance.then(|| Imbalance {
            kind: ImbalanceKind::FairValueGap,
            direction: Direction::Bullish,
            strength: 1.8,
            top: 108.0,
            bottom: 106.0,
            ts_ms,
        });
        Alert::new(
            "BTCUSDT",
            110.0,
            ts_ms,
            Some(ts_ms),
            true,
            "Volume exceeded 2.64x (true signal)",
            Some(CandleSnapshot {
                open: 100.0,
                high: 111.0,
                low: 99.0,
                close: 110.0,
                volume: 12.0,
            }),
            AlertKind::VolumeSpike {
                volume_ratio: 2.64,
                current_volume_usdt: 1320.0,
                average_volume_usdt: 500.0,
                is_true_signal: true,
                has_imbalance: with_imbalance,
                imbalance,
                order_book_snapshot: None,
            },
        )
    }

    #[tokio::test]
    async fn save_and_read_back_volume_spike() {
        let store = store().await;
        store.save(&spike(1_700_000_100_000, true)).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        let a = &recent[0];
        assert_eq!(a["alert_type"], "volume_spike");
        assert_eq!(a["symbol"], "BTCUSDT");
        assert_eq!(a["volume_ratio"], 2.64);
        assert_eq!(a["is_true_signal"], true);
        assert_eq!(a["has_imbalance"], true);
        assert_eq!(a["imbalance"]["type"], "fair_value_gap");
        assert_eq!(a["candle_data"]["close"], 110.0);
        assert!(a.get("order_book_snapshot").is_none());
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let store = store().await;
        for i in 0..5 {
            store
                .save(&spike(1_700_000_000_000 + i * 60_000, false))
                .await
                .unwrap();
        }
        let recent = store.recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0]["timestamp"], 1_700_000_240_000_i64);
        assert_eq!(recent[2]["timestamp"], 1_700_000_120_000_i64);
    }

    #[tokio::test]
    async fn consecutive_alert_has_no_volume_columns() {
        let store = store().await;
        let alert = Alert::new(
            "ETHUSDT",
            2000.0,
            1_700_000_000_000,
            Some(1_700_000_000_000),
            true,
            "5 consecutive closed long candles",
            None,
            AlertKind::ConsecutiveLong {
                consecutive_count: 5,
                has_imbalance: false,
                imbalance: None,
            },
        );
        store.save(&alert).await.unwrap();

        let recent = store.recent(1).await.unwrap();
        let a = &recent[0];
        assert_eq!(a["alert_type"], "consecutive_long");
        assert_eq!(a["consecutive_count"], 5);
        assert!(a.get("volume_ratio").is_none());
        assert!(a.get("is_true_signal").is_none());
    }
}
