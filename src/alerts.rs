// =============================================================================
// Alert types — tagged union with kind-specific payloads
// =============================================================================
//
// The wire format keeps the flat JSON shape clients already consume: common
// fields at the top level and an `alert_type` discriminator, with the
// kind-specific payload flattened alongside.
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::imbalance::Imbalance;
use crate::types::{Candle, OrderBookSnapshot};

// =============================================================================
// Candle snapshot carried inside alerts
// =============================================================================

/// Compact OHLCV snapshot embedded in an alert's JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for CandleSnapshot {
    fn from(c: &Candle) -> Self {
        Self {
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

// =============================================================================
// Alert
// =============================================================================

/// Kind-specific payload. Serialized with an `alert_type` tag so the overall
/// alert keeps the flat shape of the persisted/broadcast format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert_type", rename_all = "snake_case")]
pub enum AlertKind {
    /// First threshold crossing seen on a still-open candle.
    PreliminaryVolumeSpike {
        volume_ratio: f64,
        current_volume_usdt: f64,
        average_volume_usdt: f64,
    },
    /// Resolution of a preliminary signal when its minute closes.
    FinalVolumeSpike {
        volume_ratio: f64,
        current_volume_usdt: f64,
        average_volume_usdt: f64,
        is_true_signal: bool,
        preliminary_ts_ms: i64,
    },
    /// Authoritative spike confirmed on a closed long candle.
    VolumeSpike {
        volume_ratio: f64,
        current_volume_usdt: f64,
        average_volume_usdt: f64,
        is_true_signal: bool,
        has_imbalance: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        imbalance: Option<Imbalance>,
        #[serde(skip_serializing_if = "Option::is_none")]
        order_book_snapshot: Option<OrderBookSnapshot>,
    },
    ConsecutiveLong {
        consecutive_count: u32,
        has_imbalance: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        imbalance: Option<Imbalance>,
    },
    /// A consecutive run composed with a concurrent-or-recent volume spike.
    Priority {
        consecutive_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume_ratio: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_volume_usdt: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        average_volume_usdt: Option<f64>,
        has_imbalance: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        imbalance: Option<Imbalance>,
    },
}

impl AlertKind {
    /// Stable string used in the persisted `alert_type` column and for
    /// notification routing.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PreliminaryVolumeSpike { .. } => "preliminary_volume_spike",
            Self::FinalVolumeSpike { .. } => "final_volume_spike",
            Self::VolumeSpike { .. } => "volume_spike",
            Self::ConsecutiveLong { .. } => "consecutive_long",
            Self::Priority { .. } => "priority",
        }
    }

    pub fn has_imbalance(&self) -> bool {
        match self {
            Self::VolumeSpike { has_imbalance, .. }
            | Self::ConsecutiveLong { has_imbalance, .. }
            | Self::Priority { has_imbalance, .. } => *has_imbalance,
            _ => false,
        }
    }
}

/// A fully formed alert ready for persistence, broadcast, and notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub symbol: String,
    pub price: f64,
    /// Engine UTC time at emission, milliseconds.
    #[serde(rename = "timestamp")]
    pub ts_ms: i64,
    /// Set for alerts resolved on a closed candle.
    #[serde(rename = "close_timestamp", skip_serializing_if = "Option::is_none")]
    pub close_ts_ms: Option<i64>,
    pub is_closed: bool,
    pub message: String,
    #[serde(rename = "candle_data", skip_serializing_if = "Option::is_none")]
    pub candle: Option<CandleSnapshot>,
    #[serde(flatten)]
    pub kind: AlertKind,
}

impl Alert {
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        ts_ms: i64,
        close_ts_ms: Option<i64>,
        is_closed: bool,
        message: impl Into<String>,
        candle: Option<CandleSnapshot>,
        kind: AlertKind,
    ) -> Self {
        debug_assert!(ts_ms > 0);
        debug_assert!(close_ts_ms.is_none_or(|c| c >= ts_ms));
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            price,
            ts_ms,
            close_ts_ms,
            is_closed,
            message: message.into(),
            candle,
            kind,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spike() -> Alert {
        Alert::new(
            "BTCUSDT",
            110.0,
            1_700_000_100_000,
            Some(1_700_000_100_000),
            true,
            "Volume exceeded 2.64x (true signal)",
            None,
            AlertKind::VolumeSpike {
                volume_ratio: 2.64,
                current_volume_usdt: 1320.0,
                average_volume_usdt: 500.0,
                is_true_signal: true,
                has_imbalance: false,
                imbalance: None,
                order_book_snapshot: None,
            },
        )
    }

    #[test]
    fn wire_format_is_flat_and_tagged() {
        let alert = sample_spike();
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["alert_type"], "volume_spike");
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["timestamp"], 1_700_000_100_000_i64);
        assert_eq!(json["volume_ratio"], 2.64);
        assert_eq!(json["is_true_signal"], true);
        // absent optionals are omitted, not null
        assert!(json.get("imbalance").is_none());
        assert!(json.get("order_book_snapshot").is_none());
    }

    #[test]
    fn roundtrip_preserves_kind() {
        let alert = Alert::new(
            "ETHUSDT",
            2000.0,
            1_700_000_000_001,
            Some(1_700_000_060_000),
            true,
            "priority",
            None,
            AlertKind::Priority {
                consecutive_count: 5,
                volume_ratio: Some(2.64),
                current_volume_usdt: Some(1320.0),
                average_volume_usdt: Some(500.0),
                has_imbalance: true,
                imbalance: None,
            },
        );
        let json = serde_json::to_string(&alert).unwrap();
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(back, alert);
        assert_eq!(back.kind.type_name(), "priority");
        assert!(back.kind.has_imbalance());
    }

    #[test]
    fn type_names_are_stable() {
        let prelim = AlertKind::PreliminaryVolumeSpike {
            volume_ratio: 2.0,
            current_volume_usdt: 1.0,
            average_volume_usdt: 1.0,
        };
        assert_eq!(prelim.type_name(), "preliminary_volume_spike");
        let cons = AlertKind::ConsecutiveLong {
            consecutive_count: 5,
            has_imbalance: false,
            imbalance: None,
        };
        assert_eq!(cons.type_name(), "consecutive_long");
        assert!(!cons.has_imbalance());
    }
}
