// =============================================================================
// Shared types used across the scanning engine
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Milliseconds in one minute bar.
pub const MINUTE_MS: i64 = 60_000;

/// Truncate a millisecond timestamp down to its minute boundary.
pub fn align_down_to_minute(ms: i64) -> i64 {
    ms - ms.rem_euclid(MINUTE_MS)
}

/// A single one-minute OHLCV bar from the venue's kline stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_ms: i64,
    pub end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// A candle is long when it closed (or is currently trading) above its
    /// open.
    pub fn is_long(&self) -> bool {
        self.close > self.open
    }

    /// Quote-denominated volume of the bar (`volume × close`).
    pub fn volume_usdt(&self) -> f64 {
        self.volume * self.close
    }

    /// Check the structural invariants of a bar: price ordering, non-negative
    /// volume, sane timestamps, minute alignment for closed bars.
    pub fn validate(&self) -> EngineResult<()> {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if !(self.low <= body_low && body_high <= self.high) {
            return Err(EngineError::InvariantViolated(format!(
                "price ordering broken: o={} h={} l={} c={}",
                self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < 0.0 {
            return Err(EngineError::InvariantViolated(format!(
                "negative volume {}",
                self.volume
            )));
        }
        if self.start_ms <= 0 || self.start_ms >= self.end_ms {
            return Err(EngineError::InvariantViolated(format!(
                "bad timestamps: start={} end={}",
                self.start_ms, self.end_ms
            )));
        }
        if self.is_closed && self.start_ms % MINUTE_MS != 0 {
            return Err(EngineError::InvariantViolated(format!(
                "closed bar not minute-aligned: start={}",
                self.start_ms
            )));
        }
        Ok(())
    }
}

/// A normalized candle tick emitted by the feed client.
#[derive(Debug, Clone)]
pub struct CandleEvent {
    pub symbol: String,
    pub candle: Candle,
    pub is_closed: bool,
}

/// Which closed candles contribute to the volume baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Long,
    Short,
    All,
}

impl Default for VolumeType {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for VolumeType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "all" => Ok(Self::All),
            _ => Err(()),
        }
    }
}

/// Top-of-book snapshot attached to alerts when enabled. Levels are
/// `[price, qty]` pairs, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub ts_ms: i64,
}

/// One row of the dynamically curated watchlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub price_drop: f64,
    pub current_price: f64,
    pub historical_price: f64,
    pub is_active: bool,
    pub added_at: i64,
    pub updated_at: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            start_ms: 1_700_000_040_000,
            end_ms: 1_700_000_100_000,
            open,
            high,
            low,
            close,
            volume: 10.0,
            is_closed: true,
        }
    }

    #[test]
    fn minute_alignment() {
        assert_eq!(align_down_to_minute(1_700_000_059_999), 1_700_000_040_000);
        assert_eq!(align_down_to_minute(1_700_000_040_000), 1_700_000_040_000);
        assert_eq!(align_down_to_minute(59_999), 0);
    }

    #[test]
    fn long_and_usdt_volume() {
        let c = bar(100.0, 111.0, 99.0, 110.0);
        assert!(c.is_long());
        assert!((c.volume_usdt() - 1100.0).abs() < 1e-9);

        let c = bar(100.0, 101.0, 98.0, 99.0);
        assert!(!c.is_long());
    }

    #[test]
    fn validate_accepts_well_formed_bar() {
        assert!(bar(100.0, 110.0, 95.0, 105.0).validate().is_ok());
    }

    #[test]
    fn validate_rejects_broken_price_ordering() {
        // high below the candle body
        let c = bar(100.0, 99.0, 95.0, 105.0);
        assert!(matches!(
            c.validate(),
            Err(crate::errors::EngineError::InvariantViolated(_))
        ));
    }

    #[test]
    fn validate_rejects_negative_volume() {
        let mut c = bar(100.0, 110.0, 95.0, 105.0);
        c.volume = -1.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_unaligned_closed_bar() {
        let mut c = bar(100.0, 110.0, 95.0, 105.0);
        c.start_ms += 37;
        c.end_ms += 37;
        assert!(c.validate().is_err());
    }

    #[test]
    fn volume_type_parsing() {
        use std::str::FromStr;
        assert_eq!(VolumeType::from_str("LONG"), Ok(VolumeType::Long));
        assert_eq!(VolumeType::from_str("short"), Ok(VolumeType::Short));
        assert_eq!(VolumeType::from_str("all"), Ok(VolumeType::All));
        assert!(VolumeType::from_str("sideways").is_err());
    }
}
