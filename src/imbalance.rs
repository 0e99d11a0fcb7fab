// =============================================================================
// Imbalance analyzer — Fair Value Gap / Order Block / Breaker Block
// =============================================================================
//
// Stateless Smart-Money structure detection over an ascending window of
// closed candles. Each pattern has a minimum window; `analyze_all` evaluates
// FVG, then Order Block, then Breaker Block and returns the first match whose
// strength clears `min_strength`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::Candle;

/// Minimum relative move (percent) that qualifies an order-block impulse.
const ORDER_BLOCK_MIN_MOVE_PCT: f64 = 2.0;
/// Minimum breach (percent) past the range extreme for a breaker block.
const BREAKER_MIN_BREACH_PCT: f64 = 1.0;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceKind {
    FairValueGap,
    OrderBlock,
    BreakerBlock,
}

impl std::fmt::Display for ImbalanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FairValueGap => write!(f, "fair_value_gap"),
            Self::OrderBlock => write!(f, "order_block"),
            Self::BreakerBlock => write!(f, "breaker_block"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}

/// A detected structural imbalance. Invariant: `top > bottom`, `strength > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Imbalance {
    #[serde(rename = "type")]
    pub kind: ImbalanceKind,
    pub direction: Direction,
    /// Pattern-specific magnitude, in percent of the reference side.
    pub strength: f64,
    pub top: f64,
    pub bottom: f64,
    pub ts_ms: i64,
}

// =============================================================================
// Analyzer
// =============================================================================

/// Stateless analyzer; thresholds come from the config snapshot per call.
pub struct ImbalanceAnalyzer;

impl ImbalanceAnalyzer {
    /// Fair Value Gap over the last three candles: the wicks of the outer
    /// candles leave a void and the middle candle commits to the direction.
    pub fn fair_value_gap(window: &[Candle], cfg: &Config) -> Option<Imbalance> {
        if !cfg.fair_value_gap_enabled || window.len() < 3 {
            return None;
        }
        let prev = &window[window.len() - 3];
        let middle = &window[window.len() - 2];
        let last = &window[window.len() - 1];

        // Bullish gap: prior low sits above the latest high.
        if prev.low > last.high && middle.is_long() {
            let strength = (prev.low - last.high) / last.high * 100.0;
            if strength >= cfg.min_gap_percentage {
                return Some(Imbalance {
                    kind: ImbalanceKind::FairValueGap,
                    direction: Direction::Bullish,
                    strength,
                    top: prev.low,
                    bottom: last.high,
                    ts_ms: middle.start_ms,
                });
            }
        }

        // Bearish gap: prior high sits below the latest low.
        if prev.high < last.low && !middle.is_long() {
            let strength = (last.low - prev.high) / prev.high * 100.0;
            if strength >= cfg.min_gap_percentage {
                return Some(Imbalance {
                    kind: ImbalanceKind::FairValueGap,
                    direction: Direction::Bearish,
                    strength,
                    top: last.low,
                    bottom: prev.high,
                    ts_ms: middle.start_ms,
                });
            }
        }

        None
    }

    /// Order Block: the most recent opposite-direction candle before an
    /// impulse move of at least 2 % in the direction of the last candle.
    pub fn order_block(window: &[Candle], cfg: &Config) -> Option<Imbalance> {
        if !cfg.order_block_enabled || window.len() < 10 {
            return None;
        }
        let last = &window[window.len() - 1];
        let lookback = &window[window.len() - 10..window.len() - 1];

        if last.is_long() {
            let block = lookback.iter().rev().find(|c| !c.is_long())?;
            let move_pct = (last.close - block.high) / block.high * 100.0;
            if move_pct >= ORDER_BLOCK_MIN_MOVE_PCT {
                return Some(Imbalance {
                    kind: ImbalanceKind::OrderBlock,
                    direction: Direction::Bullish,
                    strength: move_pct,
                    top: block.high,
                    bottom: block.low,
                    ts_ms: block.start_ms,
                });
            }
        } else {
            let block = lookback.iter().rev().find(|c| c.is_long())?;
            let move_pct = (block.low - last.close) / block.low * 100.0;
            if move_pct >= ORDER_BLOCK_MIN_MOVE_PCT {
                return Some(Imbalance {
                    kind: ImbalanceKind::OrderBlock,
                    direction: Direction::Bearish,
                    strength: move_pct,
                    top: block.high,
                    bottom: block.low,
                    ts_ms: block.start_ms,
                });
            }
        }

        None
    }

    /// Breaker Block: the last candle closes beyond the 14-candle range
    /// extreme by at least 1 %.
    pub fn breaker_block(window: &[Candle], cfg: &Config) -> Option<Imbalance> {
        if !cfg.breaker_block_enabled || window.len() < 15 {
            return None;
        }
        let last = &window[window.len() - 1];
        let range = &window[window.len() - 15..window.len() - 1];

        let max_high = range.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let min_low = range.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        if last.close > max_high && last.is_long() {
            let strength = (last.close - max_high) / max_high * 100.0;
            if strength >= BREAKER_MIN_BREACH_PCT {
                return Some(Imbalance {
                    kind: ImbalanceKind::BreakerBlock,
                    direction: Direction::Bullish,
                    strength,
                    top: max_high,
                    bottom: min_low,
                    ts_ms: last.start_ms,
                });
            }
        }

        if last.close < min_low && !last.is_long() {
            let strength = (min_low - last.close) / min_low * 100.0;
            if strength >= BREAKER_MIN_BREACH_PCT {
                return Some(Imbalance {
                    kind: ImbalanceKind::BreakerBlock,
                    direction: Direction::Bearish,
                    strength,
                    top: max_high,
                    bottom: min_low,
                    ts_ms: last.start_ms,
                });
            }
        }

        None
    }

    /// Evaluate all three patterns in priority order and return the first
    /// whose strength clears `min_strength`.
    pub fn analyze_all(window: &[Candle], cfg: &Config) -> Option<Imbalance> {
        if !cfg.imbalance_enabled {
            return None;
        }
        for detect in [
            Self::fair_value_gap as fn(&[Candle], &Config) -> Option<Imbalance>,
            Self::order_block,
            Self::breaker_block,
        ] {
            if let Some(imb) = detect(window, cfg) {
                if imb.strength >= cfg.min_strength {
                    return Some(imb);
                }
            }
        }
        None
    }
}
