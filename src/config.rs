// =============================================================================
// Engine configuration — key=value file with hot reload
// =============================================================================
//
// The config source is an operator-edited `KEY=VALUE` file (`#` starts a
// comment). Every recognised key has a default; a value that fails to parse
// keeps the last-known-good value and is reported as a field-level error
// instead of aborting the reload.
//
// Consumers never hold a mutable reference: the current config is published
// as an immutable `Arc<Config>` snapshot through a `tokio::sync::watch`
// channel. Each loop iteration reads the snapshot it started with; a reload
// becomes visible on the next iteration.
// =============================================================================

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::types::VolumeType;

// =============================================================================
// Config
// =============================================================================

/// Immutable snapshot of every tunable engine setting.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // --- Volume baseline window ---------------------------------------------
    /// Hours of history used for the volume baseline.
    pub analysis_hours: i64,
    /// Trailing offset (minutes) of the baseline window.
    pub offset_minutes: i64,

    // --- Detector thresholds ------------------------------------------------
    /// Spike threshold: current USDT volume must exceed baseline × this.
    pub volume_multiplier: f64,
    /// Absolute USDT volume floor below which no spike is considered.
    pub min_volume_usdt: f64,
    /// Run length that triggers a consecutive-long alert.
    pub consecutive_long_count: u32,
    /// Cooldown between two alerts of the same class for one symbol.
    pub alert_grouping_minutes: i64,
    /// Which closed candles contribute to the baseline.
    pub volume_type: VolumeType,

    // --- Storage ------------------------------------------------------------
    /// Closed candles older than this are dropped by the retention job.
    pub data_retention_hours: i64,

    // --- Watchlist curation -------------------------------------------------
    pub pairs_check_interval_minutes: i64,
    pub price_history_days: i64,
    pub price_drop_percentage: f64,
    pub watchlist_auto_update: bool,

    // --- Imbalance gating ---------------------------------------------------
    pub min_gap_percentage: f64,
    pub min_strength: f64,

    // --- Feature flags ------------------------------------------------------
    pub volume_alerts_enabled: bool,
    pub consecutive_alerts_enabled: bool,
    pub priority_alerts_enabled: bool,
    pub imbalance_enabled: bool,
    pub orderbook_enabled: bool,
    pub orderbook_snapshot_on_alert: bool,
    pub fair_value_gap_enabled: bool,
    pub order_block_enabled: bool,
    pub breaker_block_enabled: bool,
    pub notification_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            analysis_hours: 1,
            offset_minutes: 0,
            volume_multiplier: 2.0,
            min_volume_usdt: 1000.0,
            consecutive_long_count: 5,
            alert_grouping_minutes: 5,
            volume_type: VolumeType::Long,
            data_retention_hours: 2,
            pairs_check_interval_minutes: 30,
            price_history_days: 30,
            price_drop_percentage: 10.0,
            watchlist_auto_update: true,
            min_gap_percentage: 0.1,
            min_strength: 0.5,
            volume_alerts_enabled: true,
            consecutive_alerts_enabled: true,
            priority_alerts_enabled: true,
            imbalance_enabled: true,
            orderbook_enabled: false,
            orderbook_snapshot_on_alert: false,
            fair_value_gap_enabled: true,
            order_block_enabled: true,
            breaker_block_enabled: true,
            notification_enabled: true,
        }
    }
}

impl Config {
    /// Cooldown between same-class alerts, in milliseconds.
    pub fn cooldown_ms(&self) -> i64 {
        self.alert_grouping_minutes * 60_000
    }

    /// Retention must never undercut the analysis window plus its offset,
    /// otherwise retention and backfill oscillate (delete, refill, delete).
    pub fn effective_retention_ms(&self) -> i64 {
        let retention = self.data_retention_hours * 3_600_000;
        let window = self.analysis_hours * 3_600_000 + self.offset_minutes * 60_000;
        retention.max(window)
    }

    /// Parse `KEY=VALUE` text on top of `base`. Unparseable values keep the
    /// base value and are reported; unknown keys are warned and ignored.
    pub fn parse(text: &str, base: &Config) -> (Config, Vec<EngineError>) {
        let mut cfg = base.clone();
        let mut errors = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = %line, "config line without '=' ignored");
                continue;
            };
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            if let Err(e) = cfg.apply(&key, value) {
                errors.push(e);
            }
        }

        (cfg, errors)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        fn num<T: FromStr>(key: &str, value: &str) -> Result<T, EngineError> {
            value.parse::<T>().map_err(|_| EngineError::ConfigInvalid {
                field: key.to_string(),
                reason: format!("cannot parse {value:?}"),
            })
        }

        fn flag(key: &str, value: &str) -> Result<bool, EngineError> {
            match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(EngineError::ConfigInvalid {
                    field: key.to_string(),
                    reason: format!("cannot parse {value:?} as bool"),
                }),
            }
        }

        match key {
            "ANALYSIS_HOURS" => {
                // Fractional hours are accepted from the file but rounded to
                // whole hours, floored at one.
                let v: f64 = num(key, value)?;
                self.analysis_hours = (v.round() as i64).max(1);
            }
            "OFFSET_MINUTES" => {
                let v: f64 = num(key, value)?;
                self.offset_minutes = (v.round() as i64).max(0);
            }
            "VOLUME_MULTIPLIER" => self.volume_multiplier = num(key, value)?,
            "MIN_VOLUME_USDT" => self.min_volume_usdt = num(key, value)?,
            "CONSECUTIVE_LONG_COUNT" => self.consecutive_long_count = num(key, value)?,
            "ALERT_GROUPING_MINUTES" => self.alert_grouping_minutes = num(key, value)?,
            "VOLUME_TYPE" => {
                self.volume_type =
                    VolumeType::from_str(value).map_err(|_| EngineError::ConfigInvalid {
                        field: key.to_string(),
                        reason: format!("expected long|short|all, got {value:?}"),
                    })?;
            }
            "DATA_RETENTION_HOURS" => self.data_retention_hours = num(key, value)?,
            "PAIRS_CHECK_INTERVAL_MINUTES" => {
                self.pairs_check_interval_minutes = num(key, value)?;
            }
            "PRICE_HISTORY_DAYS" => self.price_history_days = num(key, value)?,
            "PRICE_DROP_PERCENTAGE" => self.price_drop_percentage = num(key, value)?,
            "WATCHLIST_AUTO_UPDATE" => self.watchlist_auto_update = flag(key, value)?,
            "MIN_GAP_PERCENTAGE" => self.min_gap_percentage = num(key, value)?,
            "MIN_STRENGTH" => self.min_strength = num(key, value)?,
            "VOLUME_ALERTS_ENABLED" => self.volume_alerts_enabled = flag(key, value)?,
            "CONSECUTIVE_ALERTS_ENABLED" => {
                self.consecutive_alerts_enabled = flag(key, value)?;
            }
            "PRIORITY_ALERTS_ENABLED" => self.priority_alerts_enabled = flag(key, value)?,
            "IMBALANCE_ENABLED" => self.imbalance_enabled = flag(key, value)?,
            "ORDERBOOK_ENABLED" => self.orderbook_enabled = flag(key, value)?,
            "ORDERBOOK_SNAPSHOT_ON_ALERT" => {
                self.orderbook_snapshot_on_alert = flag(key, value)?;
            }
            "FAIR_VALUE_GAP_ENABLED" => self.fair_value_gap_enabled = flag(key, value)?,
            "ORDER_BLOCK_ENABLED" => self.order_block_enabled = flag(key, value)?,
            "BREAKER_BLOCK_ENABLED" => self.breaker_block_enabled = flag(key, value)?,
            "NOTIFICATION_ENABLED" => self.notification_enabled = flag(key, value)?,
            other => {
                warn!(key = %other, "unrecognised config key ignored");
            }
        }
        Ok(())
    }
}

// =============================================================================
// ConfigHandle — snapshot publication
// =============================================================================

/// Shared handle through which every component reads the current config and
/// through which reloads are published.
pub struct ConfigHandle {
    tx: watch::Sender<Arc<Config>>,
}

impl ConfigHandle {
    pub fn new(initial: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Current snapshot. Cheap; callers keep the Arc for one logical step.
    pub fn current(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Subscribe to reload notifications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Publish a new snapshot.
    pub fn install(&self, cfg: Config) {
        self.tx.send_replace(Arc::new(cfg));
    }
}

// =============================================================================
// File loading & watcher task
// =============================================================================

/// Load the config file on top of the built-in defaults. A missing file is
/// not an error; the defaults apply.
pub fn load_config(path: &Path) -> Result<(Config, Vec<EngineError>)> {
    let defaults = Config::default();
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let (cfg, errors) = Config::parse(&text, &defaults);
            for e in &errors {
                warn!(error = %e, "config field rejected, default kept");
            }
            info!(path = %path.display(), "config loaded");
            Ok((cfg, errors))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file, using defaults");
            Ok((defaults, Vec::new()))
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to read config from {}", path.display()))
        }
    }
}

/// Poll the config file's mtime and republish the snapshot when it changes.
///
/// Runs until `stop` flips to true. Parse failures on individual fields keep
/// the previous value (reported via warn); an unreadable file keeps the whole
/// previous snapshot.
pub async fn run_config_watcher(
    path: PathBuf,
    handle: Arc<ConfigHandle>,
    mut stop: watch::Receiver<bool>,
) {
    let mut last_mtime: Option<SystemTime> = std::fs::metadata(&path)
        .and_then(|m| m.modified())
        .ok();
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("config watcher stopping");
                    return;
                }
            }
        }

        let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            // File may be mid-rename or deleted; keep the current snapshot.
            Err(_) => continue,
        };
        if last_mtime == Some(mtime) {
            continue;
        }
        last_mtime = Some(mtime);

        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "config changed but unreadable, keeping previous snapshot");
                continue;
            }
        };

        let previous = handle.current();
        let (next, errors) = Config::parse(&text, &previous);
        for e in &errors {
            warn!(error = %e, "config field rejected, previous value kept");
        }
        if next != *previous {
            info!(path = %path.display(), "config reloaded");
            handle.install(next);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.analysis_hours, 1);
        assert_eq!(cfg.offset_minutes, 0);
        assert!((cfg.volume_multiplier - 2.0).abs() < f64::EPSILON);
        assert!((cfg.min_volume_usdt - 1000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.consecutive_long_count, 5);
        assert_eq!(cfg.alert_grouping_minutes, 5);
        assert_eq!(cfg.data_retention_hours, 2);
        assert_eq!(cfg.pairs_check_interval_minutes, 30);
        assert_eq!(cfg.price_history_days, 30);
        assert!((cfg.price_drop_percentage - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.volume_type, VolumeType::Long);
        assert!(cfg.volume_alerts_enabled);
        assert!(!cfg.orderbook_enabled);
    }

    #[test]
    fn parse_overrides_and_comments() {
        let text = "\
# thresholds
VOLUME_MULTIPLIER = 3.5
CONSECUTIVE_LONG_COUNT=7
volume_type=all

VOLUME_ALERTS_ENABLED=off
";
        let (cfg, errors) = Config::parse(text, &Config::default());
        assert!(errors.is_empty());
        assert!((cfg.volume_multiplier - 3.5).abs() < f64::EPSILON);
        assert_eq!(cfg.consecutive_long_count, 7);
        assert_eq!(cfg.volume_type, VolumeType::All);
        assert!(!cfg.volume_alerts_enabled);
    }

    #[test]
    fn invalid_value_keeps_last_known_good() {
        let mut base = Config::default();
        base.volume_multiplier = 4.0;
        let (cfg, errors) = Config::parse("VOLUME_MULTIPLIER=banana\nMIN_STRENGTH=0.9", &base);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            EngineError::ConfigInvalid { ref field, .. } if field == "VOLUME_MULTIPLIER"
        ));
        // rejected field keeps the base value, the valid one applies
        assert!((cfg.volume_multiplier - 4.0).abs() < f64::EPSILON);
        assert!((cfg.min_strength - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn analysis_window_clamps() {
        let (cfg, errors) = Config::parse("ANALYSIS_HOURS=0.4\nOFFSET_MINUTES=-3", &Config::default());
        assert!(errors.is_empty());
        assert_eq!(cfg.analysis_hours, 1);
        assert_eq!(cfg.offset_minutes, 0);

        let (cfg, _) = Config::parse("ANALYSIS_HOURS=2.6", &Config::default());
        assert_eq!(cfg.analysis_hours, 3);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let (cfg, errors) = Config::parse("SOME_FUTURE_KNOB=42", &Config::default());
        assert!(errors.is_empty());
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn effective_retention_never_undercuts_analysis_window() {
        let mut cfg = Config::default();
        cfg.data_retention_hours = 2;
        cfg.analysis_hours = 4;
        cfg.offset_minutes = 30;
        assert_eq!(cfg.effective_retention_ms(), 4 * 3_600_000 + 30 * 60_000);

        cfg.analysis_hours = 1;
        cfg.offset_minutes = 0;
        assert_eq!(cfg.effective_retention_ms(), 2 * 3_600_000);
    }

    #[test]
    fn snapshot_publication() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.current();
        let mut next = Config::default();
        next.volume_multiplier = 9.0;
        handle.install(next);
        let after = handle.current();
        assert!((before.volume_multiplier - 2.0).abs() < f64::EPSILON);
        assert!((after.volume_multiplier - 9.0).abs() < f64::EPSILON);
    }
}
