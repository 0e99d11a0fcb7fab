// =============================================================================
// Reconciliation — align stored candles to the required analysis window
// =============================================================================
//
// The required window is `[end − analysis_hours, end)` with
// `end = floor(now, 1m) − offset_minutes`. Per symbol: trim rows outside the
// window, then backfill whatever is missing inside it. Runs at startup and
// whenever the window settings change; concurrent runs for one symbol are
// serialised by a per-symbol lock, so the whole pass is idempotent.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backfill::Backfiller;
use crate::config::{Config, ConfigHandle};
use crate::event_bus::EventBus;
use crate::store::{CandleStore, WatchlistStore};
use crate::time_service::TimeService;
use crate::types::{align_down_to_minute, MINUTE_MS};

/// `[start, end)` the detectors need, minute-aligned.
pub fn required_window(cfg: &Config, now_ms: i64) -> (i64, i64) {
    let end = align_down_to_minute(now_ms) - cfg.offset_minutes * MINUTE_MS;
    let start = end - cfg.analysis_hours * 3_600_000;
    (start, end)
}

/// Outcome of one symbol's reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolReconcile {
    pub start_ms: i64,
    pub end_ms: i64,
    pub deleted_left: u64,
    pub deleted_right: u64,
    pub missing: i64,
}

/// Outcome of a full pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub symbols: usize,
    pub loaded_bars: u64,
    pub residual_gaps: usize,
}

pub struct Reconciler {
    store: CandleStore,
    backfiller: Backfiller,
    watchlist: WatchlistStore,
    config: Arc<ConfigHandle>,
    time: Arc<TimeService>,
    bus: EventBus,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: CandleStore,
        backfiller: Backfiller,
        watchlist: WatchlistStore,
        config: Arc<ConfigHandle>,
        time: Arc<TimeService>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            backfiller,
            watchlist,
            config,
            time,
            bus,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Trim one symbol to the required window and report what is missing.
    /// Does not load data; the caller batches loads across symbols.
    pub async fn reconcile_symbol(&self, symbol: &str) -> Result<SymbolReconcile> {
        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        let cfg = self.config.current();
        let (start_ms, end_ms) = required_window(&cfg, self.time.now_ms());

        let mut deleted_left = 0;
        let mut deleted_right = 0;
        if let Some((min_ms, max_ms, _count)) = self.store.time_range(symbol).await? {
            if min_ms < start_ms {
                deleted_left = self.store.delete_before(symbol, start_ms).await?;
            }
            if max_ms >= end_ms {
                deleted_right = self.store.delete_from(symbol, end_ms).await?;
            }
        }

        let report = self.store.check_integrity(symbol, start_ms, end_ms).await?;
        debug!(
            symbol = %symbol,
            deleted_left,
            deleted_right,
            missing = report.missing,
            "symbol reconciled"
        );

        Ok(SymbolReconcile {
            start_ms,
            end_ms,
            deleted_left,
            deleted_right,
            missing: report.missing,
        })
    }

    /// Reconcile the given symbols: check-and-trim each, then backfill the
    /// ones with gaps, emitting progress events throughout.
    pub async fn reconcile_symbols(&self, symbols: &[String]) -> ReconcileSummary {
        let total = symbols.len();
        self.bus.data_check_started(total);

        let mut needing: Vec<(String, i64, i64)> = Vec::new();
        for (i, symbol) in symbols.iter().enumerate() {
            match self.reconcile_symbol(symbol).await {
                Ok(result) => {
                    self.bus
                        .data_check_progress(symbol, i + 1, total, result.missing);
                    if result.missing > 0 {
                        needing.push((symbol.clone(), result.start_ms, result.end_ms));
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "reconciliation failed for symbol");
                }
            }
        }
        self.bus.data_check_completed(total, needing.len());

        let mut summary = ReconcileSummary {
            symbols: total,
            ..Default::default()
        };

        if !needing.is_empty() {
            self.bus.data_loading_started(needing.len());
            for (symbol, start_ms, end_ms) in &needing {
                match self.backfiller.load_range(symbol, *start_ms, *end_ms).await {
                    Ok(written) => summary.loaded_bars += written,
                    Err(e) => warn!(symbol = %symbol, error = %e, "reconciliation backfill failed"),
                }

                // Whatever survives the load is surfaced, not hidden.
                match self.store.check_integrity(symbol, *start_ms, *end_ms).await {
                    Ok(report) if report.missing > 0 => {
                        self.bus.needs_loading(symbol, report.missing);
                        summary.residual_gaps += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(symbol = %symbol, error = %e, "post-load integrity check failed"),
                }
            }
            self.bus.data_loading_completed(needing.len());
        }

        info!(
            symbols = summary.symbols,
            loaded = summary.loaded_bars,
            residual = summary.residual_gaps,
            "reconciliation pass complete"
        );
        summary
    }

    /// Full pass over every active watchlist symbol.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary> {
        let symbols = self.watchlist.active_symbols().await?;
        Ok(self.reconcile_symbols(&symbols).await)
    }
}

// =============================================================================
// Settings listener
// =============================================================================

/// Re-runs reconciliation whenever the analysis window settings change, and
/// mirrors every config reload onto the client bus.
pub async fn run_settings_listener(
    reconciler: Arc<Reconciler>,
    config: Arc<ConfigHandle>,
    bus: EventBus,
    mut stop: watch::Receiver<bool>,
) {
    let mut rx = config.subscribe();
    let mut window = {
        let cfg = config.current();
        (cfg.analysis_hours, cfg.offset_minutes)
    };

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("settings listener stopping");
                    return;
                }
            }
        }

        bus.settings_updated();

        let cfg = config.current();
        let next = (cfg.analysis_hours, cfg.offset_minutes);
        if next != window {
            info!(
                analysis_hours = next.0,
                offset_minutes = next.1,
                "analysis window changed, reconciling"
            );
            window = next;
            if let Err(e) = reconciler.reconcile_all().await {
                warn!(error = %e, "window-change reconciliation failed");
            }
        }
    }
}
