// =============================================================================
// Historical backfiller — REST gap filling for the analysis window
// =============================================================================
//
// Pages over the venue's kline endpoint in 24-hour chunks, upserting only the
// minutes the store does not already hold. Idempotent by construction; paced
// to stay far under the venue's rate limits (100 ms between chunks, 500 ms
// between symbols). Transient failures and throttling retry in place with
// exponential backoff.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bybit::BybitRest;
use crate::config::ConfigHandle;
use crate::errors::EngineResult;
use crate::event_bus::EventBus;
use crate::reconcile::required_window;
use crate::store::{CandleStore, WatchlistStore};
use crate::time_service::TimeService;

/// REST paging chunk.
const CHUNK_MS: i64 = 24 * 3_600_000;
/// Pause between chunks of one symbol.
const CHUNK_PAUSE: Duration = Duration::from_millis(100);
/// Pause between symbols in a multi-symbol load.
const SYMBOL_PAUSE: Duration = Duration::from_millis(500);
/// Retries per chunk for retryable failures.
const CHUNK_RETRIES: u32 = 3;
/// Integrity threshold below which the periodic scan triggers a load.
const SCAN_MIN_INTEGRITY_PCT: f64 = 90.0;
/// Cadence of the low-priority integrity scan.
const SCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct Backfiller {
    rest: BybitRest,
    store: CandleStore,
}

impl Backfiller {
    pub fn new(rest: BybitRest, store: CandleStore) -> Self {
        Self { rest, store }
    }

    /// Fill `[from_ms, to_ms)` for one symbol. Returns the number of bars
    /// written. Minutes already present are left untouched.
    pub async fn load_range(&self, symbol: &str, from_ms: i64, to_ms: i64) -> EngineResult<u64> {
        if from_ms >= to_ms {
            return Ok(0);
        }

        let missing = self.store.missing_minutes(symbol, from_ms, to_ms).await?;
        if missing.is_empty() {
            debug!(symbol = %symbol, "window already contiguous, nothing to load");
            return Ok(0);
        }

        let missing_set: std::collections::HashSet<i64> = missing.iter().copied().collect();
        let mut written = 0_u64;
        let mut chunk_start = from_ms;

        while chunk_start < to_ms {
            let chunk_end = (chunk_start + CHUNK_MS).min(to_ms);

            let candles = self
                .fetch_chunk_with_retry(symbol, chunk_start, chunk_end - 1)
                .await?;

            for candle in candles {
                if candle.start_ms < from_ms || candle.start_ms >= to_ms {
                    continue;
                }
                if !missing_set.contains(&candle.start_ms) {
                    continue;
                }
                match self.store.upsert(symbol, &candle).await {
                    Ok(()) => written += 1,
                    Err(e) => warn!(symbol = %symbol, error = %e, "backfill upsert failed"),
                }
            }

            chunk_start = chunk_end;
            if chunk_start < to_ms {
                tokio::time::sleep(CHUNK_PAUSE).await;
            }
        }

        info!(symbol = %symbol, written, "backfill range complete");
        Ok(written)
    }

    /// Load the same window for several symbols with inter-symbol pacing.
    pub async fn load_symbols(
        &self,
        symbols: &[String],
        from_ms: i64,
        to_ms: i64,
    ) -> u64 {
        let mut total = 0;
        for (i, symbol) in symbols.iter().enumerate() {
            match self.load_range(symbol, from_ms, to_ms).await {
                Ok(n) => total += n,
                Err(e) => warn!(symbol = %symbol, error = %e, "backfill failed for symbol"),
            }
            if i + 1 < symbols.len() {
                tokio::time::sleep(SYMBOL_PAUSE).await;
            }
        }
        total
    }

    async fn fetch_chunk_with_retry(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> EngineResult<Vec<crate::types::Candle>> {
        let mut attempt = 0;
        loop {
            match self.rest.kline_1m(symbol, start_ms, end_ms).await {
                Ok(candles) => return Ok(candles),
                Err(e) if e.is_retryable() && attempt < CHUNK_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_secs(1 << attempt);
                    warn!(symbol = %symbol, attempt, error = %e, "kline chunk retry");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Periodic integrity scan
// =============================================================================

/// Low-priority sweep: whenever a watchlist symbol's active-window integrity
/// falls below 90 %, queue a load for it.
pub async fn run_integrity_scan(
    backfiller: Backfiller,
    store: CandleStore,
    watchlist: WatchlistStore,
    config: Arc<ConfigHandle>,
    time: Arc<TimeService>,
    bus: EventBus,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(SCAN_INTERVAL);
    tick.tick().await; // skip the immediate tick; startup reconciliation covers it

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("integrity scan stopping");
                    return;
                }
            }
        }

        let symbols = match watchlist.active_symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "integrity scan: watchlist unavailable");
                continue;
            }
        };
        let cfg = config.current();
        let (start, end) = required_window(&cfg, time.now_ms());

        for symbol in &symbols {
            let report = match store.check_integrity(symbol, start, end).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "integrity check failed");
                    continue;
                }
            };
            if report.pct >= SCAN_MIN_INTEGRITY_PCT {
                continue;
            }

            info!(symbol = %symbol, pct = format!("{:.1}", report.pct),
                  missing = report.missing, "window integrity low, backfilling");
            bus.needs_loading(symbol, report.missing);
            if let Err(e) = backfiller.load_range(symbol, start, end).await {
                warn!(symbol = %symbol, error = %e, "integrity backfill failed");
            }
            tokio::time::sleep(SYMBOL_PAUSE).await;
        }
    }
}
