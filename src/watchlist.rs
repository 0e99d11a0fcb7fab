// =============================================================================
// Watchlist curator — admits pairs by N-day price drop
// =============================================================================
//
// Periodically scores every USDT linear perpetual: a pair qualifies while its
// price sits at least `price_drop_percentage` below its close from
// `price_history_days` ago. The diff against the stored watchlist drives feed
// subscriptions and reconciliation through a change channel.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bybit::BybitRest;
use crate::config::ConfigHandle;
use crate::event_bus::EventBus;
use crate::store::WatchlistStore;
use crate::time_service::TimeService;

/// Symbols scored per batch.
const SCORE_BATCH: usize = 10;
/// Pause between historical-price requests inside a batch.
const REQUEST_PAUSE: Duration = Duration::from_millis(100);
/// Pause between batches.
const BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Diff produced by one curation pass.
#[derive(Debug, Clone, Default)]
pub struct PairsChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PairsChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct PriceScore {
    current: f64,
    historical: f64,
    drop_pct: f64,
}

pub struct WatchlistCurator {
    rest: BybitRest,
    store: WatchlistStore,
    config: Arc<ConfigHandle>,
    time: Arc<TimeService>,
    bus: EventBus,
    changes_tx: mpsc::Sender<PairsChange>,
}

impl WatchlistCurator {
    pub fn new(
        rest: BybitRest,
        store: WatchlistStore,
        config: Arc<ConfigHandle>,
        time: Arc<TimeService>,
        bus: EventBus,
        changes_tx: mpsc::Sender<PairsChange>,
    ) -> Self {
        Self {
            rest,
            store,
            config,
            time,
            bus,
            changes_tx,
        }
    }

    /// Periodic loop. Dormant while `watchlist_auto_update` is off; the
    /// on-demand `update_once` stays callable either way.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            let cfg = self.config.current();
            if cfg.watchlist_auto_update {
                if let Err(e) = self.update_once().await {
                    warn!(error = %e, "watchlist update failed");
                }
            } else {
                debug!("watchlist auto-update disabled, curator idle");
            }

            let interval =
                Duration::from_secs((cfg.pairs_check_interval_minutes.max(1) as u64) * 60);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("watchlist curator stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full curation pass: fetch, score, diff, persist, notify.
    pub async fn update_once(&self) -> Result<PairsChange> {
        let cfg = self.config.current();
        let now = self.time.now_ms();

        let pairs = self.rest.perpetual_pairs().await?;
        if pairs.is_empty() {
            warn!("venue returned no perpetual pairs, watchlist unchanged");
            return Ok(PairsChange::default());
        }
        info!(pairs = pairs.len(), "scoring perpetual pairs");

        // One tickers call covers current prices for the whole pass.
        let prices = self.rest.current_prices(&pairs).await?;

        let mut qualifiers: Vec<(String, PriceScore)> = Vec::new();
        for (batch_idx, batch) in pairs.chunks(SCORE_BATCH).enumerate() {
            for symbol in batch {
                let Some(&current) = prices.get(symbol) else {
                    continue;
                };
                if current <= 0.0 {
                    continue;
                }

                let historical = match self
                    .rest
                    .historical_daily_close(symbol, cfg.price_history_days, now)
                    .await
                {
                    Ok(Some(p)) if p > 0.0 => p,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "historical price fetch failed");
                        continue;
                    }
                };

                let drop_pct = (historical - current) / historical * 100.0;
                if drop_pct >= cfg.price_drop_percentage {
                    qualifiers.push((
                        symbol.clone(),
                        PriceScore {
                            current,
                            historical,
                            drop_pct,
                        },
                    ));
                }
                tokio::time::sleep(REQUEST_PAUSE).await;
            }
            if (batch_idx + 1) * SCORE_BATCH < pairs.len() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        let change = self.apply(&qualifiers, now).await?;
        if !change.is_empty() {
            info!(
                added = change.added.len(),
                removed = change.removed.len(),
                "watchlist updated"
            );
            if self.changes_tx.send(change.clone()).await.is_err() {
                warn!("pairs-change channel closed");
            }
        }
        Ok(change)
    }

    /// Persist the qualifier set and compute the add/remove diff.
    async fn apply(
        &self,
        qualifiers: &[(String, PriceScore)],
        now: i64,
    ) -> Result<PairsChange> {
        let current: HashSet<String> = self.store.active_symbols().await?.into_iter().collect();
        let qualifying: HashSet<String> =
            qualifiers.iter().map(|(s, _)| s.clone()).collect();

        let mut change = PairsChange::default();

        // Refresh every qualifier's pricing; new ones count as additions.
        for (symbol, score) in qualifiers {
            self.store
                .upsert(symbol, score.drop_pct, score.current, score.historical, now)
                .await?;
            if !current.contains(symbol) {
                self.bus.watchlist_updated("added", symbol);
                change.added.push(symbol.clone());
            }
        }

        for symbol in current.difference(&qualifying) {
            self.store.deactivate(symbol, now).await?;
            self.bus.watchlist_updated("removed", symbol);
            change.removed.push(symbol.clone());
        }

        change.added.sort();
        change.removed.sort();
        Ok(change)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Database;

    async fn curator() -> (WatchlistCurator, mpsc::Receiver<PairsChange>) {
        let db = Database::connect_in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let curator = WatchlistCurator::new(
            BybitRest::new(),
            WatchlistStore::new(db.pool),
            Arc::new(ConfigHandle::new(Config::default())),
            Arc::new(TimeService::new()),
            EventBus::new(),
            tx,
        );
        (curator, rx)
    }

    fn score(current: f64, historical: f64) -> PriceScore {
        PriceScore {
            current,
            historical,
            drop_pct: (historical - current) / historical * 100.0,
        }
    }

    #[tokio::test]
    async fn apply_diffs_against_stored_watchlist() {
        let (curator, _rx) = curator().await;

        // Seed a pre-existing active watchlist.
        curator
            .store
            .upsert("OLDUSDT", 12.0, 1.0, 1.2, 0)
            .await
            .unwrap();
        curator
            .store
            .upsert("KEEPUSDT", 15.0, 2.0, 2.5, 0)
            .await
            .unwrap();

        // New pass: KEEP requalifies, NEW appears, OLD fails the cut.
        let qualifiers = vec![
            ("KEEPUSDT".to_string(), score(1.9, 2.5)),
            ("NEWUSDT".to_string(), score(8.0, 10.0)),
        ];
        let change = curator.apply(&qualifiers, 1_000).await.unwrap();
        assert_eq!(change.added, vec!["NEWUSDT"]);
        assert_eq!(change.removed, vec!["OLDUSDT"]);

        let active = curator.store.active_symbols().await.unwrap();
        assert_eq!(active, vec!["KEEPUSDT", "NEWUSDT"]);

        // Requalified entry picked up the refreshed pricing.
        let entries = curator.store.entries().await.unwrap();
        let keep = entries.iter().find(|e| e.symbol == "KEEPUSDT").unwrap();
        assert!((keep.current_price - 1.9).abs() < 1e-9);
        assert!((keep.price_drop - 24.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stable_watchlist_produces_empty_diff() {
        let (curator, _rx) = curator().await;
        curator
            .store
            .upsert("BTCUSDT", 12.0, 1.0, 1.2, 0)
            .await
            .unwrap();

        let qualifiers = vec![("BTCUSDT".to_string(), score(1.0, 1.2))];
        let change = curator.apply(&qualifiers, 1_000).await.unwrap();
        assert!(change.is_empty());
    }
}
