// =============================================================================
// CryptoScan — Main Entry Point
// =============================================================================
//
// Real-time alerting engine for Bybit USDT perpetuals: ingest the kline.1
// stream for a curated watchlist, detect volume spikes / consecutive runs /
// priority composites enriched with Smart-Money structure, persist alerts,
// and fan them out to dashboard clients and Telegram.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alert_sink;
mod alerts;
mod api;
mod app_state;
mod backfill;
mod bybit;
mod config;
mod errors;
mod event_bus;
mod imbalance;
mod notifier;
mod reconcile;
mod signal_engine;
mod store;
mod time_service;
mod types;
mod watchlist;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alert_sink::alert_channel;
use crate::app_state::AppState;
use crate::backfill::Backfiller;
use crate::bybit::{ws::FeedDeps, BybitRest, FeedClient};
use crate::config::ConfigHandle;
use crate::event_bus::EventBus;
use crate::notifier::TelegramNotifier;
use crate::reconcile::Reconciler;
use crate::signal_engine::{EngineDeps, EngineHandle};
use crate::store::{AlertStore, CandleStore, Database, WatchlistStore};
use crate::time_service::TimeService;
use crate::watchlist::WatchlistCurator;

/// Restart delay for a supervised loop that died unexpectedly.
const SUPERVISOR_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              CryptoScan — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path = PathBuf::from(
        std::env::var("CRYPTOSCAN_CONFIG").unwrap_or_else(|_| "cryptoscan.conf".into()),
    );
    let (initial_config, _field_errors) = config::load_config(&config_path)?;
    let config = Arc::new(ConfigHandle::new(initial_config));

    // ── 3. Storage ───────────────────────────────────────────────────────
    let db_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://data/cryptoscan.db".into());
    let db = Database::connect(&db_url).await?;
    let candles = CandleStore::new(db.pool.clone());
    let alerts = AlertStore::new(db.pool.clone());
    let watchlist_store = WatchlistStore::new(db.pool.clone());

    // ── 4. Shared services ───────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    let time = Arc::new(TimeService::new());
    let bus = EventBus::new();
    let rest = BybitRest::new();

    tokio::spawn(time_service::run_time_sync(time.clone(), stop_rx.clone()));
    tokio::spawn(config::run_config_watcher(
        config_path,
        config.clone(),
        stop_rx.clone(),
    ));

    // ── 5. Alert pipeline ────────────────────────────────────────────────
    let (sink, sink_rx) = alert_channel();
    let notifier = Arc::new(TelegramNotifier::from_env());
    if notifier.enabled() {
        info!("telegram notifications enabled");
    }
    tokio::spawn(alert_sink::run_dispatcher(
        sink_rx,
        alerts.clone(),
        bus.clone(),
        notifier,
        time.clone(),
        config.clone(),
        stop_rx.clone(),
    ));

    // ── 6. Signal engine ─────────────────────────────────────────────────
    let engine_deps = Arc::new(EngineDeps {
        store: candles.clone(),
        sink,
        rest: rest.clone(),
        time: time.clone(),
        config: config.clone(),
    });
    let engine = EngineHandle::new(engine_deps, stop_rx.clone());

    // ── 7. Watchlist curation ────────────────────────────────────────────
    let (changes_tx, mut changes_rx) = tokio::sync::mpsc::channel(32);
    let curator = WatchlistCurator::new(
        rest.clone(),
        watchlist_store.clone(),
        config.clone(),
        time.clone(),
        bus.clone(),
        changes_tx,
    );

    // Seed the watchlist before the feed starts when the store is empty.
    let mut symbols = watchlist_store.active_symbols().await?;
    if symbols.is_empty() && config.current().watchlist_auto_update {
        info!("watchlist empty, running initial curation");
        match curator.update_once().await {
            Ok(change) => {
                info!(added = change.added.len(), "initial watchlist curated");
                symbols = watchlist_store.active_symbols().await?;
            }
            Err(e) => warn!(error = %e, "initial curation failed, starting with empty watchlist"),
        }
    }
    info!(symbols = symbols.len(), "watchlist loaded");

    // ── 8. Reconciliation (startup data check) ───────────────────────────
    let backfiller = Backfiller::new(rest.clone(), candles.clone());
    let reconciler = Arc::new(Reconciler::new(
        candles.clone(),
        backfiller.clone(),
        watchlist_store.clone(),
        config.clone(),
        time.clone(),
        bus.clone(),
    ));
    if let Err(e) = reconciler.reconcile_all().await {
        warn!(error = %e, "startup reconciliation failed, detectors may lack history");
    }

    tokio::spawn(reconcile::run_settings_listener(
        reconciler.clone(),
        config.clone(),
        bus.clone(),
        stop_rx.clone(),
    ));

    // ── 9. Feed client ───────────────────────────────────────────────────
    let (feed, feed_cmd_rx) = FeedClient::new();
    feed.set_initial_pairs(&symbols);

    {
        let feed = feed.clone();
        let deps = FeedDeps {
            engine: engine.clone(),
            store: candles.clone(),
            bus: bus.clone(),
        };
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut cmd_rx = feed_cmd_rx;
            loop {
                match bybit::ws::run_feed(feed.clone(), &mut cmd_rx, &deps, stop.clone()).await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(error = %e, "feed reader died, restarting after cool-down");
                    }
                }
                let mut stop_wait = stop.clone();
                tokio::select! {
                    _ = tokio::time::sleep(SUPERVISOR_COOLDOWN) => {}
                    _ = stop_wait.changed() => {}
                }
                if *stop.borrow() {
                    return;
                }
            }
        });
    }

    // Watchlist changes drive subscriptions and reconciliation for the
    // symbols they add.
    {
        let feed = feed.clone();
        let engine = engine.clone();
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            while let Some(change) = changes_rx.recv().await {
                if !change.removed.is_empty() {
                    for symbol in &change.removed {
                        engine.remove_symbol(symbol);
                    }
                    feed.unsubscribe(change.removed.clone()).await;
                }
                if !change.added.is_empty() {
                    feed.subscribe(change.added.clone()).await;
                    reconciler.reconcile_symbols(&change.added).await;
                }
            }
        });
    }

    tokio::spawn(curator.run(stop_rx.clone()));

    // ── 10. Maintenance tasks ────────────────────────────────────────────
    tokio::spawn(store::candle_store::run_retention(
        candles.clone(),
        watchlist_store.clone(),
        config.clone(),
        time.clone(),
        stop_rx.clone(),
    ));
    tokio::spawn(backfill::run_integrity_scan(
        backfiller,
        candles.clone(),
        watchlist_store.clone(),
        config.clone(),
        time.clone(),
        bus.clone(),
        stop_rx.clone(),
    ));

    // ── 11. API server ───────────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: config.clone(),
        time: time.clone(),
        bus: bus.clone(),
        candles,
        alerts,
        watchlist: watchlist_store,
        feed,
        started_at: std::time::Instant::now(),
    });
    let bind_addr =
        std::env::var("CRYPTOSCAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());
    {
        let app = api::rest::router(state);
        let mut stop = stop_rx.clone();
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %addr, "API server listening");
            let shutdown = async move {
                while stop.changed().await.is_ok() {
                    if *stop.borrow() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");
    let _ = stop_tx.send(true);

    // Drain grace for mailboxes and the alert dispatcher.
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    info!("CryptoScan shut down complete");
    Ok(())
}
