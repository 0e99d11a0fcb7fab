// =============================================================================
// Central application state
// =============================================================================
//
// Ties the shared handles together for the API layer and the task wiring in
// main. Every field is either immutable or internally synchronised, so the
// whole struct is shared as a plain `Arc<AppState>`.
// =============================================================================

use std::sync::Arc;

use crate::bybit::FeedClient;
use crate::config::ConfigHandle;
use crate::event_bus::EventBus;
use crate::store::{AlertStore, CandleStore, WatchlistStore};
use crate::time_service::TimeService;

pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub time: Arc<TimeService>,
    pub bus: EventBus,
    pub candles: CandleStore,
    pub alerts: AlertStore,
    pub watchlist: WatchlistStore,
    pub feed: Arc<FeedClient>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
