// =============================================================================
// Event bus — one-way JSON fan-out to connected clients
// =============================================================================
//
// A broadcast ring buffer decouples producers from WebSocket consumers: a slow
// client lags and drops messages, producers never block. Serialisation is
// skipped entirely while nobody is connected.
// =============================================================================

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::alerts::Alert;
use crate::types::Candle;

/// Ring capacity per subscriber before a laggard starts losing messages.
const BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

/// Feed connection summary pushed as `connection_status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStatus {
    pub status: String,
    pub pairs_count: usize,
    pub subscribed_count: usize,
    pub pending_count: usize,
    pub streaming_active: bool,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Serialize and broadcast when at least one client is connected.
    pub fn publish(&self, message: Value) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if let Ok(text) = serde_json::to_string(&message) {
            let _ = self.tx.send(text);
        }
    }

    // -------------------------------------------------------------------------
    // Typed publishers
    // -------------------------------------------------------------------------

    pub fn new_alert(&self, alert: &Alert, server_timestamp: i64, utc_synced: bool) {
        self.publish(json!({
            "type": "new_alert",
            "alert": alert,
            "server_timestamp": server_timestamp,
            "utc_synced": utc_synced,
        }));
    }

    pub fn kline_update(&self, symbol: &str, candle: &Candle, is_closed: bool) {
        self.publish(json!({
            "type": "kline_update",
            "symbol": symbol,
            "candle": candle,
            "is_closed": is_closed,
        }));
    }

    pub fn connection_status(&self, status: &ConnectionStatus) {
        self.publish(json!({
            "type": "connection_status",
            "status": status.status,
            "pairs_count": status.pairs_count,
            "subscribed_count": status.subscribed_count,
            "pending_count": status.pending_count,
            "streaming_active": status.streaming_active,
        }));
    }

    pub fn watchlist_updated(&self, action: &str, symbol: &str) {
        self.publish(json!({
            "type": "watchlist_updated",
            "action": action,
            "symbol": symbol,
        }));
    }

    pub fn settings_updated(&self) {
        self.publish(json!({"type": "settings_updated"}));
    }

    pub fn data_check_started(&self, total_symbols: usize) {
        self.publish(json!({
            "type": "startup_data_check_started",
            "total_symbols": total_symbols,
        }));
    }

    pub fn data_check_progress(&self, symbol: &str, checked: usize, total: usize, missing: i64) {
        self.publish(json!({
            "type": "startup_data_check_progress",
            "symbol": symbol,
            "checked": checked,
            "total": total,
            "missing": missing,
        }));
    }

    pub fn data_check_completed(&self, total_symbols: usize, symbols_needing_load: usize) {
        self.publish(json!({
            "type": "startup_data_check_completed",
            "total_symbols": total_symbols,
            "symbols_needing_load": symbols_needing_load,
        }));
    }

    pub fn data_loading_started(&self, symbols: usize) {
        self.publish(json!({
            "type": "startup_data_loading_started",
            "symbols": symbols,
        }));
    }

    pub fn data_loading_completed(&self, symbols: usize) {
        self.publish(json!({
            "type": "startup_data_loading_completed",
            "symbols": symbols,
        }));
    }

    /// A residual gap survived reconciliation and is queued for backfill.
    pub fn needs_loading(&self, symbol: &str, missing: i64) {
        self.publish(json!({
            "type": "needs_loading",
            "symbol": symbol,
            "missing": missing,
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
