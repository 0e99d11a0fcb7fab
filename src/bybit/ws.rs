// =============================================================================
// Feed client — Bybit public kline.1 WebSocket stream
// =============================================================================
//
// Single persistent socket for a mutable symbol set. Subscription mutations
// arrive over a command channel and are applied by the reader task, keeping
// socket writes serialised. Per symbol, closed candles are deduplicated by
// their start minute, so the signal engine sees each minute exactly once and
// in ascending order.
//
// Connection lifecycle: Connecting → Connected → Streaming, with Degraded
// after 90 s of silence and a forced reconnect at 120 s. Reconnects back off
// `min(5s × attempt, 60s)`; ten consecutive failures surface as an error to
// the supervisor, and a connection that streams for 60 s resets the counter.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::event_bus::{ConnectionStatus, EventBus};
use crate::signal_engine::EngineHandle;
use crate::store::CandleStore;
use crate::types::{align_down_to_minute, Candle, CandleEvent, MINUTE_MS};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Symbols per subscribe frame.
const SUBSCRIBE_BATCH: usize = 50;
/// Pause between subscribe frames.
const BATCH_SPACING: Duration = Duration::from_millis(500);
/// Application-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Silence budget before the connection is flagged degraded.
const IDLE_WARN: Duration = Duration::from_secs(90);
/// Silence budget before a forced reconnect.
const IDLE_RECONNECT: Duration = Duration::from_secs(120);
/// A connection streaming this long resets the failure counter.
const STABLE_AFTER: Duration = Duration::from_secs(60);
/// Consecutive failures tolerated before surfacing a fatal error.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Connected,
    Streaming,
    Degraded,
    Closed,
    Reconnecting,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Streaming => write!(f, "streaming"),
            Self::Degraded => write!(f, "degraded"),
            Self::Closed => write!(f, "closed"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Shared handle for subscription control and status queries.
pub struct FeedClient {
    trading_pairs: RwLock<HashSet<String>>,
    subscribed: RwLock<HashSet<String>>,
    pending: RwLock<HashSet<String>>,
    last_processed_start: RwLock<HashMap<String, i64>>,
    state: RwLock<FeedState>,
    cmd_tx: mpsc::Sender<FeedCommand>,
}

impl FeedClient {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<FeedCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let client = Arc::new(Self {
            trading_pairs: RwLock::new(HashSet::new()),
            subscribed: RwLock::new(HashSet::new()),
            pending: RwLock::new(HashSet::new()),
            last_processed_start: RwLock::new(HashMap::new()),
            state: RwLock::new(FeedState::Closed),
            cmd_tx,
        });
        (client, cmd_rx)
    }

    /// Seed the symbol set before the reader starts.
    pub fn set_initial_pairs(&self, symbols: &[String]) {
        let mut pairs = self.trading_pairs.write();
        pairs.clear();
        pairs.extend(symbols.iter().cloned());
    }

    pub async fn subscribe(&self, symbols: Vec<String>) {
        if symbols.is_empty() {
            return;
        }
        if self.cmd_tx.send(FeedCommand::Subscribe(symbols)).await.is_err() {
            warn!("feed command channel closed, subscribe dropped");
        }
    }

    pub async fn unsubscribe(&self, symbols: Vec<String>) {
        if symbols.is_empty() {
            return;
        }
        if self
            .cmd_tx
            .send(FeedCommand::Unsubscribe(symbols))
            .await
            .is_err()
        {
            warn!("feed command channel closed, unsubscribe dropped");
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = *self.state.read();
        ConnectionStatus {
            status: state.to_string(),
            pairs_count: self.trading_pairs.read().len(),
            subscribed_count: self.subscribed.read().len(),
            pending_count: self.pending.read().len(),
            streaming_active: state == FeedState::Streaming,
        }
    }

    fn set_state(&self, next: FeedState, bus: &EventBus) {
        let changed = {
            let mut state = self.state.write();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            info!(state = %next, "feed state changed");
            bus.connection_status(&self.status());
        }
    }
}

// =============================================================================
// Reader task
// =============================================================================

pub struct FeedDeps {
    pub engine: EngineHandle,
    pub store: CandleStore,
    pub bus: EventBus,
}

/// Reconnect-forever reader. Returns `Err` only after ten consecutive
/// connection failures (the supervisor restarts it after a cool-down) and
/// `Ok` on a clean stop.
pub async fn run_feed(
    client: Arc<FeedClient>,
    cmd_rx: &mut mpsc::Receiver<FeedCommand>,
    deps: &FeedDeps,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut attempts: u32 = 0;

    loop {
        if *stop.borrow() {
            client.set_state(FeedState::Closed, &deps.bus);
            return Ok(());
        }

        client.set_state(FeedState::Connecting, &deps.bus);
        match drive_connection(&client, cmd_rx, deps, &mut stop).await {
            Ok(DriveOutcome::Stopped) => {
                client.set_state(FeedState::Closed, &deps.bus);
                info!("feed reader stopped");
                return Ok(());
            }
            Ok(DriveOutcome::Disconnected { was_stable }) => {
                if was_stable {
                    attempts = 0;
                }
            }
            Err(e) => {
                warn!(error = %e, "feed connection failed");
            }
        }

        attempts += 1;
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            client.set_state(FeedState::Closed, &deps.bus);
            error!(attempts, "feed exhausted reconnect attempts");
            return Err(anyhow!(
                "feed failed {attempts} consecutive connection attempts"
            ));
        }

        client.set_state(FeedState::Reconnecting, &deps.bus);
        let delay = backoff_delay(attempts);
        warn!(attempt = attempts, delay_secs = delay.as_secs(), "feed reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {}
        }
    }
}

enum DriveOutcome {
    Stopped,
    Disconnected { was_stable: bool },
}

/// Exponential-ish backoff: `min(5s × attempt, 60s)`.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs((5 * attempt as u64).min(60))
}

async fn drive_connection(
    client: &Arc<FeedClient>,
    cmd_rx: &mut mpsc::Receiver<FeedCommand>,
    deps: &FeedDeps,
    stop: &mut watch::Receiver<bool>,
) -> Result<DriveOutcome> {
    let (ws, _resp) = connect_async(WS_URL)
        .await
        .context("failed to open feed socket")?;
    let (mut write, mut read) = ws.split();

    client.set_state(FeedState::Connected, &deps.bus);

    // Fresh socket: everything must be re-acknowledged by data.
    client.pending.write().clear();
    client.subscribed.write().clear();

    let initial: Vec<String> = client.trading_pairs.read().iter().cloned().collect();
    send_subscriptions(client, &mut write, &initial, true).await?;

    let mut last_msg = tokio::time::Instant::now();
    let mut streaming_since: Option<tokio::time::Instant> = None;
    let mut idle_tick = tokio::time::interval(Duration::from_secs(5));
    let mut ping_tick = tokio::time::interval(PING_INTERVAL);

    // Only time actually spent in Streaming counts toward stability.
    let was_stable = |streaming_since: Option<tokio::time::Instant>| {
        streaming_since.is_some_and(|t| t.elapsed() >= STABLE_AFTER)
    };

    loop {
        tokio::select! {
            maybe_msg = read.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        last_msg = tokio::time::Instant::now();
                        if client.state() != FeedState::Streaming {
                            client.set_state(FeedState::Streaming, &deps.bus);
                            streaming_since = Some(last_msg);
                        }
                        handle_text(client, deps, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_msg = tokio::time::Instant::now();
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            warn!(error = %e, "pong send failed");
                            return Ok(DriveOutcome::Disconnected {
                                was_stable: was_stable(streaming_since),
                            });
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_msg = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "feed socket closed by venue");
                        return Ok(DriveOutcome::Disconnected {
                            was_stable: was_stable(streaming_since),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "feed read error");
                        return Ok(DriveOutcome::Disconnected {
                            was_stable: was_stable(streaming_since),
                        });
                    }
                    None => {
                        warn!("feed stream ended");
                        return Ok(DriveOutcome::Disconnected {
                            was_stable: was_stable(streaming_since),
                        });
                    }
                }
            }

            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(FeedCommand::Subscribe(symbols)) => {
                        client.trading_pairs.write().extend(symbols.iter().cloned());
                        send_subscriptions(client, &mut write, &symbols, true).await?;
                        deps.bus.connection_status(&client.status());
                    }
                    Some(FeedCommand::Unsubscribe(symbols)) => {
                        {
                            let mut pairs = client.trading_pairs.write();
                            let mut subscribed = client.subscribed.write();
                            let mut pending = client.pending.write();
                            let mut last = client.last_processed_start.write();
                            for sym in &symbols {
                                pairs.remove(sym);
                                subscribed.remove(sym);
                                pending.remove(sym);
                                last.remove(sym);
                            }
                        }
                        for sym in &symbols {
                            deps.engine.remove_symbol(sym);
                        }
                        send_subscriptions(client, &mut write, &symbols, false).await?;
                        deps.bus.connection_status(&client.status());
                    }
                    None => {
                        warn!("feed command channel closed");
                        return Ok(DriveOutcome::Stopped);
                    }
                }
            }

            _ = idle_tick.tick() => {
                let silence = last_msg.elapsed();
                if silence >= IDLE_RECONNECT {
                    warn!(silence_secs = silence.as_secs(), "feed silent too long, reconnecting");
                    return Ok(DriveOutcome::Disconnected {
                        was_stable: was_stable(streaming_since),
                    });
                }
                if silence >= IDLE_WARN && client.state() == FeedState::Streaming {
                    warn!(silence_secs = silence.as_secs(), "feed degraded");
                    client.set_state(FeedState::Degraded, &deps.bus);
                }
            }

            _ = ping_tick.tick() => {
                let ping = json!({"op": "ping"}).to_string();
                if let Err(e) = write.send(Message::Text(ping)).await {
                    warn!(error = %e, "app ping send failed");
                    return Ok(DriveOutcome::Disconnected {
                        was_stable: was_stable(streaming_since),
                    });
                }
            }

            _ = stop.changed() => {
                if *stop.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(DriveOutcome::Stopped);
                }
            }
        }
    }
}

/// Send (un)subscribe frames in batches of 50 with 500 ms spacing.
async fn send_subscriptions<S>(
    client: &FeedClient,
    write: &mut S,
    symbols: &[String],
    subscribe: bool,
) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let op = if subscribe { "subscribe" } else { "unsubscribe" };
    for (i, batch) in symbols.chunks(SUBSCRIBE_BATCH).enumerate() {
        let args: Vec<String> = batch.iter().map(|s| format!("kline.1.{s}")).collect();
        let frame = json!({"op": op, "args": args}).to_string();
        write
            .send(Message::Text(frame))
            .await
            .with_context(|| format!("{op} frame {} failed", i + 1))?;

        if subscribe {
            client.pending.write().extend(batch.iter().cloned());
        }
        debug!(op, batch = i + 1, symbols = batch.len(), "subscription frame sent");

        if (i + 1) * SUBSCRIBE_BATCH < symbols.len() {
            tokio::time::sleep(BATCH_SPACING).await;
        }
    }
    Ok(())
}

// =============================================================================
// Tick handling
// =============================================================================

async fn handle_text(client: &Arc<FeedClient>, deps: &FeedDeps, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "feed sent invalid JSON");
            return;
        }
    };

    // Subscription acks and pong replies.
    if value.get("success").is_some() || value.get("op").is_some() {
        if value["success"].as_bool() == Some(false) {
            warn!(response = %value, "feed rejected a request");
        }
        return;
    }

    let Some(topic) = value["topic"].as_str() else {
        return;
    };
    if !topic.starts_with("kline.1.") {
        return;
    }

    let Some((symbol, candle, is_closed)) = parse_kline_tick(topic, &value) else {
        warn!(topic = %topic, "malformed kline tick dropped");
        return;
    };

    // Symbols evicted mid-flight may still tick briefly.
    if !client.trading_pairs.read().contains(&symbol) {
        debug!(symbol = %symbol, "tick for unsubscribed symbol dropped");
        return;
    }

    // First data for a pending symbol promotes it to subscribed.
    if client.pending.write().remove(&symbol) {
        client.subscribed.write().insert(symbol.clone());
        deps.bus.connection_status(&client.status());
    }

    if let Err(e) = candle.validate() {
        warn!(symbol = %symbol, error = %e, "invalid candle dropped");
        return;
    }

    // Persist first so detectors and clients observe the same bar. A storage
    // outage degrades alerting but streaming continues.
    if let Err(e) = deps.store.upsert(&symbol, &candle).await {
        warn!(symbol = %symbol, error = %e, "candle upsert failed");
    }

    deps.bus.kline_update(&symbol, &candle, is_closed);

    if is_closed {
        let fresh = {
            let mut last = client.last_processed_start.write();
            match last.get(&symbol) {
                Some(&prev) if candle.start_ms <= prev => false,
                _ => {
                    last.insert(symbol.clone(), candle.start_ms);
                    true
                }
            }
        };
        if !fresh {
            debug!(symbol = %symbol, start_ms = candle.start_ms, "duplicate closed candle dropped");
            return;
        }
    }

    // Non-blocking: a congested symbol sheds its own open events instead of
    // stalling the shared reader.
    deps.engine.dispatch(CandleEvent {
        symbol,
        candle,
        is_closed,
    });
}

/// Extract `(symbol, candle, confirm)` from a kline frame. The venue reports
/// prices as strings and may report sub-minute timestamps on closed bars;
/// closed bars are re-anchored to their minute grid here.
fn parse_kline_tick(topic: &str, value: &Value) -> Option<(String, Candle, bool)> {
    let symbol = topic.strip_prefix("kline.1.")?.to_string();
    let data = value["data"].as_array()?.first()?;

    let num = |key: &str| -> Option<f64> {
        match &data[key] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };

    let raw_start = data["start"].as_i64()?;
    let is_closed = data["confirm"].as_bool().unwrap_or(false);

    let start_ms = if is_closed {
        align_down_to_minute(raw_start)
    } else {
        raw_start
    };

    let candle = Candle {
        start_ms,
        end_ms: if is_closed {
            start_ms + MINUTE_MS
        } else {
            data["end"].as_i64()?
        },
        open: num("open")?,
        high: num("high")?,
        low: num("low")?,
        close: num("close")?,
        volume: num("volume")?,
        is_closed,
    };

    Some((symbol, candle, is_closed))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tick(confirm: bool, start: i64) -> Value {
        json!({
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "data": [{
                "start": start,
                "end": start + 59_999,
                "interval": "1",
                "open": "100.0",
                "close": "110.5",
                "high": "111.0",
                "low": "99.5",
                "volume": "12.5",
                "turnover": "1350.0",
                "confirm": confirm,
                "timestamp": start + 30_000
            }]
        })
    }

    #[test]
    fn parse_open_tick_keeps_raw_timestamps() {
        let v = tick(false, 1_700_000_040_500);
        let (symbol, candle, is_closed) = parse_kline_tick("kline.1.BTCUSDT", &v).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert!(!is_closed);
        assert_eq!(candle.start_ms, 1_700_000_040_500);
        assert!((candle.close - 110.5).abs() < 1e-9);
        assert!((candle.volume - 12.5).abs() < 1e-9);
    }

    #[test]
    fn parse_closed_tick_normalises_to_minute_grid() {
        let v = tick(true, 1_700_000_040_500);
        let (_, candle, is_closed) = parse_kline_tick("kline.1.BTCUSDT", &v).unwrap();
        assert!(is_closed);
        assert_eq!(candle.start_ms, 1_700_000_040_000);
        assert_eq!(candle.end_ms, 1_700_000_100_000);
        assert!(candle.validate().is_ok());
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let v = json!({
            "topic": "kline.1.BTCUSDT",
            "data": [{"start": 1_700_000_040_000i64, "confirm": true, "open": "x"}]
        });
        assert!(parse_kline_tick("kline.1.BTCUSDT", &v).is_none());

        let empty = json!({"topic": "kline.1.BTCUSDT", "data": []});
        assert!(parse_kline_tick("kline.1.BTCUSDT", &empty).is_none());
    }

    #[test]
    fn backoff_schedule_caps_at_sixty_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(3), Duration::from_secs(15));
        assert_eq!(backoff_delay(12), Duration::from_secs(60));
        assert_eq!(backoff_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn status_reflects_tracked_sets() {
        let (client, _rx) = FeedClient::new();
        client.set_initial_pairs(&["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()]);
        client.pending.write().insert("BTCUSDT".into());
        client.pending.write().insert("ETHUSDT".into());
        client.subscribed.write().insert("SOLUSDT".into());
        *client.state.write() = FeedState::Streaming;

        let status = client.status();
        assert_eq!(status.status, "streaming");
        assert_eq!(status.pairs_count, 3);
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.subscribed_count, 1);
        assert!(status.streaming_active);
    }

    #[test]
    fn feed_state_display_matches_wire_values() {
        assert_eq!(FeedState::Connecting.to_string(), "connecting");
        assert_eq!(FeedState::Degraded.to_string(), "degraded");
        assert_eq!(FeedState::Reconnecting.to_string(), "reconnecting");
    }
}
