// =============================================================================
// Signal engine — per-symbol detector state machines
// =============================================================================
//
// One actor task per symbol, fed by its own mailbox. All mutable detector
// state (consecutive-run counter, cooldowns, pending preliminary) is owned by
// that single task, so no locks guard it.
//
// Open candles run the preliminary volume check (phase A); closed candles run
// the authoritative pipeline (phase B): final-signal resolution, volume
// spike, consecutive run, and priority composition, each feeding the alert
// sink in emission order.
//
// Backpressure: each mailbox is an unbounded queue with a high-water mark.
// Past the mark, open-candle events are shed (the next tick restates them);
// closed events are always enqueued because detector state depends on every
// one of them. Dispatch therefore never blocks the feed reader, and a
// congested symbol cannot stall any other symbol's delivery.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertKind, CandleSnapshot};
use crate::alert_sink::AlertSink;
use crate::bybit::BybitRest;
use crate::config::{Config, ConfigHandle};
use crate::imbalance::{Imbalance, ImbalanceAnalyzer};
use crate::store::CandleStore;
use crate::time_service::TimeService;
use crate::types::{Candle, CandleEvent, OrderBookSnapshot, MINUTE_MS};

/// Mailbox high-water mark: beyond this depth open events are shed. Closed
/// events are exempt; at one per symbol per minute they cannot grow the
/// queue meaningfully.
const MAILBOX_HIGH_WATER: usize = 64;
/// Minimum baseline sample count before a ratio is meaningful.
const MIN_BASELINE_SAMPLES: usize = 10;
/// Candle window handed to the imbalance analyzer.
const IMBALANCE_LOOKBACK: i64 = 20;
/// Minimum closed candles required for structure analysis.
const IMBALANCE_MIN_CANDLES: usize = 15;
/// In-memory cooldown entries older than this are forgotten.
const COOLDOWN_TTL_MS: i64 = 3_600_000;

/// Cooldown keys. Volume and consecutive alerts cool down independently.
const COOLDOWN_VOLUME: &str = "volume_spike";
const COOLDOWN_CONSECUTIVE: &str = "consecutive";

// =============================================================================
// Dependencies shared by all symbol actors
// =============================================================================

pub struct EngineDeps {
    pub store: CandleStore,
    pub sink: AlertSink,
    pub rest: BybitRest,
    pub time: Arc<TimeService>,
    pub config: Arc<ConfigHandle>,
}

// =============================================================================
// Mailbox — unbounded queue with a high-water mark
// =============================================================================

/// Producer half of a symbol mailbox. Depth is tracked explicitly so the
/// shedding policy can distinguish event kinds, which a bounded channel
/// cannot.
#[derive(Clone)]
struct Mailbox {
    tx: mpsc::UnboundedSender<CandleEvent>,
    depth: Arc<AtomicUsize>,
}

/// What `Mailbox::push` did with the event.
enum PushOutcome {
    Queued,
    /// An open event was shed at the high-water mark; the next tick upstream
    /// restates it.
    ShedOpen(CandleEvent),
    /// The actor is gone; the event is handed back for a respawn-and-retry.
    ActorGone(CandleEvent),
}

impl Mailbox {
    fn new() -> (Self, MailboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: depth.clone(),
            },
            MailboxReceiver { rx, depth },
        )
    }

    /// Never blocks. Closed events are always enqueued; open events are shed
    /// once the queue sits at the high-water mark.
    fn push(&self, event: CandleEvent) -> PushOutcome {
        let depth = self.depth.load(Ordering::Relaxed);
        if !event.is_closed && depth >= MAILBOX_HIGH_WATER {
            return PushOutcome::ShedOpen(event);
        }
        if event.is_closed && depth >= MAILBOX_HIGH_WATER {
            warn!(symbol = %event.symbol, depth, "mailbox over high water, closed event queued anyway");
        }

        self.depth.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(event) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::SendError(event)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                PushOutcome::ActorGone(event)
            }
        }
    }
}

/// Consumer half owned by the symbol actor.
struct MailboxReceiver {
    rx: mpsc::UnboundedReceiver<CandleEvent>,
    depth: Arc<AtomicUsize>,
}

impl MailboxReceiver {
    async fn recv(&mut self) -> Option<CandleEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        event
    }
}

// =============================================================================
// Engine handle — mailbox router
// =============================================================================

/// Routes candle events into per-symbol actors, spawning them on demand.
#[derive(Clone)]
pub struct EngineHandle {
    deps: Arc<EngineDeps>,
    mailboxes: Arc<RwLock<HashMap<String, Mailbox>>>,
    stop: watch::Receiver<bool>,
}

impl EngineHandle {
    pub fn new(deps: Arc<EngineDeps>, stop: watch::Receiver<bool>) -> Self {
        Self {
            deps,
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            stop,
        }
    }

    /// Deliver an event to its symbol actor. Non-blocking: the feed reader
    /// calling this is never held up by a congested symbol. Ordering per
    /// symbol is preserved because there is exactly one mailbox per symbol
    /// and one caller (the feed reader).
    pub fn dispatch(&self, event: CandleEvent) {
        let mailbox = self.mailbox_for(&event.symbol);
        match mailbox.push(event) {
            PushOutcome::Queued => {}
            PushOutcome::ShedOpen(ev) => {
                debug!(symbol = %ev.symbol, "mailbox over high water, open event shed");
            }
            PushOutcome::ActorGone(ev) => {
                // Stale mailbox left over from a retired actor; respawn and
                // retry so closed events are never lost. The second push can
                // only fail during shutdown.
                self.mailboxes.write().remove(&ev.symbol);
                let mailbox = self.mailbox_for(&ev.symbol);
                if let PushOutcome::ActorGone(ev) = mailbox.push(ev) {
                    warn!(symbol = %ev.symbol, "symbol actor unavailable, event dropped");
                }
            }
        }
    }

    /// Tear down the actor for an evicted symbol.
    pub fn remove_symbol(&self, symbol: &str) {
        if self.mailboxes.write().remove(symbol).is_some() {
            info!(symbol = %symbol, "symbol actor retired");
        }
    }

    pub fn active_symbols(&self) -> usize {
        self.mailboxes.read().len()
    }

    fn mailbox_for(&self, symbol: &str) -> Mailbox {
        if let Some(mailbox) = self.mailboxes.read().get(symbol) {
            return mailbox.clone();
        }

        let mut boxes = self.mailboxes.write();
        // Raced spawn: another dispatch may have created it meanwhile.
        if let Some(mailbox) = boxes.get(symbol) {
            return mailbox.clone();
        }

        let (mailbox, rx) = Mailbox::new();
        let deps = self.deps.clone();
        let stop = self.stop.clone();
        let sym = symbol.to_string();
        tokio::spawn(async move {
            run_symbol_actor(sym, rx, deps, stop).await;
        });
        boxes.insert(symbol.to_string(), mailbox.clone());
        debug!(symbol = %symbol, "symbol actor spawned");
        mailbox
    }
}

async fn run_symbol_actor(
    symbol: String,
    mut rx: MailboxReceiver,
    deps: Arc<EngineDeps>,
    mut stop: watch::Receiver<bool>,
) {
    let mut processor = SymbolProcessor::new(symbol.clone(), deps.clone());
    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        for alert in processor.on_event(&event).await {
                            deps.sink.submit(alert);
                        }
                    }
                    None => break,
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!(symbol = %symbol, "symbol actor stopped");
}

// =============================================================================
// Per-symbol state machine
// =============================================================================

/// A preliminary spike awaiting resolution on candle close.
#[derive(Debug, Clone)]
struct PendingPreliminary {
    ts_ms: i64,
    volume_ratio: f64,
    current_volume_usdt: f64,
    average_volume_usdt: f64,
}

#[derive(Debug, Default)]
struct PerSymbolState {
    consecutive_long: u32,
    last_alert_ts: HashMap<&'static str, i64>,
    preliminary: Option<PendingPreliminary>,
}

pub struct SymbolProcessor {
    symbol: String,
    deps: Arc<EngineDeps>,
    state: PerSymbolState,
    /// `(analysis_hours, offset_minutes)` the state was built against; a
    /// change invalidates cooldowns, counters, and pending preliminaries.
    window_params: (i64, i64),
}

impl SymbolProcessor {
    pub fn new(symbol: String, deps: Arc<EngineDeps>) -> Self {
        let cfg = deps.config.current();
        Self {
            symbol,
            deps,
            state: PerSymbolState::default(),
            window_params: (cfg.analysis_hours, cfg.offset_minutes),
        }
    }

    /// Process one event and return the alerts it produced, in emission
    /// order.
    pub async fn on_event(&mut self, event: &CandleEvent) -> Vec<Alert> {
        let cfg = self.deps.config.current();

        let params = (cfg.analysis_hours, cfg.offset_minutes);
        if params != self.window_params {
            info!(symbol = %self.symbol, "analysis window changed, detector state reset");
            self.state = PerSymbolState::default();
            self.window_params = params;
        }

        if let Err(e) = event.candle.validate() {
            warn!(symbol = %self.symbol, error = %e, "malformed candle dropped");
            return Vec::new();
        }

        if event.is_closed {
            self.on_closed(&event.candle, &cfg).await
        } else {
            self.on_open(&event.candle, &cfg).await
        }
    }

    // -------------------------------------------------------------------------
    // Phase A — open candle
    // -------------------------------------------------------------------------

    async fn on_open(&mut self, candle: &Candle, cfg: &Config) -> Vec<Alert> {
        if !cfg.volume_alerts_enabled {
            return Vec::new();
        }
        // At most one preliminary in flight per symbol.
        if self.state.preliminary.is_some() {
            return Vec::new();
        }
        if !candle.is_long() {
            return Vec::new();
        }
        let current_usdt = candle.volume_usdt();
        if current_usdt < cfg.min_volume_usdt {
            return Vec::new();
        }

        let Some((ratio, average)) = self.baseline_ratio(candle, cfg, current_usdt).await else {
            return Vec::new();
        };
        if ratio < cfg.volume_multiplier {
            return Vec::new();
        }

        let now = self.deps.time.now_ms();
        self.state.preliminary = Some(PendingPreliminary {
            ts_ms: now,
            volume_ratio: ratio,
            current_volume_usdt: current_usdt,
            average_volume_usdt: average,
        });

        info!(symbol = %self.symbol, ratio = format!("{ratio:.2}"), "preliminary volume signal");
        vec![Alert::new(
            &self.symbol,
            candle.close,
            now,
            None,
            false,
            format!("Preliminary signal: volume exceeded {ratio:.2}x"),
            Some(CandleSnapshot::from(candle)),
            AlertKind::PreliminaryVolumeSpike {
                volume_ratio: ratio,
                current_volume_usdt: current_usdt,
                average_volume_usdt: average,
            },
        )]
    }

    // -------------------------------------------------------------------------
    // Phase B — closed candle
    // -------------------------------------------------------------------------

    async fn on_closed(&mut self, candle: &Candle, cfg: &Config) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let now = self.deps.time.now_ms();
        self.prune_cooldowns(now);

        // Priority evidence must be captured before the preliminary is
        // consumed below.
        let preliminary_ts = self.state.preliminary.as_ref().map(|p| p.ts_ms);

        // 1. consecutive-run counter
        if candle.is_long() {
            self.state.consecutive_long += 1;
        } else {
            self.state.consecutive_long = 0;
        }

        // 2. resolve a pending preliminary into a final signal
        if let Some(pending) = self.state.preliminary.take() {
            let is_true = candle.is_long();
            info!(symbol = %self.symbol, is_true, "final volume signal");
            alerts.push(Alert::new(
                &self.symbol,
                candle.close,
                now,
                Some(now),
                true,
                format!(
                    "Final signal: {} LONG (volume {:.2}x)",
                    if is_true { "true" } else { "false" },
                    pending.volume_ratio
                ),
                Some(CandleSnapshot::from(candle)),
                AlertKind::FinalVolumeSpike {
                    volume_ratio: pending.volume_ratio,
                    current_volume_usdt: pending.current_volume_usdt,
                    average_volume_usdt: pending.average_volume_usdt,
                    is_true_signal: is_true,
                    preliminary_ts_ms: pending.ts_ms,
                },
            ));
        }

        // The structure lookup is shared by every alert on this candle.
        let mut imbalance_cache: Option<Option<Imbalance>> = None;

        // 3. authoritative volume spike
        let mut volume_fields: Option<(f64, f64, f64)> = None;
        let mut volume_imbalance: Option<Imbalance> = None;
        if cfg.volume_alerts_enabled {
            if let Some((ratio, current_usdt, average)) =
                self.validate_volume(candle, cfg, now).await
            {
                let imbalance = self.imbalance(cfg, &mut imbalance_cache).await;
                let order_book_snapshot = if cfg.orderbook_snapshot_on_alert {
                    self.orderbook_snapshot(cfg, now).await
                } else {
                    None
                };

                self.state.last_alert_ts.insert(COOLDOWN_VOLUME, now);
                volume_fields = Some((ratio, current_usdt, average));
                volume_imbalance = imbalance.clone();

                info!(symbol = %self.symbol, ratio = format!("{ratio:.2}"), "volume spike");
                alerts.push(Alert::new(
                    &self.symbol,
                    candle.close,
                    now,
                    Some(now),
                    true,
                    format!("Volume exceeded {ratio:.2}x (true signal)"),
                    Some(CandleSnapshot::from(candle)),
                    AlertKind::VolumeSpike {
                        volume_ratio: ratio,
                        current_volume_usdt: current_usdt,
                        average_volume_usdt: average,
                        is_true_signal: true,
                        has_imbalance: imbalance.is_some(),
                        imbalance,
                        order_book_snapshot,
                    },
                ));
            }
        }

        // 4. consecutive-long run
        let mut consecutive_emitted: Option<u32> = None;
        let mut consecutive_imbalance: Option<Imbalance> = None;
        if cfg.consecutive_alerts_enabled
            && self.state.consecutive_long >= cfg.consecutive_long_count
        {
            let fresh = self
                .state
                .last_alert_ts
                .get(COOLDOWN_CONSECUTIVE)
                .is_none_or(|t| now - t >= cfg.cooldown_ms());
            if fresh {
                let count = self.state.consecutive_long;
                let imbalance = self.imbalance(cfg, &mut imbalance_cache).await;

                self.state.last_alert_ts.insert(COOLDOWN_CONSECUTIVE, now);
                consecutive_emitted = Some(count);
                consecutive_imbalance = imbalance.clone();

                info!(symbol = %self.symbol, count, "consecutive long run");
                alerts.push(Alert::new(
                    &self.symbol,
                    candle.close,
                    now,
                    Some(now),
                    true,
                    format!("{count} consecutive closed LONG candles"),
                    Some(CandleSnapshot::from(candle)),
                    AlertKind::ConsecutiveLong {
                        consecutive_count: count,
                        has_imbalance: imbalance.is_some(),
                        imbalance,
                    },
                ));
            }
        }

        // 5. priority composition: a run plus spike evidence within the run
        if cfg.priority_alerts_enabled {
            if let Some(count) = consecutive_emitted {
                let range_ms = count as i64 * MINUTE_MS;
                let recent_volume = self
                    .state
                    .last_alert_ts
                    .get(COOLDOWN_VOLUME)
                    .is_some_and(|t| now - t <= range_ms);
                let recent_preliminary =
                    preliminary_ts.is_some_and(|t| now - t <= range_ms);

                if recent_volume || recent_preliminary {
                    let has_imbalance =
                        volume_imbalance.is_some() || consecutive_imbalance.is_some();
                    let imbalance = volume_imbalance.or(consecutive_imbalance);
                    let (ratio, current_usdt, average) = match volume_fields {
                        Some((r, c, a)) => (Some(r), Some(c), Some(a)),
                        None => (None, None, None),
                    };

                    info!(symbol = %self.symbol, count, "priority signal");
                    alerts.push(Alert::new(
                        &self.symbol,
                        candle.close,
                        now,
                        Some(now),
                        true,
                        format!(
                            "Priority signal: {count} LONG candles + volume spike{}",
                            if has_imbalance { " + imbalance" } else { "" }
                        ),
                        Some(CandleSnapshot::from(candle)),
                        AlertKind::Priority {
                            consecutive_count: count,
                            volume_ratio: ratio,
                            current_volume_usdt: current_usdt,
                            average_volume_usdt: average,
                            has_imbalance,
                            imbalance,
                        },
                    ));
                }
            }
        }

        alerts
    }

    // -------------------------------------------------------------------------
    // Checks
    // -------------------------------------------------------------------------

    /// Baseline window is anchored at the candle's start, so the candle under
    /// test never contributes to its own average.
    async fn baseline_ratio(
        &self,
        candle: &Candle,
        cfg: &Config,
        current_usdt: f64,
    ) -> Option<(f64, f64)> {
        let volumes = match self
            .deps
            .store
            .historical_baseline(
                &self.symbol,
                cfg.analysis_hours,
                cfg.offset_minutes,
                cfg.volume_type,
                candle.start_ms,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e,
                      "baseline unavailable, volume check skipped");
                return None;
            }
        };

        if volumes.len() < MIN_BASELINE_SAMPLES {
            debug!(symbol = %self.symbol, samples = volumes.len(), "baseline too thin");
            return None;
        }
        let average = volumes.iter().sum::<f64>() / volumes.len() as f64;
        if average <= 0.0 {
            return None;
        }
        Some((current_usdt / average, average))
    }

    /// Full closed-candle volume validation: direction, floor, cooldown,
    /// baseline depth, threshold. Returns `(ratio, current_usdt, average)`.
    async fn validate_volume(
        &self,
        candle: &Candle,
        cfg: &Config,
        now: i64,
    ) -> Option<(f64, f64, f64)> {
        if !candle.is_long() {
            return None;
        }
        let current_usdt = candle.volume_usdt();
        if current_usdt < cfg.min_volume_usdt {
            return None;
        }
        if let Some(last) = self.state.last_alert_ts.get(COOLDOWN_VOLUME) {
            if now - last < cfg.cooldown_ms() {
                debug!(symbol = %self.symbol, "volume spike suppressed by cooldown");
                return None;
            }
        }

        let (ratio, average) = self.baseline_ratio(candle, cfg, current_usdt).await?;
        if ratio < cfg.volume_multiplier {
            return None;
        }
        Some((ratio, current_usdt, average))
    }

    /// Structure lookup over the last ≤ 20 closed candles, cached for the
    /// duration of one closed-candle pass.
    async fn imbalance(
        &self,
        cfg: &Config,
        cache: &mut Option<Option<Imbalance>>,
    ) -> Option<Imbalance> {
        if let Some(cached) = cache {
            return cached.clone();
        }
        let result = match self
            .deps
            .store
            .recent_closed(&self.symbol, IMBALANCE_LOOKBACK)
            .await
        {
            Ok(window) if window.len() >= IMBALANCE_MIN_CANDLES => {
                ImbalanceAnalyzer::analyze_all(&window, cfg)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "imbalance window unavailable");
                None
            }
        };
        *cache = Some(result.clone());
        result
    }

    /// Best-effort top-of-book fetch; absence is not an error.
    async fn orderbook_snapshot(&self, cfg: &Config, now: i64) -> Option<OrderBookSnapshot> {
        if !cfg.orderbook_enabled {
            return None;
        }
        match self.deps.rest.orderbook_snapshot(&self.symbol, now).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "orderbook snapshot unavailable");
                None
            }
        }
    }

    fn prune_cooldowns(&mut self, now: i64) {
        self.state
            .last_alert_ts
            .retain(|_, ts| now - *ts < COOLDOWN_TTL_MS);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_sink::alert_channel;
    use crate::store::Database;
    use crate::types::align_down_to_minute;
    use std::time::Duration;

    struct Fixture {
        deps: Arc<EngineDeps>,
        /// Start of the minute the tests treat as "current".
        minute: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let (sink, _rx) = alert_channel();
        let time = Arc::new(TimeService::new());
        let minute = align_down_to_minute(time.now_ms());
        let deps = Arc::new(EngineDeps {
            store: CandleStore::new(db.pool),
            sink,
            rest: BybitRest::new(),
            time,
            config: Arc::new(ConfigHandle::new(Config::default())),
        });
        Fixture { deps, minute }
    }

    fn closed_bar(minute_ms: i64, open: f64, close: f64, volume: f64) -> Candle {
        Candle {
            start_ms: minute_ms,
            end_ms: minute_ms + MINUTE_MS,
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume,
            is_closed: true,
        }
    }

    /// 30 closed long candles of 500 USDT each in the hour before `minute`.
    async fn seed_baseline(fx: &Fixture, symbol: &str) {
        for i in 1..=30 {
            let minute_ms = fx.minute - i * MINUTE_MS;
            // close 10.0, volume 50 → 500 USDT, long
            let bar = closed_bar(minute_ms, 9.0, 10.0, 50.0);
            fx.deps.store.upsert(symbol, &bar).await.unwrap();
        }
    }

    fn event(symbol: &str, candle: Candle, is_closed: bool) -> CandleEvent {
        CandleEvent {
            symbol: symbol.to_string(),
            candle,
            is_closed,
        }
    }

    fn processor(fx: &Fixture, symbol: &str) -> SymbolProcessor {
        SymbolProcessor::new(symbol.to_string(), fx.deps.clone())
    }

    // --- S1: spike confirmed long ------------------------------------------

    #[tokio::test]
    async fn spike_confirmed_long_emits_preliminary_final_and_volume() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        // open tick: 12 × 110 = 1320 USDT against a 500 avg → 2.64x
        let mut open_candle = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        open_candle.is_closed = false;
        let alerts = proc.on_event(&event("BTCUSDT", open_candle, false)).await;
        assert_eq!(alerts.len(), 1);
        match &alerts[0].kind {
            AlertKind::PreliminaryVolumeSpike { volume_ratio, .. } => {
                assert!((volume_ratio - 2.64).abs() < 1e-9);
            }
            other => panic!("expected preliminary, got {other:?}"),
        }
        assert!(!alerts[0].is_closed);

        // closed tick on the same minute, still long
        let closed = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        let alerts = proc.on_event(&event("BTCUSDT", closed, true)).await;
        assert_eq!(alerts.len(), 2);
        match &alerts[0].kind {
            AlertKind::FinalVolumeSpike {
                is_true_signal,
                volume_ratio,
                ..
            } => {
                assert!(is_true_signal);
                assert!((volume_ratio - 2.64).abs() < 1e-9);
            }
            other => panic!("expected final, got {other:?}"),
        }
        match &alerts[1].kind {
            AlertKind::VolumeSpike {
                volume_ratio,
                current_volume_usdt,
                average_volume_usdt,
                is_true_signal,
                ..
            } => {
                assert!((volume_ratio - 2.64).abs() < 1e-9);
                assert!((current_volume_usdt - 1320.0).abs() < 1e-9);
                assert!((average_volume_usdt - 500.0).abs() < 1e-9);
                assert!(is_true_signal);
            }
            other => panic!("expected volume spike, got {other:?}"),
        }
    }

    // --- S2: spike resolved as a false signal -------------------------------

    #[tokio::test]
    async fn spike_resolved_short_emits_false_final_only() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        let mut open_candle = closed_bar(fx.minute, 100.0, 105.0, 13.0);
        open_candle.is_closed = false;
        let alerts = proc.on_event(&event("BTCUSDT", open_candle, false)).await;
        assert_eq!(alerts.len(), 1);

        // the minute closes short
        let closed = closed_bar(fx.minute, 100.0, 99.0, 13.0);
        let alerts = proc.on_event(&event("BTCUSDT", closed, true)).await;
        assert_eq!(alerts.len(), 1);
        match &alerts[0].kind {
            AlertKind::FinalVolumeSpike { is_true_signal, .. } => assert!(!is_true_signal),
            other => panic!("expected final, got {other:?}"),
        }
        // a short candle resets the run counter
        assert_eq!(proc.state.consecutive_long, 0);
    }

    #[tokio::test]
    async fn final_requires_pending_preliminary() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        // closed spike with no preliminary before it: volume spike only
        let closed = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        let alerts = proc.on_event(&event("BTCUSDT", closed, true)).await;
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0].kind, AlertKind::VolumeSpike { .. }));
    }

    #[tokio::test]
    async fn only_one_preliminary_in_flight() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        let mut tick = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        tick.is_closed = false;
        let first = proc.on_event(&event("BTCUSDT", tick.clone(), false)).await;
        assert_eq!(first.len(), 1);
        let second = proc.on_event(&event("BTCUSDT", tick, false)).await;
        assert!(second.is_empty());
    }

    // --- S3: consecutive run with cooldown and reset ------------------------

    #[tokio::test]
    async fn consecutive_run_alerts_once_per_cooldown_and_resets() {
        let fx = fixture().await;
        let mut proc = processor(&fx, "ETHUSDT");

        // four long candles: too short for a run alert (volume below floor
        // keeps the volume detector quiet)
        for i in 0..4 {
            let bar = closed_bar(fx.minute + i * MINUTE_MS, 10.0, 10.5, 10.0);
            let alerts = proc.on_event(&event("ETHUSDT", bar, true)).await;
            assert!(alerts.is_empty(), "no alert expected at run length {}", i + 1);
        }

        // fifth long candle completes the run
        let bar = closed_bar(fx.minute + 4 * MINUTE_MS, 10.0, 10.5, 10.0);
        let alerts = proc.on_event(&event("ETHUSDT", bar, true)).await;
        assert_eq!(alerts.len(), 1);
        match &alerts[0].kind {
            AlertKind::ConsecutiveLong {
                consecutive_count, ..
            } => assert_eq!(*consecutive_count, 5),
            other => panic!("expected consecutive, got {other:?}"),
        }

        // sixth long candle arrives inside the cooldown window
        let bar = closed_bar(fx.minute + 5 * MINUTE_MS, 10.0, 10.5, 10.0);
        let alerts = proc.on_event(&event("ETHUSDT", bar, true)).await;
        assert!(alerts.is_empty());
        assert_eq!(proc.state.consecutive_long, 6);

        // a short candle resets the counter to zero
        let bar = closed_bar(fx.minute + 6 * MINUTE_MS, 10.5, 10.0, 10.0);
        let alerts = proc.on_event(&event("ETHUSDT", bar, true)).await;
        assert!(alerts.is_empty());
        assert_eq!(proc.state.consecutive_long, 0);
    }

    // --- S4: priority composition -------------------------------------------

    #[tokio::test]
    async fn priority_composes_run_and_spike() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        // four quiet long candles ahead of the current minute
        for i in (1..=4).rev() {
            // volume 1 × close ≈ 10 USDT, far below the floor
            let bar = closed_bar(fx.minute - (30 + i) * MINUTE_MS, 10.0, 10.5, 1.0);
            let alerts = proc.on_event(&event("BTCUSDT", bar, true)).await;
            assert!(alerts.is_empty());
        }

        // spiking fifth long candle: volume spike + run of 5 + priority
        let bar = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        let alerts = proc.on_event(&event("BTCUSDT", bar, true)).await;
        let kinds: Vec<&str> = alerts.iter().map(|a| a.kind.type_name()).collect();
        assert_eq!(kinds, vec!["volume_spike", "consecutive_long", "priority"]);

        match &alerts[2].kind {
            AlertKind::Priority {
                consecutive_count,
                volume_ratio,
                has_imbalance,
                ..
            } => {
                assert_eq!(*consecutive_count, 5);
                let ratio = volume_ratio.expect("priority carries the spike ratio");
                assert!(ratio >= 2.0, "ratio={ratio}");
                assert!(!has_imbalance);
            }
            other => panic!("expected priority, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn priority_requires_volume_evidence() {
        let fx = fixture().await;
        let mut proc = processor(&fx, "ETHUSDT");

        // five quiet long candles: run fires, but there was never a spike
        let mut last = Vec::new();
        for i in 0..5 {
            let bar = closed_bar(fx.minute + i * MINUTE_MS, 10.0, 10.5, 10.0);
            last = proc.on_event(&event("ETHUSDT", bar, true)).await;
        }
        let kinds: Vec<&str> = last.iter().map(|a| a.kind.type_name()).collect();
        assert_eq!(kinds, vec!["consecutive_long"]);
    }

    #[tokio::test]
    async fn priority_accepts_recent_preliminary_as_evidence() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        // a run of four quiet candles first
        for i in (1..=4).rev() {
            let bar = closed_bar(fx.minute - (30 + i) * MINUTE_MS, 10.0, 10.5, 1.0);
            proc.on_event(&event("BTCUSDT", bar, true)).await;
        }

        // preliminary fires on the open tick of the fifth minute
        let mut open_tick = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        open_tick.is_closed = false;
        let alerts = proc.on_event(&event("BTCUSDT", open_tick, false)).await;
        assert_eq!(alerts.len(), 1);

        // the fifth minute closes long but with modest volume: no fresh
        // spike, yet the preliminary counts as evidence
        let closed = closed_bar(fx.minute, 100.0, 100.5, 1.0);
        let alerts = proc.on_event(&event("BTCUSDT", closed, true)).await;
        let kinds: Vec<&str> = alerts.iter().map(|a| a.kind.type_name()).collect();
        assert_eq!(kinds, vec!["final_volume_spike", "consecutive_long", "priority"]);
        match &alerts[2].kind {
            AlertKind::Priority { volume_ratio, .. } => {
                // no authoritative spike on this candle → no volume fields
                assert!(volume_ratio.is_none());
            }
            other => panic!("expected priority, got {other:?}"),
        }
    }

    // --- cooldown discipline -------------------------------------------------

    #[tokio::test]
    async fn volume_spike_cooldown_suppresses_back_to_back_alerts() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut proc = processor(&fx, "BTCUSDT");

        let first = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        let alerts = proc.on_event(&event("BTCUSDT", first, true)).await;
        assert_eq!(alerts.len(), 1);

        let second = closed_bar(fx.minute + MINUTE_MS, 100.0, 110.0, 12.0);
        let alerts = proc.on_event(&event("BTCUSDT", second, true)).await;
        assert!(alerts.is_empty(), "cooldown must suppress the second spike");
    }

    // --- degradation ----------------------------------------------------------

    #[tokio::test]
    async fn storage_outage_produces_no_alerts_and_no_panic() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = db.pool.clone();
        let (sink, _rx) = alert_channel();
        let time = Arc::new(TimeService::new());
        let minute = align_down_to_minute(time.now_ms());
        let deps = Arc::new(EngineDeps {
            store: CandleStore::new(pool.clone()),
            sink,
            rest: BybitRest::new(),
            time,
            config: Arc::new(ConfigHandle::new(Config::default())),
        });
        pool.close().await;

        let mut proc = SymbolProcessor::new("BTCUSDT".to_string(), deps);
        let mut open_tick = closed_bar(minute, 100.0, 110.0, 12.0);
        open_tick.is_closed = false;
        let alerts = proc.on_event(&event("BTCUSDT", open_tick, false)).await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn disabled_volume_flag_silences_phase_a_and_spikes() {
        let fx = fixture().await;
        seed_baseline(&fx, "BTCUSDT").await;
        let mut cfg = Config::default();
        cfg.volume_alerts_enabled = false;
        fx.deps.config.install(cfg);
        let mut proc = processor(&fx, "BTCUSDT");

        let mut open_tick = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        open_tick.is_closed = false;
        assert!(proc.on_event(&event("BTCUSDT", open_tick, false)).await.is_empty());

        let closed = closed_bar(fx.minute, 100.0, 110.0, 12.0);
        assert!(proc.on_event(&event("BTCUSDT", closed, true)).await.is_empty());
    }

    #[tokio::test]
    async fn window_change_resets_detector_state() {
        let fx = fixture().await;
        let mut proc = processor(&fx, "ETHUSDT");

        for i in 0..3 {
            let bar = closed_bar(fx.minute + i * MINUTE_MS, 10.0, 10.5, 10.0);
            proc.on_event(&event("ETHUSDT", bar, true)).await;
        }
        assert_eq!(proc.state.consecutive_long, 3);

        let mut cfg = Config::default();
        cfg.analysis_hours = 4;
        fx.deps.config.install(cfg);

        let bar = closed_bar(fx.minute + 3 * MINUTE_MS, 10.0, 10.5, 10.0);
        proc.on_event(&event("ETHUSDT", bar, true)).await;
        // reset happened before the candle was applied
        assert_eq!(proc.state.consecutive_long, 1);
    }

    // --- mailbox policy -------------------------------------------------------

    #[tokio::test]
    async fn open_events_shed_at_high_water_closed_events_never() {
        let (mailbox, mut rx) = Mailbox::new();

        // Fill to the mark with open events, then keep pushing.
        let mut queued_open = 0;
        let mut shed_open = 0;
        for i in 0..(MAILBOX_HIGH_WATER + 10) {
            let mut candle = closed_bar((i as i64 + 1) * MINUTE_MS, 10.0, 10.5, 1.0);
            candle.is_closed = false;
            match mailbox.push(event("BTCUSDT", candle, false)) {
                PushOutcome::Queued => queued_open += 1,
                PushOutcome::ShedOpen(_) => shed_open += 1,
                PushOutcome::ActorGone(_) => panic!("receiver is alive"),
            }
        }
        assert_eq!(queued_open, MAILBOX_HIGH_WATER);
        assert_eq!(shed_open, 10);

        // Closed events are enqueued even over the mark.
        for i in 0..3 {
            let candle = closed_bar((i + 1) * MINUTE_MS, 10.0, 10.5, 1.0);
            assert!(matches!(
                mailbox.push(event("BTCUSDT", candle, true)),
                PushOutcome::Queued
            ));
        }

        // Everything queued comes out, closed events last and intact.
        let mut received = Vec::new();
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            received.push(ev);
            if received.len() == MAILBOX_HIGH_WATER + 3 {
                break;
            }
        }
        assert_eq!(received.len(), MAILBOX_HIGH_WATER + 3);
        assert_eq!(received.iter().filter(|e| e.is_closed).count(), 3);

        // Draining freed the queue: open events flow again.
        let mut candle = closed_bar(MINUTE_MS, 10.0, 10.5, 1.0);
        candle.is_closed = false;
        assert!(matches!(
            mailbox.push(event("BTCUSDT", candle, false)),
            PushOutcome::Queued
        ));
    }

    #[test]
    fn push_to_retired_actor_hands_the_event_back() {
        let (mailbox, rx) = Mailbox::new();
        drop(rx);
        let candle = closed_bar(MINUTE_MS, 10.0, 10.5, 1.0);
        match mailbox.push(event("BTCUSDT", candle, true)) {
            PushOutcome::ActorGone(ev) => assert!(ev.is_closed),
            _ => panic!("expected ActorGone"),
        }
    }

    // --- actor plumbing -------------------------------------------------------

    #[tokio::test]
    async fn dispatched_event_reaches_sink_through_actor() {
        let db = Database::connect_in_memory().await.unwrap();
        let (sink, mut rx) = alert_channel();
        let time = Arc::new(TimeService::new());
        let minute = align_down_to_minute(time.now_ms());
        let store = CandleStore::new(db.pool);
        for i in 1..=30 {
            let bar = closed_bar(minute - i * MINUTE_MS, 9.0, 10.0, 50.0);
            store.upsert("BTCUSDT", &bar).await.unwrap();
        }
        let deps = Arc::new(EngineDeps {
            store,
            sink,
            rest: BybitRest::new(),
            time,
            config: Arc::new(ConfigHandle::new(Config::default())),
        });
        let (_stop_tx, stop_rx) = watch::channel(false);
        let engine = EngineHandle::new(deps, stop_rx);

        engine.dispatch(event("BTCUSDT", closed_bar(minute, 100.0, 110.0, 12.0), true));

        let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("alert within deadline")
            .expect("sink open");
        assert_eq!(alert.kind.type_name(), "volume_spike");
        assert_eq!(engine.active_symbols(), 1);

        engine.remove_symbol("BTCUSDT");
        assert_eq!(engine.active_symbols(), 0);
    }
}
