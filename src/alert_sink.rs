// =============================================================================
// Alert sink — bounded fan-out to store, bus, and notifier
// =============================================================================
//
// The signal engine pushes finished alerts into a bounded channel and moves
// on; it is never blocked by a slow downstream. The dispatcher delivers each
// alert to persistence, the client bus, and the notification channel with
// independent failure domains.
// =============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::alerts::Alert;
use crate::config::ConfigHandle;
use crate::event_bus::EventBus;
use crate::notifier::TelegramNotifier;
use crate::store::AlertStore;
use crate::time_service::TimeService;

/// Channel capacity; alerts beyond this are dropped with a warning.
const SINK_CAPACITY: usize = 1024;
/// Drain budget after the stop signal.
const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Cloneable producer half handed to the signal engine.
#[derive(Clone)]
pub struct AlertSink {
    tx: mpsc::Sender<Alert>,
}

impl AlertSink {
    /// Non-blocking submit. Saturation drops the alert (warned) rather than
    /// stalling the per-symbol actor.
    pub fn submit(&self, alert: Alert) {
        if let Err(e) = self.tx.try_send(alert) {
            match e {
                mpsc::error::TrySendError::Full(alert) => {
                    warn!(symbol = %alert.symbol, kind = alert.kind.type_name(),
                          "alert sink saturated, alert dropped");
                }
                mpsc::error::TrySendError::Closed(alert) => {
                    warn!(symbol = %alert.symbol, "alert sink closed, alert dropped");
                }
            }
        }
    }
}

pub fn alert_channel() -> (AlertSink, mpsc::Receiver<Alert>) {
    let (tx, rx) = mpsc::channel(SINK_CAPACITY);
    (AlertSink { tx }, rx)
}

// =============================================================================
// Dispatcher task
// =============================================================================

/// Deliver alerts until the stop signal, then drain briefly and exit.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<Alert>,
    alert_store: AlertStore,
    bus: EventBus,
    notifier: Arc<TelegramNotifier>,
    time: Arc<TimeService>,
    config: Arc<ConfigHandle>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_alert = rx.recv() => {
                match maybe_alert {
                    Some(alert) => {
                        deliver(&alert, &alert_store, &bus, &notifier, &time, &config).await;
                    }
                    None => {
                        info!("alert sink channel closed, dispatcher exiting");
                        return;
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }

    // Drain what is already queued, bounded by the grace budget.
    info!("alert dispatcher draining");
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    while let Ok(Some(alert)) =
        tokio::time::timeout_at(deadline, rx.recv()).await
    {
        deliver(&alert, &alert_store, &bus, &notifier, &time, &config).await;
    }
    info!("alert dispatcher stopped");
}

/// One alert, three downstreams, no shared fate.
async fn deliver(
    alert: &Alert,
    alert_store: &AlertStore,
    bus: &EventBus,
    notifier: &TelegramNotifier,
    time: &TimeService,
    config: &ConfigHandle,
) {
    let persist = async {
        if let Err(e) = alert_store.save(alert).await {
            warn!(symbol = %alert.symbol, error = %e, "alert persistence failed");
        }
    };

    let broadcast = async {
        bus.new_alert(alert, time.now_ms(), time.synced());
    };

    let notify = async {
        if config.current().notification_enabled {
            notifier.send_alert(alert).await;
        }
    };

    tokio::join!(persist, broadcast, notify);
    debug!(symbol = %alert.symbol, kind = alert.kind.type_name(), "alert delivered");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;

    fn sample(symbol: &str) -> Alert {
        Alert::new(
            symbol,
            1.0,
            1_700_000_000_000,
            None,
            false,
            "m",
            None,
            AlertKind::PreliminaryVolumeSpike {
                volume_ratio: 2.0,
                current_volume_usdt: 100.0,
                average_volume_usdt: 50.0,
            },
        )
    }

    #[tokio::test]
    async fn submit_preserves_emission_order() {
        let (sink, mut rx) = alert_channel();
        sink.submit(sample("AUSDT"));
        sink.submit(sample("BUSDT"));
        sink.submit(sample("CUSDT"));
        assert_eq!(rx.recv().await.unwrap().symbol, "AUSDT");
        assert_eq!(rx.recv().await.unwrap().symbol, "BUSDT");
        assert_eq!(rx.recv().await.unwrap().symbol, "CUSDT");
    }

    #[tokio::test]
    async fn saturation_drops_instead_of_blocking() {
        let (sink, rx) = alert_channel();
        // fill past capacity without a consumer; submit must return promptly
        for _ in 0..(SINK_CAPACITY + 10) {
            sink.submit(sample("XUSDT"));
        }
        drop(rx);
        // closed channel must also not panic
        sink.submit(sample("XUSDT"));
    }
}
