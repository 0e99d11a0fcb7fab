// =============================================================================
// Telegram notifier — kind-specific alert formatting
// =============================================================================
//
// Best-effort delivery to a Telegram chat via the Bot API. Disabled entirely
// when credentials are absent; failures are logged and never propagate into
// the alert pipeline.
// =============================================================================

use std::time::Duration;

use chrono::DateTime;
use tracing::{debug, warn};

use crate::alerts::{Alert, AlertKind};

pub struct TelegramNotifier {
    token: Option<String>,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    /// Reads `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID` from the environment.
    /// Missing credentials produce a disabled notifier.
    pub fn from_env() -> Self {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty());
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
        if token.is_none() || chat_id.is_empty() {
            debug!("telegram credentials absent, notifier disabled");
        }
        Self {
            token: token.filter(|_| !chat_id.is_empty()),
            chat_id,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build telegram HTTP client"),
        }
    }

    pub fn enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Format and send one alert. Returns quietly when disabled.
    pub async fn send_alert(&self, alert: &Alert) {
        let Some(token) = &self.token else {
            return;
        };
        let text = format_alert(alert);
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(symbol = %alert.symbol, kind = alert.kind.type_name(), "telegram alert sent");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram rejected the message");
            }
            Err(e) => {
                warn!(error = %e, "telegram send failed");
            }
        }
    }
}

fn format_time(ts_ms: i64) -> String {
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

/// One message per alert kind, HTML-formatted.
fn format_alert(alert: &Alert) -> String {
    let time = format_time(alert.ts_ms);
    match &alert.kind {
        AlertKind::PreliminaryVolumeSpike {
            volume_ratio,
            current_volume_usdt,
            average_volume_usdt,
        } => format!(
            "⚡ <b>Preliminary volume signal</b>\n\
             Symbol: <b>{}</b>\n\
             Price: {}\n\
             Volume: {:.0} USDT ({:.2}x of {:.0} avg)\n\
             Time: {}",
            alert.symbol, alert.price, current_volume_usdt, volume_ratio, average_volume_usdt, time
        ),
        AlertKind::FinalVolumeSpike {
            volume_ratio,
            is_true_signal,
            preliminary_ts_ms,
            ..
        } => format!(
            "{} <b>Final volume signal</b>\n\
             Symbol: <b>{}</b>\n\
             Price: {}\n\
             Result: {} ({:.2}x volume)\n\
             Preliminary at: {}\n\
             Time: {}",
            if *is_true_signal { "✅" } else { "❌" },
            alert.symbol,
            alert.price,
            if *is_true_signal { "true LONG" } else { "false LONG" },
            volume_ratio,
            format_time(*preliminary_ts_ms),
            time
        ),
        AlertKind::VolumeSpike {
            volume_ratio,
            current_volume_usdt,
            average_volume_usdt,
            has_imbalance,
            ..
        } => format!(
            "🚨 <b>Volume spike</b>\n\
             Symbol: <b>{}</b>\n\
             Price: {}\n\
             Volume: {:.0} USDT ({:.2}x of {:.0} avg){}\n\
             Time: {}",
            alert.symbol,
            alert.price,
            current_volume_usdt,
            volume_ratio,
            average_volume_usdt,
            if *has_imbalance { "\nImbalance: yes" } else { "" },
            time
        ),
        AlertKind::ConsecutiveLong {
            consecutive_count,
            has_imbalance,
            ..
        } => format!(
            "📈 <b>Consecutive LONG candles</b>\n\
             Symbol: <b>{}</b>\n\
             Price: {}\n\
             Run: {} closed candles{}\n\
             Time: {}",
            alert.symbol,
            alert.price,
            consecutive_count,
            if *has_imbalance { "\nImbalance: yes" } else { "" },
            time
        ),
        AlertKind::Priority {
            consecutive_count,
            volume_ratio,
            has_imbalance,
            ..
        } => {
            let mut text = format!(
                "🔥 <b>Priority signal</b>\n\
                 Symbol: <b>{}</b>\n\
                 Price: {}\n\
                 Run: {} LONG candles + volume spike",
                alert.symbol, alert.price, consecutive_count
            );
            if let Some(ratio) = volume_ratio {
                text.push_str(&format!(" ({ratio:.2}x)"));
            }
            if *has_imbalance {
                text.push_str("\nImbalance: yes");
            }
            text.push_str(&format!("\nTime: {time}"));
            text
        }
    }
}
