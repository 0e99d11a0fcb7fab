// =============================================================================
// Time service — sub-second UTC via trusted time servers + exchange clock
// =============================================================================
//
// All quantised-time decisions (candle closure, window boundaries) go through
// this service. It keeps two offsets against the local clock:
//
//   * trusted UTC servers (worldtimeapi / timeapi.io), refreshed hourly;
//   * the venue's /v5/market/time, refreshed every five minutes.
//
// `now_ms` prefers the trusted offset while fresh, then the exchange offset,
// then falls back to plain system UTC. Sync failures never block a caller;
// a fetch's network round-trip is halved and subtracted from the sample.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::align_down_to_minute;

/// Trusted time servers, tried in order.
const TIME_SOURCES: &[(TimeSourceKind, &str)] = &[
    (
        TimeSourceKind::WorldTimeApi,
        "http://worldtimeapi.org/api/timezone/UTC",
    ),
    (
        TimeSourceKind::TimeApiIo,
        "https://timeapi.io/api/Time/current/zone?timeZone=UTC",
    ),
];

const EXCHANGE_TIME_URL: &str = "https://api.bybit.com/v5/market/time";

/// Refresh cadence for the trusted servers (seconds).
const TRUSTED_SYNC_INTERVAL_SECS: i64 = 3_600;
/// Refresh cadence for the exchange clock (seconds).
const EXCHANGE_SYNC_INTERVAL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeSourceKind {
    WorldTimeApi,
    TimeApiIo,
}

// =============================================================================
// TimeService
// =============================================================================

pub struct TimeService {
    /// System UTC milliseconds captured at construction.
    boot_wall_ms: i64,
    /// Monotonic instant paired with `boot_wall_ms`.
    boot_instant: Instant,
    /// trusted_utc − local_utc, milliseconds.
    trusted_offset_ms: AtomicI64,
    /// exchange_utc − local_utc, milliseconds.
    exchange_offset_ms: AtomicI64,
    /// Local ms of the last successful trusted sync; 0 = never.
    trusted_synced_at: AtomicI64,
    /// Local ms of the last successful exchange sync; 0 = never.
    exchange_synced_at: AtomicI64,
    client: reqwest::Client,
}

/// Snapshot of the sync state for the API and the client bus.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_synced: bool,
    pub trusted_synced: bool,
    pub exchange_synced: bool,
    pub offset_ms: i64,
    pub server_time: i64,
}

impl TimeService {
    pub fn new() -> Self {
        let boot_wall_ms = chrono::Utc::now().timestamp_millis();
        Self {
            boot_wall_ms,
            boot_instant: Instant::now(),
            trusted_offset_ms: AtomicI64::new(0),
            exchange_offset_ms: AtomicI64::new(0),
            trusted_synced_at: AtomicI64::new(0),
            exchange_synced_at: AtomicI64::new(0),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build time sync HTTP client"),
        }
    }

    /// Local UTC milliseconds derived from the monotonic clock, immune to
    /// system clock steps after startup.
    fn local_now_ms(&self) -> i64 {
        self.boot_wall_ms + self.boot_instant.elapsed().as_millis() as i64
    }

    /// Best-known UTC milliseconds.
    pub fn now_ms(&self) -> i64 {
        let local = self.local_now_ms();
        if self.trusted_fresh(local) {
            local + self.trusted_offset_ms.load(Ordering::Relaxed)
        } else if self.exchange_fresh(local) {
            local + self.exchange_offset_ms.load(Ordering::Relaxed)
        } else {
            local
        }
    }

    /// A candle is closed once its end boundary is in the past.
    pub fn is_candle_closed(&self, end_ms: i64) -> bool {
        self.now_ms() >= end_ms
    }

    /// Start of the current minute.
    pub fn current_minute_ms(&self) -> i64 {
        align_down_to_minute(self.now_ms())
    }

    fn trusted_fresh(&self, local: i64) -> bool {
        let at = self.trusted_synced_at.load(Ordering::Relaxed);
        at > 0 && local - at < 2 * TRUSTED_SYNC_INTERVAL_SECS * 1000
    }

    fn exchange_fresh(&self, local: i64) -> bool {
        let at = self.exchange_synced_at.load(Ordering::Relaxed);
        at > 0 && local - at < 2 * EXCHANGE_SYNC_INTERVAL_SECS * 1000
    }

    /// True while at least one source is within twice its refresh interval.
    pub fn synced(&self) -> bool {
        let local = self.local_now_ms();
        self.trusted_fresh(local) || self.exchange_fresh(local)
    }

    pub fn sync_status(&self) -> SyncStatus {
        let local = self.local_now_ms();
        let trusted = self.trusted_fresh(local);
        let exchange = self.exchange_fresh(local);
        let offset_ms = if trusted {
            self.trusted_offset_ms.load(Ordering::Relaxed)
        } else if exchange {
            self.exchange_offset_ms.load(Ordering::Relaxed)
        } else {
            0
        };
        SyncStatus {
            is_synced: trusted || exchange,
            trusted_synced: trusted,
            exchange_synced: exchange,
            offset_ms,
            server_time: self.now_ms(),
        }
    }

    // -------------------------------------------------------------------------
    // Sync passes
    // -------------------------------------------------------------------------

    /// Query the trusted servers in order; the first usable answer wins.
    pub async fn sync_trusted(&self) -> bool {
        for (kind, url) in TIME_SOURCES {
            let before = self.local_now_ms();
            let resp = match self.client.get(*url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url, error = %e, "time server unreachable");
                    continue;
                }
            };
            let body: Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(url = %url, error = %e, "time server sent unparseable body");
                    continue;
                }
            };
            let after = self.local_now_ms();

            let Some(server_ms) = extract_utc_ms(*kind, &body) else {
                warn!(url = %url, "time server response missing timestamp");
                continue;
            };
            if !plausible_utc_ms(server_ms) {
                warn!(url = %url, server_ms, "time server returned implausible timestamp");
                continue;
            }

            let midpoint = before + (after - before) / 2;
            let offset = server_ms - midpoint;
            self.trusted_offset_ms.store(offset, Ordering::Relaxed);
            self.trusted_synced_at.store(after, Ordering::Relaxed);
            info!(url = %url, offset_ms = offset, "trusted UTC sync ok");
            return true;
        }
        warn!("all trusted time servers failed");
        false
    }

    /// Query the venue's server time endpoint.
    pub async fn sync_exchange(&self) -> bool {
        let before = self.local_now_ms();
        let body: Value = match self
            .client
            .get(EXCHANGE_TIME_URL)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "exchange time body unparseable");
                    return false;
                }
            },
            Err(e) => {
                warn!(error = %e, "exchange time fetch failed");
                return false;
            }
        };
        let after = self.local_now_ms();

        if body["retCode"].as_i64() != Some(0) {
            warn!(ret_msg = ?body["retMsg"], "exchange time returned an API error");
            return false;
        }
        let Some(server_ms) = exchange_time_ms(&body["result"]) else {
            warn!("exchange time response missing fields");
            return false;
        };
        if !plausible_utc_ms(server_ms) {
            warn!(server_ms, "exchange returned implausible timestamp");
            return false;
        }

        let midpoint = before + (after - before) / 2;
        let offset = server_ms - midpoint;
        self.exchange_offset_ms.store(offset, Ordering::Relaxed);
        self.exchange_synced_at.store(after, Ordering::Relaxed);
        debug!(offset_ms = offset, "exchange time sync ok");
        true
    }

    #[cfg(test)]
    fn force_trusted(&self, offset_ms: i64) {
        self.trusted_offset_ms.store(offset_ms, Ordering::Relaxed);
        self.trusted_synced_at
            .store(self.local_now_ms(), Ordering::Relaxed);
    }

    #[cfg(test)]
    fn force_exchange(&self, offset_ms: i64) {
        self.exchange_offset_ms.store(offset_ms, Ordering::Relaxed);
        self.exchange_synced_at
            .store(self.local_now_ms(), Ordering::Relaxed);
    }
}

impl Default for TimeService {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Sanity window: 2023..2033.
fn plausible_utc_ms(ms: i64) -> bool {
    (1_700_000_000_000..2_000_000_000_000).contains(&ms)
}

fn extract_utc_ms(kind: TimeSourceKind, body: &Value) -> Option<i64> {
    match kind {
        TimeSourceKind::WorldTimeApi => body["unixtime"].as_i64().map(|s| s * 1000),
        TimeSourceKind::TimeApiIo => {
            let s = body["dateTime"].as_str()?;
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
    }
}

/// `{timeSecond, timeNano}` (strings) → milliseconds.
fn exchange_time_ms(result: &Value) -> Option<i64> {
    let secs: i64 = result["timeSecond"].as_str()?.parse().ok()?;
    let nanos: i64 = result["timeNano"].as_str()?.parse().ok()?;
    Some(secs * 1000 + (nanos / 1_000_000) % 1000)
}

// =============================================================================
// Background sync task
// =============================================================================

/// Periodic sync loop: trusted servers hourly, the exchange every 5 minutes,
/// both immediately at startup. Checks once a minute; runs until `stop`.
pub async fn run_time_sync(service: std::sync::Arc<TimeService>, mut stop: watch::Receiver<bool>) {
    service.sync_trusted().await;
    service.sync_exchange().await;

    let mut last_trusted = service.local_now_ms();
    let mut last_exchange = last_trusted;
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("time sync stopping");
                    return;
                }
            }
        }

        let local = service.local_now_ms();
        if local - last_trusted >= TRUSTED_SYNC_INTERVAL_SECS * 1000 {
            service.sync_trusted().await;
            last_trusted = local;
        }
        if local - last_exchange >= EXCHANGE_SYNC_INTERVAL_SECS * 1000 {
            service.sync_exchange().await;
            last_exchange = local;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MINUTE_MS;
    use serde_json::json;

    #[test]
    fn unsynced_service_falls_back_to_local() {
        let ts = TimeService::new();
        assert!(!ts.synced());
        let diff = (ts.now_ms() - ts.local_now_ms()).abs();
        assert!(diff <= 5, "fallback should track local clock, diff={diff}");
    }

    #[test]
    fn trusted_offset_takes_priority() {
        let ts = TimeService::new();
        ts.force_exchange(-3_000);
        ts.force_trusted(5_000);
        let diff = ts.now_ms() - ts.local_now_ms();
        assert!((diff - 5_000).abs() <= 5, "diff={diff}");
        assert!(ts.synced());
        let status = ts.sync_status();
        assert!(status.trusted_synced);
        assert_eq!(status.offset_ms, 5_000);
    }

    #[test]
    fn exchange_offset_used_when_trusted_is_stale() {
        let ts = TimeService::new();
        ts.force_exchange(-3_000);
        let diff = ts.now_ms() - ts.local_now_ms();
        assert!((diff + 3_000).abs() <= 5, "diff={diff}");
        let status = ts.sync_status();
        assert!(!status.trusted_synced);
        assert!(status.exchange_synced);
    }

    #[test]
    fn candle_closure_follows_now() {
        let ts = TimeService::new();
        let now = ts.now_ms();
        assert!(ts.is_candle_closed(now - 1));
        assert!(!ts.is_candle_closed(now + MINUTE_MS));
    }

    #[test]
    fn current_minute_is_aligned() {
        let ts = TimeService::new();
        assert_eq!(ts.current_minute_ms() % MINUTE_MS, 0);
    }

    #[test]
    fn worldtimeapi_extraction() {
        let body = json!({"unixtime": 1_750_000_000, "utc_offset": "+00:00"});
        assert_eq!(
            extract_utc_ms(TimeSourceKind::WorldTimeApi, &body),
            Some(1_750_000_000_000)
        );
    }

    #[test]
    fn timeapiio_extraction() {
        let body = json!({"dateTime": "2025-06-15T12:30:45.1234567"});
        let ms = extract_utc_ms(TimeSourceKind::TimeApiIo, &body).unwrap();
        let dt = chrono::DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(dt.format("%Y-%m-%dT%H:%M:%S").to_string(), "2025-06-15T12:30:45");
    }

    #[test]
    fn exchange_time_extraction() {
        let result = json!({"timeSecond": "1750000000", "timeNano": "1750000000123456789"});
        assert_eq!(exchange_time_ms(&result), Some(1_750_000_000_123));
    }

    #[test]
    fn implausible_timestamps_rejected() {
        assert!(!plausible_utc_ms(0));
        assert!(!plausible_utc_ms(2_100_000_000_000));
        assert!(plausible_utc_ms(1_750_000_000_000));
    }
}
