// =============================================================================
// REST endpoints — Axum 0.7
// =============================================================================
//
// Small read-only surface for the dashboard: health, recent alerts, the
// current watchlist, and time-sync status. The WebSocket endpoint carries
// everything real-time. CORS is permissive; the surface exposes no mutating
// operations.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/alerts", get(alerts))
        .route("/api/watchlist", get(watchlist))
        .route("/api/time", get(time_status))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": state.time.now_ms(),
        "utc_synced": state.time.synced(),
        "uptime_secs": state.uptime_secs(),
        "feed": state.feed.status(),
    }))
}

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<i64>,
}

async fn alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.alerts.recent(limit).await {
        Ok(list) => Json(serde_json::json!({"alerts": list})),
        Err(e) => {
            warn!(error = %e, "alert query failed");
            Json(serde_json::json!({"alerts": [], "error": "storage unavailable"}))
        }
    }
}

async fn watchlist(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.watchlist.entries().await {
        Ok(entries) => Json(serde_json::json!({"watchlist": entries})),
        Err(e) => {
            warn!(error = %e, "watchlist query failed");
            Json(serde_json::json!({"watchlist": [], "error": "storage unavailable"}))
        }
    }
}

async fn time_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.time.sync_status())
}
