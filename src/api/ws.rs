// =============================================================================
// WebSocket endpoint — event-bus bridge for dashboard clients
// =============================================================================
//
// Clients connect to `/ws` and receive every bus message (alerts, kline
// updates, connection status, watchlist and settings changes). Inbound
// traffic is limited to `ping` (answered with `pong`) and
// `subscribe`/`unsubscribe`, which are echoed back as `*_confirmed`; actual
// fan-out is broadcast-wide, filtering happens client-side.
//
// A client that cannot keep up lags the broadcast ring and loses messages
// rather than stalling producers.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    info!("client websocket connected");
    let (mut sender, mut receiver) = socket.split();
    let mut bus_rx = state.bus.subscribe();

    // Greet with the current feed status so the dashboard renders
    // immediately instead of waiting for the next transition.
    let status = state.feed.status();
    let greeting = json!({
        "type": "connection_status",
        "status": status.status,
        "pairs_count": status.pairs_count,
        "subscribed_count": status.subscribed_count,
        "pending_count": status.pending_count,
        "streaming_active": status.streaming_active,
    });
    if sender
        .send(Message::Text(greeting.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            bus_msg = bus_rx.recv() => {
                match bus_msg {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            debug!("client send failed, disconnecting");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "slow client lagged the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            client_msg = receiver.next() => {
                match client_msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&text) {
                            if sender.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "client receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("client websocket disconnected");
}

/// `ping` → `pong`; `subscribe`/`unsubscribe` → `*_confirmed` echo.
fn handle_client_message(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value["type"].as_str()? {
        "ping" => Some(json!({"type": "pong"})),
        "subscribe" => Some(json!({
            "type": "subscribe_confirmed",
            "symbol": value["symbol"],
        })),
        "unsubscribe" => Some(json!({
            "type": "unsubscribe_confirmed",
            "symbol": value["symbol"],
        })),
        other => {
            debug!(kind = %other, "unhandled client message");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_gets_pong() {
        let reply = handle_client_message(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(reply["type"], "pong");
    }

    #[test]
    fn subscriptions_are_echoed() {
        let reply =
            handle_client_message(r#"{"type":"subscribe","symbol":"BTCUSDT"}"#).unwrap();
        assert_eq!(reply["type"], "subscribe_confirmed");
        assert_eq!(reply["symbol"], "BTCUSDT");

        let reply =
            handle_client_message(r#"{"type":"unsubscribe","symbol":"ETHUSDT"}"#).unwrap();
        assert_eq!(reply["type"], "unsubscribe_confirmed");
    }

    #[test]
    fn garbage_and_unknown_types_are_ignored() {
        assert!(handle_client_message("not json").is_none());
        assert!(handle_client_message(r#"{"type":"place_order"}"#).is_none());
        assert!(handle_client_message(r#"{"no_type":true}"#).is_none());
    }
}
