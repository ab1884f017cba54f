//! WebSocket support for live pulse streaming.
//!
//! Clients connect to `/ws` and receive every pulse the store accepts, as
//! `{"type": "new_pulse", "pulse": {...}}`.

use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, debug, warn};

use super::AppState;
use crate::types::Pulse;

/// Events sent to WebSocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsEvent {
    #[serde(rename = "new_pulse")]
    NewPulse {
        pulse: Pulse,
    },
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("🔌 WebSocket client connecting");
    let feed = state.store.subscribe();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, feed))
}

/// Handle an individual WebSocket connection
async fn handle_ws_connection(socket: WebSocket, mut feed: broadcast::Receiver<Pulse>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Send pulses to client
    let send_task = tokio::spawn(async move {
        loop {
            let pulse = match feed.recv().await {
                Ok(pulse) => pulse,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {} pulses skipped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match serde_json::to_string(&WsEvent::NewPulse { pulse }) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Client disconnected
                    }
                }
                Err(e) => {
                    warn!("Failed to serialize WS event: {}", e);
                }
            }
        }
    });

    // Read from client (handle pings/close, ignore other messages)
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Ping(_) => {
                    debug!("WS ping received");
                    // Pong is auto-handled by axum
                }
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("🔌 WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_timestamp, ByteHash, StatusCode};

    #[test]
    fn test_new_pulse_event_shape() {
        let pulse = Pulse {
            uri: "http://beacon.test/2.0/chain/0/pulse/0".into(),
            version: "2.0".into(),
            cypher_suite: 1,
            period: 60_000,
            certificate_id: ByteHash::new(vec![1; 64]),
            chain_index: 0,
            pulse_index: 0,
            time_stamp: parse_timestamp("2024-01-01T00:00:00Z").unwrap(),
            local_random_value: ByteHash::new(vec![2; 64]),
            skip_list_layer_size: 27,
            skip_list_num_layers: 1,
            skip_list_anchors: vec![ByteHash::zero()],
            precommitment_value: ByteHash::new(vec![3; 64]),
            status_code: StatusCode::CHAIN_START,
            signature_value: ByteHash::new(vec![4; 64]),
            output_value: ByteHash::new(vec![5; 64]),
        };

        let json = serde_json::to_value(WsEvent::NewPulse { pulse }).unwrap();
        assert_eq!(json["type"], "new_pulse");
        assert_eq!(json["pulse"]["pulseIndex"], 0);
        assert_eq!(json["pulse"]["statusCode"], 1);
        assert_eq!(json["pulse"]["timeStamp"], "2024-01-01T00:00:00.000Z");
    }
}
