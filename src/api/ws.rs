// =============================================================================
// WebSocket Handler — live price stream
// =============================================================================
//
// Clients connect to `/ws/prices` and receive:
//   1. An `info` message on connect.
//   2. One `price` event per normalized tick.
//   3. A `ping` event on the hub's liveness interval.
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Skips ahead when it lags behind the hub instead of slowing the feed.
//   - Leaves the hub on disconnect (the subscription guard is dropped).
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
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::broadcast::welcome_message;
use crate::app_state::AppState;

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Runs one subscriber until either side goes away.
///
/// `tokio::select!` over:
///   1. **Hub loop** — forward each broadcast payload as a text frame.
///   2. **Recv loop** — answer Pings, stop on Close or error.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.hub.join();
    info!(subscribers = state.hub.subscriber_count(), "price subscriber joined");

    let (mut sender, mut receiver) = socket.split();

    if let Err(e) = sender.send(Message::Text(welcome_message().to_string())).await {
        debug!(error = %e, "failed to send welcome — disconnecting");
        return;
    }

    loop {
        tokio::select! {
            // ── Hub loop ───────────────────────────────────────────────
            event = subscription.rx.recv() => {
                match event {
                    Ok(payload) => {
                        if let Err(e) = sender.send(Message::Text(payload.to_string())).await {
                            debug!(error = %e, "subscriber send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "slow price subscriber skipped events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // ── Recv loop ──────────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    drop(subscription);
    info!(subscribers = state.hub.subscriber_count(), "price subscriber left");
}
