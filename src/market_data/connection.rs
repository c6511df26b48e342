// =============================================================================
// Connection Manager — upstream feed socket lifecycle and subscription
// =============================================================================
//
// The lifecycle is an explicit state machine that emits actions; the async
// driver below performs them against a real socket.  Keeping the two apart
// lets the transitions be tested without any network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::decoder::SubscriptionMode;
use super::token_map::TokenMap;
use crate::pipeline::TickPipeline;
use crate::runtime_config::{FeedConfig, FeedCredentials};
use crate::types::now_ms;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Opened,
    Error,
    Closed,
    RetryElapsed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    OpenSocket,
    SendSubscription,
    StartHeartbeat,
    StopHeartbeat,
    ScheduleReconnect,
}

#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    reconnect_pending: bool,
    connects: u64,
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Successful opens so far.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        use ConnectionAction::*;
        use ConnectionState::*;

        match (self.state, event) {
            (_, ConnectionEvent::Shutdown) => {
                let was_connected = self.state == Connected;
                self.state = Disconnected;
                self.reconnect_pending = false;
                if was_connected {
                    vec![StopHeartbeat]
                } else {
                    Vec::new()
                }
            }
            (Disconnected, ConnectionEvent::Connect) => {
                self.state = Connecting;
                vec![OpenSocket]
            }
            (Connecting, ConnectionEvent::Opened) => {
                self.state = Connected;
                self.connects += 1;
                vec![SendSubscription, StartHeartbeat]
            }
            (Connecting | Connected, ConnectionEvent::Error | ConnectionEvent::Closed) => {
                let mut actions = Vec::new();
                if self.state == Connected {
                    actions.push(StopHeartbeat);
                }
                self.state = Reconnecting;
                if !self.reconnect_pending {
                    self.reconnect_pending = true;
                    actions.push(ScheduleReconnect);
                }
                actions
            }
            (Reconnecting, ConnectionEvent::RetryElapsed) => {
                self.reconnect_pending = false;
                self.state = Connecting;
                vec![OpenSocket]
            }
            // Includes a second error/close while a retry is already pending.
            _ => Vec::new(),
        }
    }
}

/// Shared, read-mostly view of the feed state for the health endpoint.
#[derive(Debug, Default)]
pub struct FeedStatus {
    state: RwLock<ConnectionState>,
    connects: RwLock<u64>,
}

impl FeedStatus {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn connects(&self) -> u64 {
        *self.connects.read()
    }

    fn publish(&self, machine: &ConnectionStateMachine) {
        *self.state.write() = machine.state();
        *self.connects.write() = machine.connects();
    }
}

// ---------------------------------------------------------------------------
// Subscription message
// ---------------------------------------------------------------------------

/// Build the one-shot subscription request covering the whole token
/// universe, grouped by exchange type.
pub fn build_subscription_message(tokens: &TokenMap, mode: SubscriptionMode) -> serde_json::Value {
    let token_list: Vec<serde_json::Value> = tokens
        .tokens_by_exchange_type()
        .into_iter()
        .map(|(exchange_type, tokens)| {
            serde_json::json!({ "exchangeType": exchange_type, "tokens": tokens })
        })
        .collect();

    let correlation_id: String = uuid::Uuid::new_v4().simple().to_string()[..10].to_string();

    serde_json::json!({
        "correlationID": correlation_id,
        "action": 1,
        "params": {
            "mode": mode.code(),
            "tokenList": token_list,
        }
    })
}

// ---------------------------------------------------------------------------
// Feed WebSocket driver
// ---------------------------------------------------------------------------

type FeedSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Run the upstream feed forever: connect, subscribe, stream frames into the
/// pipeline, and on any failure wait the fixed delay and start over.
pub async fn run_feed(
    feed: FeedConfig,
    credentials: FeedCredentials,
    tokens: Arc<TokenMap>,
    pipeline: Arc<TickPipeline>,
    status: Arc<FeedStatus>,
) {
    let mode = SubscriptionMode::from_byte(feed.subscription_mode).unwrap_or(SubscriptionMode::Quote);
    let subscription = build_subscription_message(&tokens, mode).to_string();
    let heartbeat = Duration::from_secs(feed.heartbeat_secs.max(1));
    let retry_delay = Duration::from_secs(feed.reconnect_delay_secs);

    let mut machine = ConnectionStateMachine::default();
    let mut actions = machine.handle(ConnectionEvent::Connect);

    loop {
        status.publish(&machine);

        if actions.contains(&ConnectionAction::OpenSocket) {
            let event = match open_socket(&feed.url, &credentials).await {
                Ok(ws) => {
                    let session_actions = machine.handle(ConnectionEvent::Opened);
                    status.publish(&machine);
                    info!(url = %feed.url, tokens = tokens.len(), "feed connected");
                    let (write, read) = ws.split();
                    run_session(write, read, &session_actions, &subscription, heartbeat, |bytes| {
                        pipeline.handle_frame(bytes, now_ms());
                    })
                    .await
                }
                Err(e) => {
                    error!(error = %e, "feed connect failed");
                    ConnectionEvent::Error
                }
            };
            actions = machine.handle(event);
            status.publish(&machine);
        }

        if actions.contains(&ConnectionAction::ScheduleReconnect) {
            info!(delay_secs = retry_delay.as_secs(), "feed reconnect scheduled");
            tokio::time::sleep(retry_delay).await;
            actions = machine.handle(ConnectionEvent::RetryElapsed);
        } else if !actions.contains(&ConnectionAction::OpenSocket) {
            // Nothing left to do; only reachable if the machine was shut down.
            return;
        }
    }
}

/// Upgrade request for the feed. The session token goes out exactly as
/// issued.
fn feed_request(url: &str, creds: &FeedCredentials) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .context("failed to build feed request")?;

    let headers = request.headers_mut();
    let pairs = [
        ("authorization", creds.auth_token.as_str()),
        ("x-api-key", creds.api_key.as_str()),
        ("x-client-code", creds.client_code.as_str()),
        ("x-feed-token", creds.feed_token.as_str()),
    ];
    for (name, value) in pairs {
        let value = value
            .parse()
            .with_context(|| format!("invalid header value for {name}"))?;
        headers.insert(name, value);
    }
    Ok(request)
}

async fn open_socket(url: &str, creds: &FeedCredentials) -> Result<FeedSocket> {
    let request = feed_request(url, creds)?;

    info!(url = %url, "connecting to feed WebSocket");
    let (ws_stream, _response) = connect_async(request)
        .await
        .context("failed to connect to feed WebSocket")?;
    Ok(ws_stream)
}

/// Drive one open socket until it fails or closes. Returns the event that
/// ended the session.
async fn run_session<W, R, E>(
    mut write: W,
    mut read: R,
    actions: &[ConnectionAction],
    subscription: &str,
    heartbeat: Duration,
    mut on_frame: impl FnMut(&[u8]),
) -> ConnectionEvent
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    if actions.contains(&ConnectionAction::SendSubscription) {
        if let Err(e) = write.send(Message::Text(subscription.to_string())).await {
            error!(error = %e, "failed to send subscription");
            return ConnectionEvent::Error;
        }
        info!("subscription sent");
    }

    let heartbeat_on = actions.contains(&ConnectionAction::StartHeartbeat);
    let mut ticker = tokio::time::interval(heartbeat);
    // First tick of `interval` fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick(), if heartbeat_on => {
                if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                    warn!(error = %e, "heartbeat send failed");
                    return ConnectionEvent::Error;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => on_frame(&bytes),
                Some(Ok(Message::Text(text))) => handle_text(&text),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        warn!(error = %e, "pong send failed");
                        return ConnectionEvent::Error;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "feed closed by server");
                    return ConnectionEvent::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "feed read error");
                    return ConnectionEvent::Error;
                }
                None => {
                    warn!("feed stream ended");
                    return ConnectionEvent::Closed;
                }
            }
        }
    }
}

fn handle_text(text: &str) {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("pong") || trimmed.eq_ignore_ascii_case("ping") {
        return;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(v) => info!(message = %v, "feed control message"),
        Err(_) => debug!(text = %trimmed, "unparsed feed text frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::token_map::TokenMapEntry;
    use ConnectionAction::*;
    use ConnectionEvent::*;

    #[test]
    fn happy_path_transitions() {
        let mut m = ConnectionStateMachine::default();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.handle(Connect), vec![OpenSocket]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.handle(Opened), vec![SendSubscription, StartHeartbeat]);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.connects(), 1);
    }

    #[test]
    fn error_then_close_schedules_exactly_one_retry() {
        let mut m = ConnectionStateMachine::default();
        m.handle(Connect);
        m.handle(Opened);

        assert_eq!(m.handle(Error), vec![StopHeartbeat, ScheduleReconnect]);
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert!(m.reconnect_pending());
        assert!(m.handle(Closed).is_empty());
        assert!(m.handle(Error).is_empty());

        assert_eq!(m.handle(RetryElapsed), vec![OpenSocket]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(!m.reconnect_pending());
    }

    #[test]
    fn failed_connect_retries_without_heartbeat_stop() {
        let mut m = ConnectionStateMachine::default();
        m.handle(Connect);
        assert_eq!(m.handle(Error), vec![ScheduleReconnect]);
        m.handle(RetryElapsed);
        assert_eq!(m.handle(Opened), vec![SendSubscription, StartHeartbeat]);
        assert_eq!(m.connects(), 1);
    }

    #[test]
    fn stray_events_are_ignored() {
        let mut m = ConnectionStateMachine::default();
        assert!(m.handle(Opened).is_empty());
        assert!(m.handle(RetryElapsed).is_empty());
        m.handle(Connect);
        assert!(m.handle(Connect).is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn shutdown_clears_pending_retry() {
        let mut m = ConnectionStateMachine::default();
        m.handle(Connect);
        m.handle(Opened);
        m.handle(Closed);
        assert!(m.handle(Shutdown).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.reconnect_pending());
    }

    #[test]
    fn subscription_groups_tokens_by_exchange() {
        let entry = |s: &str, e: &str| TokenMapEntry {
            symbol: s.into(),
            exchange: e.into(),
        };
        let map = TokenMap::from_entries(vec![
            ("3045".to_string(), entry("SBIN", "NSE")),
            ("2885".to_string(), entry("RELIANCE", "NSE")),
            ("500112".to_string(), entry("SBIN", "BSE")),
        ]);
        let msg = build_subscription_message(&map, SubscriptionMode::Quote);

        assert_eq!(msg["action"], 1);
        assert_eq!(msg["params"]["mode"], 2);
        assert_eq!(msg["correlationID"].as_str().unwrap().len(), 10);
        let list = msg["params"]["tokenList"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["exchangeType"], 1);
        assert_eq!(list[0]["tokens"], serde_json::json!(["2885", "3045"]));
        assert_eq!(list[1]["exchangeType"], 3);
    }

    fn creds(auth_token: &str) -> FeedCredentials {
        FeedCredentials {
            api_key: "key".into(),
            client_code: "C123".into(),
            auth_token: auth_token.into(),
            feed_token: "feed".into(),
        }
    }

    #[test]
    fn feed_request_sends_token_as_issued() {
        let url = "wss://example.invalid/smart-stream";
        for token in ["eyJhbGci", "Bearer eyJhbGci"] {
            let request = feed_request(url, &creds(token)).unwrap();
            let headers = request.headers();
            assert_eq!(headers["authorization"], token);
            assert_eq!(headers["x-api-key"], "key");
            assert_eq!(headers["x-client-code"], "C123");
            assert_eq!(headers["x-feed-token"], "feed");
        }
    }

    #[test]
    fn feed_request_rejects_unencodable_header() {
        assert!(feed_request("wss://example.invalid/", &creds("bad\ntoken")).is_err());
    }

    type Incoming = Vec<Result<Message, String>>;

    fn failing_sink() -> impl Sink<Message, Error = String> + Unpin {
        Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async {
            Err::<(), String>("socket gone".to_string())
        }))
    }

    fn collecting_sink() -> impl Sink<Message, Error = String> + Unpin {
        Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async { Ok::<(), String>(()) }))
    }

    #[tokio::test]
    async fn failed_pong_ends_session_with_error() {
        let incoming: Incoming = vec![Ok(Message::Ping(vec![1, 2]))];
        let event = run_session(
            failing_sink(),
            futures_util::stream::iter(incoming),
            &[],
            "{}",
            Duration::from_secs(30),
            |_| {},
        )
        .await;
        assert_eq!(event, Error);
    }

    #[tokio::test]
    async fn session_forwards_binary_frames_until_close() {
        let incoming: Incoming = vec![
            Ok(Message::Binary(vec![1, 0, 0])),
            Ok(Message::Text("pong".into())),
            Ok(Message::Ping(vec![9])),
            Ok(Message::Binary(vec![2, 0])),
            Ok(Message::Close(None)),
            Ok(Message::Binary(vec![3])),
        ];
        let mut frames = Vec::new();
        let event = run_session(
            collecting_sink(),
            futures_util::stream::iter(incoming),
            &[],
            "{}",
            Duration::from_secs(30),
            |bytes| frames.push(bytes.to_vec()),
        )
        .await;
        assert_eq!(event, Closed);
        assert_eq!(frames, vec![vec![1, 0, 0], vec![2, 0]]);
    }

    #[tokio::test]
    async fn failed_subscription_ends_session_with_error() {
        let incoming: Incoming = vec![];
        let event = run_session(
            failing_sink(),
            futures_util::stream::iter(incoming),
            &[SendSubscription],
            "{}",
            Duration::from_secs(30),
            |_| {},
        )
        .await;
        assert_eq!(event, Error);
    }
}
