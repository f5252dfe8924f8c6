//! Signaling relay client.
//!
//! This module provides a client for the relay's persistent WebSocket:
//! - Single-flight connect (concurrent callers share one attempt)
//! - Text `ping` heartbeat on a fixed interval, `pong` replies to the relay's pings
//! - `action:request` / `action:response` correlation by a UUID `action_id`
//!
//! When the socket closes or errors, every pending connect waiter and action
//! is rejected and the client returns to `Disconnected`. There is no
//! automatic reconnect; the next [`WebSocketSignalingClient::connect`] starts
//! fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message as WsMessage,
    },
};
use tunnel_protocol::{Descriptor, Envelope, Inbound, PING, PONG};
use uuid::Uuid;

use super::negotiator::OfferExchange;
use crate::error::{Result, TunnelError};

/// Default relay endpoint.
pub const DEFAULT_SIGNALING_URL: &str = "wss://device-airos.svc.ubnt.com/api/airos/v1/unifi/events";

/// Default `Origin` header.
pub const DEFAULT_ORIGIN: &str = "https://unifi.ubnt.com";

/// Default heartbeat interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long `disconnect` waits for the close frame to be written.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Action carrying our offer; the response carries the remote answer.
pub const ACTION_SDP_OFFER: &str = "sdp-offer";

/// Action carrying our finalized descriptor.
pub const ACTION_SDP_FINAL: &str = "sdp-final";

/// Connection state for the signaling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Not connected to the relay.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and ready.
    Connected,
}

/// Events emitted by the signaling client.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Connection state changed.
    StateChanged(SignalingState),
    /// An envelope that is not a response to one of our actions.
    Message(Envelope),
    /// A text frame that is neither a heartbeat nor an envelope.
    Text(String),
}

/// Configuration for the WebSocket signaling client.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// The WebSocket URL of the relay.
    pub url: String,
    /// `Origin` header sent with the upgrade request.
    pub origin: Option<String>,
    /// `Cookie` header sent with the upgrade request.
    pub cookie: Option<String>,
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            origin: Some(DEFAULT_ORIGIN.to_string()),
            cookie: None,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl SignalingConfig {
    /// Creates a new configuration with the specified relay URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the `Origin` header.
    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the `Cookie` header.
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// Internal state for the WebSocket signaling client.
struct ClientState {
    connection_state: SignalingState,
    /// Sender feeding the writer task; present only while connected.
    outgoing: Option<mpsc::UnboundedSender<WsMessage>>,
    /// Callers waiting on the in-flight connect attempt.
    waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Action callbacks keyed by `action_id`.
    pending: HashMap<String, oneshot::Sender<Result<Envelope>>>,
    /// Reader and writer tasks of the current socket.
    tasks: Vec<JoinHandle<()>>,
    /// Bumped on every connect so tasks of an old socket cannot reset a new one.
    generation: u64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            connection_state: SignalingState::Disconnected,
            outgoing: None,
            waiters: Vec::new(),
            pending: HashMap::new(),
            tasks: Vec::new(),
            generation: 0,
        }
    }
}

/// State shared with the socket tasks.
struct Shared {
    config: SignalingConfig,
    state: RwLock<ClientState>,
    event_tx: mpsc::Sender<SignalingEvent>,
}

impl Shared {
    fn emit(&self, event: SignalingEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!(error = %e, "signaling event dropped - receiver full or gone");
        }
    }

    /// Tears down the socket of `generation`, rejecting everything waiting on it.
    async fn shutdown(&self, generation: u64, reason: &str) {
        let mut state = self.state.write().await;
        if state.generation != generation || state.connection_state == SignalingState::Disconnected
        {
            return;
        }

        tracing::info!(reason, "signaling connection closed");
        state.connection_state = SignalingState::Disconnected;
        state.outgoing = None;

        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(TunnelError::Signaling(reason.to_string())));
        }
        for (_, pending) in state.pending.drain() {
            let _ = pending.send(Err(TunnelError::Signaling(reason.to_string())));
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
        drop(state);

        self.emit(SignalingEvent::StateChanged(SignalingState::Disconnected));
    }
}

/// WebSocket-based signaling client implementation.
pub struct WebSocketSignalingClient {
    shared: Arc<Shared>,
    /// Receiver for events (returned by events()).
    event_rx: Mutex<Option<mpsc::Receiver<SignalingEvent>>>,
}

impl WebSocketSignalingClient {
    /// Creates a new WebSocket signaling client.
    pub fn new(config: SignalingConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ClientState::default()),
                event_tx,
            }),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.shared.config
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> SignalingState {
        self.shared.state.read().await.connection_state
    }

    /// Returns a receiver for signaling events.
    /// Returns None if the receiver has already been taken.
    pub async fn events(&self) -> Option<mpsc::Receiver<SignalingEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Connects to the relay.
    ///
    /// Resolves immediately when already connected. Concurrent callers
    /// coalesce into one attempt and all receive its outcome.
    pub async fn connect(&self) -> Result<()> {
        let rx = {
            let mut state = self.shared.state.write().await;
            if state.connection_state == SignalingState::Connected {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);

            if state.waiters.len() == 1 {
                state.connection_state = SignalingState::Connecting;
                state.generation += 1;
                let generation = state.generation;
                let shared = self.shared.clone();
                tokio::spawn(async move { establish(shared, generation).await });
            }
            rx
        };

        rx.await
            .unwrap_or_else(|_| Err(TunnelError::Signaling("connect attempt abandoned".into())))
    }

    /// Closes the socket, rejecting any pending actions.
    ///
    /// The close frame is flushed before the socket tasks are stopped.
    pub async fn disconnect(&self) {
        let (generation, writer) = {
            let mut state = self.shared.state.write().await;
            let writer = match state.outgoing.take() {
                Some(outgoing) if outgoing.send(WsMessage::Close(None)).is_ok() => {
                    (!state.tasks.is_empty()).then(|| state.tasks.remove(0))
                }
                _ => None,
            };
            (state.generation, writer)
        };

        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                tracing::debug!("close frame not flushed in time");
                writer.abort();
            }
        }
        self.shared.shutdown(generation, "disconnected by client").await;
    }

    /// Sends a text frame, connecting first if needed.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.connect().await?;
        let state = self.shared.state.read().await;
        push(&state, WsMessage::Text(text.into()))
    }

    /// Sends an envelope, connecting first if needed.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_text(envelope.to_json()?).await
    }

    /// Sends an `action:request` and waits for the matching `action:response`.
    ///
    /// There is no timeout: the call fails only when the socket goes away.
    pub async fn action_request(&self, action: &str, args: Value) -> Result<Envelope> {
        self.connect().await?;

        let action_id = Uuid::new_v4().to_string();
        let envelope = Envelope::action_request(action, action_id.clone(), args);
        let text = envelope.to_json()?;

        let rx = {
            let mut state = self.shared.state.write().await;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(action_id.clone(), tx);
            if let Err(e) = push(&state, WsMessage::Text(text)) {
                state.pending.remove(&action_id);
                return Err(e);
            }
            rx
        };

        tracing::debug!(action, action_id = %action_id, "action request sent");
        rx.await
            .unwrap_or_else(|_| Err(TunnelError::Signaling("connection closed".into())))
    }
}

impl Drop for WebSocketSignalingClient {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_write() {
            for task in state.tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn push(state: &ClientState, message: WsMessage) -> Result<()> {
    match &state.outgoing {
        Some(tx) => tx
            .send(message)
            .map_err(|_| TunnelError::Signaling("writer task stopped".into())),
        None => Err(TunnelError::Signaling(
            "not connected to signaling relay".into(),
        )),
    }
}

/// Opens the socket and resolves every connect waiter with the outcome.
async fn establish(shared: Arc<Shared>, generation: u64) {
    shared.emit(SignalingEvent::StateChanged(SignalingState::Connecting));

    match open_socket(&shared, generation).await {
        Ok(()) => {
            tracing::info!(url = %shared.config.url, "connected to signaling relay");
            shared.emit(SignalingEvent::StateChanged(SignalingState::Connected));
        }
        Err(e) => {
            tracing::error!(error = %e, url = %shared.config.url, "signaling connection failed");
            let mut state = shared.state.write().await;
            if state.generation != generation {
                return;
            }
            state.connection_state = SignalingState::Disconnected;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(e.clone()));
            }
            drop(state);
            shared.emit(SignalingEvent::StateChanged(SignalingState::Disconnected));
        }
    }
}

/// Connects the WebSocket, spawns its writer and reader tasks and marks the
/// client connected.
async fn open_socket(shared: &Arc<Shared>, generation: u64) -> Result<()> {
    let config = &shared.config;

    let mut request = config.url.as_str().into_client_request()?;
    if let Some(origin) = &config.origin {
        request.headers_mut().insert(header::ORIGIN, header_value(origin)?);
    }
    if let Some(cookie) = &config.cookie {
        request.headers_mut().insert(header::COOKIE, header_value(cookie)?);
    }

    tracing::info!(url = %config.url, "connecting to signaling relay");
    let (ws_stream, _) = connect_async(request).await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();

    // Held until the client is marked connected, so a socket that dies
    // immediately cannot be torn down before it was set up.
    let mut state = shared.state.write().await;
    if state.generation != generation {
        return Err(TunnelError::Signaling("connect attempt superseded".into()));
    }

    // Writer: outgoing frames plus the heartbeat
    let ping_interval = config.ping_interval;
    let writer_shared = shared.clone();
    let writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(ping_interval);
        let mut reason = "signaling writer stopped";
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sink.send(WsMessage::Text(PING.to_string())).await {
                        tracing::error!(error = %e, "failed to send heartbeat ping");
                        break;
                    }
                    tracing::debug!("sent heartbeat ping");
                }
                msg = outgoing_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let closing = matches!(msg, WsMessage::Close(_));
                    if let Err(e) = ws_sink.send(msg).await {
                        tracing::error!(error = %e, "failed to send WebSocket message");
                        break;
                    }
                    if closing {
                        reason = "disconnected by client";
                        break;
                    }
                }
            }
        }
        writer_shared.shutdown(generation, reason).await;
    });

    // Reader: heartbeat replies, action responses, everything else as events
    let reader_shared = shared.clone();
    let pong_tx = outgoing_tx.clone();
    let reader = tokio::spawn(async move {
        let reason = loop {
            match ws_stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_text(&reader_shared, &pong_tx, &text).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break "relay closed connection".to_string(),
                Some(Err(e)) => break format!("WebSocket error: {}", e),
                Some(Ok(_)) => {
                    // Binary and protocol-level ping/pong frames carry nothing for us
                }
            }
        };
        reader_shared.shutdown(generation, &reason).await;
    });

    state.outgoing = Some(outgoing_tx);
    state.tasks = vec![writer, reader];
    state.connection_state = SignalingState::Connected;
    for waiter in state.waiters.drain(..) {
        let _ = waiter.send(Ok(()));
    }
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TunnelError::Signaling(format!("invalid header value: {}", e)))
}

async fn handle_text(shared: &Shared, outgoing: &mpsc::UnboundedSender<WsMessage>, text: &str) {
    match Inbound::parse(text) {
        Inbound::Ping => {
            let _ = outgoing.send(WsMessage::Text(PONG.to_string()));
        }
        Inbound::Pong => tracing::debug!("received heartbeat pong"),
        Inbound::Envelope(envelope) if envelope.is_action_response() => {
            let callback = match &envelope.action_id {
                Some(id) => shared.state.write().await.pending.remove(id),
                None => None,
            };
            match callback {
                Some(tx) => {
                    let _ = tx.send(Ok(envelope));
                }
                None => {
                    tracing::debug!(action_id = ?envelope.action_id, "unmatched action response");
                    shared.emit(SignalingEvent::Message(envelope));
                }
            }
        }
        Inbound::Envelope(envelope) => shared.emit(SignalingEvent::Message(envelope)),
        Inbound::Other(text) => shared.emit(SignalingEvent::Text(text)),
    }
}

/// Dial-flow descriptor exchange carried over signaling actions.
pub struct SignalingOfferExchange {
    client: Arc<WebSocketSignalingClient>,
    device: String,
    session_id: String,
}

impl SignalingOfferExchange {
    pub fn new(
        client: Arc<WebSocketSignalingClient>,
        device: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            device: device.into(),
            session_id: session_id.into(),
        }
    }

    fn args(&self, descriptor: &Descriptor) -> Value {
        json!({
            "mac": self.device,
            "uuid": self.session_id,
            "type": descriptor.kind,
            "sdp": descriptor.body,
        })
    }
}

#[async_trait]
impl OfferExchange for SignalingOfferExchange {
    async fn exchange_offer(&self, offer: &Descriptor) -> Result<Descriptor> {
        let response = self
            .client
            .action_request(ACTION_SDP_OFFER, self.args(offer))
            .await?;

        response
            .field("sdp")
            .and_then(Value::as_str)
            .map(Descriptor::answer)
            .ok_or_else(|| TunnelError::Signaling("action response carries no answer".into()))
    }

    async fn finalize(&self, descriptor: &Descriptor) -> Result<()> {
        self.client
            .action_request(ACTION_SDP_FINAL, self.args(descriptor))
            .await?;
        Ok(())
    }
}
