//! Framed request multiplexer.
//!
//! One [`ChannelMultiplexer`] owns one data channel. It allocates a
//! correlation id per request, writes the encoded frame, and routes inbound
//! frames back to the waiting caller by id. No ordering is assumed between
//! in-flight requests.
//!
//! Frames that arrive after their request timed out are dropped, as are
//! frames that fail to decode; neither takes the channel down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tunnel_protocol::{ApiRequest, Frame, FrameCodec};

use crate::error::{Result, TunnelError};
use crate::network::{ChannelEvent, DataChannel, PeerTransport};

/// Default budget for one request, pre-open wait included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a request re-checks a channel that is not open yet.
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

type Inflight = DashMap<u64, oneshot::Sender<Result<Frame>>>;

/// State shared with the reader task.
struct Shared {
    channel: Arc<dyn DataChannel>,
    codec: FrameCodec,
    next_id: AtomicU64,
    inflight: Inflight,
    closed: AtomicBool,
}

impl Shared {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.channel.is_open()
    }

    /// Fails every pending request and refuses new ones.
    fn close_inflight(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<u64> = self.inflight.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.inflight.remove(&id) {
                let _ = tx.send(Err(TunnelError::Closed));
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let id = frame.correlation_id;
        match self.inflight.remove(&id) {
            Some((_, tx)) => {
                tracing::debug!(
                    channel = self.channel.label(),
                    correlation_id = id,
                    payload_len = frame.payload.len(),
                    "response frame"
                );
                if tx.send(Ok(frame)).is_err() {
                    tracing::debug!(correlation_id = id, "requester went away");
                }
            }
            None => {
                tracing::warn!(
                    channel = self.channel.label(),
                    correlation_id = id,
                    "dropping frame with no pending request"
                );
            }
        }
    }
}

/// Multiplexes framed requests over one data channel.
pub struct ChannelMultiplexer {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl ChannelMultiplexer {
    /// Opens a data channel called `name` on `transport` and attaches to it.
    ///
    /// Does not wait for the channel to open; [`request`](Self::request)
    /// waits for readiness within its own budget.
    pub async fn open_channel(transport: &dyn PeerTransport, name: &str) -> Result<Self> {
        let channel = transport.create_data_channel(name).await?;
        Self::attach(channel)
    }

    /// Takes ownership of `channel`'s inbound stream.
    ///
    /// Fails if something else already consumes the channel's events.
    pub fn attach(channel: Arc<dyn DataChannel>) -> Result<Self> {
        Self::with_codec(channel, FrameCodec::new())
    }

    pub fn with_codec(channel: Arc<dyn DataChannel>, codec: FrameCodec) -> Result<Self> {
        let events = channel.take_events().ok_or_else(|| {
            TunnelError::Transport(format!(
                "data channel '{}' is already attached",
                channel.label()
            ))
        })?;

        let shared = Arc::new(Shared {
            channel,
            codec,
            next_id: AtomicU64::new(1),
            inflight: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_frames(Arc::clone(&shared), events));

        Ok(Self { shared, reader })
    }

    pub fn label(&self) -> &str {
        self.shared.channel.label()
    }

    /// Whether the channel is open and not yet closed underneath us.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Number of requests waiting for a response.
    pub fn pending(&self) -> usize {
        self.shared.inflight.len()
    }

    fn allocate_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one framed request and waits for the matching response frame.
    ///
    /// `timeout` covers both the wait for the channel to open (checked once
    /// per second) and the wait for the response. If the channel never opens,
    /// nothing is sent.
    pub async fn request(
        &self,
        path: &str,
        request: &ApiRequest,
        timeout: Duration,
    ) -> Result<Frame> {
        let id = self.allocate_id();
        let (header, payload) = request.build(path)?;
        let encoded = self.shared.codec.encode(id, &header, &payload)?;

        let timed_out = || TunnelError::RequestTimeout {
            correlation_id: id,
            path: path.to_string(),
        };

        let mut remaining = timeout;
        while !self.shared.is_open() {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(TunnelError::Closed);
            }
            if remaining.is_zero() {
                tracing::debug!(correlation_id = id, path, "channel never opened");
                return Err(timed_out());
            }
            tracing::debug!(
                channel = self.label(),
                remaining_ms = remaining.as_millis() as u64,
                "channel not open yet, waiting"
            );
            let step = READINESS_POLL_INTERVAL.min(remaining);
            tokio::time::sleep(step).await;
            remaining -= step;
        }

        let (tx, rx) = oneshot::channel();
        self.shared.inflight.insert(id, tx);
        // The reader may have closed the channel since the readiness check.
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.inflight.remove(&id);
            return Err(TunnelError::Closed);
        }

        if let Err(e) = self.shared.channel.send(Bytes::from(encoded)).await {
            self.shared.inflight.remove(&id);
            return Err(e);
        }

        tracing::debug!(
            channel = self.label(),
            correlation_id = id,
            method = header.method.unwrap_or_default().as_str(),
            path = %header.path,
            "request sent"
        );

        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TunnelError::Closed),
            Err(_) => {
                self.shared.inflight.remove(&id);
                tracing::warn!(correlation_id = id, path, "request timed out");
                Err(timed_out())
            }
        }
    }

    /// [`request`](Self::request) with the default 30 second budget.
    pub async fn call(&self, path: &str, request: &ApiRequest) -> Result<Frame> {
        self.request(path, request, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Sends a framed request without waiting for, or routing, a response.
    ///
    /// Returns the correlation id used.
    pub async fn notify(&self, path: &str, request: &ApiRequest) -> Result<u64> {
        if !self.is_open() {
            return Err(TunnelError::NotOpen);
        }
        let id = self.allocate_id();
        let (header, payload) = request.build(path)?;
        let encoded = self.shared.codec.encode(id, &header, &payload)?;
        self.shared.channel.send(Bytes::from(encoded)).await?;
        Ok(id)
    }

    /// Writes bytes to the channel as-is.
    pub async fn send_raw(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TunnelError::NotOpen);
        }
        self.shared.channel.send(data).await
    }

    /// Closes the channel and fails every pending request.
    pub async fn close(&self) -> Result<()> {
        self.shared.close_inflight();
        self.reader.abort();
        self.shared.channel.close().await
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decodes one frame per channel message and routes it by id.
///
/// Data channels preserve message boundaries, so a message that does not
/// hold exactly one frame is malformed and dropped on its own.
async fn read_frames(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => {
                tracing::debug!(channel = shared.channel.label(), "channel open");
            }
            ChannelEvent::Message(data) => match shared.codec.decode(&data) {
                Ok(frame) => shared.dispatch(frame),
                Err(e) => {
                    tracing::warn!(
                        channel = shared.channel.label(),
                        error = %e,
                        len = data.len(),
                        "dropping malformed frame"
                    );
                }
            },
            ChannelEvent::Close => {
                tracing::info!(channel = shared.channel.label(), "channel closed");
                break;
            }
        }
    }

    shared.close_inflight();
}
