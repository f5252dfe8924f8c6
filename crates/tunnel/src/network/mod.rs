//! Network module for reaching a device.
//!
//! This module provides:
//! - The transport provider abstraction (peer connection, data channels)
//! - [`negotiator`]: offer/answer/candidate exchange on top of a provider
//! - [`signaling`]: the relay WebSocket client
//! - [`webrtc`]: the default provider backed by the `webrtc` crate

pub mod negotiator;
pub mod signaling;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tunnel_protocol::{Candidate, Descriptor};

use crate::error::Result;

/// Connection state of a peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    fn rank(self) -> u8 {
        match self {
            TransportState::New => 0,
            TransportState::Connecting => 1,
            TransportState::Connected => 2,
            TransportState::Disconnected => 3,
            TransportState::Failed => 4,
            TransportState::Closed => 5,
        }
    }

    /// States only move forward; anything else is a regression to ignore.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        next.rank() > self.rank()
    }

    /// `failed` and `disconnected` tear the session down.
    pub fn is_fatal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Disconnected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// STUN/TURN server URLs.
    pub urls: Vec<String>,
    /// Username for TURN authentication (optional for STUN).
    pub username: Option<String>,
    /// Credential for TURN authentication (optional for STUN).
    pub credential: Option<String>,
}

impl IceServer {
    /// Creates a new STUN server configuration.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Creates a new TURN server configuration with authentication.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Events reported by a [`PeerTransport`].
pub enum TransportEvent {
    /// A local candidate, or the terminal end-of-gathering marker.
    Candidate(Candidate),
    /// Connection state change.
    StateChanged(TransportState),
    /// The remote end opened a data channel.
    DataChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Candidate(c) => f.debug_tuple("Candidate").field(c).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
        }
    }
}

/// Events reported by a [`DataChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
}

/// Creates peer transports. Injected so the tunnel never depends on a
/// particular ICE/DTLS stack.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerTransport>>;
}

/// One peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<Descriptor>;

    async fn create_answer(&self) -> Result<Descriptor>;

    async fn set_local_description(&self, descriptor: &Descriptor) -> Result<()>;

    async fn set_remote_description(&self, descriptor: &Descriptor) -> Result<()>;

    /// Opens a locally initiated data channel.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Returns the event receiver. Returns `None` once it has been taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn close(&self) -> Result<()>;
}

/// One data channel on a peer transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<()>;

    /// Returns the event receiver. Returns `None` once it has been taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self) -> Result<()>;
}

// Re-export key types
pub use negotiator::{NegotiatorOptions, OfferExchange, TransportNegotiator};
pub use signaling::{
    SignalingConfig, SignalingEvent, SignalingOfferExchange, SignalingState,
    WebSocketSignalingClient,
};
pub use webrtc::WebRtcProvider;
