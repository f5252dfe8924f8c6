//! Default transport provider backed by the `webrtc` crate.
//!
//! This module adapts `RTCPeerConnection` and `RTCDataChannel` to the
//! provider traits:
//! - ICE server configuration (STUN/TURN)
//! - Callbacks forwarded as [`TransportEvent`]s and [`ChannelEvent`]s
//! - Local candidates reported one by one, `None` as the terminal marker

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tunnel_protocol::{Candidate, Descriptor, DescriptorKind};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelEvent, DataChannel, IceServer, PeerTransport, TransportEvent, TransportProvider,
    TransportState,
};
use crate::error::{Result, TunnelError};

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        }
    }
}

fn to_rtc_description(descriptor: &Descriptor) -> Result<RTCSessionDescription> {
    let body = descriptor.body.clone();
    let desc = match descriptor.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(body),
        DescriptorKind::Answer => RTCSessionDescription::answer(body),
    };
    desc.map_err(|e| TunnelError::Transport(format!("invalid session description: {}", e)))
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<Descriptor> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(Descriptor::offer(desc.sdp.clone())),
        RTCSdpType::Answer => Ok(Descriptor::answer(desc.sdp.clone())),
        other => Err(TunnelError::Transport(format!(
            "unsupported session description type: {:?}",
            other
        ))),
    }
}

/// Maps a local candidate callback to a candidate event.
///
/// `None` from `webrtc` ends gathering. A candidate that cannot be serialized
/// is skipped rather than reported, since an empty one would read as terminal.
fn candidate_event(candidate: Option<RTCIceCandidate>) -> Option<Candidate> {
    match candidate {
        None => Some(Candidate::end_of_candidates()),
        Some(candidate) => local_candidate(candidate.to_json()),
    }
}

fn local_candidate(
    init: std::result::Result<RTCIceCandidateInit, webrtc::Error>,
) -> Option<Candidate> {
    match init {
        Ok(init) if init.candidate.trim().is_empty() => {
            tracing::debug!("skipping empty local candidate");
            None
        }
        Ok(init) => Some(Candidate::new(
            init.sdp_mline_index.unwrap_or(0),
            init.candidate,
        )),
        Err(e) => {
            tracing::warn!(error = %e, "skipping local candidate that failed to serialize");
            None
        }
    }
}

/// Creates `webrtc` peer connections.
#[derive(Debug, Clone, Default)]
pub struct WebRtcProvider;

impl WebRtcProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportProvider for WebRtcProvider {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerTransport>> {
        // Create a MediaEngine (required even for data-only connections)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            TunnelError::Transport(format!("failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            TunnelError::Transport(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let configuration = RTCConfiguration {
            ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };

        let peer_connection = api.new_peer_connection(configuration).await.map_err(|e| {
            TunnelError::Transport(format!("failed to create peer connection: {}", e))
        })?;

        Ok(Arc::new(WebRtcTransport::new(Arc::new(peer_connection))))
    }
}

/// A `webrtc` peer connection.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebRtcTransport {
    fn new(peer_connection: Arc<RTCPeerConnection>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(event) = candidate_event(candidate) {
                let _ = candidate_tx.send(TransportEvent::Candidate(event));
            }
            Box::pin(async {})
        }));

        let state_tx = tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                tracing::debug!("peer connection state changed: {:?}", state);
                let _ = state_tx.send(TransportEvent::StateChanged(state.into()));
                Box::pin(async {})
            },
        ));

        let channel_tx = tx;
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let channel: Arc<dyn DataChannel> = WebRtcDataChannel::wrap(channel);
            let _ = channel_tx.send(TransportEvent::DataChannel(channel));
            Box::pin(async {})
        }));

        Self {
            peer_connection,
            events: Mutex::new(Some(rx)),
        }
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<Descriptor> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| TunnelError::Transport(format!("failed to create offer: {}", e)))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<Descriptor> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| TunnelError::Transport(format!("failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, descriptor: &Descriptor) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(descriptor)?)
            .await
            .map_err(|e| {
                TunnelError::Transport(format!("failed to set local description: {}", e))
            })
    }

    async fn set_remote_description(&self, descriptor: &Descriptor) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(descriptor)?)
            .await
            .map_err(|e| {
                TunnelError::Transport(format!("failed to set remote description: {}", e))
            })
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(|e| {
                TunnelError::Transport(format!("failed to create data channel '{}': {}", label, e))
            })?;
        Ok(WebRtcDataChannel::wrap(channel))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| TunnelError::Transport(format!("failed to close peer connection: {}", e)))
    }
}

/// A `webrtc` data channel.
pub struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcDataChannel {
    /// Wraps a channel and forwards its callbacks. A channel that is already
    /// open reports `Open` right away; consumers treat repeats as no-ops.
    pub fn wrap(inner: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        inner.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let message_tx = tx.clone();
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = message_tx.send(ChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        inner.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Close);
            Box::pin(async {})
        }));

        if inner.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        let label = inner.label().to_string();
        tracing::debug!(label = %label, "data channel attached");

        Arc::new(Self {
            inner,
            label,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::Transport(format!("data channel send failed: {}", e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| TunnelError::Transport(format!("failed to close data channel: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_server_conversion() {
        let server = IceServer::turn("turn:example.com:3478", "user", "pass");
        let rtc = RTCIceServer::from(&server);
        assert_eq!(rtc.urls, vec!["turn:example.com:3478"]);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "pass");

        let stun = RTCIceServer::from(&IceServer::stun("stun:example.com:3478"));
        assert!(stun.username.is_empty());
    }

    #[test]
    fn test_state_conversion() {
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Failed),
            TransportState::Failed
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }

    #[test]
    fn test_end_of_candidates() {
        assert!(candidate_event(None).unwrap().terminal);
    }

    #[test]
    fn test_unserializable_candidate_is_skipped() {
        assert!(local_candidate(Err(webrtc::Error::ErrConnectionClosed)).is_none());
        assert!(local_candidate(Ok(RTCIceCandidateInit::default())).is_none());
    }

    #[test]
    fn test_local_candidate_keeps_mline_index() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host".to_string(),
            sdp_mline_index: Some(1),
            ..Default::default()
        };
        let candidate = local_candidate(Ok(init)).unwrap();
        assert_eq!(candidate.mline_index, 1);
        assert!(!candidate.terminal);
    }

    #[tokio::test]
    async fn test_create_transport() {
        let transport = WebRtcProvider::new().create(&[]).await;
        assert!(transport.is_ok());
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let transport = WebRtcProvider::new().create(&[]).await.unwrap();
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
    }

    #[tokio::test]
    async fn test_create_offer_with_data_channel() {
        let transport = WebRtcProvider::new().create(&[]).await.unwrap();
        let channel = transport.create_data_channel("api").await.unwrap();
        assert_eq!(channel.label(), "api");
        assert!(!channel.is_open());

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, DescriptorKind::Offer);
        assert!(offer.body.contains("m=application"));
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip_between_peers() {
        let provider = WebRtcProvider::new();
        let offerer = provider.create(&[]).await.unwrap();
        let answerer = provider.create(&[]).await.unwrap();

        offerer.create_data_channel("api").await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(&offer).await.unwrap();

        answerer.set_remote_description(&offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.kind, DescriptorKind::Answer);
        answerer.set_local_description(&answer).await.unwrap();

        offerer.set_remote_description(&answer).await.unwrap();

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }
}
