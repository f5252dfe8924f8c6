//! In-memory transport, data channel and controller used by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use tunnel::controller::{TransportHints, TunnelController, TurnCredentials};
use tunnel::network::{
    ChannelEvent, DataChannel, IceServer, PeerTransport, TransportEvent, TransportProvider,
    TransportState,
};
use tunnel::protocol::{Candidate, Descriptor};
use tunnel::{Result, TunnelError};

/// Offer as produced by a device: one data media block.
pub const DEVICE_OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=candidate:9 1 udp 2122260223 10.0.0.20 40000 typ host\r\n";

/// Answer as produced by a local transport before candidates are inlined.
pub const LOCAL_ANSWER: &str = "v=0\r\n\
o=- 3 4 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sctp-port:5000\r\n";

/// Offer with two media blocks for the dial flow.
pub const LOCAL_OFFER: &str = "v=0\r\n\
o=- 5 6 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n";

pub const HOST_CANDIDATE: &str = "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host";
pub const TCP_CANDIDATE: &str = "candidate:2 1 tcp 1518280447 192.168.1.10 9 typ host tcptype active";
pub const SRFLX_CANDIDATE: &str =
    "candidate:3 1 udp 1686052607 203.0.113.5 50001 typ srflx raddr 192.168.1.10 rport 50000";

/// Candidate events emitted after `set_local_description`, terminal last.
pub fn default_candidates() -> Vec<Candidate> {
    vec![
        Candidate::new(0, HOST_CANDIDATE),
        Candidate::new(0, TCP_CANDIDATE),
        Candidate::new(0, SRFLX_CANDIDATE),
        Candidate::end_of_candidates(),
    ]
}

// =============================================================================
// Data channel
// =============================================================================

pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    sent: Mutex<Vec<Bytes>>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Marks the channel open and reports it.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    /// Delivers one inbound message.
    pub fn deliver(&self, data: impl Into<Bytes>) {
        let _ = self.events_tx.send(ChannelEvent::Message(data.into()));
    }

    /// Simulates the remote end closing the channel.
    pub fn remote_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Close);
    }

    /// Everything written to the channel so far.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Stream of writes, for tests that answer requests as they are sent.
    pub fn take_outbound(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.outbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("outbound already taken")
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TunnelError::NotOpen);
        }
        self.sent.lock().unwrap().push(data.clone());
        let _ = self.outbound_tx.send(data);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(ChannelEvent::Close);
        }
        Ok(())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// What the simulated device does once our local description is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    /// Connects and opens the session channel.
    Open,
    /// Never opens a channel.
    Silent,
    /// Connects, then reports this fatal state.
    Fail(TransportState),
}

pub struct MockTransport {
    behavior: DeviceBehavior,
    candidates: Vec<Candidate>,
    ice_servers: Vec<IceServer>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    local: Mutex<Option<Descriptor>>,
    remote: Mutex<Option<Descriptor>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(behavior: DeviceBehavior, candidates: Vec<Candidate>) -> Arc<Self> {
        Self::with_ice_servers(behavior, candidates, Vec::new())
    }

    fn with_ice_servers(
        behavior: DeviceBehavior,
        candidates: Vec<Candidate>,
        ice_servers: Vec<IceServer>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            behavior,
            candidates,
            ice_servers,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn local_description(&self) -> Option<Descriptor> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<Descriptor> {
        self.remote.lock().unwrap().clone()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.clone()
    }

    /// Channels created locally or announced by the simulated device.
    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Announces a device-initiated channel and opens it.
    pub fn announce_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = MockDataChannel::new(label);
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        self.emit(TransportEvent::DataChannel(channel.clone()));
        channel.open();
        channel
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<Descriptor> {
        Ok(Descriptor::offer(LOCAL_OFFER))
    }

    async fn create_answer(&self) -> Result<Descriptor> {
        if self.remote.lock().unwrap().is_none() {
            return Err(TunnelError::Transport("no remote offer".to_string()));
        }
        Ok(Descriptor::answer(LOCAL_ANSWER))
    }

    async fn set_local_description(&self, descriptor: &Descriptor) -> Result<()> {
        *self.local.lock().unwrap() = Some(descriptor.clone());

        for candidate in &self.candidates {
            self.emit(TransportEvent::Candidate(candidate.clone()));
        }

        match self.behavior {
            DeviceBehavior::Open => {
                self.emit(TransportEvent::StateChanged(TransportState::Connecting));
                self.emit(TransportEvent::StateChanged(TransportState::Connected));
                self.announce_channel("ssh");
            }
            DeviceBehavior::Silent => {}
            DeviceBehavior::Fail(state) => {
                self.emit(TransportEvent::StateChanged(TransportState::Connecting));
                self.emit(TransportEvent::StateChanged(state));
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, descriptor: &Descriptor) -> Result<()> {
        *self.remote.lock().unwrap() = Some(descriptor.clone());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = MockDataChannel::new(label);
        if self.behavior == DeviceBehavior::Open {
            channel.open();
        }
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Provider
// =============================================================================

pub struct MockProvider {
    behavior: Mutex<DeviceBehavior>,
    candidates: Vec<Candidate>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockProvider {
    pub fn new(behavior: DeviceBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            candidates: default_candidates(),
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: DeviceBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TransportProvider for MockProvider {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerTransport>> {
        let behavior = *self.behavior.lock().unwrap();
        let transport =
            MockTransport::with_ice_servers(behavior, self.candidates.clone(), ice_servers.to_vec());
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Default)]
pub struct MockController {
    /// Poll results served in order; once empty, polls return the offer.
    pub offers: Mutex<VecDeque<Option<Descriptor>>>,
    /// When set, every poll returns `None`.
    pub never_offer: AtomicBool,
    pub fail_create: AtomicBool,
    pub create_delay: Mutex<Option<Duration>>,
    pub turn: Mutex<Option<TurnCredentials>>,

    pub create_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub teardown_calls: AtomicUsize,
    pub hints: Mutex<Vec<TransportHints>>,
    pub answers: Mutex<Vec<Descriptor>>,
}

impl MockController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A controller whose device has not produced an offer for the first `empty` polls.
    pub fn with_empty_polls(empty: usize) -> Arc<Self> {
        let controller = Self::default();
        {
            let mut offers = controller.offers.lock().unwrap();
            for _ in 0..empty {
                offers.push_back(None);
            }
        }
        Arc::new(controller)
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<Descriptor> {
        self.answers.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelController for MockController {
    async fn create_tunnel(
        &self,
        _device: &str,
        _session_id: &str,
        _ttl: &str,
        hints: &TransportHints,
    ) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.hints.lock().unwrap().push(hints.clone());

        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TunnelError::Controller("device offline".to_string()));
        }
        Ok(())
    }

    async fn poll_offer_descriptor(&self, _device: &str, _session_id: &str) -> Result<Option<Descriptor>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if self.never_offer.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let queued = self.offers.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| Some(Descriptor::offer(DEVICE_OFFER))))
    }

    async fn submit_answer_descriptor(
        &self,
        _device: &str,
        _session_id: &str,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self.answers.lock().unwrap().push(descriptor.clone());
        Ok(())
    }

    async fn teardown_tunnel(&self, _device: &str, _session_id: &str) -> Result<()> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn turn_credentials(&self) -> Result<Option<TurnCredentials>> {
        Ok(self.turn.lock().unwrap().clone())
    }
}
