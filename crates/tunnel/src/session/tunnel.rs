//! Tunnel session state machine.
//!
//! A [`TunnelSession`] is the raw byte session to one device:
//!
//! ```text
//!   closed ──connect()──▶ connecting ──channel open──▶ open
//!     ▲                       │                          │
//!     └───────── close() / failure / idle timeout ───────┘
//! ```
//!
//! Concurrent `connect()` calls share one negotiation. Every background task
//! is tagged with the connect generation that spawned it so late callbacks
//! from a torn-down attempt are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::expect::{default_message, first_match, ExpectMatch, IntoPatterns, Pattern};
use super::multiplexer::{ChannelMultiplexer, DEFAULT_REQUEST_TIMEOUT};
use crate::controller::{TransportHints, TunnelController};
use crate::error::{Result, TunnelError};
use crate::network::{
    ChannelEvent, DataChannel, IceServer, NegotiatorOptions, TransportNegotiator,
    TransportProvider, TransportState,
};

/// Default time for the data channel to open once the answer is submitted.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default inactivity period before an open session closes itself.
pub const DEFAULT_AUTOCLOSE: Duration = Duration::from_secs(30);

/// Default `expect` budget.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session time-to-live sent to the controller; `-1` means unlimited.
pub const DEFAULT_TTL: &str = "-1";

/// Event bus capacity.
const EVENT_CAPACITY: usize = 256;

/// Called once with the fatal transport state that ended the session.
pub type OnTerminate = Box<dyn FnOnce(TransportState) + Send + 'static>;

/// Immutable per-session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    /// `None` disables idle auto-close.
    pub autoclose: Option<Duration>,
    pub expect_timeout: Duration,
    /// Budget for requests on channels opened with [`TunnelSession::open_api`].
    pub request_timeout: Duration,
    pub ttl: String,
    /// When empty, TURN credentials are requested from the controller.
    pub ice_servers: Vec<IceServer>,
    pub negotiator: NegotiatorOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            autoclose: Some(DEFAULT_AUTOCLOSE),
            expect_timeout: DEFAULT_EXPECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ttl: DEFAULT_TTL.to_string(),
            ice_servers: Vec::new(),
            negotiator: NegotiatorOptions::default(),
        }
    }
}

/// Public session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Connecting,
    Open,
}

/// Events broadcast to [`TunnelSession::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Open,
    /// Bytes appended to the session buffer.
    Data(Bytes),
    TransportState(TransportState),
    Closed,
}

/// Background task slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Task {
    Negotiation,
    Monitor,
    Channel,
    ConnectTimer,
    IdleTimer,
}

struct Watcher {
    id: u64,
    patterns: Vec<Pattern>,
    tx: oneshot::Sender<ExpectMatch>,
}

struct State {
    status: SessionStatus,
    closing: bool,
    generation: u64,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    on_terminate: Option<OnTerminate>,
    negotiator: Option<Arc<TransportNegotiator>>,
    channel: Option<Arc<dyn DataChannel>>,
    buffer: Vec<u8>,
    watchers: Vec<Watcher>,
    next_watcher: u64,
    last_match: Option<ExpectMatch>,
    tasks: HashMap<Task, JoinHandle<()>>,
}

struct Inner {
    device: String,
    session_id: String,
    controller: Arc<dyn TunnelController>,
    provider: Arc<dyn TransportProvider>,
    options: SessionOptions,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<State>,
}

/// Raw byte session to one device.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct TunnelSession {
    inner: Arc<Inner>,
}

impl TunnelSession {
    /// Creates a closed session with a fresh session id.
    pub fn new(
        device: impl Into<String>,
        controller: Arc<dyn TunnelController>,
        provider: Arc<dyn TransportProvider>,
        options: SessionOptions,
    ) -> Self {
        Self::with_session_id(
            device,
            uuid::Uuid::new_v4().to_string(),
            controller,
            provider,
            options,
        )
    }

    /// Creates a closed session that identifies itself to the controller as `session_id`.
    pub fn with_session_id(
        device: impl Into<String>,
        session_id: impl Into<String>,
        controller: Arc<dyn TunnelController>,
        provider: Arc<dyn TransportProvider>,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = State {
            status: SessionStatus::Closed,
            closing: false,
            generation: 0,
            waiters: Vec::new(),
            on_terminate: None,
            negotiator: None,
            channel: None,
            buffer: Vec::new(),
            watchers: Vec::new(),
            next_watcher: 0,
            last_match: None,
            tasks: HashMap::new(),
        };

        Self {
            inner: Arc::new(Inner {
                device: device.into(),
                session_id: session_id.into(),
                controller,
                provider,
                options,
                events,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == SessionStatus::Open
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Connects with the configured connect timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(self.inner.options.connect_timeout, None)
            .await
    }

    /// Connects, or joins the connect already in flight.
    ///
    /// Resolves immediately when the session is open. `timeout` bounds the
    /// wait for the data channel once the answer has been submitted; when it
    /// fires the tunnel is torn down and every waiter fails with
    /// [`TunnelError::ChannelOpenTimeout`]. `on_terminate` is called if the
    /// transport later fails or disconnects.
    pub async fn connect_with(
        &self,
        timeout: Duration,
        on_terminate: Option<OnTerminate>,
    ) -> Result<()> {
        let rx = {
            let mut st = self.inner.lock();
            if st.status == SessionStatus::Open {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);

            if st.status == SessionStatus::Closed {
                st.status = SessionStatus::Connecting;
                st.closing = false;
                st.generation += 1;
                // Nothing from a previous connection carries over.
                st.buffer.clear();
                st.last_match = None;
                st.on_terminate = on_terminate;
                let generation = st.generation;

                tracing::info!(
                    device = %self.inner.device,
                    session_id = %self.inner.session_id,
                    generation,
                    "connecting tunnel session"
                );

                let inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(inner.negotiate(generation, timeout));
                st.tasks.insert(Task::Negotiation, handle);
            } else {
                if on_terminate.is_some() {
                    st.on_terminate = on_terminate;
                }
                tracing::debug!(session_id = %self.inner.session_id, "joining connect in flight");
            }
            rx
        };

        rx.await.unwrap_or(Err(TunnelError::Closed))
    }

    /// Writes bytes to the open channel.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let channel = {
            let st = self.inner.lock();
            match (&st.channel, st.status) {
                (Some(channel), SessionStatus::Open) => Arc::clone(channel),
                _ => return Err(TunnelError::NotOpen),
            }
        };
        self.inner.touch();
        channel.send(data.into()).await
    }

    /// Drains and returns everything received since the last drain.
    pub fn recv(&self) -> Vec<u8> {
        self.inner.touch();
        std::mem::take(&mut self.inner.lock().buffer)
    }

    /// Waits for any of `patterns` with the configured timeout and default message.
    pub async fn expect(&self, patterns: impl IntoPatterns) -> Result<ExpectMatch> {
        self.expect_with(patterns, self.inner.options.expect_timeout, None)
            .await
    }

    /// Waits until one of `patterns` matches the accumulated buffer.
    ///
    /// The whole buffer is tested on every received message, and once on
    /// registration. A match drains the buffer. On timeout the session stays
    /// open and the error carries `message`, or `timeout for <patterns>`.
    pub async fn expect_with(
        &self,
        patterns: impl IntoPatterns,
        timeout: Duration,
        message: Option<String>,
    ) -> Result<ExpectMatch> {
        let patterns = patterns.into_patterns();
        let message = message.unwrap_or_else(|| default_message(&patterns));

        let (id, rx) = {
            let mut st = self.inner.lock();
            if let Some(found) = st.take_match(&patterns) {
                drop(st);
                self.inner.touch();
                return Ok(found);
            }
            let (tx, rx) = oneshot::channel();
            let id = st.next_watcher;
            st.next_watcher += 1;
            st.watchers.push(Watcher {
                id,
                patterns,
                tx,
            });
            (id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(_)) => Err(TunnelError::Closed),
            Err(_) => {
                self.inner.lock().watchers.retain(|w| w.id != id);
                tracing::debug!(session_id = %self.inner.session_id, %message, "expect timed out");
                Err(TunnelError::ExpectTimeout(message))
            }
        }
    }

    /// The most recent successful `expect` match.
    pub fn last_match(&self) -> Option<ExpectMatch> {
        self.inner.lock().last_match.clone()
    }

    /// Opens an additional framed API channel on the session's transport.
    pub async fn open_api(&self, name: &str) -> Result<ChannelMultiplexer> {
        let negotiator = {
            let st = self.inner.lock();
            match (&st.negotiator, st.status) {
                (Some(negotiator), SessionStatus::Open) => Arc::clone(negotiator),
                _ => return Err(TunnelError::NotOpen),
            }
        };
        ChannelMultiplexer::open_channel(negotiator.transport().as_ref(), name).await
    }

    /// Tears the tunnel down.
    ///
    /// The first call issues the teardown RPC and releases the transport;
    /// calls made while already closing return `Ok` at once.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl State {
    /// Drains the buffer if one of `patterns` matches it.
    fn take_match(&mut self, patterns: &[Pattern]) -> Option<ExpectMatch> {
        let index = first_match(patterns, &self.buffer)?;
        let found = ExpectMatch {
            index,
            pattern: patterns[index].clone(),
            buffer: std::mem::take(&mut self.buffer),
        };
        self.last_match = Some(found.clone());
        Some(found)
    }

    fn abort_task(&mut self, task: Task) {
        if let Some(handle) = self.tasks.remove(&task) {
            handle.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Forgets the handle of a task that is about to tear the session down,
    /// so the teardown does not abort it.
    fn detach(&self, generation: u64, task: Task) {
        let mut st = self.lock();
        if st.generation == generation {
            st.tasks.remove(&task);
        }
    }

    /// Restarts the idle timer of an open session.
    fn touch(self: &Arc<Self>) {
        let Some(period) = self.options.autoclose else {
            return;
        };

        let mut st = self.lock();
        if st.status != SessionStatus::Open {
            return;
        }
        st.abort_task(Task::IdleTimer);

        let generation = st.generation;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.detach(generation, Task::IdleTimer);
            tracing::info!(
                session_id = %inner.session_id,
                idle_ms = period.as_millis() as u64,
                "closing idle session"
            );
            if let Err(e) = inner.close().await {
                tracing::warn!(session_id = %inner.session_id, error = %e, "idle close failed");
            }
        });
        st.tasks.insert(Task::IdleTimer, handle);
    }

    async fn negotiate(self: Arc<Self>, generation: u64, timeout: Duration) {
        match self.establish(generation).await {
            Ok(()) => self.arm_connect_timer(generation, timeout),
            Err(e) => {
                self.detach(generation, Task::Negotiation);
                self.fail_connect(generation, e).await;
            }
        }
    }

    /// Remote session creation and the answer flow, up to answer submission.
    async fn establish(self: &Arc<Self>, generation: u64) -> Result<()> {
        let ice_servers = self.ice_servers().await?;
        let hints = TransportHints::from_ice_servers(&ice_servers);

        self.controller
            .create_tunnel(&self.device, &self.session_id, &self.options.ttl, &hints)
            .await?;
        tracing::debug!(session_id = %self.session_id, "remote tunnel created");

        let transport = self.provider.create(&ice_servers).await?;
        let negotiator = Arc::new(TransportNegotiator::new(
            transport,
            self.options.negotiator,
        )?);

        let current = {
            let mut st = self.lock();
            let current = st.generation == generation && st.status == SessionStatus::Connecting;
            if current {
                st.negotiator = Some(Arc::clone(&negotiator));

                let weak = Arc::downgrade(self);
                let monitor = tokio::spawn(monitor_transport(
                    weak.clone(),
                    Arc::clone(&negotiator),
                    generation,
                ));
                let channel = tokio::spawn(await_channel(weak, Arc::clone(&negotiator), generation));
                st.tasks.insert(Task::Monitor, monitor);
                st.tasks.insert(Task::Channel, channel);
            }
            current
        };

        if !current {
            let _ = negotiator.close().await;
            return Err(TunnelError::Closed);
        }

        negotiator
            .answer(self.controller.as_ref(), &self.device, &self.session_id)
            .await?;
        Ok(())
    }

    /// Configured servers, or the controller's TURN credentials when none are configured.
    async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        if !self.options.ice_servers.is_empty() {
            return Ok(self.options.ice_servers.clone());
        }
        match self.controller.turn_credentials().await? {
            Some(credentials) => {
                let servers = credentials.ice_servers();
                tracing::debug!(count = servers.len(), "using controller turn credentials");
                Ok(servers)
            }
            None => Ok(Vec::new()),
        }
    }

    fn arm_connect_timer(self: &Arc<Self>, generation: u64, timeout: Duration) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.tasks.remove(&Task::Negotiation);
        if st.status != SessionStatus::Connecting {
            return;
        }

        tracing::debug!(
            session_id = %self.session_id,
            timeout_ms = timeout.as_millis() as u64,
            "answer submitted, waiting for channel"
        );

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.detach(generation, Task::ConnectTimer);
            tracing::warn!(session_id = %inner.session_id, "data channel did not open in time");
            inner
                .fail_connect(
                    generation,
                    TunnelError::ChannelOpenTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    },
                )
                .await;
        });
        st.tasks.insert(Task::ConnectTimer, handle);
    }

    /// Tears down a connect attempt, then fails its waiters with `error`.
    async fn fail_connect(self: &Arc<Self>, generation: u64, error: TunnelError) {
        let waiters = {
            let mut st = self.lock();
            if st.generation != generation || st.status != SessionStatus::Connecting {
                return;
            }
            std::mem::take(&mut st.waiters)
        };

        tracing::warn!(session_id = %self.session_id, error = %error, "connect failed");
        if let Err(e) = self.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "teardown after failed connect");
        }

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn adopt_channel(&self, generation: u64, channel: Arc<dyn DataChannel>) -> bool {
        let mut st = self.lock();
        if st.generation != generation || st.closing {
            return false;
        }
        st.channel = Some(channel);
        true
    }

    fn on_open(self: &Arc<Self>, generation: u64) {
        let waiters = {
            let mut st = self.lock();
            if st.generation != generation || st.status != SessionStatus::Connecting {
                // Duplicate open, or open after teardown.
                return;
            }
            st.status = SessionStatus::Open;
            st.abort_task(Task::ConnectTimer);
            std::mem::take(&mut st.waiters)
        };

        tracing::info!(session_id = %self.session_id, "tunnel session open");
        self.emit(SessionEvent::Open);
        self.touch();

        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_data(self: &Arc<Self>, generation: u64, data: Bytes) {
        let matched = {
            let mut st = self.lock();
            if st.generation != generation {
                return;
            }
            st.buffer.extend_from_slice(&data);

            let mut matched = false;
            let watchers = std::mem::take(&mut st.watchers);
            for watcher in watchers {
                if watcher.tx.is_closed() {
                    continue;
                }
                match st.take_match(&watcher.patterns) {
                    Some(found) => {
                        matched = true;
                        let _ = watcher.tx.send(found);
                    }
                    None => st.watchers.push(watcher),
                }
            }
            matched
        };

        tracing::trace!(session_id = %self.session_id, len = data.len(), "session data");
        self.emit(SessionEvent::Data(data));
        if matched {
            self.touch();
        }
    }

    async fn on_channel_closed(self: &Arc<Self>, generation: u64) {
        let status = {
            let st = self.lock();
            if st.generation != generation || st.closing {
                return;
            }
            st.status
        };

        tracing::info!(session_id = %self.session_id, "session channel closed");
        match status {
            SessionStatus::Connecting => self.fail_connect(generation, TunnelError::Closed).await,
            SessionStatus::Open => {
                if let Err(e) = self.close().await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "close after channel close");
                }
            }
            SessionStatus::Closed => {}
        }
    }

    async fn on_fatal(self: &Arc<Self>, generation: u64, state: TransportState) {
        let (connecting, hook) = {
            let mut st = self.lock();
            if st.generation != generation || st.closing {
                return;
            }
            (st.status == SessionStatus::Connecting, st.on_terminate.take())
        };

        tracing::warn!(session_id = %self.session_id, %state, "transport lost");
        if connecting {
            self.fail_connect(generation, TunnelError::Negotiation { state })
                .await;
        } else if let Err(e) = self.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "close after transport loss");
        }

        if let Some(hook) = hook {
            hook(state);
        }
    }

    async fn close(&self) -> Result<()> {
        let (negotiator, channel, waiters, tasks) = {
            let mut st = self.lock();
            if st.closing {
                return Ok(());
            }
            st.closing = true;
            st.status = SessionStatus::Closed;
            st.watchers.clear();
            st.on_terminate = None;
            (
                st.negotiator.take(),
                st.channel.take(),
                std::mem::take(&mut st.waiters),
                std::mem::take(&mut st.tasks),
            )
        };

        for (_, handle) in tasks {
            handle.abort();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(TunnelError::Closed));
        }

        tracing::info!(
            device = %self.device,
            session_id = %self.session_id,
            "closing tunnel session"
        );
        self.emit(SessionEvent::Closed);

        let teardown = self
            .controller
            .teardown_tunnel(&self.device, &self.session_id)
            .await;

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(error = %e, "channel close");
            }
        }
        if let Some(negotiator) = negotiator {
            if let Err(e) = negotiator.close().await {
                tracing::debug!(error = %e, "transport close");
            }
        }

        teardown
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, handle) in st.tasks.drain() {
            handle.abort();
        }
    }
}

/// Forwards transport state changes to the bus and ends the session on a fatal one.
async fn monitor_transport(
    weak: Weak<Inner>,
    negotiator: Arc<TransportNegotiator>,
    generation: u64,
) {
    let mut rx = negotiator.watch_state();
    drop(negotiator);

    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.emit(SessionEvent::TransportState(state));

        if state.is_fatal() {
            inner.detach(generation, Task::Monitor);
            inner.on_fatal(generation, state).await;
            return;
        }
        if state == TransportState::Closed {
            return;
        }
    }
}

/// Adopts the first data channel the device opens and pumps its events.
async fn await_channel(weak: Weak<Inner>, negotiator: Arc<TransportNegotiator>, generation: u64) {
    let Some(channel) = negotiator.next_data_channel().await else {
        return;
    };
    drop(negotiator);

    let Some(mut events) = channel.take_events() else {
        tracing::warn!(label = channel.label(), "session channel events already taken");
        return;
    };

    {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        tracing::debug!(session_id = %inner.session_id, label = channel.label(), "session channel");
        if !inner.adopt_channel(generation, Arc::clone(&channel)) {
            return;
        }
        if channel.is_open() {
            inner.on_open(generation);
        }
    }

    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Open => inner.on_open(generation),
            ChannelEvent::Message(data) => inner.on_data(generation, data),
            ChannelEvent::Close => {
                inner.detach(generation, Task::Channel);
                inner.on_channel_closed(generation).await;
                return;
            }
        }
    }
}
