//! Offer/answer negotiation over an injected peer transport.
//!
//! The negotiator owns the transport's event stream and fans it out:
//! candidates feed [`TransportNegotiator::gather_candidates`], state changes
//! land in a `watch` channel, and remotely opened data channels queue up for
//! [`TransportNegotiator::next_data_channel`].
//!
//! Two flows are supported:
//! - **dial**: we create the offer and exchange it through an [`OfferExchange`]
//! - **answer**: the device created the offer; we poll it from the controller
//!   and submit a patched answer

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tunnel_protocol::{patch_connection_line, Candidate, Descriptor};

use super::{DataChannel, PeerTransport, TransportEvent, TransportState};
use crate::controller::{poll_offer, PollPolicy, TunnelController};
use crate::error::{Result, TunnelError};

/// Default candidate gathering budget.
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for one negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorOptions {
    pub gather_timeout: Duration,
    pub poll: PollPolicy,
}

impl Default for NegotiatorOptions {
    fn default() -> Self {
        Self {
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            poll: PollPolicy::default(),
        }
    }
}

/// Descriptor exchange for the dial flow.
#[async_trait]
pub trait OfferExchange: Send + Sync {
    /// Delivers our offer and returns the remote answer.
    async fn exchange_offer(&self, offer: &Descriptor) -> Result<Descriptor>;

    /// Delivers our descriptor once its candidates are inlined.
    async fn finalize(&self, descriptor: &Descriptor) -> Result<()>;
}

/// Drives one peer transport through negotiation.
pub struct TransportNegotiator {
    transport: Arc<dyn PeerTransport>,
    options: NegotiatorOptions,
    candidates: Mutex<mpsc::UnboundedReceiver<Candidate>>,
    channels: Mutex<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>,
    state_rx: watch::Receiver<TransportState>,
    router: JoinHandle<()>,
}

impl TransportNegotiator {
    /// Takes the transport's event stream and starts routing it.
    pub fn new(transport: Arc<dyn PeerTransport>, options: NegotiatorOptions) -> Result<Self> {
        let events = transport.take_events().ok_or_else(|| {
            TunnelError::Transport("transport events already taken".to_string())
        })?;

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransportState::New);

        let router = tokio::spawn(route_events(events, candidate_tx, state_tx, channel_tx));

        Ok(Self {
            transport,
            options,
            candidates: Mutex::new(candidate_rx),
            channels: Mutex::new(channel_rx),
            state_rx,
            router,
        })
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Current transport state.
    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Subscribes to transport state changes.
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    /// Resolves with the first fatal state (`failed` or `disconnected`).
    ///
    /// Returns `Closed` if the transport goes away without failing.
    pub async fn wait_for_fatal(&self) -> TransportState {
        let mut rx = self.state_rx.clone();
        let state = match rx
            .wait_for(|state| state.is_fatal() || *state == TransportState::Closed)
            .await
        {
            Ok(state) => *state,
            Err(_) => TransportState::Closed,
        };
        state
    }

    /// Waits for the next data channel opened by the remote end.
    pub async fn next_data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channels.lock().await.recv().await
    }

    /// Collects local candidates until the terminal marker and inlines them
    /// into `local`.
    ///
    /// TCP candidates are dropped. Fails if the terminal marker does not
    /// arrive within the gather timeout.
    pub async fn gather_candidates(&self, local: Descriptor) -> Result<Descriptor> {
        let mut rx = self.candidates.lock().await;
        let budget = self.options.gather_timeout;

        let collect = async {
            let mut gathered = Vec::new();
            while let Some(candidate) = rx.recv().await {
                if candidate.terminal {
                    return Ok(gathered);
                }
                if candidate.is_tcp() {
                    tracing::debug!(candidate = %candidate.text, "skipping tcp candidate");
                    continue;
                }
                gathered.push(candidate);
            }
            Err(TunnelError::Transport(
                "transport closed during candidate gathering".to_string(),
            ))
        };

        let gathered = tokio::time::timeout(budget, collect).await.map_err(|_| {
            TunnelError::Transport(format!(
                "candidate gathering timed out after {} ms",
                budget.as_millis()
            ))
        })??;

        tracing::debug!(count = gathered.len(), "candidate gathering complete");

        let mut descriptor = local;
        descriptor.candidates = gathered;
        Ok(descriptor.finalized())
    }

    /// Caller-side flow: opens `label`, offers, applies the answer and
    /// delivers the finalized offer.
    pub async fn dial(
        &self,
        exchange: &dyn OfferExchange,
        label: &str,
    ) -> Result<(Descriptor, Arc<dyn DataChannel>)> {
        let channel = self.transport.create_data_channel(label).await?;

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;

        let answer = exchange.exchange_offer(&offer).await?;
        self.transport.set_remote_description(&answer).await?;

        let finalized = self.gather_candidates(offer).await?;
        exchange.finalize(&finalized).await?;

        tracing::info!(label, "dial negotiation complete");
        Ok((finalized, channel))
    }

    /// Callee-side flow: polls the device's offer, answers it and submits
    /// the finalized answer with its connection line patched.
    pub async fn answer(
        &self,
        controller: &dyn TunnelController,
        device: &str,
        session_id: &str,
    ) -> Result<Descriptor> {
        let offer = poll_offer(controller, device, session_id, self.options.poll).await?;
        self.transport.set_remote_description(&offer).await?;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;

        let mut finalized = self.gather_candidates(answer).await?;
        finalized.body = patch_connection_line(&finalized.body);

        controller
            .submit_answer_descriptor(device, session_id, &finalized)
            .await?;

        tracing::info!(device, session_id, "answer submitted");
        Ok(finalized)
    }

    /// Closes the transport and stops routing its events.
    pub async fn close(&self) -> Result<()> {
        self.router.abort();
        self.transport.close().await
    }
}

impl Drop for TransportNegotiator {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Fans transport events out to the negotiator's queues.
async fn route_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    candidate_tx: mpsc::UnboundedSender<Candidate>,
    state_tx: watch::Sender<TransportState>,
    channel_tx: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Candidate(candidate) => {
                tracing::debug!(
                    mline_index = candidate.mline_index,
                    terminal = candidate.terminal,
                    candidate = %candidate.text,
                    "local candidate"
                );
                let _ = candidate_tx.send(candidate);
            }
            TransportEvent::StateChanged(next) => {
                let current = *state_tx.borrow();
                if current.can_transition_to(next) {
                    tracing::info!(from = %current, to = %next, "transport state changed");
                    state_tx.send_replace(next);
                } else {
                    tracing::warn!(from = %current, to = %next, "ignoring transport state regression");
                }
            }
            TransportEvent::DataChannel(channel) => {
                tracing::debug!(label = channel.label(), "remote data channel");
                let _ = channel_tx.send(channel);
            }
        }
    }
}
