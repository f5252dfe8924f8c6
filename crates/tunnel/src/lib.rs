//! # Device Tunnel Library
//!
//! This crate opens peer-to-peer tunnels to devices managed by a controller
//! and multiplexes traffic over them.
//!
//! ## Overview
//!
//! - **Signaling**: persistent WebSocket client for the relay, with heartbeat
//!   and correlated action requests
//! - **Negotiation**: offer/answer/candidate exchange over an injected
//!   transport provider, with bounded offer polling
//! - **Multiplexing**: many concurrent framed API requests over one data
//!   channel, matched by correlation id
//! - **Sessions**: raw byte sessions with single-flight connect, idle
//!   auto-close and `expect()`
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TunnelSession                          │
//! │        connect · send · recv · expect · close · events       │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │     TransportNegotiator      │      ChannelMultiplexer       │
//! │  offer/answer · candidates   │  correlation ids · timeouts   │
//! ├──────────────┬───────────────┼───────────────────────────────┤
//! │  Controller  │   Signaling   │   FrameCodec (tunnel-protocol)│
//! │  (REST RPCs) │  (WebSocket)  │                               │
//! ├──────────────┴───────────────┴───────────────────────────────┤
//! │          TransportProvider (webrtc crate by default)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunnel::{Config, HttpController, TunnelSession, WebRtcProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let controller = HttpController::new(
//!         config.controller.base_url.clone(),
//!         config.controller.site.clone(),
//!         config.controller.cookie.clone(),
//!         config.controller.accept_invalid_certs,
//!     )?;
//!
//!     let session = TunnelSession::new(
//!         "f0:9f:c2:00:00:01",
//!         Arc::new(controller),
//!         Arc::new(WebRtcProvider::new()),
//!         config.session_options(),
//!     );
//!
//!     session.connect().await?;
//!     session.send("uptime\n").await?;
//!     let found = session.expect("load average").await?;
//!     println!("{}", found.text());
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`controller`]: Controller RPCs and offer polling
//! - [`network`]: Transport abstraction, negotiation, signaling, WebRTC provider
//! - [`session`]: Tunnel sessions and the framed request multiplexer
//! - [`error`]: Error type shared by all of the above

pub mod config;
pub mod controller;
pub mod error;
pub mod network;
pub mod session;

// Re-export protocol for convenience
pub use tunnel_protocol as protocol;

pub use config::{Config, ConfigError};
pub use controller::{
    poll_offer, HttpController, PollPolicy, TransportHints, TunnelController, TurnCredentials,
};
pub use error::{Result, TunnelError};
pub use network::{
    ChannelEvent, DataChannel, IceServer, NegotiatorOptions, OfferExchange, PeerTransport,
    SignalingConfig, SignalingEvent, SignalingOfferExchange, SignalingState, TransportEvent,
    TransportNegotiator, TransportProvider, TransportState, WebRtcProvider,
    WebSocketSignalingClient,
};
pub use session::{
    ChannelMultiplexer, ExpectMatch, IntoPatterns, OnTerminate, Pattern, SessionEvent,
    SessionOptions, SessionStatus, TunnelSession,
};
