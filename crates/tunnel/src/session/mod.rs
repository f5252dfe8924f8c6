//! Session layer.
//!
//! This module provides the two ways of talking to a device once a transport
//! is up: the raw byte [`TunnelSession`] (connect, send, recv, expect, close)
//! and the framed [`ChannelMultiplexer`] for API requests.

pub mod expect;
pub mod multiplexer;
pub mod tunnel;

pub use expect::{ExpectMatch, IntoPatterns, Pattern};
pub use multiplexer::{ChannelMultiplexer, DEFAULT_REQUEST_TIMEOUT};
pub use tunnel::{
    OnTerminate, SessionEvent, SessionOptions, SessionStatus, TunnelSession,
    DEFAULT_AUTOCLOSE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_EXPECT_TIMEOUT,
};
