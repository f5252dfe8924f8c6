//! Error types for tunnel sessions.
//!
//! Errors are `Clone` so the outcome of one coalesced connect attempt can be
//! handed to every waiter.

use thiserror::Error;
use tunnel_protocol::ProtocolError;

use crate::network::TransportState;

/// Tunnel error type.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    // Setup errors
    /// The signaling socket failed to connect or closed underneath a request.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The peer transport reached a fatal state during or after setup.
    #[error("negotiation failed: transport {state}")]
    Negotiation {
        /// Terminal state reported by the transport.
        state: TransportState,
    },

    /// The remote device never produced an offer.
    #[error("offer descriptor not available after {attempts} attempts")]
    DescriptorTimeout {
        /// Number of polls performed.
        attempts: u32,
    },

    /// The data channel did not signal open before the connect timer fired.
    #[error("data channel did not open within {timeout_ms} ms")]
    ChannelOpenTimeout {
        /// Connect budget in milliseconds.
        timeout_ms: u64,
    },

    // Per-request errors
    /// A framed request exceeded its budget.
    #[error("request {correlation_id} for {path} timed out")]
    RequestTimeout {
        /// Correlation id allocated to the request.
        correlation_id: u64,
        /// Request path.
        path: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Decode(#[from] ProtocolError),

    /// No expect pattern matched in time; carries the caller's message.
    #[error("{0}")]
    ExpectTimeout(String),

    // Collaborator and provider errors
    /// A controller RPC failed.
    #[error("controller error: {0}")]
    Controller(String),

    /// The transport provider reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    // Session state errors
    /// The operation needs an open session or channel.
    #[error("not open")]
    NotOpen,

    /// The session or channel was closed.
    #[error("closed")]
    Closed,
}

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::Controller(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TunnelError::Signaling(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_timeout_error_display() {
        let err = TunnelError::DescriptorTimeout { attempts: 10 };
        assert_eq!(
            err.to_string(),
            "offer descriptor not available after 10 attempts"
        );
    }

    #[test]
    fn test_negotiation_error_display() {
        let err = TunnelError::Negotiation {
            state: TransportState::Failed,
        };
        assert_eq!(err.to_string(), "negotiation failed: transport failed");
    }

    #[test]
    fn test_expect_timeout_uses_message_verbatim() {
        let err = TunnelError::ExpectTimeout("no shell prompt".to_string());
        assert_eq!(err.to_string(), "no shell prompt");
    }

    #[test]
    fn test_from_protocol_error() {
        let err: TunnelError = ProtocolError::InvalidHeader("eof".to_string()).into();
        assert!(matches!(err, TunnelError::Decode(_)));
        assert_eq!(err.to_string(), "frame error: invalid frame header: eof");
    }

    #[test]
    fn test_error_is_clone_send_sync() {
        fn assert_traits<T: Clone + Send + Sync + 'static>() {}
        assert_traits::<TunnelError>();
    }
}
