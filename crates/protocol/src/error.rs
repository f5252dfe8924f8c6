//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way encoding or decoding can fail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The length prefix disagrees with the bytes actually received.
    #[error("frame length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch {
        /// Length announced by the preamble (excluding the length field itself).
        declared: usize,
        /// Bytes present after the length field.
        actual: usize,
    },

    /// The JSON header segment could not be parsed.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// A gzip/zlib payload could not be inflated.
    #[error("failed to decompress payload: {0}")]
    Decompression(String),

    /// An integer does not fit in the requested number of bytes.
    #[error("value {value} does not fit in {width} bytes")]
    ValueOutOfRange {
        /// The value that was being encoded.
        value: u64,
        /// The target width in bytes.
        width: usize,
    },

    /// The request could not be expressed on the wire.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Decompression(err.to_string())
    }
}
