//! # Tunnel Protocol Library
//!
//! Wire formats shared by the controller tunnel: nothing in this crate does
//! I/O, so everything here can be tested byte for byte.
//!
//! ## Overview
//!
//! - **Frame Codec**: the 16-byte-preamble binary format that multiplexes many
//!   API requests over one data channel
//! - **Request Builder**: maps `{method, contentType, data}` onto a frame
//!   header and payload
//! - **SDP Patching**: inlines gathered candidates into a descriptor and
//!   rewrites its connection lines
//! - **Signaling Envelopes**: JSON messages exchanged with the relay
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        API requests / responses         │  JSON, octet-stream, blob
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  16-byte preamble, gzip
//! ├─────────────────────────────────────────┤
//! │         Peer data channel               │  negotiated via SDP
//! ├─────────────────────────────────────────┤
//! │   Controller RPC / signaling relay      │  descriptor exchange
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use tunnel_protocol::{ApiRequest, FrameCodec, ResponseBody};
//! use serde_json::json;
//!
//! let request = ApiRequest::get().with_json(json!({"limit": 5}));
//! let (header, payload) = request.build("/api/stat").unwrap();
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(1, &header, &payload).unwrap();
//!
//! let frame = codec.decode(&bytes).unwrap();
//! assert_eq!(frame.correlation_id, 1);
//! assert_eq!(frame.header.query_string.as_deref(), Some("limit=5"));
//! assert!(matches!(frame.body().unwrap(), ResponseBody::Blob { .. }));
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec and response body decoding
//! - [`request`]: API request builder
//! - [`sdp`]: Descriptors, candidates and SDP patching
//! - [`envelope`]: Signaling relay messages
//! - [`error`]: Error types

pub mod envelope;
pub mod error;
pub mod framing;
pub mod request;
pub mod sdp;

pub use envelope::{Envelope, Inbound, ACTION_REQUEST, ACTION_RESPONSE, PING, PONG};
pub use error::{ProtocolError, Result};
pub use framing::{
    decode_uint, encode_uint, Frame, FrameCodec, FrameHeader, Method, ResponseBody,
    CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, MAX_FRAME_SIZE, PREAMBLE_SIZE,
};
pub use request::{ApiRequest, RequestData};
pub use sdp::{
    patch_connection_line, Candidate, CandidateFields, Descriptor, DescriptorKind, SdpDocument,
};
