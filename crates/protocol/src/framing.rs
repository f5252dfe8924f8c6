//! Frame codec for the multiplexed API channel.
//!
//! # Frame Format
//!
//! Every frame starts with a fixed 16-byte preamble, all integers big-endian:
//! - 4 bytes: total length (`12 + header length + payload length`, i.e. the
//!   frame size without the length field itself)
//! - 8 bytes: correlation id
//! - 4 bytes: header length
//! - N bytes: UTF-8 JSON header
//! - M bytes: payload
//!
//! The header carries the request line (`path`, `method`, `queryString`) and
//! the content negotiation fields (`contentType`, `Accept-Encoding`,
//! `Content-Encoding`). Responses may be gzip or zlib compressed; see
//! [`Frame::body`].

use std::borrow::Cow;
use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};

/// Size of the fixed preamble: 4 (length) + 8 (id) + 4 (header length).
pub const PREAMBLE_SIZE: usize = 16;

/// Size of the leading length field, which `total_length` does not count.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Content type for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type for raw binary payloads.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// The only content encoding the remote end produces.
pub const ENCODING_GZIP: &str = "gzip";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encodes `value` as a big-endian unsigned integer of exactly `width` bytes.
pub fn encode_uint(value: u64, width: usize) -> Result<Vec<u8>> {
    if width == 0 || width > 8 || (width < 8 && value >> (width * 8) != 0) {
        return Err(ProtocolError::ValueOutOfRange { value, width });
    }
    Ok(value.to_be_bytes()[8 - width..].to_vec())
}

/// Decodes a big-endian unsigned integer spanning all of `bytes` (at most 8).
pub fn decode_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// HTTP-like verb carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Returns true for verbs whose data travels in the query string.
    pub fn uses_query_string(self) -> bool {
        matches!(self, Method::Get | Method::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON header segment of a frame.
///
/// Unknown keys sent by the remote end are preserved in `extra` so a decoded
/// header re-encodes to the same document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameHeader {
    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(rename = "Accept-Encoding", default, skip_serializing_if = "Option::is_none")]
    pub accept_encoding: Option<String>,

    #[serde(rename = "Content-Encoding", default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,

    #[serde(rename = "queryString", default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FrameHeader {
    /// Creates a request header that advertises gzip support.
    pub fn request(path: impl Into<String>, method: Method) -> Self {
        Self {
            path: path.into(),
            method: Some(method),
            accept_encoding: Some(ENCODING_GZIP.to_string()),
            ..Default::default()
        }
    }

    /// Returns true when the payload must be inflated before use.
    pub fn is_gzip(&self) -> bool {
        self.content_encoding
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(ENCODING_GZIP))
    }
}

/// Decoded payload of a response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// `application/json`; an empty payload decodes to `Value::Null`.
    Json(Value),
    /// `application/octet-stream`.
    Binary(Vec<u8>),
    /// Any other (or missing) content type, kept opaque.
    Blob {
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

/// One complete message on the API channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Identifier echoed by the remote end in the matching response.
    pub correlation_id: u64,
    /// Parsed JSON header.
    pub header: FrameHeader,
    /// Raw payload bytes, exactly as carried on the wire.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(correlation_id: u64, header: FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            correlation_id,
            header,
            payload,
        }
    }

    /// Returns the payload with any declared gzip encoding removed.
    pub fn content(&self) -> Result<Cow<'_, [u8]>> {
        if self.header.is_gzip() && !self.payload.is_empty() {
            Ok(Cow::Owned(inflate(&self.payload)?))
        } else {
            Ok(Cow::Borrowed(&self.payload))
        }
    }

    /// Decodes the payload according to the header's content type.
    pub fn body(&self) -> Result<ResponseBody> {
        let content = self.content()?;
        let content_type = self.header.content_type.as_deref();

        match content_type.map(media_type) {
            Some(CONTENT_TYPE_JSON) => {
                if content.is_empty() {
                    return Ok(ResponseBody::Json(Value::Null));
                }
                let value = serde_json::from_slice(&content)?;
                Ok(ResponseBody::Json(value))
            }
            Some(CONTENT_TYPE_OCTET_STREAM) => Ok(ResponseBody::Binary(content.into_owned())),
            _ => Ok(ResponseBody::Blob {
                content_type: content_type.map(str::to_string),
                data: content.into_owned(),
            }),
        }
    }
}

/// Strips parameters such as `; charset=utf-8` from a content type.
fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type).trim()
}

/// Inflates a gzip or zlib stream, detecting the wrapper from its magic bytes.
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    if data.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(data).read_to_end(&mut out)?;
    } else {
        ZlibDecoder::new(data).read_to_end(&mut out)?;
    }
    Ok(out)
}

/// Encoder and decoder for API frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec with the default 16 MB frame limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a codec with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encodes one frame.
    pub fn encode(&self, correlation_id: u64, header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>> {
        let header_bytes = serde_json::to_vec(header)?;

        let total_size = PREAMBLE_SIZE + header_bytes.len() + payload.len();
        if total_size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: self.max_frame_size,
            });
        }

        let total_length = (total_size - LENGTH_FIELD_SIZE) as u64;

        let mut output = Vec::with_capacity(total_size);
        output.extend_from_slice(&encode_uint(total_length, 4)?);
        output.extend_from_slice(&encode_uint(correlation_id, 8)?);
        output.extend_from_slice(&encode_uint(header_bytes.len() as u64, 4)?);
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(payload);

        Ok(output)
    }

    /// Encodes an already assembled [`Frame`].
    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.encode(frame.correlation_id, &frame.header, &frame.payload)
    }

    /// Decodes exactly one frame; `data` must hold the whole frame and nothing else.
    pub fn decode(&self, data: &[u8]) -> Result<Frame> {
        if data.len() < PREAMBLE_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame preamble: need {} bytes, have {}",
                PREAMBLE_SIZE,
                data.len()
            )));
        }

        let declared = decode_uint(&data[0..4]) as usize;
        let actual = data.len() - LENGTH_FIELD_SIZE;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        self.decode_body(data)
    }

    /// Tries to decode a frame from the front of a stream buffer.
    ///
    /// Returns `None` while the buffer holds less than one complete frame,
    /// otherwise the frame and the number of bytes it occupied.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let declared = decode_uint(&data[0..4]) as usize;
        let frame_size = declared + LENGTH_FIELD_SIZE;
        if frame_size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_size,
                max: self.max_frame_size,
            });
        }

        if data.len() < frame_size {
            return Ok(None);
        }

        self.decode(&data[..frame_size])
            .map(|frame| Some((frame, frame_size)))
    }

    /// Parses the preamble and segments of a frame whose length is already checked.
    fn decode_body(&self, data: &[u8]) -> Result<Frame> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        let correlation_id = decode_uint(&data[4..12]);
        let header_len = decode_uint(&data[12..16]) as usize;

        let header_end = PREAMBLE_SIZE
            .checked_add(header_len)
            .filter(|end| *end <= data.len())
            .ok_or(ProtocolError::LengthMismatch {
                declared: header_len,
                actual: data.len() - PREAMBLE_SIZE,
            })?;

        let header: FrameHeader = serde_json::from_slice(&data[PREAMBLE_SIZE..header_end])
            .map_err(|e| ProtocolError::InvalidHeader(e.to_string()))?;

        Ok(Frame {
            correlation_id,
            header,
            payload: data[header_end..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn response_header(content_type: &str) -> FrameHeader {
        FrameHeader {
            content_type: Some(content_type.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_uint_roundtrip_at_width_boundaries() {
        for (value, width) in [
            (0u64, 1usize),
            (255, 1),
            (256, 2),
            (0xDEAD_BEEF, 4),
            (u32::MAX as u64, 4),
            (1 << 40, 6),
            (u64::MAX, 8),
        ] {
            let encoded = encode_uint(value, width).unwrap();
            assert_eq!(encoded.len(), width);
            assert_eq!(decode_uint(&encoded), value, "width {}", width);
        }
    }

    #[test]
    fn test_uint_is_big_endian() {
        assert_eq!(encode_uint(0x0102_0304, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(encode_uint(1, 8).unwrap(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_uint_out_of_range() {
        let result = encode_uint(256, 1);
        assert!(matches!(
            result,
            Err(ProtocolError::ValueOutOfRange { value: 256, width: 1 })
        ));
        assert!(encode_uint(1, 0).is_err());
        assert!(encode_uint(1, 9).is_err());
    }

    #[test]
    fn test_encode_preamble_layout() {
        let codec = FrameCodec::new();
        let header = FrameHeader::request("/api/stat", Method::Get);
        let header_json = serde_json::to_vec(&header).unwrap();
        let payload = b"{\"a\":1}";

        let encoded = codec.encode(42, &header, payload).unwrap();

        let total_length = decode_uint(&encoded[0..4]) as usize;
        assert_eq!(total_length, 12 + header_json.len() + payload.len());
        assert_eq!(encoded.len(), total_length + 4);
        assert_eq!(decode_uint(&encoded[4..12]), 42);
        assert_eq!(decode_uint(&encoded[12..16]) as usize, header_json.len());
        assert_eq!(&encoded[16..16 + header_json.len()], &header_json[..]);
        assert_eq!(&encoded[16 + header_json.len()..], payload);
    }

    #[test]
    fn test_request_header_wire_names() {
        let mut header = FrameHeader::request("/upgrade", Method::Post);
        header.content_type = Some(CONTENT_TYPE_JSON.to_string());
        header.query_string = Some("force=1".to_string());

        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(
            value,
            json!({
                "path": "/upgrade",
                "method": "POST",
                "contentType": "application/json",
                "Accept-Encoding": "gzip",
                "queryString": "force=1",
            })
        );
    }

    #[test]
    fn test_roundtrip_preserves_id_header_and_payload() {
        let codec = FrameCodec::new();

        let mut with_extra = response_header(CONTENT_TYPE_JSON);
        with_extra
            .extra
            .insert("statusCode".to_string(), json!(200));

        let cases = vec![
            (1u64, FrameHeader::request("/status", Method::Get), Vec::new()),
            (
                u64::MAX,
                FrameHeader::request("/upload", Method::Put),
                (0..=255u8).collect::<Vec<_>>(),
            ),
            (7, with_extra, b"{\"ok\":true}".to_vec()),
        ];

        for (id, header, payload) in cases {
            let encoded = codec.encode(id, &header, &payload).unwrap();
            let decoded = codec.decode(&encoded).unwrap();
            assert_eq!(decoded.correlation_id, id);
            assert_eq!(decoded.header, header);
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn test_decode_length_mismatch() {
        let codec = FrameCodec::new();
        let encoded = codec
            .encode(3, &FrameHeader::request("/x", Method::Get), b"abc")
            .unwrap();

        let truncated = &encoded[..encoded.len() - 1];
        assert!(matches!(
            codec.decode(truncated),
            Err(ProtocolError::LengthMismatch { .. })
        ));

        let mut padded = encoded.clone();
        padded.push(0);
        assert!(matches!(
            codec.decode(&padded),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_header_length_past_end() {
        let mut data = Vec::new();
        data.extend_from_slice(&encode_uint(14, 4).unwrap());
        data.extend_from_slice(&encode_uint(1, 8).unwrap());
        data.extend_from_slice(&encode_uint(500, 4).unwrap());
        data.extend_from_slice(b"{}");

        let result = FrameCodec::new().decode(&data);
        assert!(matches!(result, Err(ProtocolError::LengthMismatch { .. })));
    }

    #[test]
    fn test_decode_invalid_header_json() {
        let header = b"{not json";
        let mut data = Vec::new();
        data.extend_from_slice(&encode_uint((12 + header.len()) as u64, 4).unwrap());
        data.extend_from_slice(&encode_uint(9, 8).unwrap());
        data.extend_from_slice(&encode_uint(header.len() as u64, 4).unwrap());
        data.extend_from_slice(header);

        let result = FrameCodec::new().decode(&data);
        assert!(matches!(result, Err(ProtocolError::InvalidHeader(_))));
    }

    #[test]
    fn test_decode_insufficient_preamble() {
        let result = FrameCodec::new().decode(&[0, 0, 0, 1]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("insufficient data"));
    }

    #[test]
    fn test_encode_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(64);
        let result = codec.encode(1, &FrameHeader::request("/x", Method::Post), &[0u8; 64]);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_try_decode_partial_and_concatenated() {
        let codec = FrameCodec::new();
        let first = codec
            .encode(1, &FrameHeader::request("/a", Method::Get), b"")
            .unwrap();
        let second = codec
            .encode(2, &FrameHeader::request("/b", Method::Post), b"xyz")
            .unwrap();

        for i in 0..first.len() {
            assert!(codec.try_decode(&first[..i]).unwrap().is_none());
        }

        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let (frame, used) = codec.try_decode(&stream).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 1);
        assert_eq!(used, first.len());

        let (frame, used) = codec.try_decode(&stream[used..]).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 2);
        assert_eq!(frame.payload, b"xyz");
        assert_eq!(used, second.len());
    }

    #[test]
    fn test_try_decode_oversized_length() {
        let codec = FrameCodec::with_max_frame_size(1024);
        let data = encode_uint(4096, 4).unwrap();
        assert!(matches!(
            codec.try_decode(&data),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_body_json() {
        let frame = Frame::new(1, response_header(CONTENT_TYPE_JSON), br#"{"data":[1,2]}"#.to_vec());
        assert_eq!(frame.body().unwrap(), ResponseBody::Json(json!({"data": [1, 2]})));
    }

    #[test]
    fn test_body_json_with_charset_parameter() {
        let frame = Frame::new(
            1,
            response_header("application/json; charset=utf-8"),
            b"[]".to_vec(),
        );
        assert_eq!(frame.body().unwrap(), ResponseBody::Json(json!([])));
    }

    #[test]
    fn test_body_empty_json_is_null() {
        let frame = Frame::new(1, response_header(CONTENT_TYPE_JSON), Vec::new());
        assert_eq!(frame.body().unwrap(), ResponseBody::Json(Value::Null));
    }

    #[test]
    fn test_body_gzip_json() {
        let mut header = response_header(CONTENT_TYPE_JSON);
        header.content_encoding = Some("gzip".to_string());
        let frame = Frame::new(5, header, gzip(br#"{"meta":{"rc":"ok"}}"#));

        assert_eq!(
            frame.body().unwrap(),
            ResponseBody::Json(json!({"meta": {"rc": "ok"}}))
        );
    }

    #[test]
    fn test_body_zlib_wrapped_gzip_encoding() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"\x00\x01\x02binary").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut header = response_header(CONTENT_TYPE_OCTET_STREAM);
        header.content_encoding = Some("gzip".to_string());
        let frame = Frame::new(5, header, compressed);

        assert_eq!(
            frame.body().unwrap(),
            ResponseBody::Binary(b"\x00\x01\x02binary".to_vec())
        );
    }

    #[test]
    fn test_body_corrupt_gzip() {
        let mut header = response_header(CONTENT_TYPE_JSON);
        header.content_encoding = Some("gzip".to_string());
        let frame = Frame::new(5, header, vec![0x1f, 0x8b, 0xff, 0xff, 0xff]);

        assert!(matches!(frame.body(), Err(ProtocolError::Decompression(_))));
    }

    #[test]
    fn test_body_octet_stream() {
        let frame = Frame::new(1, response_header(CONTENT_TYPE_OCTET_STREAM), vec![0xde, 0xad]);
        assert_eq!(frame.body().unwrap(), ResponseBody::Binary(vec![0xde, 0xad]));
    }

    #[test]
    fn test_body_other_content_type_is_blob() {
        let frame = Frame::new(1, response_header("text/plain"), b"hello".to_vec());
        assert_eq!(
            frame.body().unwrap(),
            ResponseBody::Blob {
                content_type: Some("text/plain".to_string()),
                data: b"hello".to_vec(),
            }
        );

        let untyped = Frame::new(1, FrameHeader::default(), b"?".to_vec());
        assert!(matches!(
            untyped.body().unwrap(),
            ResponseBody::Blob { content_type: None, .. }
        ));
    }

    #[test]
    fn test_method_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Method::Delete).unwrap(), "\"DELETE\"");
        let method: Method = serde_json::from_str("\"PUT\"").unwrap();
        assert_eq!(method, Method::Put);
        assert!(Method::Get.uses_query_string());
        assert!(!Method::Post.uses_query_string());
    }
}
