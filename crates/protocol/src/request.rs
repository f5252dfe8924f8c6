//! API request builder.
//!
//! Turns a caller-facing request (`path`, method, optional body) into the
//! frame header and payload expected by the device's API channel.

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::framing::{FrameHeader, Method, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM};

/// Body of an API request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    /// Serialized as UTF-8 JSON text.
    Json(Value),
    /// Sent verbatim.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

/// Options for one framed request: `{method, contentType, data}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub content_type: Option<String>,
    pub data: Option<RequestData>,
}

impl ApiRequest {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn delete() -> Self {
        Self::new(Method::Delete)
    }

    pub fn post(data: RequestData) -> Self {
        Self::new(Method::Post).with_data(data)
    }

    pub fn put(data: RequestData) -> Self {
        Self::new(Method::Put).with_data(data)
    }

    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: RequestData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_json(self, value: Value) -> Self {
        self.with_data(RequestData::Json(value))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Builds the frame header and payload for `uri`.
    ///
    /// A `?` in `uri` splits it into `path` and `queryString`. For GET and
    /// DELETE the request data replaces the query string and no payload is
    /// sent; other methods carry the data as the payload.
    pub fn build(&self, uri: &str) -> Result<(FrameHeader, Vec<u8>)> {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (uri, None),
        };

        let mut header = FrameHeader::request(path, self.method);
        header.query_string = query;
        header.content_type = self.content_type.clone();

        if self.method.uses_query_string() {
            if let Some(data) = &self.data {
                header.query_string = Some(query_string(data)?);
            }
            return Ok((header, Vec::new()));
        }

        if header.content_type.is_none() {
            header.content_type = self.data.as_ref().and_then(inferred_content_type);
        }

        let payload = match &self.data {
            None => Vec::new(),
            Some(RequestData::Json(value)) => serde_json::to_vec(value)?,
            Some(RequestData::Text(text)) => text.as_bytes().to_vec(),
            Some(RequestData::Binary(bytes)) => bytes.clone(),
        };

        Ok((header, payload))
    }
}

fn inferred_content_type(data: &RequestData) -> Option<String> {
    match data {
        RequestData::Json(_) => Some(CONTENT_TYPE_JSON.to_string()),
        RequestData::Binary(_) => Some(CONTENT_TYPE_OCTET_STREAM.to_string()),
        RequestData::Text(_) => None,
    }
}

/// Serializes request data for the `queryString` header field.
fn query_string(data: &RequestData) -> Result<String> {
    match data {
        RequestData::Text(text) => Ok(text.clone()),
        RequestData::Json(Value::String(text)) => Ok(text.clone()),
        RequestData::Json(Value::Object(map)) => {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in map {
                match value {
                    Value::Null => {}
                    Value::String(s) => {
                        serializer.append_pair(key, s);
                    }
                    other => {
                        serializer.append_pair(key, &other.to_string());
                    }
                }
            }
            Ok(serializer.finish())
        }
        RequestData::Json(other) => Err(ProtocolError::InvalidRequest(format!(
            "query data must be an object or string, got {}",
            other
        ))),
        RequestData::Binary(_) => Err(ProtocolError::InvalidRequest(
            "binary data cannot be sent as a query string".to_string(),
        )),
    }
}
