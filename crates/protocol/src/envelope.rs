//! Signaling relay messages.
//!
//! The relay speaks JSON envelopes tagged by `message`, plus bare `ping` and
//! `pong` text frames used as an application-level heartbeat.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Outbound action request tag.
pub const ACTION_REQUEST: &str = "action:request";

/// Inbound action response tag.
pub const ACTION_RESPONSE: &str = "action:response";

/// Heartbeat request text.
pub const PING: &str = "ping";

/// Heartbeat reply text.
pub const PONG: &str = "pong";

/// A JSON message on the signaling socket.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    /// Response payload fields, kept as sent by the relay.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Builds an `action:request` envelope.
    pub fn action_request(action: impl Into<String>, action_id: impl Into<String>, args: Value) -> Self {
        Self {
            message: ACTION_REQUEST.to_string(),
            action: Some(action.into()),
            action_id: Some(action_id.into()),
            args: Some(args),
            extra: Map::new(),
        }
    }

    pub fn is_action_response(&self) -> bool {
        self.message == ACTION_RESPONSE
    }

    /// Looks up a response field, checking the top level before `args`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra
            .get(key)
            .or_else(|| self.args.as_ref().and_then(|args| args.get(key)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Classification of an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Pong,
    Envelope(Envelope),
    /// Anything else, including JSON that is not an envelope.
    Other(String),
}

impl Inbound {
    pub fn parse(text: &str) -> Self {
        match text {
            PING => Inbound::Ping,
            PONG => Inbound::Pong,
            _ if text.trim_start().starts_with('{') => match serde_json::from_str(text) {
                Ok(envelope) => Inbound::Envelope(envelope),
                Err(_) => Inbound::Other(text.to_string()),
            },
            _ => Inbound::Other(text.to_string()),
        }
    }
}
