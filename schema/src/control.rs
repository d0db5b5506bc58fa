//! Control messages exchanged over a child's stdout
//!
//! A control line is the literal [`MSG_PREFIX`] followed by a single JSON
//! object and a newline:
//!
//! ```text
//! #tether {"type":"ready"}
//! #tether {"type":"vars","vars":{"addr":"127.0.0.1:4000"}}
//! ```
//!
//! Lines without the prefix are ordinary output and carry no meaning for the
//! protocol.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Leading bytes that mark a stdout line as a control message
pub const MSG_PREFIX: &str = "#tether ";

/// A message sent from a child process to its parent
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// The child has finished initializing
    Ready,
    /// Key/value state published by the child; merged into what the parent
    /// has already received
    Vars {
        /// Variables to merge, overwriting existing keys
        vars: BTreeMap<String, String>,
    },
}

/// Errors raised while decoding a control line
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload after the prefix is not a valid message object
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// The payload parsed but its `type` tag is not recognized
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
}

/// Loose shape used to tell a bad tag apart from bad JSON
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    vars: Option<BTreeMap<String, String>>,
}

impl ControlMessage {
    /// Build a `vars` message from any iterator of key/value pairs
    pub fn vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ControlMessage::Vars {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Decode the JSON payload that follows [`MSG_PREFIX`] on a control line
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match envelope.kind.as_str() {
            "ready" => Ok(ControlMessage::Ready),
            "vars" => Ok(ControlMessage::Vars {
                vars: envelope.vars.unwrap_or_default(),
            }),
            _ => Err(ProtocolError::UnknownType(envelope.kind)),
        }
    }

    /// Encode as a complete control line, prefix and trailing newline included
    pub fn encode_line(&self) -> String {
        // Serializing a map of strings cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{MSG_PREFIX}{json}\n")
    }
}
