//! The on-the-wire shape of a broadcast message.
//!
//! The same envelope is used by producers pushing structured records into
//! the input endpoint and by the hub when it writes to output clients.

use serde::{Deserialize, Serialize};

/// Message payload.
///
/// UTF-8 payloads are carried as strings so JSON clients can read them
/// directly. Anything else is carried as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Arbitrary bytes (MessagePack `bin`, JSON array of numbers).
    Binary(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Payload {
    /// Pick the most readable representation for raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Payload::Text(text.to_owned()),
            Err(_) => Payload::Binary(bytes.to_vec()),
        }
    }

    /// Consume the payload, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

/// A message as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message identifier. Zero when a producer leaves it to the hub.
    #[serde(default)]
    pub id: u64,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    /// Optional message type, e.g. `"metric"` or `"log"`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Optional origin of the message (an input connection id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Message body.
    #[serde(default)]
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope around a payload with no id or timestamp.
    #[must_use]
    pub fn new(payload: impl AsRef<[u8]>) -> Self {
        Self {
            id: 0,
            timestamp: 0,
            kind: None,
            source: None,
            payload: Payload::from_bytes(payload.as_ref()),
        }
    }

    /// Set the message type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the message source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
