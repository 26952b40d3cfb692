//! Broadcast message type.
//!
//! A message is handed to the hub once and then shared, read-only, by every
//! mailbox it is fanned out to.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use surge_protocol::Envelope;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    now_nanos() / 1_000_000
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    now_nanos().wrapping_add(counter)
}

/// A message to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Creation time in milliseconds.
    pub timestamp: u64,
    /// Optional message type.
    pub kind: Option<String>,
    /// Source connection ID, for messages that came through the input endpoint.
    pub source: Option<String>,
    /// Message payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            timestamp: now_millis(),
            kind: None,
            source: None,
            payload: payload.into(),
        }
    }

    /// Set the message type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the source connection.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Build a message from a decoded envelope.
    ///
    /// A zero id or timestamp means the producer left it to the hub.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            id: if envelope.id == 0 {
                generate_message_id()
            } else {
                envelope.id
            },
            timestamp: if envelope.timestamp == 0 {
                now_millis()
            } else {
                envelope.timestamp
            },
            kind: envelope.kind,
            source: envelope.source,
            payload: Bytes::from(envelope.payload.into_bytes()),
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

impl From<&Message> for Envelope {
    fn from(message: &Message) -> Self {
        let mut envelope = Envelope::new(&message.payload);
        envelope.id = message.id;
        envelope.timestamp = message.timestamp;
        envelope.kind = message.kind.clone();
        envelope.source = message.source.clone();
        envelope
    }
}
