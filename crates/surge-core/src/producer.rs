//! Relay stages: the producers that feed the hub.
//!
//! A relay stage decodes each payload it receives into a [`Message`] and
//! hands it to the hub. The hub's bounded broadcast queue is the only place
//! a relay can be made to wait.

use crate::hub::HubHandle;
use crate::ingest::StageSender;
use crate::message::Message;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use surge_protocol::{codec, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decode errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not a valid JSON envelope.
    #[error("Invalid envelope: {0}")]
    Envelope(#[from] ProtocolError),

    /// Unknown decoder name.
    #[error("Unknown decoder: {0}")]
    UnknownDecoder(String),
}

/// How a relay turns payloads into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    /// The payload is the message body.
    Raw,
    /// The payload is a JSON envelope.
    Json,
}

impl Decoder {
    /// Decode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if a JSON payload is not a valid envelope.
    pub fn decode(&self, payload: Bytes) -> Result<Message, DecodeError> {
        match self {
            Decoder::Raw => Ok(Message::new(payload)),
            Decoder::Json => {
                let envelope = codec::decode_json(&payload)?;
                Ok(Message::from_envelope(envelope))
            }
        }
    }

    /// Decoder name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Decoder::Raw => "raw",
            Decoder::Json => "json",
        }
    }
}

impl fmt::Display for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decoder {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Decoder::Raw),
            "json" => Ok(Decoder::Json),
            other => Err(DecodeError::UnknownDecoder(other.to_string())),
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Payloads broadcast.
    pub relayed: u64,
    /// Payloads that failed to decode.
    pub rejected: u64,
}

/// Spawn a relay stage feeding `hub`.
///
/// Returns the stage's input, to be registered in a
/// [`StageRegistry`](crate::ingest::StageRegistry), and the task, which
/// ends when every sender is dropped or the hub shuts down.
#[must_use]
pub fn spawn_relay(
    name: impl Into<String>,
    decoder: Decoder,
    hub: HubHandle,
    capacity: usize,
) -> (StageSender, JoinHandle<RelayStats>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(relay(name.into(), decoder, hub, rx));
    (tx, task)
}

async fn relay(
    name: String,
    decoder: Decoder,
    hub: HubHandle,
    mut rx: mpsc::Receiver<Bytes>,
) -> RelayStats {
    debug!(stage = %name, %decoder, "Relay started");
    let mut stats = RelayStats::default();

    while let Some(payload) = rx.recv().await {
        let message = match decoder.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(stage = %name, error = %e, "Dropping undecodable payload");
                stats.rejected += 1;
                continue;
            }
        };

        if hub.broadcast(message).await.is_err() {
            info!(stage = %name, "Hub closed, relay stopping");
            break;
        }
        stats.relayed += 1;
    }

    debug!(stage = %name, ?stats, "Relay stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, SessionCloser};
    use crate::hub::{Hub, HubConfig};
    use crate::mailbox::mailbox;
    use crate::testing::CountingCloser;
    use std::sync::Arc;

    #[test]
    fn test_raw_decoder() {
        let message = Decoder::Raw.decode(Bytes::from_static(b"plain")).unwrap();
        assert_eq!(&message.payload[..], b"plain");
        assert!(message.kind.is_none());
    }

    #[test]
    fn test_json_decoder() {
        let payload = Bytes::from_static(br#"{"type":"alert","payload":"disk full"}"#);
        let message = Decoder::Json.decode(payload).unwrap();
        assert_eq!(message.kind.as_deref(), Some("alert"));
        assert_eq!(&message.payload[..], b"disk full");
    }

    #[test]
    fn test_json_decoder_rejects_garbage() {
        assert!(matches!(
            Decoder::Json.decode(Bytes::from_static(b"not json")),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn test_decoder_names() {
        assert_eq!("json".parse::<Decoder>().unwrap(), Decoder::Json);
        assert_eq!(Decoder::Raw.to_string(), "raw");
        assert!("xml".parse::<Decoder>().is_err());
    }

    #[tokio::test]
    async fn test_relay_broadcasts_decoded_payloads() {
        let (hub, _hub_task) = Hub::spawn(HubConfig::default());
        let (tx, mut rx) = mailbox(8);
        let _registration = hub
            .register(ConnectionHandle::new(
                "sub".into(),
                tx,
                CountingCloser::new() as Arc<dyn SessionCloser>,
            ))
            .unwrap();

        let (stage, relay) = spawn_relay("json", Decoder::Json, hub.clone(), 8);
        stage
            .send(Bytes::from_static(br#"{"payload":"one"}"#))
            .await
            .unwrap();
        stage.send(Bytes::from_static(b"{broken")).await.unwrap();
        stage
            .send(Bytes::from_static(br#"{"payload":"two"}"#))
            .await
            .unwrap();
        drop(stage);

        let stats = relay.await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                relayed: 2,
                rejected: 1
            }
        );
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"one");
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"two");
    }

    #[tokio::test]
    async fn test_relay_stops_with_hub() {
        let (hub, hub_task) = Hub::spawn(HubConfig::default());
        let (stage, relay) = spawn_relay("raw", Decoder::Raw, hub.clone(), 8);

        hub.shutdown();
        hub_task.await.unwrap();

        stage.send(Bytes::from_static(b"late")).await.unwrap();
        let stats = relay.await.unwrap();
        assert_eq!(stats.relayed, 0);
    }
}
