//! Session halves over any WebSocket stream.
//!
//! Both tokio-tungstenite and axum expose a WebSocket as a
//! `Stream + Sink` of their own message type. [`WsFrame`] papers over the
//! difference so one reader and one writer serve both.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;
use surge_core::{
    CloseSignal, ConnectionId, Message, SessionCloser, SessionError, SessionParts, SessionReader,
    SessionWriter,
};
use surge_protocol::{codec, Encoded, Envelope, ProtocolError, WireFormat};
use tracing::trace;

/// What an inbound WebSocket message means to a session.
#[derive(Debug)]
pub enum Inbound {
    /// Application data.
    Data(Bytes),
    /// Ping, pong or a raw frame.
    Control,
    /// The peer sent a close frame.
    Close,
}

/// A WebSocket message type.
pub trait WsFrame: Sized + Send + 'static {
    /// Wrap an encoded envelope.
    fn from_encoded(encoded: Encoded) -> Self;

    /// A close frame.
    fn close() -> Self;

    /// Classify an inbound message.
    fn classify(self) -> Inbound;
}

/// Pick the wire format from a request query string.
///
/// Looks for `format=<name>`, percent-decoded; without one, `default` is
/// used.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownFormat`] for an unrecognized name or a
/// query that does not parse.
pub fn format_from_query(
    query: Option<&str>,
    default: WireFormat,
) -> Result<WireFormat, ProtocolError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query.unwrap_or_default())
        .map_err(|e| ProtocolError::UnknownFormat(e.to_string()))?;

    match pairs.into_iter().find(|(key, _)| key == "format") {
        Some((_, name)) => name.parse(),
        None => Ok(default),
    }
}

/// Split a WebSocket into session parts.
///
/// The sink and stream are usually the two halves of `StreamExt::split`.
pub fn split_session<K, S, M>(
    id: ConnectionId,
    sink: K,
    stream: S,
    format: WireFormat,
    max_message_size: usize,
) -> SessionParts<WsReader<S>, WsWriter<K, M>>
where
    M: WsFrame,
{
    let signal = CloseSignal::new();
    SessionParts {
        id,
        reader: WsReader {
            stream,
            signal: signal.clone(),
            max_message_size,
        },
        writer: WsWriter {
            sink,
            format,
            signal: signal.clone(),
            _frame: PhantomData,
        },
        closer: Arc::new(signal) as Arc<dyn SessionCloser>,
    }
}

/// Inbound half of a WebSocket session.
pub struct WsReader<S> {
    stream: S,
    signal: CloseSignal,
    max_message_size: usize,
}

#[async_trait]
impl<S, M, E> SessionReader for WsReader<S>
where
    S: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
    M: WsFrame,
    E: Display + Send + 'static,
{
    async fn read(&mut self) -> Result<Option<Bytes>, SessionError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.signal.closed() => return Err(SessionError::Closed),
                next = self.stream.next() => next,
            };

            match next {
                None => return Ok(None),
                Some(Err(e)) => return Err(SessionError::Read(e.to_string())),
                Some(Ok(frame)) => match frame.classify() {
                    Inbound::Data(data) if data.len() > self.max_message_size => {
                        return Err(SessionError::TooLarge(data.len()));
                    }
                    Inbound::Data(data) => return Ok(Some(data)),
                    Inbound::Control => continue,
                    Inbound::Close => return Ok(None),
                },
            }
        }
    }
}

/// Outbound half of a WebSocket session.
pub struct WsWriter<K, M> {
    sink: K,
    format: WireFormat,
    signal: CloseSignal,
    _frame: PhantomData<fn() -> M>,
}

impl<K, M> WsWriter<K, M> {
    /// The wire format this writer encodes to.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }
}

#[async_trait]
impl<K, M> SessionWriter for WsWriter<K, M>
where
    K: Sink<M> + Unpin + Send + 'static,
    K::Error: Display,
    M: WsFrame,
{
    async fn write(&mut self, message: &Message) -> Result<(), SessionError> {
        if self.signal.is_closed() {
            return Err(SessionError::Closed);
        }

        let encoded = codec::encode_as(self.format, &Envelope::from(message))
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        trace!(bytes = encoded.len(), format = %self.format, "Writing frame");

        let send = self.sink.send(M::from_encoded(encoded));
        tokio::select! {
            biased;
            _ = self.signal.closed() => Err(SessionError::Closed),
            result = send => result.map_err(|e| SessionError::Write(e.to_string())),
        }
    }

    async fn finish(&mut self) {
        if !self.signal.is_closed() {
            let _ = self.sink.send(M::close()).await;
        }
        let _ = self.sink.close().await;
    }
}
