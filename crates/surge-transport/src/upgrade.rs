//! Sessions over WebSockets upgraded by axum.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use surge_core::{ConnectionId, SessionParts};
use surge_protocol::{Encoded, WireFormat};

use crate::socket::{split_session, Inbound, WsFrame, WsReader, WsWriter};

impl WsFrame for Message {
    fn from_encoded(encoded: Encoded) -> Self {
        match encoded {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(bytes) => Message::Binary(bytes.to_vec()),
        }
    }

    fn close() -> Self {
        Message::Close(None)
    }

    fn classify(self) -> Inbound {
        match self {
            Message::Text(text) => Inbound::Data(Bytes::from(text)),
            Message::Binary(data) => Inbound::Data(Bytes::from(data)),
            Message::Ping(_) | Message::Pong(_) => Inbound::Control,
            Message::Close(_) => Inbound::Close,
        }
    }
}

/// Inbound half of an upgraded axum socket.
pub type UpgradedReader = WsReader<SplitStream<WebSocket>>;

/// Outbound half of an upgraded axum socket.
pub type UpgradedWriter = WsWriter<SplitSink<WebSocket, Message>, Message>;

/// Split an upgraded socket into session parts with a fresh connection ID.
#[must_use]
pub fn split_socket(
    socket: WebSocket,
    format: WireFormat,
    max_message_size: usize,
) -> SessionParts<UpgradedReader, UpgradedWriter> {
    let (sink, stream) = socket.split();
    split_session(
        ConnectionId::generate(),
        sink,
        stream,
        format,
        max_message_size,
    )
}
