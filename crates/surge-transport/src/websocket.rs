//! WebSocket transport implementation.
//!
//! This module provides a standalone WebSocket listener using
//! tokio-tungstenite. Clients pick their wire format with `?format=` on
//! the upgrade request.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use surge_core::{ConnectionId, SessionParts};
use surge_protocol::{Encoded, WireFormat};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info};

use crate::socket::{format_from_query, split_session, Inbound, WsFrame, WsReader, WsWriter};
use crate::traits::{Transport, TransportError};

/// Default maximum inbound message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default time a client gets to send its upgrade request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Wire format for clients that do not ask for one.
    pub format: WireFormat,
    /// Time allowed for the WebSocket handshake.
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            format: WireFormat::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

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
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Control,
            Message::Close(_) => Inbound::Close,
        }
    }
}

type TcpWebSocket = WebSocketStream<TcpStream>;

/// Inbound half of a tungstenite session.
pub type WebSocketReader = WsReader<SplitStream<TcpWebSocket>>;

/// Outbound half of a tungstenite session.
pub type WebSocketWriter = WsWriter<SplitSink<TcpWebSocket, Message>, Message>;

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        info!(
            "WebSocket transport listening on {}",
            listener.local_addr()?
        );

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;
    type Pending = (TcpStream, SocketAddr);

    async fn accept(&self) -> Result<Self::Pending, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        Ok((stream, addr))
    }

    async fn handshake(
        &self,
        pending: Self::Pending,
    ) -> Result<SessionParts<Self::Reader, Self::Writer>, TransportError> {
        let (stream, addr) = pending;
        let default_format = self.config.format;
        let mut format = default_format;
        let negotiate = |request: &Request, response: Response| {
            match format_from_query(request.uri().query(), default_format) {
                Ok(requested) => {
                    format = requested;
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        };

        let ws_stream = accept_hdr_async(stream, negotiate)
            .await
            .map_err(|e| TransportError::Handshake(format!("{}: {}", addr, e)))?;

        let id = ConnectionId::generate();
        debug!(connection = %id, %addr, %format, "WebSocket handshake completed");

        let (sink, stream) = ws_stream.split();
        Ok(split_session(
            id,
            sink,
            stream,
            format,
            self.config.max_message_size,
        ))
    }

    fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
