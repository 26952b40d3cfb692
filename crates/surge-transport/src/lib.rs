//! # surge-transport
//!
//! Transport layer for the Surge fan-out hub.
//!
//! Transports hand the hub accepted sessions as [`SessionParts`]: a reader,
//! a writer and a closer. Two WebSocket front ends are provided:
//!
//! - **axum** - sockets upgraded by an axum router ([`split_socket`])
//! - **tokio-tungstenite** - a standalone listener ([`WebSocketTransport`])
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use surge_transport::{serve_hub, WebSocketTransport};
//!
//! let transport = WebSocketTransport::bind("127.0.0.1:5000".parse()?).await?;
//! serve_hub(Arc::new(transport), hub).await?;
//! ```
//!
//! [`SessionParts`]: surge_core::SessionParts

pub mod socket;
pub mod traits;
pub mod upgrade;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use socket::{format_from_query, split_session, Inbound, WsFrame, WsReader, WsWriter};
pub use traits::{serve_hub, Transport, TransportError};
pub use upgrade::{split_socket, UpgradedReader, UpgradedWriter};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
