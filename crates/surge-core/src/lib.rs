//! # surge-core
//!
//! Connection registry and broadcast engine for the Surge fan-out hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Single-owner live set with non-blocking, evict-on-full fan-out
//! - **Mailbox** - Bounded per-connection outbound queue
//! - **Writer** - Drains a mailbox into a transport
//! - **Session** - Registers a connection for as long as its peer stays
//! - **Ingest** - Input queue with named downstream stages
//! - **Producer** - Relay stages that decode payloads and feed the hub
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐    ┌────────┐    ┌─────────┐    ┌──────────┐    ┌─────────┐
//! │ Ingest  │───▶│ Relay  │───▶│   Hub   │───▶│ Mailbox  │───▶│ Writer  │───▶ client
//! └─────────┘    └────────┘    └─────────┘    └──────────┘    └─────────┘
//!                                   ▲
//!                                   │ register / unregister
//!                              ┌─────────┐
//!                              │ Session │◀── client
//!                              └─────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod ingest;
pub mod mailbox;
pub mod message;
pub mod producer;
pub mod session;
pub mod writer;

#[cfg(test)]
mod testing;

pub use connection::{
    CloseSignal, ConnectionHandle, ConnectionId, SessionCloser, SessionError, SessionReader,
    SessionWriter,
};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats, Registration};
pub use ingest::{
    ingest, run_ingest_session, Ingest, IngestConfig, IngestError, IngestHandle, StageRegistry,
};
pub use mailbox::{mailbox, Enqueue, MailboxReceiver, MailboxSender};
pub use message::Message;
pub use producer::{spawn_relay, DecodeError, Decoder, RelayStats};
pub use session::{run_session, SessionEnd, SessionParts};
pub use writer::{DeliveryWriter, WriterExit};
