//! Connections and the transport seams the hub drives them through.
//!
//! A transport session is split three ways:
//!
//! - a [`SessionWriter`] owned by the delivery writer,
//! - a [`SessionReader`] owned by the session loop,
//! - a [`SessionCloser`] shared with the hub so it can close the session
//!   when it evicts the connection.

use crate::mailbox::MailboxSender;
use crate::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let seq = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let epoch = crate::message::now_millis();
        Self(format!("conn_{:x}_{:x}", epoch, seq))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors raised by a transport session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was closed locally.
    #[error("Session closed")]
    Closed,

    /// Writing to the peer failed.
    #[error("Write failed: {0}")]
    Write(String),

    /// A write did not finish within the deadline.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Reading from the peer failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// Inbound frame larger than allowed.
    #[error("Inbound message of {0} bytes exceeds limit")]
    TooLarge(usize),

    /// The message could not be encoded for this client.
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Outbound half of a session.
#[async_trait]
pub trait SessionWriter: Send + 'static {
    /// Write one message in the client's wire encoding.
    async fn write(&mut self, message: &Message) -> Result<(), SessionError>;

    /// Called once after the mailbox closes, before the writer exits.
    async fn finish(&mut self) {}
}

/// Inbound half of a session.
#[async_trait]
pub trait SessionReader: Send + 'static {
    /// Wait for the next inbound payload.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly and
    /// `Err(SessionError::Closed)` when the session was closed locally.
    async fn read(&mut self) -> Result<Option<Bytes>, SessionError>;
}

/// Closes a session from outside its own tasks.
///
/// Implementations must be idempotent and must not wait on the peer.
#[async_trait]
pub trait SessionCloser: Send + Sync + 'static {
    /// Close the session.
    async fn close(&self);
}

/// Idempotent close flag shared by every part of a session.
///
/// Readers wait on [`CloseSignal::closed`] alongside the transport so that
/// closing the signal ends the session loop.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    /// Create an open signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the signal closed.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Whether the signal has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is closed.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionCloser for CloseSignal {
    async fn close(&self) {
        CloseSignal::close(self);
    }
}

/// The hub's view of a live connection.
///
/// Dropping the handle closes the connection's mailbox.
pub struct ConnectionHandle {
    id: ConnectionId,
    mailbox: MailboxSender,
    closer: Arc<dyn SessionCloser>,
}

impl ConnectionHandle {
    /// Create a handle from the connection's mailbox and closer.
    #[must_use]
    pub fn new(id: ConnectionId, mailbox: MailboxSender, closer: Arc<dyn SessionCloser>) -> Self {
        Self {
            id,
            mailbox,
            closer,
        }
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The connection's mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &MailboxSender {
        &self.mailbox
    }

    /// A shared reference to the session closer.
    #[must_use]
    pub fn closer(&self) -> Arc<dyn SessionCloser> {
        Arc::clone(&self.closer)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("queued", &self.mailbox.len())
            .finish()
    }
}
