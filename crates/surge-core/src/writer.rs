//! Per-connection delivery writer.
//!
//! Drains a connection's mailbox into its transport, one message at a time.
//! The writer never touches the live set; mailbox closure is the only
//! signal it gets from the hub.

use crate::connection::{ConnectionId, SessionError, SessionWriter};
use crate::mailbox::MailboxReceiver;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Why a delivery writer stopped.
#[derive(Debug)]
pub enum WriterExit {
    /// The mailbox was closed and fully drained.
    Drained {
        /// Messages written over the writer's lifetime.
        delivered: u64,
    },
    /// A write failed; the rest of the mailbox was abandoned.
    WriteFailed {
        /// Messages written before the failure.
        delivered: u64,
        /// The failure.
        error: SessionError,
    },
    /// The writer task panicked or was cancelled.
    Aborted,
}

impl WriterExit {
    /// Messages written before the writer stopped.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        match self {
            WriterExit::Drained { delivered } | WriterExit::WriteFailed { delivered, .. } => {
                *delivered
            }
            WriterExit::Aborted => 0,
        }
    }
}

/// Drains one mailbox into one transport.
pub struct DeliveryWriter<W> {
    id: ConnectionId,
    mailbox: MailboxReceiver,
    writer: W,
    write_timeout: Option<Duration>,
}

impl<W: SessionWriter> DeliveryWriter<W> {
    /// Create a writer for a connection.
    #[must_use]
    pub fn new(id: ConnectionId, mailbox: MailboxReceiver, writer: W) -> Self {
        Self {
            id,
            mailbox,
            writer,
            write_timeout: None,
        }
    }

    /// Fail any single write that takes longer than `timeout`.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Run until the mailbox closes or a write fails.
    pub async fn run(mut self) -> WriterExit {
        let mut delivered = 0u64;

        while let Some(message) = self.mailbox.recv().await {
            let result = match self.write_timeout {
                Some(limit) => tokio::time::timeout(limit, self.writer.write(&message))
                    .await
                    .unwrap_or(Err(SessionError::WriteTimeout(limit))),
                None => self.writer.write(&message).await,
            };

            if let Err(error) = result {
                warn!(connection = %self.id, error = %error, "Delivery failed");
                return WriterExit::WriteFailed { delivered, error };
            }

            delivered += 1;
            trace!(connection = %self.id, message = message.id, "Delivered");
        }

        self.writer.finish().await;
        debug!(connection = %self.id, delivered, "Mailbox closed, writer done");
        WriterExit::Drained { delivered }
    }
}
