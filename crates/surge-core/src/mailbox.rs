//! Bounded per-connection outbound queue.
//!
//! The sending half lives inside the hub's live set and is the only way
//! anything gets queued for a connection. It cannot be cloned, so the
//! mailbox closes exactly once: when the hub drops it.

use crate::message::Message;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The message was queued.
    Enqueued,
    /// The mailbox is full or its writer is gone.
    WouldBlock,
}

/// Create a mailbox with the given capacity.
///
/// A capacity of zero is raised to one.
#[must_use]
pub fn mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MailboxSender { tx }, MailboxReceiver { rx })
}

/// Sending half, owned by the hub.
#[derive(Debug)]
pub struct MailboxSender {
    tx: mpsc::Sender<Arc<Message>>,
}

impl MailboxSender {
    /// Try to queue a message without waiting.
    pub fn offer(&self, message: Arc<Message>) -> Enqueue {
        match self.tx.try_send(message) {
            Ok(()) => Enqueue::Enqueued,
            // Nothing will drain a mailbox whose writer has exited.
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => Enqueue::WouldBlock,
        }
    }

    /// Mailbox capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving half, owned by the connection's delivery writer.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<Arc<Message>>,
}

impl MailboxReceiver {
    /// Wait for the next message.
    ///
    /// Returns `None` once the mailbox is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.rx.recv().await
    }

    /// Take the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.rx.try_recv().ok()
    }

    /// Whether the sending half has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &'static str) -> Arc<Message> {
        Arc::new(Message::new(body))
    }

    #[test]
    fn test_offer_until_full() {
        let (tx, mut rx) = mailbox(2);
        assert_eq!(tx.offer(msg("a")), Enqueue::Enqueued);
        assert_eq!(tx.offer(msg("b")), Enqueue::Enqueued);
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.offer(msg("c")), Enqueue::WouldBlock);

        assert_eq!(&rx.try_recv().unwrap().payload[..], b"a");
        assert_eq!(tx.offer(msg("d")), Enqueue::Enqueued);
    }

    #[test]
    fn test_offer_after_writer_gone() {
        let (tx, rx) = mailbox(4);
        drop(rx);
        assert_eq!(tx.offer(msg("a")), Enqueue::WouldBlock);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, mut rx) = mailbox(4);
        tx.offer(msg("a"));
        tx.offer(msg("b"));
        drop(tx);

        assert!(rx.is_closed());
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"a");
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"b");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_zero_capacity_raised() {
        let (tx, _rx) = mailbox(0);
        assert_eq!(tx.capacity(), 1);
    }
}
