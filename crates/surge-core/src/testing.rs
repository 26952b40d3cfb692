//! In-memory transport parts for unit tests.

use crate::connection::{CloseSignal, SessionCloser, SessionError, SessionReader, SessionWriter};
use crate::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How a [`MockWriter`] treats writes.
#[derive(Debug, Clone, Copy)]
pub enum WriterBehavior {
    /// Every write succeeds.
    Accept,
    /// The first `n` writes succeed, the next one fails.
    FailAfter(usize),
    /// Writes never complete.
    Stall,
}

/// Records written payloads as UTF-8 strings; `finish` records `"<finish>"`.
pub struct MockWriter {
    behavior: WriterBehavior,
    written: usize,
    sent: mpsc::UnboundedSender<String>,
}

impl MockWriter {
    pub fn new(behavior: WriterBehavior) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sent, rx) = mpsc::unbounded_channel();
        let writer = Self {
            behavior,
            written: 0,
            sent,
        };
        (writer, rx)
    }
}

#[async_trait]
impl SessionWriter for MockWriter {
    async fn write(&mut self, message: &Message) -> Result<(), SessionError> {
        match self.behavior {
            WriterBehavior::Stall => std::future::pending::<()>().await,
            WriterBehavior::FailAfter(n) if self.written >= n => {
                return Err(SessionError::Write("peer reset".into()));
            }
            _ => {}
        }
        self.written += 1;
        let _ = self
            .sent
            .send(String::from_utf8_lossy(&message.payload).into_owned());
        Ok(())
    }

    async fn finish(&mut self) {
        let _ = self.sent.send("<finish>".into());
    }
}

/// Yields whatever is pushed into its inbox; dropping the inbox sender is a
/// clean peer close. Closing its signal ends reads with `Closed`.
pub struct MockReader {
    inbox: mpsc::UnboundedReceiver<Bytes>,
    signal: CloseSignal,
}

impl MockReader {
    pub fn new(signal: CloseSignal) -> (Self, mpsc::UnboundedSender<Bytes>) {
        let (tx, inbox) = mpsc::unbounded_channel();
        (Self { inbox, signal }, tx)
    }
}

#[async_trait]
impl SessionReader for MockReader {
    async fn read(&mut self) -> Result<Option<Bytes>, SessionError> {
        tokio::select! {
            biased;
            _ = self.signal.closed() => Err(SessionError::Closed),
            next = self.inbox.recv() => Ok(next),
        }
    }
}

/// Counts close calls and forwards them to a [`CloseSignal`].
#[derive(Default)]
pub struct CountingCloser {
    pub signal: CloseSignal,
    calls: AtomicUsize,
}

impl CountingCloser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionCloser for CountingCloser {
    async fn close(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.signal.close();
    }
}
