//! Transport abstraction traits for Surge.
//!
//! A transport accepts client sessions and hands them over already split
//! into the parts the hub drives: a reader, a writer and a closer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use surge_core::{run_session, HubHandle, SessionParts, SessionReader, SessionWriter};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handshake with a client failed. The listener is still usable.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The client did not finish the handshake in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// I/O error on the listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error only affects one client.
    #[must_use]
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            TransportError::Handshake(_) | TransportError::HandshakeTimeout(_)
        )
    }
}

/// A transport that can accept sessions.
///
/// Accepting is split in two so a slow peer never holds up the listener:
/// [`accept`](Transport::accept) only waits for a connection, and
/// [`handshake`](Transport::handshake) runs in that connection's own task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Inbound half of accepted sessions.
    type Reader: SessionReader;
    /// Outbound half of accepted sessions.
    type Writer: SessionWriter;
    /// A connection that has not completed its handshake yet.
    type Pending: Send + 'static;

    /// Accept the next connection.
    async fn accept(&self) -> Result<Self::Pending, TransportError>;

    /// Complete the handshake of an accepted connection.
    async fn handshake(
        &self,
        pending: Self::Pending,
    ) -> Result<SessionParts<Self::Reader, Self::Writer>, TransportError>;

    /// How long a peer gets to complete the handshake.
    fn handshake_timeout(&self) -> Duration;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

async fn handshake_within<T: Transport>(
    transport: &T,
    pending: T::Pending,
) -> Result<SessionParts<T::Reader, T::Writer>, TransportError> {
    let limit = transport.handshake_timeout();
    tokio::time::timeout(limit, transport.handshake(pending))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(limit))?
}

/// Accept sessions from `transport` and serve each one against `hub`.
///
/// Every accepted connection gets its own task, which runs the handshake
/// under [`Transport::handshake_timeout`] and then the session. Handshake
/// failures only cost the client that caused them. Stops accepting once
/// the hub has shut down.
///
/// # Errors
///
/// Returns the first listener-level error.
pub async fn serve_hub<T>(transport: Arc<T>, hub: HubHandle) -> Result<(), TransportError>
where
    T: Transport + 'static,
{
    info!(transport = transport.name(), "Accepting sessions");

    while !hub.is_closed() {
        let pending = match transport.accept().await {
            Ok(pending) => pending,
            Err(e) if e.is_per_connection() => {
                warn!(transport = transport.name(), error = %e, "Rejected client");
                continue;
            }
            Err(e) => {
                error!(transport = transport.name(), error = %e, "Listener failed");
                return Err(e);
            }
        };

        let transport = Arc::clone(&transport);
        let hub = hub.clone();
        tokio::spawn(async move {
            let parts = match handshake_within(&*transport, pending).await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(transport = transport.name(), error = %e, "Rejected client");
                    return;
                }
            };

            let id = parts.id.clone();
            let end = run_session(&hub, parts).await;
            debug!(connection = %id, end = ?end, "Session finished");
        });
    }

    info!(transport = transport.name(), "Hub closed, no longer accepting");
    Ok(())
}
