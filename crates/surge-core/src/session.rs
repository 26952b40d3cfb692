//! The per-connection session loop for broadcast clients.
//!
//! [`run_session`] registers a connection with the hub, starts its delivery
//! writer, and then only listens for the peer going away. The registration
//! guard guarantees exactly one unregister on every exit path.

use crate::connection::{
    ConnectionHandle, ConnectionId, SessionCloser, SessionError, SessionReader, SessionWriter,
};
use crate::hub::HubHandle;
use crate::mailbox::mailbox;
use crate::writer::{DeliveryWriter, WriterExit};
use std::sync::Arc;
use tracing::{debug, trace};

/// The pieces of an accepted transport session.
pub struct SessionParts<R, W> {
    /// Connection ID.
    pub id: ConnectionId,
    /// Inbound half.
    pub reader: R,
    /// Outbound half.
    pub writer: W,
    /// Closes the whole session.
    pub closer: Arc<dyn SessionCloser>,
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer closed the connection.
    PeerClosed,
    /// The session was closed locally (eviction or shutdown).
    Closed,
    /// Reading from the peer failed.
    ReadFailed(SessionError),
    /// The delivery writer stopped first.
    WriterExited(WriterExit),
    /// The hub was already shut down.
    HubClosed,
}

/// Serve one broadcast client until it disconnects, fails, or is evicted.
///
/// Inbound payloads are read only to notice the peer going away; their
/// contents are discarded.
pub async fn run_session<R, W>(hub: &HubHandle, parts: SessionParts<R, W>) -> SessionEnd
where
    R: SessionReader,
    W: SessionWriter,
{
    let SessionParts {
        id,
        mut reader,
        writer,
        closer,
    } = parts;

    let (tx, rx) = mailbox(hub.config().mailbox_capacity);
    let registration = match hub.register(ConnectionHandle::new(id.clone(), tx, closer)) {
        Ok(registration) => registration,
        Err(_) => return SessionEnd::HubClosed,
    };

    let mut writer_task = tokio::spawn(
        DeliveryWriter::new(id.clone(), rx, writer)
            .with_write_timeout(hub.config().write_timeout)
            .run(),
    );

    debug!(connection = %id, "Session started");

    let mut writer_done = false;
    let end = loop {
        tokio::select! {
            inbound = reader.read() => match inbound {
                Ok(Some(payload)) => {
                    trace!(connection = %id, bytes = payload.len(), "Ignoring inbound payload");
                }
                Ok(None) => break SessionEnd::PeerClosed,
                Err(SessionError::Closed) => break SessionEnd::Closed,
                Err(e) => break SessionEnd::ReadFailed(e),
            },
            exit = &mut writer_task => {
                writer_done = true;
                break SessionEnd::WriterExited(exit.unwrap_or(WriterExit::Aborted));
            }
        }
    };

    drop(registration);

    if !writer_done {
        match end {
            // The transport is closed; nothing queued can be written anymore.
            SessionEnd::Closed => writer_task.abort(),
            // The unregister closes the mailbox, which lets the writer drain.
            _ => {
                let _ = writer_task.await;
            }
        }
    }

    debug!(connection = %id, end = ?end, "Session ended");
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseSignal;
    use crate::hub::{Hub, HubConfig};
    use crate::message::Message;
    use crate::testing::{CountingCloser, MockReader, MockWriter, WriterBehavior};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Client {
        inbox: mpsc::UnboundedSender<Bytes>,
        sent: mpsc::UnboundedReceiver<String>,
        closer: Arc<CountingCloser>,
        task: tokio::task::JoinHandle<SessionEnd>,
    }

    fn connect(hub: &HubHandle, id: &str, behavior: WriterBehavior) -> Client {
        let closer = CountingCloser::new();
        let (reader, inbox) = MockReader::new(closer.signal.clone());
        let (writer, sent) = MockWriter::new(behavior);
        let parts = SessionParts {
            id: id.into(),
            reader,
            writer,
            closer: Arc::clone(&closer) as Arc<dyn SessionCloser>,
        };
        let hub = hub.clone();
        let task = tokio::spawn(async move { run_session(&hub, parts).await });
        Client {
            inbox,
            sent,
            closer,
            task,
        }
    }

    async fn wait_for_members(hub: &HubHandle, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.members().await.unwrap().len() != n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("membership never settled");
    }

    #[tokio::test]
    async fn test_peer_close_unregisters_and_drains() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let mut client = connect(&hub, "a", WriterBehavior::Accept);
        wait_for_members(&hub, 1).await;

        hub.broadcast(Message::new("x")).await.unwrap();
        assert_eq!(client.sent.recv().await.unwrap(), "x");

        // Inbound data is ignored, not fatal.
        client.inbox.send(Bytes::from_static(b"hi")).unwrap();
        drop(client.inbox);

        assert!(matches!(client.task.await.unwrap(), SessionEnd::PeerClosed));
        assert!(hub.members().await.unwrap().is_empty());
        assert_eq!(client.sent.recv().await.unwrap(), "<finish>");
        assert_eq!(client.closer.calls(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_ends_session() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let client = connect(&hub, "a", WriterBehavior::FailAfter(0));
        wait_for_members(&hub, 1).await;

        hub.broadcast(Message::new("x")).await.unwrap();

        match client.task.await.unwrap() {
            SessionEnd::WriterExited(WriterExit::WriteFailed { delivered, .. }) => {
                assert_eq!(delivered, 0);
            }
            other => panic!("Expected writer failure, got {:?}", other),
        }
        assert!(hub.members().await.unwrap().is_empty());
        drop(client.inbox);
    }

    #[tokio::test]
    async fn test_eviction_closes_session() {
        let config = HubConfig {
            mailbox_capacity: 1,
            ..HubConfig::default()
        };
        let (hub, _task) = Hub::spawn(config);
        let client = connect(&hub, "stuck", WriterBehavior::Stall);
        wait_for_members(&hub, 1).await;

        // First message is taken by the stalled writer, the second fills the
        // mailbox, the third overflows it.
        for body in ["m1", "m2", "m3", "m4"] {
            hub.broadcast(Message::new(body)).await.unwrap();
        }

        let end = tokio::time::timeout(Duration::from_secs(5), client.task)
            .await
            .expect("evicted session did not end")
            .unwrap();
        assert!(matches!(end, SessionEnd::Closed));
        assert_eq!(client.closer.calls(), 1);

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.live, 0);
        drop(client.inbox);
    }

    #[tokio::test]
    async fn test_hub_closed_before_register() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        hub.shutdown();
        task.await.unwrap();

        let signal = CloseSignal::new();
        let (reader, _inbox) = MockReader::new(signal.clone());
        let (writer, _sent) = MockWriter::new(WriterBehavior::Accept);
        let parts = SessionParts {
            id: "late".into(),
            reader,
            writer,
            closer: Arc::new(signal),
        };
        assert!(matches!(run_session(&hub, parts).await, SessionEnd::HubClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_and_broadcasts() {
        const CLIENTS: usize = 64;
        const PRODUCERS: usize = 4;
        const BROADCASTS: usize = 200;

        let (hub, _task) = Hub::spawn(HubConfig {
            mailbox_capacity: PRODUCERS * BROADCASTS + 1,
            ..HubConfig::default()
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    for i in 0..BROADCASTS {
                        hub.broadcast(Message::new(format!("{}:{}", p, i)))
                            .await
                            .unwrap();
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        let clients: Vec<Client> = (0..CLIENTS)
            .map(|i| connect(&hub, &format!("c{}", i), WriterBehavior::Accept))
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        wait_for_members(&hub, CLIENTS).await;

        // Half of the clients leave.
        let (leaving, mut staying): (Vec<_>, Vec<_>) = clients
            .into_iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);
        for (_, client) in leaving {
            drop(client.inbox);
            assert!(matches!(client.task.await.unwrap(), SessionEnd::PeerClosed));
        }

        let members = hub.members().await.unwrap();
        let mut expected: Vec<ConnectionId> = staying
            .iter()
            .map(|(i, _)| ConnectionId::from(format!("c{}", i)))
            .collect();
        expected.sort();
        assert_eq!(members, expected);

        // Each producer's messages arrive in the order it sent them.
        for (_, client) in staying.iter_mut() {
            let mut last: [Option<usize>; PRODUCERS] = [None; PRODUCERS];
            while let Ok(body) = client.sent.try_recv() {
                let (p, i) = body.split_once(':').unwrap();
                let (p, i): (usize, usize) = (p.parse().unwrap(), i.parse().unwrap());
                assert!(last[p].map_or(true, |prev| i > prev));
                last[p] = Some(i);
            }
            assert_eq!(client.closer.calls(), 0);
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.broadcasts, (PRODUCERS * BROADCASTS) as u64);
        assert_eq!(stats.registered, CLIENTS as u64);
        assert_eq!(stats.unregistered, (CLIENTS / 2) as u64);
        assert_eq!(stats.live, CLIENTS / 2);
        assert_eq!(stats.evicted, 0);

        drop(staying);
    }
}
