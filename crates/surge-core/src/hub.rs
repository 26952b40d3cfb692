//! The registry and broadcast engine.
//!
//! One task owns the live set of connections. Everything else talks to it
//! through a [`HubHandle`]: registrations and unregistrations go through an
//! unbounded control queue, messages through a bounded broadcast queue.
//! Because the set has a single owner it needs no lock.
//!
//! Broadcast never waits on a client. Each live mailbox is offered the
//! message without blocking; a mailbox that cannot take it gets its
//! connection evicted on the spot.
//!
//! ```text
//!   register / unregister ──▶ ┌──────────┐ ──offer──▶ mailbox ──▶ writer ──▶ client
//!                             │   Hub    │ ──offer──▶ mailbox ──▶ writer ──▶ client
//!   broadcast (bounded)   ──▶ └──────────┘ ──evict──▶ close()  (detached)
//! ```

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::mailbox::{Enqueue, DEFAULT_MAILBOX_CAPACITY};
use crate::message::Message;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Default capacity of the broadcast queue.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Hub errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The hub has shut down.
    #[error("Hub is shut down")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's mailbox.
    pub mailbox_capacity: usize,
    /// Capacity of the broadcast queue in front of the hub.
    pub broadcast_capacity: usize,
    /// Deadline for a single write to a client, if any.
    pub write_timeout: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            write_timeout: None,
        }
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Connections currently in the live set.
    pub live: usize,
    /// Successful registrations.
    pub registered: u64,
    /// Connections removed by an explicit unregister.
    pub unregistered: u64,
    /// Connections removed because their mailbox was full.
    pub evicted: u64,
    /// Registrations turned away during shutdown.
    pub refused: u64,
    /// Messages broadcast.
    pub broadcasts: u64,
    /// Messages queued into mailboxes.
    pub deliveries: u64,
}

enum Control {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Stats(oneshot::Sender<HubStats>),
    Members(oneshot::Sender<Vec<ConnectionId>>),
    Shutdown,
}

/// The live set and the rules for changing it.
///
/// Only the hub task holds one of these.
pub(crate) struct HubCore {
    live: HashMap<ConnectionId, ConnectionHandle>,
    stats: HubStats,
    accepting: bool,
}

impl HubCore {
    pub(crate) fn new() -> Self {
        Self {
            live: HashMap::new(),
            stats: HubStats::default(),
            accepting: true,
        }
    }

    fn handle(&mut self, control: Control) {
        match control {
            Control::Register(conn) => self.register(conn),
            Control::Unregister(id) => self.unregister(&id),
            Control::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Control::Members(reply) => {
                let _ = reply.send(self.members());
            }
            Control::Shutdown => {}
        }
    }

    pub(crate) fn register(&mut self, conn: ConnectionHandle) {
        if !self.accepting {
            // Dropping the handle closes its mailbox.
            self.stats.refused += 1;
            debug!(connection = %conn.id(), "Registration refused, hub is shutting down");
            return;
        }

        match self.live.entry(conn.id().clone()) {
            Entry::Occupied(entry) => {
                error!(connection = %entry.key(), "Connection registered twice");
                if cfg!(debug_assertions) {
                    panic!("connection {} registered twice", entry.key());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(conn);
                self.stats.registered += 1;
                debug!(live = self.live.len(), "Connection registered");
            }
        }
    }

    pub(crate) fn unregister(&mut self, id: &ConnectionId) {
        if self.live.remove(id).is_some() {
            self.stats.unregistered += 1;
            debug!(connection = %id, live = self.live.len(), "Connection unregistered");
        } else {
            trace!(connection = %id, "Unregister of connection not in live set");
        }
    }

    /// Offer a message to every live mailbox, evicting those that are full.
    ///
    /// Returns the evicted connections.
    pub(crate) fn broadcast(&mut self, message: Arc<Message>) -> Vec<ConnectionId> {
        self.stats.broadcasts += 1;

        let mut delivered = 0u64;
        let mut evicted = Vec::new();
        self.live
            .retain(|id, conn| match conn.mailbox().offer(Arc::clone(&message)) {
                Enqueue::Enqueued => {
                    delivered += 1;
                    true
                }
                Enqueue::WouldBlock => {
                    evicted.push((id.clone(), conn.closer()));
                    false
                }
            });
        // Evicted handles were dropped by `retain`, closing their mailboxes.

        self.stats.deliveries += delivered;
        self.stats.evicted += evicted.len() as u64;
        trace!(message = message.id, recipients = delivered, "Broadcast");

        evicted
            .into_iter()
            .map(|(id, closer)| {
                debug!(connection = %id, "Mailbox full, evicting slow client");
                tokio::spawn(async move { closer.close().await });
                id
            })
            .collect()
    }

    /// Stop accepting registrations and close every live mailbox.
    pub(crate) fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        let closed = self.live.len();
        self.live.clear();
        info!(closed, "Hub shutting down");
    }

    pub(crate) fn stats(&self) -> HubStats {
        HubStats {
            live: self.live.len(),
            ..self.stats.clone()
        }
    }

    pub(crate) fn members(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.live.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut broadcasts: mpsc::Receiver<Arc<Message>>,
    ) -> HubStats {
        loop {
            // Control first, so a registration made before a broadcast was
            // submitted is applied before that broadcast.
            tokio::select! {
                biased;
                Some(event) = control.recv() => {
                    if let Control::Shutdown = event {
                        break;
                    }
                    self.handle(event);
                }
                Some(message) = broadcasts.recv() => {
                    self.broadcast(message);
                }
                else => break,
            }
        }

        self.shutdown();
        control.close();
        broadcasts.close();

        while let Ok(event) = control.try_recv() {
            self.handle(event);
        }
        let mut discarded = 0usize;
        while broadcasts.try_recv().is_ok() {
            discarded += 1;
        }

        let stats = self.stats();
        info!(?stats, discarded, "Hub stopped");
        stats
    }
}

/// Entry point for starting a hub.
pub struct Hub;

impl Hub {
    /// Spawn the hub task.
    ///
    /// The task returns its final counters once it is shut down or every
    /// handle has been dropped.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<HubStats>) {
        info!("Starting hub with config: {:?}", config);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));

        let task = tokio::spawn(HubCore::new().run(control_rx, broadcast_rx));
        let handle = HubHandle {
            control: control_tx,
            broadcasts: broadcast_tx,
            config: Arc::new(config),
        };

        (handle, task)
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::UnboundedSender<Control>,
    broadcasts: mpsc::Sender<Arc<Message>>,
    config: Arc<HubConfig>,
}

impl HubHandle {
    /// The hub's configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Add a connection to the live set.
    ///
    /// The returned guard unregisters the connection when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn register(&self, conn: ConnectionHandle) -> Result<Registration, HubError> {
        let id = conn.id().clone();
        self.control
            .send(Control::Register(conn))
            .map_err(|_| HubError::Closed)?;
        Ok(Registration {
            id,
            hub: self.clone(),
        })
    }

    /// Remove a connection from the live set.
    ///
    /// Unknown connections and a stopped hub are both ignored.
    pub fn unregister(&self, id: &ConnectionId) {
        let _ = self.control.send(Control::Unregister(id.clone()));
    }

    /// Hand a message to the hub for fan-out.
    ///
    /// Waits only while the broadcast queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.broadcasts
            .send(Arc::new(message))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Current hub counters.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Stats(tx))
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// IDs of the connections in the live set, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn members(&self) -> Result<Vec<ConnectionId>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Members(tx))
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the hub: refuse new registrations and close every mailbox.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Whether the hub task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

/// Keeps a connection registered; unregisters it when dropped.
#[must_use = "dropping the registration unregisters the connection"]
pub struct Registration {
    id: ConnectionId,
    hub: HubHandle,
}

impl Registration {
    /// The registered connection.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}
