//! Ingestion of payloads pushed by clients of the input endpoint.
//!
//! Input sessions push raw payloads into one bounded queue. A single
//! [`Ingest`] loop drains that queue into a named downstream stage,
//! resolved once from a [`StageRegistry`] when the loop starts.

use crate::connection::{CloseSignal, ConnectionId, SessionError, SessionReader};
use crate::session::SessionEnd;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Default capacity of the ingest queue.
pub const DEFAULT_INGEST_CAPACITY: usize = 256;

/// Stage used when no stage is configured.
pub const DEFAULT_STAGE: &str = "raw";

/// Sending side of a downstream stage.
pub type StageSender = mpsc::Sender<Bytes>;

/// Ingest errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    /// No stage is registered under the configured name.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// Ingestion has been stopped.
    #[error("Ingest stopped")]
    Stopped,

    /// The downstream stage went away.
    #[error("Stage closed: {0}")]
    StageClosed(String),
}

/// Ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Capacity of the ingest queue.
    pub capacity: usize,
    /// Name of the stage to route payloads to; [`DEFAULT_STAGE`] if unset.
    pub stage: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_INGEST_CAPACITY,
            stage: None,
        }
    }
}

/// Named downstream stages.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: DashMap<String, StageSender>,
}

impl StageRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage, returning the one it replaced.
    pub fn register(&self, name: impl Into<String>, sender: StageSender) -> Option<StageSender> {
        let name = name.into();
        debug!(stage = %name, "Registering stage");
        self.stages.insert(name, sender)
    }

    /// Look up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<StageSender> {
        self.stages.get(name).map(|s| s.value().clone())
    }

    /// Registered stage names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stages.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve the configured stage, falling back to [`DEFAULT_STAGE`].
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::StageNotFound`] if nothing is registered
    /// under the name.
    pub fn resolve(&self, stage: Option<&str>) -> Result<(String, StageSender), IngestError> {
        let name = stage.unwrap_or(DEFAULT_STAGE);
        self.get(name)
            .map(|sender| (name.to_string(), sender))
            .ok_or_else(|| IngestError::StageNotFound(name.to_string()))
    }
}

/// Create the ingest queue.
#[must_use]
pub fn ingest(config: IngestConfig) -> (IngestHandle, Ingest) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let stop = CloseSignal::new();
    let handle = IngestHandle {
        tx,
        stop: stop.clone(),
    };
    let ingest = Ingest {
        rx,
        stage: config.stage,
        stop,
    };
    (handle, ingest)
}

/// Cloneable handle used by input sessions.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Bytes>,
    stop: CloseSignal,
}

impl IngestHandle {
    /// Queue a payload, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Stopped`] once ingestion has stopped.
    pub async fn submit(&self, payload: Bytes) -> Result<(), IngestError> {
        if self.stop.is_closed() {
            return Err(IngestError::Stopped);
        }
        self.tx.send(payload).await.map_err(|_| IngestError::Stopped)
    }

    /// Stop accepting payloads. Already queued payloads are still forwarded.
    pub fn stop(&self) {
        if self.stop.close() {
            info!("Ingest stopping");
        }
    }

    /// Whether ingestion has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_closed()
    }

    /// Wait until ingestion is stopped.
    pub async fn stopped(&self) {
        self.stop.closed().await;
    }
}

/// The single consumer of the ingest queue.
#[derive(Debug)]
pub struct Ingest {
    rx: mpsc::Receiver<Bytes>,
    stage: Option<String>,
    stop: CloseSignal,
}

impl Ingest {
    /// Forward payloads to the configured stage until stopped.
    ///
    /// Returns the number of payloads forwarded.
    ///
    /// # Errors
    ///
    /// Fails before consuming anything if the stage is unknown, and stops
    /// early if the stage goes away.
    pub async fn run(mut self, stages: &StageRegistry) -> Result<u64, IngestError> {
        let (name, target) = stages.resolve(self.stage.as_deref())?;
        info!(stage = %name, "Ingest started");

        let mut forwarded = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = self.stop.closed() => break,
                next = self.rx.recv() => match next {
                    Some(payload) => {
                        forward(&target, &name, payload).await?;
                        forwarded += 1;
                    }
                    None => break,
                },
            }
        }

        // Refuse new payloads, but hand on what was already accepted.
        self.rx.close();
        while let Some(payload) = self.rx.recv().await {
            forward(&target, &name, payload).await?;
            forwarded += 1;
        }

        info!(stage = %name, forwarded, "Ingest stopped");
        Ok(forwarded)
    }
}

async fn forward(target: &StageSender, name: &str, payload: Bytes) -> Result<(), IngestError> {
    trace!(stage = %name, bytes = payload.len(), "Forwarding payload");
    target
        .send(payload)
        .await
        .map_err(|_| IngestError::StageClosed(name.to_string()))
}

/// Serve one input client, submitting every payload it sends.
///
/// Returns how many payloads were accepted and why the session ended.
pub async fn run_ingest_session<R: SessionReader>(
    ingest: &IngestHandle,
    id: &ConnectionId,
    mut reader: R,
) -> (u64, SessionEnd) {
    debug!(connection = %id, "Input session started");

    let mut received = 0u64;
    let end = loop {
        let inbound = tokio::select! {
            biased;
            _ = ingest.stopped() => break SessionEnd::Closed,
            inbound = reader.read() => inbound,
        };

        match inbound {
            Ok(Some(payload)) => {
                if ingest.submit(payload).await.is_err() {
                    break SessionEnd::Closed;
                }
                received += 1;
            }
            Ok(None) => break SessionEnd::PeerClosed,
            Err(SessionError::Closed) => break SessionEnd::Closed,
            Err(e) => break SessionEnd::ReadFailed(e),
        }
    };

    debug!(connection = %id, received, end = ?end, "Input session ended");
    (received, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockReader;

    fn stage(registry: &StageRegistry, name: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(16);
        registry.register(name, tx);
        rx
    }

    #[tokio::test]
    async fn test_routes_to_default_stage() {
        let registry = StageRegistry::new();
        let mut raw = stage(&registry, DEFAULT_STAGE);
        let mut json = stage(&registry, "json");

        let (handle, ingest) = ingest(IngestConfig::default());
        let runner = tokio::spawn(async move { ingest.run(&registry).await });

        handle.submit(Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(&raw.recv().await.unwrap()[..], b"one");
        assert!(json.try_recv().is_err());

        handle.stop();
        assert_eq!(runner.await.unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn test_routes_to_named_stage() {
        let registry = StageRegistry::new();
        let _raw = stage(&registry, DEFAULT_STAGE);
        let mut json = stage(&registry, "json");

        let (handle, ingest) = ingest(IngestConfig {
            stage: Some("json".into()),
            ..IngestConfig::default()
        });
        let runner = tokio::spawn(async move { ingest.run(&registry).await });

        handle.submit(Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(&json.recv().await.unwrap()[..], b"{}");

        handle.stop();
        assert_eq!(runner.await.unwrap(), Ok(1));
        assert_eq!(
            handle.submit(Bytes::from_static(b"late")).await,
            Err(IngestError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_unknown_stage_fails_fast() {
        let registry = StageRegistry::new();
        let _raw = stage(&registry, DEFAULT_STAGE);

        let (_handle, ingest) = ingest(IngestConfig {
            stage: Some("JsonDecoder".into()),
            ..IngestConfig::default()
        });
        assert_eq!(
            ingest.run(&registry).await,
            Err(IngestError::StageNotFound("JsonDecoder".into()))
        );
    }

    #[tokio::test]
    async fn test_stop_forwards_buffered_payloads() {
        let registry = StageRegistry::new();
        let mut raw = stage(&registry, DEFAULT_STAGE);

        let (handle, ingest) = ingest(IngestConfig::default());
        for body in ["a", "b", "c"] {
            handle.submit(Bytes::from(body)).await.unwrap();
        }
        handle.stop();
        assert!(handle.is_stopped());

        assert_eq!(ingest.run(&registry).await, Ok(3));
        let got: Vec<_> = std::iter::from_fn(|| raw.try_recv().ok()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stage_closed() {
        let registry = StageRegistry::new();
        drop(stage(&registry, DEFAULT_STAGE));

        let (handle, ingest) = ingest(IngestConfig::default());
        handle.submit(Bytes::from_static(b"x")).await.unwrap();
        handle.stop();

        assert_eq!(
            ingest.run(&registry).await,
            Err(IngestError::StageClosed(DEFAULT_STAGE.into()))
        );
    }

    #[tokio::test]
    async fn test_input_session_submits_until_peer_closes() {
        let (handle, mut ingest) = ingest(IngestConfig::default());
        let (reader, inbox) = MockReader::new(CloseSignal::new());

        inbox.send(Bytes::from_static(b"p1")).unwrap();
        inbox.send(Bytes::from_static(b"p2")).unwrap();
        drop(inbox);

        let (received, end) = run_ingest_session(&handle, &"in-1".into(), reader).await;
        assert_eq!(received, 2);
        assert!(matches!(end, SessionEnd::PeerClosed));

        assert_eq!(&ingest.rx.recv().await.unwrap()[..], b"p1");
        assert_eq!(&ingest.rx.recv().await.unwrap()[..], b"p2");
    }

    #[tokio::test]
    async fn test_input_session_ends_on_stop() {
        let (handle, _ingest) = ingest(IngestConfig::default());
        let (reader, _inbox) = MockReader::new(CloseSignal::new());

        let session = {
            let handle = handle.clone();
            tokio::spawn(async move { run_ingest_session(&handle, &"in-1".into(), reader).await })
        };
        handle.stop();

        let (received, end) = session.await.unwrap();
        assert_eq!(received, 0);
        assert!(matches!(end, SessionEnd::Closed));
    }

    #[test]
    fn test_registry_names() {
        let registry = StageRegistry::new();
        let _json = stage(&registry, "json");
        let _raw = stage(&registry, "raw");
        assert_eq!(registry.names(), vec!["json", "raw"]);
        assert!(registry.get("missing").is_none());
    }
}
