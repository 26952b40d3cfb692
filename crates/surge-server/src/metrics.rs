//! Metrics collection and export for Surge.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use surge_core::{HubHandle, HubStats, Message, SessionError, SessionReader, SessionWriter};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "surge_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "surge_connections_active";
    pub const MESSAGES_TOTAL: &str = "surge_messages_total";
    pub const MESSAGES_BYTES: &str = "surge_messages_bytes";
    pub const LIVE_CONNECTIONS: &str = "surge_hub_live_connections";
    pub const BROADCASTS_TOTAL: &str = "surge_hub_broadcasts_total";
    pub const DELIVERIES_TOTAL: &str = "surge_hub_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "surge_hub_evictions_total";
    pub const REFUSED_TOTAL: &str = "surge_hub_refused_total";
    pub const ERRORS_TOTAL: &str = "surge_errors_total";
}

/// How often hub statistics are sampled.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(
        names::LIVE_CONNECTIONS,
        "Connections currently receiving broadcasts"
    );
    metrics::describe_counter!(names::BROADCASTS_TOTAL, "Messages broadcast by the hub");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Messages enqueued to connection mailboxes"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections evicted for a full mailbox"
    );
    metrics::describe_counter!(
        names::REFUSED_TOTAL,
        "Registrations refused during shutdown"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(endpoint: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "endpoint" => endpoint).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "endpoint" => endpoint).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection(endpoint: &'static str) {
    gauge!(names::CONNECTIONS_ACTIVE, "endpoint" => endpoint).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Copy hub statistics into metrics.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::LIVE_CONNECTIONS).set(stats.live as f64);
    counter!(names::BROADCASTS_TOTAL).absolute(stats.broadcasts);
    counter!(names::DELIVERIES_TOTAL).absolute(stats.deliveries);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evicted);
    counter!(names::REFUSED_TOTAL).absolute(stats.refused);
}

/// Sample hub statistics every `interval` until the hub shuts down.
pub fn spawn_hub_sampler(hub: HubHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match hub.stats().await {
                Ok(stats) => record_hub_stats(&stats),
                Err(_) => break,
            }
        }
        debug!("Hub sampler stopped");
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    endpoint: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(endpoint: &'static str) -> Self {
        record_connection(endpoint);
        Self { endpoint }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.endpoint);
    }
}

/// Counts inbound payloads of a session.
pub struct MeteredReader<R> {
    inner: R,
}

impl<R> MeteredReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: SessionReader> SessionReader for MeteredReader<R> {
    async fn read(&mut self) -> Result<Option<Bytes>, SessionError> {
        let result = self.inner.read().await;
        match &result {
            Ok(Some(payload)) => record_message(payload.len(), "inbound"),
            Ok(None) | Err(SessionError::Closed) => {}
            Err(SessionError::TooLarge(_)) => record_error("too_large"),
            Err(_) => record_error("read"),
        }
        result
    }
}

/// Counts messages written to a session.
pub struct MeteredWriter<W> {
    inner: W,
}

impl<W> MeteredWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: SessionWriter> SessionWriter for MeteredWriter<W> {
    async fn write(&mut self, message: &Message) -> Result<(), SessionError> {
        let result = self.inner.write(message).await;
        match &result {
            Ok(()) => record_message(message.payload_size(), "outbound"),
            Err(SessionError::Closed) => {}
            Err(SessionError::WriteTimeout(_)) => record_error("write_timeout"),
            Err(_) => record_error("write"),
        }
        result
    }

    async fn finish(&mut self) {
        self.inner.finish().await;
    }
}
