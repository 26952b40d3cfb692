//! HTTP surface of the Surge server.
//!
//! This module wires the hub, the ingestion path and the relay stages
//! together, and serves the broadcast, ingestion and health endpoints.

use crate::config::{Config, HEALTH_PATH};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredReader, MeteredWriter};
use anyhow::{bail, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use surge_core::{
    ingest, run_ingest_session, run_session, spawn_relay, CloseSignal, Decoder, Hub, HubHandle,
    IngestHandle, SessionEnd, SessionParts, SessionWriter, StageRegistry,
};
use surge_protocol::WireFormat;
use surge_transport::{format_from_query, split_socket};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name of the broadcast endpoint in metrics and health output.
pub const OUTPUT: &str = "output";

/// Name of the ingestion endpoint in metrics and health output.
pub const INPUT: &str = "input";

/// State of one configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum ListenerState {
    /// Bound and serving.
    Listening { address: SocketAddr },
    /// Could not be bound.
    Failed { address: SocketAddr, error: String },
    /// Turned off in the configuration.
    Disabled,
    /// Shut down.
    Stopped,
}

/// Shared server state.
pub struct AppState {
    /// The broadcast hub.
    pub hub: HubHandle,
    /// Intake for the ingestion endpoint.
    pub ingest: IngestHandle,
    /// Server configuration.
    pub config: Config,
    /// Endpoint states, keyed by endpoint name.
    pub listeners: DashMap<&'static str, ListenerState>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle, ingest: IngestHandle) -> Self {
        Self {
            hub,
            ingest,
            config,
            listeners: DashMap::new(),
        }
    }

    fn set_listener(&self, endpoint: &'static str, state: ListenerState) {
        self.listeners.insert(endpoint, state);
    }
}

/// Which endpoints a listener serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPlan {
    /// Bind address.
    pub address: SocketAddr,
    /// Endpoint names served on it.
    pub endpoints: Vec<&'static str>,
}

/// Group the enabled endpoints by bind address.
///
/// # Errors
///
/// Returns an error if an address does not parse.
pub fn plan_listeners(config: &Config) -> Result<Vec<ListenerPlan>> {
    let mut plans = vec![ListenerPlan {
        address: config.output_addr()?,
        endpoints: vec![OUTPUT],
    }];

    if config.input.enabled {
        let address = config.input_addr()?;
        match plans.iter_mut().find(|plan| plan.address == address) {
            Some(plan) => plan.endpoints.push(INPUT),
            None => plans.push(ListenerPlan {
                address,
                endpoints: vec![INPUT],
            }),
        }
    }

    Ok(plans)
}

/// Build the router for one listener.
pub fn build_router(plan: &ListenerPlan, state: Arc<AppState>) -> Router {
    let mut router = Router::new().route(HEALTH_PATH, get(health_handler));
    for endpoint in &plan.endpoints {
        router = match *endpoint {
            OUTPUT => router.route(&state.config.output.path, get(output_handler)),
            _ => router.route(&state.config.input.path, get(input_handler)),
        };
    }
    router.with_state(state)
}

/// Run the server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if no listener could be started.
pub async fn run_server(config: Config) -> Result<()> {
    let (hub, hub_task) = Hub::spawn(config.hub_config());

    // Relay stages feeding the hub, selectable by name for ingestion.
    let stages = Arc::new(StageRegistry::new());
    let mut relays = Vec::new();
    for decoder in [Decoder::Raw, Decoder::Json] {
        let (stage, relay) = spawn_relay(
            decoder.as_str(),
            decoder,
            hub.clone(),
            config.ingest.capacity,
        );
        stages.register(decoder.as_str(), stage);
        relays.push(relay);
    }

    let (ingest_handle, ingest_loop) = ingest(config.ingest_config());
    let ingest_task = {
        let stages = Arc::clone(&stages);
        let handle = ingest_handle.clone();
        tokio::spawn(async move {
            if let Err(e) = ingest_loop.run(&stages).await {
                error!(error = %e, "Ingestion failed");
                handle.stop();
            }
        })
    };

    // Start metrics server if enabled
    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_hub_sampler(hub.clone(), metrics::SAMPLE_INTERVAL);
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        hub.clone(),
        ingest_handle.clone(),
    ));
    if !config.input.enabled {
        state.set_listener(INPUT, ListenerState::Disabled);
    }

    let shutdown = CloseSignal::new();
    let mut servers: Vec<JoinHandle<()>> = Vec::new();
    for plan in plan_listeners(&config)? {
        match TcpListener::bind(plan.address).await {
            Ok(listener) => {
                for &endpoint in &plan.endpoints {
                    state.set_listener(
                        endpoint,
                        ListenerState::Listening {
                            address: plan.address,
                        },
                    );
                }
                info!(address = %plan.address, endpoints = ?plan.endpoints, "Listening");
                servers.push(spawn_listener(
                    listener,
                    build_router(&plan, Arc::clone(&state)),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                error!(address = %plan.address, error = %e, "Failed to bind");
                metrics::record_error("bind");
                for &endpoint in &plan.endpoints {
                    state.set_listener(
                        endpoint,
                        ListenerState::Failed {
                            address: plan.address,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    if servers.is_empty() {
        hub.shutdown();
        ingest_handle.stop();
        bail!("No listener could be started");
    }

    info!(
        "Broadcast endpoint: ws://{}{}",
        config.output.address, config.output.path
    );
    if config.input.enabled {
        info!(
            "Ingestion endpoint: ws://{}{}",
            config.input.address, config.input.path
        );
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    hub.shutdown();
    ingest_handle.stop();
    shutdown.close();

    for server in servers {
        let _ = server.await;
    }
    for endpoint in [OUTPUT, INPUT] {
        if let Some(mut entry) = state.listeners.get_mut(endpoint) {
            if matches!(*entry, ListenerState::Listening { .. }) {
                *entry = ListenerState::Stopped;
            }
        }
    }

    let _ = ingest_task.await;
    match hub_task.await {
        Ok(stats) => info!(?stats, "Hub stopped"),
        Err(e) => warn!(error = %e, "Hub task failed"),
    }
    // Relays end once their stage senders are gone.
    drop(stages);
    for relay in relays {
        if let Ok(stats) = relay.await {
            debug!(?stats, "Relay finished");
        }
    }

    Ok(())
}

fn spawn_listener(listener: TcpListener, router: Router, shutdown: CloseSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.closed().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Listener failed");
        }
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let listeners: serde_json::Map<String, serde_json::Value> = state
        .listeners
        .iter()
        .map(|entry| {
            (
                entry.key().to_string(),
                serde_json::to_value(entry.value()).unwrap_or_default(),
            )
        })
        .collect();

    let hub = match state.hub.stats().await {
        Ok(stats) => serde_json::json!({
            "live": stats.live,
            "registered": stats.registered,
            "unregistered": stats.unregistered,
            "evicted": stats.evicted,
            "refused": stats.refused,
            "broadcasts": stats.broadcasts,
            "deliveries": stats.deliveries,
        }),
        Err(_) => serde_json::Value::Null,
    };

    let (status, code) = if hub.is_null() {
        ("stopping", StatusCode::SERVICE_UNAVAILABLE)
    } else {
        ("ok", StatusCode::OK)
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "hub": hub,
            "listeners": listeners,
        })),
    )
        .into_response()
}

/// Broadcast endpoint: upgrade and serve a session until it ends.
async fn output_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<Arc<AppState>>,
) -> Response {
    let format = match format_from_query(query.as_deref(), state.config.output.format) {
        Ok(format) => format,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    if state.hub.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let _metrics_guard = ConnectionMetricsGuard::new(OUTPUT);
            let SessionParts {
                id,
                reader,
                writer,
                closer,
            } = split_socket(socket, format, max_message_size);

            debug!(connection = %id, %format, "Output client connected");
            let end = run_session(
                &state.hub,
                SessionParts {
                    id: id.clone(),
                    reader: MeteredReader::new(reader),
                    writer: MeteredWriter::new(writer),
                    closer,
                },
            )
            .await;
            log_end(OUTPUT, &id, &end);
        })
}

/// Ingestion endpoint: every payload a client sends is submitted.
async fn input_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.ingest.is_stopped() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let _metrics_guard = ConnectionMetricsGuard::new(INPUT);
            let SessionParts {
                id,
                reader,
                mut writer,
                ..
            } = split_socket(socket, WireFormat::default(), max_message_size);

            debug!(connection = %id, "Input client connected");
            let (received, end) =
                run_ingest_session(&state.ingest, &id, MeteredReader::new(reader)).await;
            writer.finish().await;
            debug!(connection = %id, received, "Input client submitted payloads");
            log_end(INPUT, &id, &end);
        })
}

fn log_end(endpoint: &'static str, id: &surge_core::ConnectionId, end: &SessionEnd) {
    match end {
        SessionEnd::PeerClosed | SessionEnd::Closed => {
            debug!(endpoint, connection = %id, ?end, "Client disconnected");
        }
        SessionEnd::HubClosed => {
            debug!(endpoint, connection = %id, "Client refused, hub closed");
        }
        SessionEnd::ReadFailed(e) => {
            warn!(endpoint, connection = %id, error = %e, "Client read failed");
        }
        SessionEnd::WriterExited(exit) => {
            warn!(endpoint, connection = %id, ?exit, "Client writer stopped");
        }
    }
}
