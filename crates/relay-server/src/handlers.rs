//! Node wiring and admin handlers.
//!
//! This module assembles a node (bus, registry, router, TCP listener), keeps
//! the metrics in step with connection and registry changes, and serves the
//! HTTP admin endpoint.

use crate::config::{BusTarget, Config};
use crate::metrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use bytes::Bytes;
use chat_relay_core::{
    Admission, Bus, ClientRegistry, LocalBus, MessageHandler, Outbound, Router as ChatRouter,
    RouterConfig, TransportError,
};
use chat_relay_transport::{ConnectionTable, TcpBus, TcpServer};
use relay_protocol::{ChatMessage, HEADER_LEN};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Shared node state.
pub struct AppState {
    /// The message router.
    pub router: Arc<ChatRouter>,
    /// Open client connections.
    pub connections: Arc<ConnectionTable>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(router: Arc<ChatRouter>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            router,
            connections,
        }
    }
}

/// Drives the router from the TCP listener and records metrics.
pub struct NodeHandler {
    router: Arc<ChatRouter>,
}

impl NodeHandler {
    /// Wrap a router.
    #[must_use]
    pub fn new(router: Arc<ChatRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn on_connect(&self, _addr: SocketAddr) {
        metrics::record_connection();
    }

    async fn on_message(&self, source: SocketAddr, message: ChatMessage) {
        metrics::record_message(HEADER_LEN + message.data.len(), "inbound");

        match self.router.process(source, message).await {
            Ok(Admission::Registered) => {
                metrics::set_clients_registered(self.router.registry().len());
            }
            Ok(Admission::Collision) => metrics::record_name_collision(),
            Ok(Admission::Forwarded) => {}
            Err(e) => {
                metrics::record_error("publish");
                warn!(connection = %source, error = %e, "Failed to publish message");
            }
        }
    }

    async fn on_drop(&self, addr: SocketAddr) {
        metrics::record_disconnection();
        if self.router.disconnect(addr).is_some() {
            metrics::set_clients_registered(self.router.registry().len());
        }
    }
}

/// [`ConnectionTable`] sends, counted.
pub struct MeteredOutbound {
    connections: Arc<ConnectionTable>,
}

impl MeteredOutbound {
    /// Wrap a connection table.
    #[must_use]
    pub fn new(connections: Arc<ConnectionTable>) -> Self {
        Self { connections }
    }
}

impl Outbound for MeteredOutbound {
    fn send(&self, addr: SocketAddr, data: Bytes) -> Result<(), TransportError> {
        let bytes = data.len();
        match self.connections.send(addr, data) {
            Ok(()) => {
                metrics::record_message(bytes, "outbound");
                Ok(())
            }
            Err(e) => {
                if matches!(e, TransportError::QueueFull(_)) {
                    metrics::record_error("queue_full");
                }
                Err(e)
            }
        }
    }
}

/// Run a chat node until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the bus, the bus subscription, or the listener cannot
/// be set up.
pub async fn run_node(config: Config) -> Result<()> {
    let bus: Arc<dyn Bus> = match config.bus_target()? {
        BusTarget::Memory => Arc::new(LocalBus::new()),
        BusTarget::Tcp(addr) => {
            let link = TcpBus::connect(config.tcp_bus_config(addr.clone()))
                .await
                .with_context(|| format!("Failed to connect to bus at {}", addr))?;
            Arc::new(link)
        }
    };

    let registry = Arc::new(ClientRegistry::new());
    let connections = Arc::new(ConnectionTable::new());
    let router = Arc::new(ChatRouter::with_config(
        RouterConfig {
            subject: config.bus.subject.clone(),
        },
        registry,
        bus,
        Arc::new(MeteredOutbound::new(Arc::clone(&connections))),
    ));
    let _subscription = router.start().context("Failed to subscribe to bus")?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    if config.admin.enabled {
        let state = Arc::new(AppState::new(Arc::clone(&router), Arc::clone(&connections)));
        let addr = config.admin_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint {}", addr))?;
        info!(addr = %addr, "Admin endpoint listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, admin_router(state)).await {
                error!(error = %e, "Admin endpoint failed");
            }
        });
    }

    let handler = Arc::new(NodeHandler::new(Arc::clone(&router)));
    let server = TcpServer::bind(config.tcp_config()?, connections, handler)
        .await
        .context("Failed to bind chat listener")?;

    info!(node = %router.node_id(), addr = %server.local_addr()?, "Node running");
    server.run_until(shutdown_signal()).await?;
    info!(node = %router.node_id(), "Node stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Build the admin HTTP router.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.router.node_id().as_str(),
    }))
}

/// Registry and connection counts.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "clients": state.router.registry().len(),
        "connections": state.connections.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AppState> {
        let connections = Arc::new(ConnectionTable::new());
        let router = Arc::new(ChatRouter::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(LocalBus::new()),
            Arc::new(MeteredOutbound::new(Arc::clone(&connections))),
        ));
        Arc::new(AppState::new(router, connections))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_health_reports_node_id() {
        let state = state();
        let Json(body) = health_handler(State(Arc::clone(&state))).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["node_id"], state.router.node_id().as_str());
    }

    #[tokio::test]
    async fn test_stats_follow_registry_and_connections() {
        let state = state();
        let handler = NodeHandler::new(Arc::clone(&state.router));
        let _queue = state.connections.register(addr(1), 8);

        handler.on_connect(addr(1)).await;
        handler
            .on_message(addr(1), ChatMessage::init("bill", "bill is online"))
            .await;

        let Json(body) = stats_handler(State(Arc::clone(&state))).await;
        assert_eq!(body["clients"], 1);
        assert_eq!(body["connections"], 1);

        state.connections.unregister(addr(1));
        handler.on_drop(addr(1)).await;

        let Json(body) = stats_handler(State(Arc::clone(&state))).await;
        assert_eq!(body["clients"], 0);
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_duplicate_init_is_not_registered() {
        let state = state();
        let handler = NodeHandler::new(Arc::clone(&state.router));

        handler
            .on_message(addr(1), ChatMessage::init("bill", "bill is online"))
            .await;
        handler
            .on_message(addr(2), ChatMessage::init("bill", "bill is online"))
            .await;

        let registry = state.router.registry();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_username("bill").unwrap().address, addr(1));
    }

    #[test]
    fn test_metered_outbound_passes_errors_through() {
        let connections = Arc::new(ConnectionTable::new());
        let outbound = MeteredOutbound::new(Arc::clone(&connections));

        let err = outbound.send(addr(9), Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));

        let _queue = connections.register(addr(9), 1);
        outbound.send(addr(9), Bytes::from_static(b"x")).unwrap();
    }
}
