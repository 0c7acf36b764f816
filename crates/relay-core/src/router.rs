//! Message router for a chat node.
//!
//! The router has two sides. The transport side admits messages from local
//! clients and publishes them on the bus. The bus side receives every
//! published message (from every node, this one included) and delivers it to
//! whichever matching clients are registered locally.
//!
//! Nodes do not know where other nodes' users are; each node decides from its
//! own registry alone.

use crate::bus::{validate_subject, Bus, BusError, Envelope, NodeId};
use crate::registry::{ClientRecord, ClientRegistry};
use crate::transport::{MessageHandler, Outbound};
use async_trait::async_trait;
use relay_protocol::{codec, ChatMessage, MessageKind, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Subject carrying all chat traffic.
pub const DEFAULT_SUBJECT: &str = "msg";

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Bus failure.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// A message could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An `InCache` notice carried something other than `ip:port`.
    #[error("Invalid notice address: {0}")]
    InvalidAddress(String),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bus subject for chat traffic.
    pub subject: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
        }
    }
}

/// What the router did with a message from a local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// An `Init` for a new username; the client is now registered.
    Registered,
    /// An `Init` for a username already registered on this node; an
    /// `InCache` notice was published instead.
    Collision,
    /// Any other message, published unchanged.
    Forwarded,
}

/// Outcome of delivering one bus message to local clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sends handed to the transport.
    pub delivered: usize,
    /// Local clients the message was not addressed to.
    pub skipped: usize,
    /// Sends the transport refused.
    pub failed: usize,
}

/// The node's message router.
pub struct Router {
    node_id: NodeId,
    subject: String,
    registry: Arc<ClientRegistry>,
    bus: Arc<dyn Bus>,
    outbound: Arc<dyn Outbound>,
}

impl Router {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(
        registry: Arc<ClientRegistry>,
        bus: Arc<dyn Bus>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self::with_config(RouterConfig::default(), registry, bus, outbound)
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(
        config: RouterConfig,
        registry: Arc<ClientRegistry>,
        bus: Arc<dyn Bus>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        let node_id = NodeId::generate();
        info!(node = %node_id, subject = %config.subject, bus = bus.name(), "Creating router");
        Self {
            node_id,
            subject: config.subject,
            registry,
            bus,
            outbound,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The bus subject this router publishes and subscribes on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The node's client registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Subscribe to the bus and start delivering to local clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject is invalid or the subscription fails.
    pub fn start(self: &Arc<Self>) -> Result<RouterHandle, RouterError> {
        validate_subject(&self.subject).map_err(BusError::InvalidSubject)?;
        let mut subscription = self.bus.subscribe(&self.subject)?;
        info!(node = %self.node_id, subject = %self.subject, "Subject subscribed");

        let router = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                if let Err(e) = router.deliver(&payload) {
                    warn!(node = %router.node_id, error = %e, "Dropping bus message");
                }
            }
            debug!(node = %router.node_id, "Bus subscription closed");
        });

        Ok(RouterHandle { task })
    }

    /// Decide what to publish for a message from a local client.
    ///
    /// Registers the sender of a first `Init`. A repeated `Init` for a
    /// registered username leaves the existing entry alone and turns into an
    /// `InCache` notice addressed to the rejected connection.
    pub fn admit(&self, source: SocketAddr, message: ChatMessage) -> (Admission, ChatMessage) {
        if message.kind != MessageKind::Init {
            return (Admission::Forwarded, message);
        }

        match self.registry.try_add(&message.sender, source) {
            Ok(()) => {
                info!(user = %message.sender, connection = %source, "Added client");
                (Admission::Registered, message)
            }
            Err(existing) => {
                info!(
                    user = %message.sender,
                    connection = %source,
                    registered = %existing.address,
                    "Username already registered"
                );
                let notice = ChatMessage::in_cache(message.sender, source);
                (Admission::Collision, notice)
            }
        }
    }

    /// Handle a message from a local client: admit it, then publish.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails. The message is dropped.
    pub async fn process(
        &self,
        source: SocketAddr,
        message: ChatMessage,
    ) -> Result<Admission, RouterError> {
        debug!(connection = %source, kind = %message.kind, sender = %message.sender, "Inbound");
        let (admission, outgoing) = self.admit(source, message);
        self.publish(&outgoing).await?;
        Ok(admission)
    }

    /// Publish a message on the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the bus refuses it.
    pub async fn publish(&self, message: &ChatMessage) -> Result<(), RouterError> {
        let payload = Envelope::encode(&self.node_id, message)?;
        trace!(node = %self.node_id, kind = %message.kind, bytes = payload.len(), "Outbound to bus");
        self.bus.publish(&self.subject, payload).await?;
        Ok(())
    }

    /// Deliver one bus payload to local clients.
    ///
    /// `InCache` notices go straight to the address they carry. Everything
    /// else goes to each registered client other than the sender that the
    /// message is addressed to.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode or a notice address
    /// does not parse.
    pub fn deliver(&self, payload: &[u8]) -> Result<DeliveryReport, RouterError> {
        let Envelope { origin, message } = Envelope::decode(payload)?;
        trace!(origin = %origin, kind = %message.kind, sender = %message.sender, "Inbound from bus");

        let data = codec::encode(&message)?;
        let mut report = DeliveryReport::default();

        if message.kind == MessageKind::InCache {
            let text = message.data_str();
            let addr: SocketAddr = text
                .parse()
                .map_err(|_| RouterError::InvalidAddress(text.to_string()))?;

            match self.outbound.send(addr, data) {
                Ok(()) => {
                    debug!(connection = %addr, user = %message.recipient, "Sent in-cache notice");
                    report.delivered += 1;
                }
                Err(e) => {
                    trace!(connection = %addr, error = %e, "In-cache notice not for this node");
                    report.failed += 1;
                }
            }
            return Ok(report);
        }

        for ClientRecord { username, address } in self.registry.all_except(&message.sender) {
            if !message.is_for(&username) {
                trace!(user = %username, connection = %address, "Skip");
                report.skipped += 1;
                continue;
            }

            match self.outbound.send(address, data.clone()) {
                Ok(()) => {
                    trace!(user = %username, connection = %address, "Send");
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(user = %username, connection = %address, error = %e, "Send failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Forget the client at `addr` after its connection dropped.
    ///
    /// Returns the removed record, or `None` if nothing was registered there
    /// (connections that never sent `Init`, or rejected duplicates).
    pub fn disconnect(&self, addr: SocketAddr) -> Option<ClientRecord> {
        if self.registry.get_by_address(addr).is_none() {
            debug!(connection = %addr, "Dropped connection was not registered");
            return None;
        }

        match self.registry.remove(addr) {
            Ok(record) => {
                info!(user = %record.username, connection = %addr, "Removed client");
                Some(record)
            }
            Err(e) => {
                debug!(connection = %addr, error = %e, "Client already removed");
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn on_message(&self, source: SocketAddr, message: ChatMessage) {
        if let Err(e) = self.process(source, message).await {
            warn!(connection = %source, error = %e, "Failed to publish message");
        }
    }

    async fn on_drop(&self, addr: SocketAddr) {
        self.disconnect(addr);
    }
}

/// Handle to a running bus subscription.
#[derive(Debug)]
pub struct RouterHandle {
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Stop delivering bus messages.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the subscription loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
