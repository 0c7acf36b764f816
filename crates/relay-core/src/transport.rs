//! Transport boundary.
//!
//! The router does not own sockets. It is driven by a transport that calls a
//! [`MessageHandler`] for every complete inbound message and for every dropped
//! connection, and it sends through an [`Outbound`] handle keyed by address.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{ChatMessage, ProtocolError};
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No open connection at the address.
    #[error("Not connected: {0}")]
    NotConnected(SocketAddr),

    /// The connection's outbound queue is full.
    #[error("Outbound queue full for {0}")]
    QueueFull(SocketAddr),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    LimitReached,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends raw bytes to a connected peer.
pub trait Outbound: Send + Sync {
    /// Queue `data` for delivery to `addr`.
    ///
    /// Must not block; delivery is best effort.
    fn send(&self, addr: SocketAddr, data: Bytes) -> Result<(), TransportError>;
}

/// Receives events from a transport.
///
/// A transport calls `on_message` at most once at a time per connection, in
/// the order messages arrived, but concurrently across connections.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// A connection from `addr` was accepted.
    async fn on_connect(&self, _addr: SocketAddr) {}

    /// A complete message arrived from `source`.
    async fn on_message(&self, source: SocketAddr, message: ChatMessage);

    /// The connection at `addr` is gone.
    async fn on_drop(&self, addr: SocketAddr);
}
