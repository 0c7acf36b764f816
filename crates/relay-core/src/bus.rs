//! Publish/subscribe bus shared by all nodes.
//!
//! Every message a node accepts is published on the bus, and every node
//! (including the publisher) receives it through its subscription. Payloads
//! are wrapped in an [`Envelope`] that prefixes the publishing node's id.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use relay_protocol::{codec, ChatMessage, ProtocolError};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Maximum subject length, bounded by the one-byte length in bus frames.
pub const MAX_SUBJECT_LENGTH: usize = 255;

/// Default per-subject buffer for the in-process bus.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid subject name.
    #[error("Invalid subject: {0}")]
    InvalidSubject(&'static str),

    /// The bus link is down.
    #[error("Bus disconnected")]
    Disconnected,

    /// The outbound queue is full.
    #[error("Bus outbound queue is full")]
    Backpressure,

    /// Frame exceeds the bus frame limit.
    #[error("Bus frame size {0} exceeds maximum")]
    FrameTooLarge(usize),

    /// Malformed bus frame.
    #[error("Invalid bus frame: {0}")]
    InvalidFrame(String),

    /// I/O error on the bus link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a subject name.
///
/// # Errors
///
/// Returns an error message if the subject is empty, too long, or contains
/// whitespace or control characters.
pub fn validate_subject(subject: &str) -> Result<(), &'static str> {
    if subject.is_empty() {
        return Err("Subject cannot be empty");
    }
    if subject.len() > MAX_SUBJECT_LENGTH {
        return Err("Subject too long");
    }
    if !subject
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && !c.is_ascii_whitespace())
    {
        return Err("Subject contains invalid characters");
    }
    Ok(())
}

/// A publish/subscribe bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on `subject`.
    ///
    /// Publishing with no subscribers is not an error.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to `subject`.
    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Bus implementation name (e.g. "memory", "tcp").
    fn name(&self) -> &'static str;
}

/// A live subscription to one subject.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: broadcast::Receiver<Bytes>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    #[must_use]
    pub fn new(subject: impl Into<String>, receiver: broadcast::Receiver<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    /// The subscribed subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the bus is gone. If this subscriber falls behind,
    /// the skipped payloads are logged and dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subject = %self.subject, skipped, "Subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus.
///
/// Connects every router in the same process; used for single-node
/// deployments and tests.
#[derive(Debug)]
pub struct LocalBus {
    subjects: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl LocalBus {
    /// Create a bus with the default per-subject capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific per-subject capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subjects: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on `subject`.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .get(subject)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        validate_subject(subject).map_err(BusError::InvalidSubject)?;

        match self.subjects.get(subject) {
            Some(tx) => {
                let receivers = tx.send(payload).unwrap_or_default();
                trace!(subject = %subject, receivers, "Published");
            }
            None => trace!(subject = %subject, "Publish with no subscribers"),
        }
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        validate_subject(subject).map_err(BusError::InvalidSubject)?;

        let receiver = self
            .subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!(subject = %subject, "Subscribed");
        Ok(Subscription::new(subject, receiver))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Identifier of a running node, fixed at [`NodeId::LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Length of a node id on the bus.
    pub const LEN: usize = 36;

    /// Generate a random node id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message as carried on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Id of the node that published the message.
    pub origin: String,
    /// The message.
    pub message: ChatMessage,
}

impl Envelope {
    /// Encode `message` behind the publishing node's id.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn encode(origin: &NodeId, message: &ChatMessage) -> Result<Bytes, ProtocolError> {
        let mut buf =
            BytesMut::with_capacity(NodeId::LEN + relay_protocol::HEADER_LEN + message.data.len());
        buf.put_slice(origin.as_str().as_bytes());
        codec::encode_into(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Split a bus payload into origin and message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is shorter than a node id or the
    /// message does not decode.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < NodeId::LEN {
            return Err(ProtocolError::Truncated {
                needed: NodeId::LEN,
                got: payload.len(),
            });
        }

        let (origin, message) = payload.split_at(NodeId::LEN);
        Ok(Self {
            origin: String::from_utf8_lossy(origin).into_owned(),
            message: codec::decode(message)?,
        })
    }
}
