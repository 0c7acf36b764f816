//! Message types for the chat relay protocol.
//!
//! A [`ChatMessage`] is the unit exchanged between clients and nodes, and
//! between nodes over the bus.

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// Message kind identifiers.
///
/// The ordinals are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A client announcing its presence under a username.
    Init = 0,
    /// An ordinary chat message.
    Chat = 1,
    /// The username is already taken on the node the client connected to.
    InCache = 2,
}

impl MessageKind {
    /// Short lowercase name, used in logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Init => "init",
            MessageKind::Chat => "chat",
            MessageKind::InCache => "in_cache",
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Init),
            1 => Ok(MessageKind::Chat),
            2 => Ok(MessageKind::InCache),
            _ => Err("Invalid message kind"),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat protocol message.
///
/// `sender` and `recipient` are capped at [`NAME_LEN`](crate::codec::NAME_LEN)
/// bytes on the wire; longer values are truncated by the encoder. An empty
/// `recipient` addresses every other user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Username of the author.
    pub sender: String,
    /// Target username, or empty for a broadcast.
    pub recipient: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Raw payload.
    pub data: Bytes,
}

impl ChatMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            data: data.into(),
        }
    }

    /// Create an `Init` message announcing `sender`.
    #[must_use]
    pub fn init(sender: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Init, sender, String::new(), data)
    }

    /// Create a `Chat` message. An empty `recipient` broadcasts.
    #[must_use]
    pub fn chat(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(MessageKind::Chat, sender, recipient, data)
    }

    /// Create an `InCache` notice for `username`, carrying the address of the
    /// connection that tried to claim it.
    #[must_use]
    pub fn in_cache(username: impl Into<String>, address: impl fmt::Display) -> Self {
        let username = username.into();
        Self::new(
            MessageKind::InCache,
            username.clone(),
            username,
            address.to_string(),
        )
    }

    /// Whether this message is addressed to every other user.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_empty()
    }

    /// Whether a client registered as `username` should receive this message.
    ///
    /// Only the recipient filter is checked here; excluding the author is the
    /// caller's job.
    #[must_use]
    pub fn is_for(&self, username: &str) -> bool {
        self.is_broadcast() || self.recipient == username
    }

    /// The payload as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn data_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recipient = if self.is_broadcast() {
            "*"
        } else {
            self.recipient.as_str()
        };
        write!(
            f,
            "[{}] {} -> {}: {}",
            self.kind,
            self.sender,
            recipient,
            self.data_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_conversion() {
        assert_eq!(MessageKind::try_from(0), Ok(MessageKind::Init));
        assert_eq!(MessageKind::try_from(1), Ok(MessageKind::Chat));
        assert_eq!(MessageKind::try_from(2), Ok(MessageKind::InCache));
        assert!(MessageKind::try_from(3).is_err());
        assert_eq!(u8::from(MessageKind::InCache), 2);
    }

    #[test]
    fn test_in_cache_targets_itself() {
        let addr: std::net::SocketAddr = "10.0.0.7:50123".parse().unwrap();
        let msg = ChatMessage::in_cache("bill", addr);

        assert_eq!(msg.kind, MessageKind::InCache);
        assert_eq!(msg.sender, "bill");
        assert_eq!(msg.recipient, "bill");
        assert_eq!(msg.data_str(), "10.0.0.7:50123");
    }

    #[test]
    fn test_recipient_filter() {
        let broadcast = ChatMessage::chat("bill", "", "hi all");
        assert!(broadcast.is_broadcast());
        assert!(broadcast.is_for("jill"));

        let direct = ChatMessage::chat("bill", "jill", "hi");
        assert!(direct.is_for("jill"));
        assert!(!direct.is_for("phil"));
    }

    #[test]
    fn test_display() {
        let msg = ChatMessage::chat("bill", "", "hello");
        assert_eq!(msg.to_string(), "[chat] bill -> *: hello");

        let msg = ChatMessage::chat("bill", "jill", "hi");
        assert_eq!(msg.to_string(), "[chat] bill -> jill: hi");
    }
}
