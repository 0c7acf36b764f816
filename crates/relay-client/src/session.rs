//! One user's chat session: what to send for typed lines and how to treat
//! what the server sends back.

use relay_protocol::{codec, parse_line, ChatMessage, MessageKind, ProtocolError};

/// What the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A message to print.
    Show(ChatMessage),
    /// The chosen username is in use on the node; the session cannot go on.
    NameTaken(String),
}

/// A named session.
#[derive(Debug, Clone)]
pub struct Session {
    name: String,
}

impl Session {
    /// Start a session as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The session's username.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input prompt.
    #[must_use]
    pub fn prompt(&self) -> String {
        format!("{}#> ", self.name)
    }

    /// Announcement sent right after connecting.
    #[must_use]
    pub fn online(&self) -> ChatMessage {
        ChatMessage::init(self.name.as_str(), format!("{} is online", self.name))
    }

    /// Broadcast sent when the user quits.
    #[must_use]
    pub fn offline(&self) -> ChatMessage {
        ChatMessage::chat(
            self.name.as_str(),
            "",
            format!("{} is offline", self.name),
        )
    }

    /// Message for a typed line, or `None` for a blank broadcast.
    #[must_use]
    pub fn outgoing(&self, line: &str) -> Option<ChatMessage> {
        let parsed = parse_line(line);
        if parsed.recipient.is_empty() && parsed.data.trim().is_empty() {
            return None;
        }
        Some(parsed.into_message(&self.name))
    }

    /// Interpret one complete message from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not decode.
    pub fn incoming(&self, frame: &[u8]) -> Result<Incoming, ProtocolError> {
        let message = codec::decode(frame)?;
        if message.kind == MessageKind::InCache {
            return Ok(Incoming::NameTaken(message.sender));
        }
        Ok(Incoming::Show(message))
    }
}
