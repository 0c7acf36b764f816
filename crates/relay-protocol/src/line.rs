//! Client-side line convention.
//!
//! A line starting with `@name` is addressed to `name`, and the rest of the
//! line after the first run of whitespace is the payload. Any other line is a
//! broadcast carrying the whole line.

use crate::message::ChatMessage;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A typed line split into recipient and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    /// Target username, empty for a broadcast.
    pub recipient: &'a str,
    /// Message text.
    pub data: &'a str,
}

impl ParsedLine<'_> {
    /// Build a `Chat` message from `sender`.
    #[must_use]
    pub fn into_message(self, sender: &str) -> ChatMessage {
        ChatMessage::chat(sender, self.recipient, self.data.to_string())
    }
}

/// Split a typed line into recipient and payload.
#[must_use]
pub fn parse_line(line: &str) -> ParsedLine<'_> {
    let line = line.trim_end_matches(LINE_ENDINGS);

    match line.strip_prefix('@') {
        Some(rest) => match rest.find(char::is_whitespace) {
            Some(split) => ParsedLine {
                recipient: &rest[..split],
                data: rest[split..].trim_start(),
            },
            None => ParsedLine {
                recipient: rest,
                data: "",
            },
        },
        None => ParsedLine {
            recipient: "",
            data: line,
        },
    }
}
