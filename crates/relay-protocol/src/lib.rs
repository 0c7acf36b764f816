//! # relay-protocol
//!
//! Wire protocol definitions for the chat relay.
//!
//! Every message is a fixed 24-byte header (sender, recipient, payload length,
//! kind) followed by the raw payload. This crate encodes and decodes that
//! format and reads whole messages off a byte stream.
//!
//! ## Message Kinds
//!
//! - `Init` - A client announcing its username
//! - `Chat` - An ordinary direct or broadcast message
//! - `InCache` - The username is already taken on this node
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ChatMessage};
//!
//! let msg = ChatMessage::chat("Bill", "Jill", "hi");
//!
//! let encoded = codec::encode(&msg).unwrap();
//! assert_eq!(encoded.len(), 26);
//!
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod line;
pub mod message;
pub mod reader;

pub use codec::{decode, encode, ProtocolError, HEADER_LEN, MAX_PAYLOAD_SIZE, NAME_LEN};
pub use line::{parse_line, ParsedLine};
pub use message::{ChatMessage, MessageKind};
pub use reader::{read_message, HeaderRetry};
